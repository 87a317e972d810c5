//! Plain RTP over UDP, addressed by `rtp://` URL or an SDP descriptor file.

use std::fs;
use std::io::{self, Cursor};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, trace};
use url::Url;
use webrtc::rtp::packet::Packet;
use webrtc::sdp::description::media::MediaDescription;
use webrtc::sdp::SessionDescription;
use webrtc::util::Unmarshal;

use super::source::{
    MediaKind, MediaPacket, PacketSource, Packetization, Payload, ReadEvent, StreamInfo,
};
use crate::codec::CodecId;
use crate::error::OpenError;

const DEFAULT_PAYLOAD_TYPE: u8 = 96;
const MAX_DATAGRAM: usize = 65_536;

pub struct RtpSource {
    name: String,
    streams: Vec<StreamInfo>,
    endpoints: Vec<SocketAddr>,
    socket: Option<UdpSocket>,
    selected: usize,
    buf: Vec<u8>,
}

impl RtpSource {
    fn new(name: String, streams: Vec<StreamInfo>, endpoints: Vec<SocketAddr>) -> Self {
        Self {
            name,
            streams,
            endpoints,
            socket: None,
            selected: 0,
            buf: vec![0u8; MAX_DATAGRAM],
        }
    }

    /// `rtp://host:port[?codec=h264&pt=96]`. Unknown query keys are ignored.
    pub fn from_url(input: &str) -> Result<Self, OpenError> {
        let url = Url::parse(input).map_err(|e| OpenError::InvalidDescriptor(e.to_string()))?;
        if !matches!(url.scheme(), "rtp" | "udp") {
            return Err(OpenError::InvalidDescriptor(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }
        let host = url.host_str().unwrap_or("0.0.0.0").trim_matches(['[', ']']);
        let ip: IpAddr = host
            .parse()
            .map_err(|_| OpenError::InvalidDescriptor(format!("invalid host {}", host)))?;
        let port = url
            .port()
            .ok_or_else(|| OpenError::InvalidDescriptor("missing port".to_string()))?;

        let mut codec_name = "H264".to_string();
        let mut payload_type = DEFAULT_PAYLOAD_TYPE;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "codec" => codec_name = value.to_string(),
                "pt" => {
                    payload_type = value.parse().map_err(|_| {
                        OpenError::InvalidDescriptor(format!("invalid payload type {}", value))
                    })?
                }
                _ => {}
            }
        }

        let mut info = StreamInfo::video(
            0,
            CodecId::from_name(&codec_name),
            &codec_name,
            Packetization::Rtp,
        );
        info.payload_type = Some(payload_type);
        Ok(Self::new(
            input.to_string(),
            vec![info],
            vec![SocketAddr::new(ip, port)],
        ))
    }

    pub fn from_sdp_file(path: &Path) -> Result<Self, OpenError> {
        let text = fs::read_to_string(path)
            .map_err(|e| OpenError::SourceUnreachable(format!("{}: {}", path.display(), e)))?;
        Self::from_sdp(path.display().to_string(), &text)
    }

    pub fn from_sdp(name: String, text: &str) -> Result<Self, OpenError> {
        let mut reader = Cursor::new(text.as_bytes());
        let session = SessionDescription::unmarshal(&mut reader)
            .map_err(|e| OpenError::InvalidDescriptor(format!("{:?}", e)))?;
        let session_ip = session
            .connection_information
            .as_ref()
            .and_then(|c| c.address.as_ref())
            .and_then(|a| connection_ip(&a.address));

        let mut streams = vec![];
        let mut endpoints = vec![];
        for (index, media) in session.media_descriptions.iter().enumerate() {
            let ip = media
                .connection_information
                .as_ref()
                .and_then(|c| c.address.as_ref())
                .and_then(|a| connection_ip(&a.address))
                .or(session_ip)
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
            let port = u16::try_from(media.media_name.port.value).map_err(|_| {
                OpenError::InvalidDescriptor(format!(
                    "invalid port {}",
                    media.media_name.port.value
                ))
            })?;
            streams.push(stream_from_media(index, media));
            endpoints.push(SocketAddr::new(ip, port));
        }
        Ok(Self::new(name, streams, endpoints))
    }
}

/// `c=` addresses may carry a `/ttl` suffix.
fn connection_ip(address: &str) -> Option<IpAddr> {
    address.split('/').next()?.parse().ok()
}

fn stream_from_media(index: usize, media: &MediaDescription) -> StreamInfo {
    let kind = match media.media_name.media.as_str() {
        "video" => MediaKind::Video,
        "audio" => MediaKind::Audio,
        _ => MediaKind::Other,
    };
    let payload_type = media
        .media_name
        .formats
        .first()
        .and_then(|f| f.parse::<u8>().ok());

    // a=rtpmap:96 H264/90000
    let (codec_name, clock_rate) = format_attribute(media, "rtpmap", payload_type)
        .and_then(|v| v.split_whitespace().nth(1))
        .map(|enc| {
            let mut parts = enc.split('/');
            let name = parts.next().unwrap_or_default().to_string();
            let rate = parts.next().and_then(|r| r.parse().ok()).unwrap_or(90_000);
            (name, rate)
        })
        .unwrap_or_else(|| ("unknown".to_string(), 90_000));

    let mut info = StreamInfo::video(
        index,
        CodecId::from_name(&codec_name),
        &codec_name,
        Packetization::Rtp,
    );
    info.kind = kind;
    info.payload_type = payload_type;
    info.clock_rate = clock_rate;

    // a=framesize:96 640-480, or a=x-dimensions:640,480
    let dims = format_attribute(media, "framesize", payload_type)
        .and_then(|v| v.split_whitespace().nth(1))
        .and_then(|d| d.split_once('-'))
        .or_else(|| {
            media
                .attributes
                .iter()
                .find(|a| a.key == "x-dimensions")
                .and_then(|a| a.value.as_deref())
                .and_then(|d| d.split_once(','))
        });
    if let Some((w, h)) = dims {
        info.width = w.trim().parse().unwrap_or(0);
        info.height = h.trim().parse().unwrap_or(0);
    }
    info
}

/// Value of the first `key` attribute addressed to `payload_type`.
fn format_attribute<'a>(
    media: &'a MediaDescription,
    key: &str,
    payload_type: Option<u8>,
) -> Option<&'a str> {
    media
        .attributes
        .iter()
        .filter(|a| a.key == key)
        .filter_map(|a| a.value.as_deref())
        .find(|v| {
            payload_type.is_none_or(|pt| v.split_whitespace().next() == Some(pt.to_string().as_str()))
        })
}

impl PacketSource for RtpSource {
    fn describe(&self) -> String {
        format!("rtp {}", self.name)
    }

    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn select(&mut self, index: usize) -> Result<(), OpenError> {
        let addr = *self
            .endpoints
            .get(index)
            .ok_or_else(|| OpenError::InvalidDescriptor(format!("no stream {}", index)))?;
        let socket = UdpSocket::bind(addr)
            .map_err(|e| OpenError::SourceUnreachable(format!("bind {}: {}", addr, e)))?;
        info!("listening for RTP on {}", addr);
        self.socket = Some(socket);
        self.selected = index;
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> io::Result<ReadEvent> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no stream selected"))?;
        socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let n = match socket.recv(&mut self.buf) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Ok(ReadEvent::Idle)
            }
            Err(e) => return Err(e),
        };

        // RTCP multiplexed on the same port: packet types 200..=204
        if n >= 2 && (200..=204).contains(&self.buf[1]) {
            trace!("skipping rtcp packet");
            return Ok(ReadEvent::Idle);
        }
        let packet = match Packet::unmarshal(&mut &self.buf[..n]) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping malformed rtp datagram: {}", e);
                return Ok(ReadEvent::Idle);
            }
        };
        let expected = self.streams[self.selected].payload_type;
        if expected.is_some_and(|pt| pt != packet.header.payload_type) {
            trace!("ignoring payload type {}", packet.header.payload_type);
            return Ok(ReadEvent::Idle);
        }
        Ok(ReadEvent::Packet(MediaPacket {
            stream: self.selected,
            payload: Payload::Rtp(packet),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::util::Marshal;

    const SDP: &str = "v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=capture\r\n\
c=IN IP4 127.0.0.1\r\n\
t=0 0\r\n\
m=audio 5002 RTP/AVP 111\r\n\
a=rtpmap:111 opus/48000/2\r\n\
m=video 5004 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=framesize:96 640-480\r\n\
m=video 5006 RTP/AVP 97\r\n\
a=rtpmap:97 VP8/90000\r\n";

    #[test]
    fn url_with_query() {
        let src = RtpSource::from_url("rtp://127.0.0.1:5004?codec=vp8&pt=100&protocol_whitelist=file,udp,rtp").unwrap();
        let info = &src.streams()[0];
        assert_eq!(info.codec, Some(CodecId::Vp8));
        assert_eq!(info.payload_type, Some(100));
        assert_eq!(src.endpoints[0], "127.0.0.1:5004".parse().unwrap());
    }

    #[test]
    fn url_errors() {
        assert!(matches!(
            RtpSource::from_url("rtp://0.0.0.0"),
            Err(OpenError::InvalidDescriptor(_))
        ));
        assert!(matches!(
            RtpSource::from_url("http://0.0.0.0:80"),
            Err(OpenError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn sdp_media_lines() {
        let src = RtpSource::from_sdp("test.sdp".to_string(), SDP).unwrap();
        let streams = src.streams();
        assert_eq!(streams.len(), 3);
        assert_eq!(streams[0].kind, MediaKind::Audio);
        assert_eq!(streams[1].codec, Some(CodecId::H264));
        assert_eq!((streams[1].width, streams[1].height), (640, 480));
        assert_eq!(streams[2].codec, Some(CodecId::Vp8));
        assert_eq!(streams[2].payload_type, Some(97));
        assert_eq!(src.endpoints[2], "127.0.0.1:5006".parse().unwrap());
    }

    #[test]
    fn receives_and_filters_datagrams() {
        let mut src = RtpSource::from_url("rtp://127.0.0.1:0?pt=96").unwrap();
        src.select(0).unwrap();
        let addr = src.socket.as_ref().unwrap().local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();

        let mut pkt = Packet::default();
        pkt.header.version = 2;
        pkt.header.payload_type = 97;
        sender.send_to(&pkt.marshal().unwrap(), addr).unwrap();
        pkt.header.payload_type = 96;
        pkt.header.sequence_number = 7;
        sender.send_to(&pkt.marshal().unwrap(), addr).unwrap();

        let timeout = Duration::from_secs(2);
        assert!(matches!(src.read(timeout).unwrap(), ReadEvent::Idle));
        match src.read(timeout).unwrap() {
            ReadEvent::Packet(MediaPacket {
                payload: Payload::Rtp(p),
                ..
            }) => assert_eq!(p.header.sequence_number, 7),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            src.read(Duration::from_millis(20)).unwrap(),
            ReadEvent::Idle
        ));
    }
}
