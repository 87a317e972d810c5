//! Source fed from another thread, used for RTP received on a negotiated track.

use std::io;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use webrtc::rtp::packet::Packet;

use super::source::{MediaPacket, PacketSource, Packetization, Payload, ReadEvent, StreamInfo};
use crate::codec::CodecId;

pub struct ChannelSource {
    name: String,
    streams: Vec<StreamInfo>,
    packets: Receiver<Packet>,
}

impl ChannelSource {
    /// `mime` is the negotiated codec, e.g. `video/VP8`. The stream ends
    /// when every sender is dropped.
    pub fn new(name: impl Into<String>, mime: &str, payload_type: u8, packets: Receiver<Packet>) -> Self {
        let mut info = StreamInfo::video(0, CodecId::from_name(mime), mime, Packetization::Rtp);
        info.payload_type = Some(payload_type);
        Self {
            name: name.into(),
            streams: vec![info],
            packets,
        }
    }
}

impl PacketSource for ChannelSource {
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read(&mut self, timeout: Duration) -> io::Result<ReadEvent> {
        match self.packets.recv_timeout(timeout) {
            Ok(packet) => Ok(ReadEvent::Packet(MediaPacket {
                stream: 0,
                payload: Payload::Rtp(packet),
            })),
            Err(RecvTimeoutError::Timeout) => Ok(ReadEvent::Idle),
            Err(RecvTimeoutError::Disconnected) => Ok(ReadEvent::Eof),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn idle_then_packet_then_eof() {
        let (tx, rx) = mpsc::channel();
        let mut src = ChannelSource::new("track", "video/H264", 102, rx);
        assert_eq!(src.streams()[0].codec, Some(CodecId::H264));
        assert_eq!(src.streams()[0].payload_type, Some(102));

        assert!(matches!(
            src.read(Duration::from_millis(1)).unwrap(),
            ReadEvent::Idle
        ));
        tx.send(Packet::default()).unwrap();
        assert!(matches!(
            src.read(Duration::from_millis(1)).unwrap(),
            ReadEvent::Packet(_)
        ));
        drop(tx);
        assert!(matches!(
            src.read(Duration::from_millis(1)).unwrap(),
            ReadEvent::Eof
        ));
    }
}
