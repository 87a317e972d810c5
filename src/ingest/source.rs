use std::io;
use std::time::Duration;

use webrtc::rtp::packet::Packet;

use crate::codec::{AccessUnit, CodecId};
use crate::error::OpenError;
use crate::frame::PixelFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    Other,
}

/// How a stream's payload reaches the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packetization {
    /// RTP packets that must be reassembled into access units.
    Rtp,
    /// Whole access units, one per packet.
    AccessUnits,
}

/// What a source knows about one of its sub-streams before decoding.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: MediaKind,
    /// `None` when the source names a codec we do not know.
    pub codec: Option<CodecId>,
    pub codec_name: String,
    pub packetization: Packetization,
    pub payload_type: Option<u8>,
    pub clock_rate: u32,
    /// Declared geometry, zero when not advertised.
    pub width: u32,
    pub height: u32,
    pub format: Option<PixelFormat>,
}

impl StreamInfo {
    pub fn video(
        index: usize,
        codec: Option<CodecId>,
        codec_name: &str,
        packetization: Packetization,
    ) -> Self {
        Self {
            index,
            kind: MediaKind::Video,
            codec,
            codec_name: codec_name.to_string(),
            packetization,
            payload_type: None,
            clock_rate: 90_000,
            width: 0,
            height: 0,
            format: None,
        }
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

#[derive(Debug, Clone)]
pub enum Payload {
    Rtp(Packet),
    Unit(AccessUnit),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Rtp(p) => p.payload.len(),
            Payload::Unit(u) => u.data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub stream: usize,
    pub payload: Payload,
}

#[derive(Debug)]
pub enum ReadEvent {
    Packet(MediaPacket),
    /// Nothing arrived within the timeout.
    Idle,
    Eof,
}

/// A packetized byte source. Reads must honour the timeout so the session
/// can observe stop requests between reads.
pub trait PacketSource: Send {
    fn describe(&self) -> String;

    fn streams(&self) -> &[StreamInfo];

    /// Called once with the stream the session decodes, before any read.
    fn select(&mut self, _index: usize) -> Result<(), OpenError> {
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> io::Result<ReadEvent>;
}
