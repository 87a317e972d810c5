//! Decoder seam: access units in, raw frames out.

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod raw;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{DecodeError, OpenError};
use crate::frame::RawFrame;
use crate::ingest::StreamInfo;

/// Video codecs a stream can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CodecId {
    H264,
    Vp8,
    Vp9,
    /// Uncompressed planar pictures.
    Raw,
}

impl CodecId {
    /// Accepts bare names (`H264`) and MIME types (`video/H264`).
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.rsplit('/').next().unwrap_or(name);
        match name.to_ascii_lowercase().as_str() {
            "h264" | "avc" | "avc1" => Some(CodecId::H264),
            "vp8" => Some(CodecId::Vp8),
            "vp9" => Some(CodecId::Vp9),
            "raw" | "rawvideo" => Some(CodecId::Raw),
            _ => None,
        }
    }
}

impl FromStr for CodecId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CodecId::from_name(s).ok_or_else(|| format!("unknown codec: {}", s))
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecId::H264 => write!(f, "H264"),
            CodecId::Vp8 => write!(f, "VP8"),
            CodecId::Vp9 => write!(f, "VP9"),
            CodecId::Raw => write!(f, "RAW"),
        }
    }
}

/// One complete coded picture.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub data: Bytes,
    pub keyframe: bool,
    pub timestamp: u32,
}

pub trait VideoDecoder: Send {
    /// Feeds one access unit. Every frame it completes is appended to `out`
    /// in presentation order; zero frames is a valid outcome.
    fn decode(&mut self, unit: &AccessUnit, out: &mut Vec<RawFrame>) -> Result<(), DecodeError>;

    /// Drains frames still held by the decoder at end of stream.
    fn flush(&mut self, out: &mut Vec<RawFrame>) -> Result<(), DecodeError>;
}

pub type DecoderFactory =
    Arc<dyn Fn(&StreamInfo) -> Result<Box<dyn VideoDecoder>, OpenError> + Send + Sync>;

/// Maps a codec to the factory that builds its decoder.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    factories: HashMap<CodecId, DecoderFactory>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw pass-through, plus the ffmpeg decoders when built with `ffmpeg`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(CodecId::Raw, |info: &StreamInfo| {
            Ok(Box::new(raw::RawDecoder::new(info)?) as Box<dyn VideoDecoder>)
        });
        #[cfg(feature = "ffmpeg")]
        ffmpeg::register(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, codec: CodecId, factory: F)
    where
        F: Fn(&StreamInfo) -> Result<Box<dyn VideoDecoder>, OpenError> + Send + Sync + 'static,
    {
        self.factories.insert(codec, Arc::new(factory));
    }

    pub fn supports(&self, codec: CodecId) -> bool {
        self.factories.contains_key(&codec)
    }

    /// Registered codecs that a negotiated RTP track can carry.
    pub fn compressed(&self) -> Vec<CodecId> {
        [CodecId::H264, CodecId::Vp8, CodecId::Vp9]
            .into_iter()
            .filter(|c| self.supports(*c))
            .collect()
    }

    pub fn create(&self, info: &StreamInfo) -> Result<Box<dyn VideoDecoder>, OpenError> {
        let codec = info
            .codec
            .ok_or_else(|| OpenError::UnsupportedCodec(info.codec_name.clone()))?;
        let factory = self
            .factories
            .get(&codec)
            .ok_or_else(|| OpenError::UnsupportedCodec(codec.to_string()))?;
        factory(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use crate::ingest::Packetization;

    #[test]
    fn codec_names() {
        assert_eq!(CodecId::from_name("video/H264"), Some(CodecId::H264));
        assert_eq!(CodecId::from_name("vp9"), Some(CodecId::Vp9));
        assert_eq!("VP8".parse::<CodecId>(), Ok(CodecId::Vp8));
        assert!("opus".parse::<CodecId>().is_err());
    }

    #[test]
    fn registry_rejects_unregistered_codec() {
        let registry = DecoderRegistry::new();
        let info = StreamInfo::video(0, Some(CodecId::Vp8), "VP8", Packetization::Rtp);
        assert!(matches!(
            registry.create(&info),
            Err(OpenError::UnsupportedCodec(_))
        ));

        let unknown = StreamInfo::video(0, None, "theora", Packetization::Rtp);
        match registry.create(&unknown) {
            Err(OpenError::UnsupportedCodec(name)) => assert_eq!(name, "theora"),
            _ => panic!("expected unsupported codec"),
        }
    }

    #[test]
    fn defaults_include_raw() {
        let registry = DecoderRegistry::with_defaults();
        assert!(registry.supports(CodecId::Raw));
        let mut info = StreamInfo::video(0, Some(CodecId::Raw), "raw", Packetization::AccessUnits);
        info.width = 2;
        info.height = 2;
        info.format = Some(PixelFormat::Gray8);
        assert!(registry.create(&info).is_ok());
    }

    #[test]
    fn compressed_lists_only_registered_codecs() {
        let mut registry = DecoderRegistry::new();
        assert!(registry.compressed().is_empty());
        registry.register(CodecId::Vp8, |info: &StreamInfo| {
            Ok(Box::new(raw::RawDecoder::new(info)?) as Box<dyn VideoDecoder>)
        });
        assert_eq!(registry.compressed(), vec![CodecId::Vp8]);
    }

    #[cfg(feature = "ffmpeg")]
    #[test]
    fn default_build_decodes_webrtc_codecs() {
        assert_eq!(
            DecoderRegistry::with_defaults().compressed(),
            vec![CodecId::H264, CodecId::Vp8, CodecId::Vp9]
        );
    }
}
