//! libavcodec decoders for compressed RTP payloads.
//!
//! Decoded pictures go through swscale to packed BGR24 here, so the stream
//! session only ever sees canonical-layout frames from this backend.

use ffmpeg_next::{
    codec::{context::Context as CodecContext, Id},
    decoder::Video as FfmpegVideoDecoder,
    format::Pixel,
    frame::Video as VideoFrame,
    software::scaling::{Context as ScalingContext, Flags as ScalingFlags},
    Packet,
};
use tracing::{debug, trace};

use crate::error::{DecodeError, OpenError};
use crate::frame::{PixelFormat, Plane, RawFrame};
use crate::ingest::StreamInfo;

use super::{AccessUnit, CodecId, DecoderRegistry, VideoDecoder};

pub fn register(registry: &mut DecoderRegistry) {
    for codec in [CodecId::H264, CodecId::Vp8, CodecId::Vp9] {
        registry.register(codec, move |info: &StreamInfo| {
            Ok(Box::new(FfmpegDecoder::new(codec, info)?) as Box<dyn VideoDecoder>)
        });
    }
}

/// Scaler for one `(format, width, height)` of decoder output.
struct Scaler {
    context: ScalingContext,
    format: Pixel,
    width: u32,
    height: u32,
    output: VideoFrame,
}

impl Scaler {
    fn new(format: Pixel, width: u32, height: u32) -> Result<Self, DecodeError> {
        let context = ScalingContext::get(
            format,
            width,
            height,
            Pixel::BGR24,
            width,
            height,
            ScalingFlags::BILINEAR,
        )
        .map_err(|e| {
            debug!("swscale {:?} {}x{}: {}", format, width, height, e);
            DecodeError::ConversionInitFailed {
                width: width as i32,
                height: height as i32,
                format: pixel_format(format),
            }
        })?;
        Ok(Self {
            context,
            format,
            width,
            height,
            output: VideoFrame::empty(),
        })
    }

    fn matches(&self, frame: &VideoFrame) -> bool {
        frame.format() == self.format && frame.width() == self.width && frame.height() == self.height
    }

    fn run(&mut self, frame: &VideoFrame) -> Result<RawFrame, DecodeError> {
        self.context
            .run(frame, &mut self.output)
            .map_err(|e| DecodeError::Decoder(format!("swscale: {}", e)))?;
        Ok(RawFrame {
            width: self.width as i32,
            height: self.height as i32,
            format: PixelFormat::Bgr24,
            planes: vec![Plane {
                data: self.output.data(0).to_vec(),
                stride: self.output.stride(0),
            }],
        })
    }
}

pub struct FfmpegDecoder {
    decoder: FfmpegVideoDecoder,
    frame: VideoFrame,
    scaler: Option<Scaler>,
}

impl FfmpegDecoder {
    pub fn new(codec: CodecId, info: &StreamInfo) -> Result<Self, OpenError> {
        ffmpeg_next::init().map_err(|e| OpenError::DecoderInit(e.to_string()))?;
        let id = match codec {
            CodecId::H264 => Id::H264,
            CodecId::Vp8 => Id::VP8,
            CodecId::Vp9 => Id::VP9,
            CodecId::Raw => return Err(OpenError::UnsupportedCodec(codec.to_string())),
        };
        let found = ffmpeg_next::decoder::find(id)
            .ok_or_else(|| OpenError::UnsupportedCodec(codec.to_string()))?;
        let decoder = CodecContext::new_with_codec(found)
            .decoder()
            .video()
            .map_err(|e| OpenError::DecoderInit(e.to_string()))?;
        debug!("ffmpeg {} decoder ready for stream {}", codec, info.index);
        Ok(Self {
            decoder,
            frame: VideoFrame::empty(),
            scaler: None,
        })
    }

    fn receive(&mut self, out: &mut Vec<RawFrame>) -> Result<(), DecodeError> {
        while self.decoder.receive_frame(&mut self.frame).is_ok() {
            let (width, height) = (self.frame.width(), self.frame.height());
            if width == 0 || height == 0 {
                trace!("dropping empty decoder frame");
                continue;
            }
            if !self.scaler.as_ref().is_some_and(|s| s.matches(&self.frame)) {
                self.scaler = Some(Scaler::new(self.frame.format(), width, height)?);
            }
            if let Some(scaler) = self.scaler.as_mut() {
                out.push(scaler.run(&self.frame)?);
            }
        }
        Ok(())
    }
}

impl VideoDecoder for FfmpegDecoder {
    fn decode(&mut self, unit: &AccessUnit, out: &mut Vec<RawFrame>) -> Result<(), DecodeError> {
        let packet = Packet::copy(&unit.data);
        self.decoder
            .send_packet(&packet)
            .map_err(|e| DecodeError::Decoder(e.to_string()))?;
        self.receive(out)
    }

    fn flush(&mut self, out: &mut Vec<RawFrame>) -> Result<(), DecodeError> {
        self.decoder
            .send_eof()
            .map_err(|e| DecodeError::Decoder(e.to_string()))?;
        self.receive(out)
    }
}

/// For error reports only.
fn pixel_format(pixel: Pixel) -> PixelFormat {
    match pixel {
        Pixel::YUV420P | Pixel::YUVJ420P => PixelFormat::I420,
        Pixel::YUV422P | Pixel::YUVJ422P => PixelFormat::I422,
        Pixel::YUV444P | Pixel::YUVJ444P => PixelFormat::I444,
        Pixel::NV12 => PixelFormat::Nv12,
        Pixel::GRAY8 => PixelFormat::Gray8,
        other => PixelFormat::Other(ffmpeg_next::ffi::AVPixelFormat::from(other) as i32 as u32),
    }
}
