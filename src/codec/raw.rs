use crate::error::{DecodeError, OpenError};
use crate::frame::{PixelFormat, Plane, RawFrame};
use crate::ingest::StreamInfo;

use super::{AccessUnit, VideoDecoder};

/// Splits uncompressed pictures into planes. Geometry and layout come
/// from the stream description since the payload carries neither.
pub struct RawDecoder {
    width: usize,
    height: usize,
    format: PixelFormat,
    /// (row bytes, rows) per plane
    planes: Vec<(usize, usize)>,
}

impl RawDecoder {
    pub fn new(info: &StreamInfo) -> Result<Self, OpenError> {
        let format = info
            .format
            .ok_or_else(|| OpenError::DecoderInit("raw stream without pixel format".to_string()))?;
        if info.width == 0 || info.height == 0 {
            return Err(OpenError::DecoderInit(
                "raw stream without geometry".to_string(),
            ));
        }
        let (w, h) = (info.width as usize, info.height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        let planes = match format {
            PixelFormat::I420 => vec![(w, h), (cw, ch), (cw, ch)],
            PixelFormat::I422 => vec![(w, h), (cw, h), (cw, h)],
            PixelFormat::I444 => vec![(w, h), (w, h), (w, h)],
            PixelFormat::Nv12 => vec![(w, h), (cw * 2, ch)],
            PixelFormat::Gray8 => vec![(w, h)],
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => vec![(w * 3, h)],
            PixelFormat::Rgba | PixelFormat::Bgra => vec![(w * 4, h)],
            PixelFormat::Other(_) => {
                return Err(OpenError::DecoderInit(format!(
                    "raw layout {} not supported",
                    format
                )))
            }
        };
        Ok(Self {
            width: w,
            height: h,
            format,
            planes,
        })
    }

    pub fn frame_size(&self) -> usize {
        self.planes.iter().map(|(row, rows)| row * rows).sum()
    }
}

impl VideoDecoder for RawDecoder {
    fn decode(&mut self, unit: &AccessUnit, out: &mut Vec<RawFrame>) -> Result<(), DecodeError> {
        if unit.data.len() != self.frame_size() {
            return Err(DecodeError::Decoder(format!(
                "raw picture of {} bytes, expected {}",
                unit.data.len(),
                self.frame_size()
            )));
        }
        let mut at = 0;
        let mut planes = Vec::with_capacity(self.planes.len());
        for &(row, rows) in &self.planes {
            planes.push(Plane {
                data: unit.data[at..at + row * rows].to_vec(),
                stride: row,
            });
            at += row * rows;
        }
        out.push(RawFrame {
            width: self.width as i32,
            height: self.height as i32,
            format: self.format,
            planes,
        });
        Ok(())
    }

    fn flush(&mut self, _out: &mut Vec<RawFrame>) -> Result<(), DecodeError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecId;
    use crate::ingest::Packetization;
    use bytes::Bytes;

    fn info(width: u32, height: u32, format: Option<PixelFormat>) -> StreamInfo {
        let mut info = StreamInfo::video(0, Some(CodecId::Raw), "raw", Packetization::AccessUnits);
        info.width = width;
        info.height = height;
        info.format = format;
        info
    }

    #[test]
    fn splits_i420_planes() {
        let mut decoder = RawDecoder::new(&info(3, 3, Some(PixelFormat::I420))).unwrap();
        assert_eq!(decoder.frame_size(), 9 + 4 + 4);
        let unit = AccessUnit {
            data: Bytes::from((0..17u8).collect::<Vec<_>>()),
            keyframe: true,
            timestamp: 0,
        };
        let mut out = vec![];
        decoder.decode(&unit, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].planes[1].data, vec![9, 10, 11, 12]);
        assert_eq!(out[0].planes[2].stride, 2);
    }

    #[test]
    fn wrong_size_is_a_decoder_error() {
        let mut decoder = RawDecoder::new(&info(2, 2, Some(PixelFormat::Gray8))).unwrap();
        let unit = AccessUnit {
            data: Bytes::from_static(&[0, 0, 0]),
            keyframe: true,
            timestamp: 0,
        };
        let mut out = vec![];
        assert!(decoder.decode(&unit, &mut out).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn needs_format_and_geometry() {
        assert!(matches!(
            RawDecoder::new(&info(2, 2, None)),
            Err(OpenError::DecoderInit(_))
        ));
        assert!(matches!(
            RawDecoder::new(&info(0, 2, Some(PixelFormat::Gray8))),
            Err(OpenError::DecoderInit(_))
        ));
    }
}
