//! Pixel buffer adapter: decoder output to canonical packed BGR.

use crate::error::DecodeError;
use crate::frame::{CanonicalFrame, PixelFormat, Plane, RawFrame, CANONICAL_CHANNELS};

#[derive(Debug, Clone, Copy)]
enum Layout {
    /// Three planes, chroma subsampled by `1 << sx` horizontally and `1 << sy` vertically.
    Yuv { sx: u32, sy: u32 },
    /// Luma plane plus one interleaved UV plane at 4:2:0.
    SemiPlanar,
    Gray,
    /// Packed pixels, `bpp` bytes each, with the byte offsets of B, G and R.
    Packed { bpp: usize, b: usize, g: usize, r: usize },
}

/// Conversion state sized for one `(width, height, format)` triple.
///
/// Rebuilt by the stream session whenever the decoder output changes shape.
#[derive(Debug)]
pub struct Converter {
    width: u32,
    height: u32,
    format: PixelFormat,
    layout: Layout,
}

impl Converter {
    pub fn new(width: i32, height: i32, format: PixelFormat) -> Result<Self, DecodeError> {
        let fail = || DecodeError::ConversionInitFailed {
            width,
            height,
            format,
        };
        if width <= 0 || height <= 0 {
            return Err(fail());
        }
        let layout = match format {
            PixelFormat::I420 => Layout::Yuv { sx: 1, sy: 1 },
            PixelFormat::I422 => Layout::Yuv { sx: 1, sy: 0 },
            PixelFormat::I444 => Layout::Yuv { sx: 0, sy: 0 },
            PixelFormat::Nv12 => Layout::SemiPlanar,
            PixelFormat::Gray8 => Layout::Gray,
            PixelFormat::Bgr24 => Layout::Packed { bpp: 3, b: 0, g: 1, r: 2 },
            PixelFormat::Rgb24 => Layout::Packed { bpp: 3, b: 2, g: 1, r: 0 },
            PixelFormat::Bgra => Layout::Packed { bpp: 4, b: 0, g: 1, r: 2 },
            PixelFormat::Rgba => Layout::Packed { bpp: 4, b: 2, g: 1, r: 0 },
            PixelFormat::Other(_) => return Err(fail()),
        };
        (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(CANONICAL_CHANNELS))
            .ok_or_else(fail)?;
        Ok(Self {
            width: width as u32,
            height: height as u32,
            format,
            layout,
        })
    }

    /// True when `frame` can be converted without rebuilding.
    pub fn matches(&self, frame: &RawFrame) -> bool {
        frame.width as u32 == self.width
            && frame.height as u32 == self.height
            && frame.format == self.format
    }

    pub fn geometry(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn convert(&self, frame: &RawFrame) -> Result<CanonicalFrame, DecodeError> {
        if !self.matches(frame) {
            return Err(DecodeError::Decoder(format!(
                "frame {}x{} {} does not match converter {}x{} {}",
                frame.width, frame.height, frame.format, self.width, self.height, self.format
            )));
        }
        let (w, h) = (self.width as usize, self.height as usize);
        let mut out = vec![0u8; w * h * CANONICAL_CHANNELS];

        match self.layout {
            Layout::Yuv { sx, sy } => {
                let (cw, ch) = (chroma_len(w, sx), chroma_len(h, sy));
                let y = plane(frame, 0, w, h)?;
                let u = plane(frame, 1, cw, ch)?;
                let v = plane(frame, 2, cw, ch)?;
                for row in 0..h {
                    let crow = row >> sy;
                    for col in 0..w {
                        let ccol = col >> sx;
                        let px = yuv_to_bgr(
                            y.data[row * y.stride + col],
                            u.data[crow * u.stride + ccol],
                            v.data[crow * v.stride + ccol],
                        );
                        let at = (row * w + col) * CANONICAL_CHANNELS;
                        out[at..at + CANONICAL_CHANNELS].copy_from_slice(&px);
                    }
                }
            }
            Layout::SemiPlanar => {
                let y = plane(frame, 0, w, h)?;
                let uv = plane(frame, 1, chroma_len(w, 1) * 2, chroma_len(h, 1))?;
                for row in 0..h {
                    let crow = row >> 1;
                    for col in 0..w {
                        let at_uv = crow * uv.stride + (col >> 1) * 2;
                        let px = yuv_to_bgr(
                            y.data[row * y.stride + col],
                            uv.data[at_uv],
                            uv.data[at_uv + 1],
                        );
                        let at = (row * w + col) * CANONICAL_CHANNELS;
                        out[at..at + CANONICAL_CHANNELS].copy_from_slice(&px);
                    }
                }
            }
            Layout::Gray => {
                let y = plane(frame, 0, w, h)?;
                for row in 0..h {
                    for col in 0..w {
                        let l = y.data[row * y.stride + col];
                        let at = (row * w + col) * CANONICAL_CHANNELS;
                        out[at..at + CANONICAL_CHANNELS].copy_from_slice(&[l, l, l]);
                    }
                }
            }
            Layout::Packed { bpp, b, g, r } => {
                let p = plane(frame, 0, w * bpp, h)?;
                for row in 0..h {
                    let src = &p.data[row * p.stride..row * p.stride + w * bpp];
                    let dst = &mut out[row * w * CANONICAL_CHANNELS..(row + 1) * w * CANONICAL_CHANNELS];
                    for (s, d) in src
                        .chunks_exact(bpp)
                        .zip(dst.chunks_exact_mut(CANONICAL_CHANNELS))
                    {
                        d.copy_from_slice(&[s[b], s[g], s[r]]);
                    }
                }
            }
        }

        CanonicalFrame::new(self.width, self.height, out)
            .ok_or_else(|| DecodeError::Decoder("converted buffer size mismatch".to_string()))
    }
}

fn chroma_len(len: usize, shift: u32) -> usize {
    (len + (1 << shift) - 1) >> shift
}

/// Returns the plane after checking it holds `rows` rows of `row_bytes`.
fn plane(frame: &RawFrame, index: usize, row_bytes: usize, rows: usize) -> Result<&Plane, DecodeError> {
    let p = frame
        .planes
        .get(index)
        .ok_or_else(|| DecodeError::Decoder(format!("{} frame missing plane {}", frame.format, index)))?;
    let needed = p.stride * rows.saturating_sub(1) + row_bytes;
    if p.stride < row_bytes || p.data.len() < needed {
        return Err(DecodeError::Decoder(format!(
            "plane {} too small: {} bytes, stride {}, need {}",
            index,
            p.data.len(),
            p.stride,
            needed
        )));
    }
    Ok(p)
}

/// BT.601 limited range, integer arithmetic.
fn yuv_to_bgr(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;
    [clip(b), clip(g), clip(r)]
}

fn clip(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i420(width: i32, height: i32, y: u8, u: u8, v: u8) -> RawFrame {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = ((w + 1) / 2, (h + 1) / 2);
        RawFrame {
            width,
            height,
            format: PixelFormat::I420,
            planes: vec![
                Plane {
                    data: vec![y; w * h],
                    stride: w,
                },
                Plane {
                    data: vec![u; cw * ch],
                    stride: cw,
                },
                Plane {
                    data: vec![v; cw * ch],
                    stride: cw,
                },
            ],
        }
    }

    #[test]
    fn rejects_unknown_format_and_empty_geometry() {
        assert!(matches!(
            Converter::new(4, 4, PixelFormat::Other(99)),
            Err(DecodeError::ConversionInitFailed { .. })
        ));
        assert!(matches!(
            Converter::new(0, 4, PixelFormat::I420),
            Err(DecodeError::ConversionInitFailed { .. })
        ));
    }

    #[test]
    fn converts_i420_white_and_black() {
        let conv = Converter::new(4, 2, PixelFormat::I420).unwrap();
        let white = conv.convert(&i420(4, 2, 235, 128, 128)).unwrap();
        assert!(white.data().iter().all(|&b| b == 255));
        let black = conv.convert(&i420(4, 2, 16, 128, 128)).unwrap();
        assert!(black.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn converts_odd_geometry() {
        let conv = Converter::new(3, 3, PixelFormat::I420).unwrap();
        let frame = conv.convert(&i420(3, 3, 16, 128, 128)).unwrap();
        assert_eq!(frame.data().len(), 27);
    }

    #[test]
    fn red_lands_in_last_channel() {
        let conv = Converter::new(2, 2, PixelFormat::I420).unwrap();
        // BT.601 red: Y=81 U=90 V=240
        let frame = conv.convert(&i420(2, 2, 81, 90, 240)).unwrap();
        let px = &frame.data()[..3];
        assert!(px[2] > 240, "red {:?}", px);
        assert!(px[0] < 10 && px[1] < 10, "blue/green {:?}", px);
    }

    #[test]
    fn packed_rgb_honours_stride() {
        let conv = Converter::new(1, 2, PixelFormat::Rgb24).unwrap();
        let frame = RawFrame {
            width: 1,
            height: 2,
            format: PixelFormat::Rgb24,
            planes: vec![Plane {
                data: vec![1, 2, 3, 0, 4, 5, 6, 0],
                stride: 4,
            }],
        };
        let out = conv.convert(&frame).unwrap();
        assert_eq!(out.data(), &[3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn short_plane_is_an_error() {
        let conv = Converter::new(4, 4, PixelFormat::Gray8).unwrap();
        let frame = RawFrame {
            width: 4,
            height: 4,
            format: PixelFormat::Gray8,
            planes: vec![Plane {
                data: vec![0; 8],
                stride: 4,
            }],
        };
        assert!(matches!(conv.convert(&frame), Err(DecodeError::Decoder(_))));
    }

    #[test]
    fn mismatched_frame_is_refused() {
        let conv = Converter::new(4, 2, PixelFormat::I420).unwrap();
        assert!(!conv.matches(&i420(2, 2, 16, 128, 128)));
        assert!(conv.convert(&i420(2, 2, 16, 128, 128)).is_err());
    }
}
