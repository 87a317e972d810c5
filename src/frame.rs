use std::fmt;

/// Bytes per pixel of the canonical layout.
pub const CANONICAL_CHANNELS: usize = 3;

/// One decoded frame normalized to packed 8-bit BGR.
///
/// The buffer length always equals `width * height * 3`. A frame is moved
/// from the producing stage into the persistence engine and never shared.
#[derive(Clone, PartialEq, Eq)]
pub struct CanonicalFrame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl CanonicalFrame {
    /// Returns `None` when the geometry is empty or does not match the buffer.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        let expected = (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(CANONICAL_CHANNELS)?;
        if data.len() != expected {
            return None;
        }
        Some(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn geometry(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Packed BGR pixels, row-major, no padding.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Copies the pixels out in RGB order, as image encoders expect.
    pub fn to_rgb(&self) -> Vec<u8> {
        let mut rgb = Vec::with_capacity(self.data.len());
        for px in self.data.chunks_exact(CANONICAL_CHANNELS) {
            rgb.extend_from_slice(&[px[2], px[1], px[0]]);
        }
        rgb
    }
}

impl fmt::Debug for CanonicalFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanonicalFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Pixel layouts a decoder may hand back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Planar 4:2:0, Y then U then V.
    I420,
    /// Y plane followed by interleaved UV at half resolution.
    Nv12,
    /// Planar 4:2:2.
    I422,
    /// Planar 4:4:4.
    I444,
    Gray8,
    Rgb24,
    Bgr24,
    Rgba,
    Bgra,
    /// Anything the decoder produced that we cannot name.
    Other(u32),
}

impl PixelFormat {
    /// Number of planes the format carries.
    pub fn planes(&self) -> usize {
        match self {
            PixelFormat::I420 | PixelFormat::I422 | PixelFormat::I444 => 3,
            PixelFormat::Nv12 => 2,
            PixelFormat::Gray8
            | PixelFormat::Rgb24
            | PixelFormat::Bgr24
            | PixelFormat::Rgba
            | PixelFormat::Bgra => 1,
            PixelFormat::Other(_) => 0,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::I420 => write!(f, "yuv420p"),
            PixelFormat::Nv12 => write!(f, "nv12"),
            PixelFormat::I422 => write!(f, "yuv422p"),
            PixelFormat::I444 => write!(f, "yuv444p"),
            PixelFormat::Gray8 => write!(f, "gray"),
            PixelFormat::Rgb24 => write!(f, "rgb24"),
            PixelFormat::Bgr24 => write!(f, "bgr24"),
            PixelFormat::Rgba => write!(f, "rgba"),
            PixelFormat::Bgra => write!(f, "bgra"),
            PixelFormat::Other(id) => write!(f, "unknown({id})"),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Plane {
    pub data: Vec<u8>,
    /// Bytes per row, may exceed the visible width.
    pub stride: usize,
}

/// A frame as emitted by a decoder, before conversion.
///
/// Geometry is signed because decoders report it that way and a
/// non-positive value marks a frame that must be dropped.
#[derive(Clone)]
pub struct RawFrame {
    pub width: i32,
    pub height: i32,
    pub format: PixelFormat,
    pub planes: Vec<Plane>,
}

impl RawFrame {
    pub fn has_valid_geometry(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("planes", &self.planes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_frame_rejects_bad_geometry() {
        assert!(CanonicalFrame::new(0, 2, vec![]).is_none());
        assert!(CanonicalFrame::new(2, 2, vec![0; 11]).is_none());
        assert!(CanonicalFrame::new(2, 2, vec![0; 12]).is_some());
    }

    #[test]
    fn canonical_frame_to_rgb_swaps_channels() {
        let frame = CanonicalFrame::new(2, 1, vec![1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(frame.to_rgb(), vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn raw_frame_geometry() {
        let frame = RawFrame {
            width: 0,
            height: 16,
            format: PixelFormat::Gray8,
            planes: vec![],
        };
        assert!(!frame.has_valid_geometry());
    }
}
