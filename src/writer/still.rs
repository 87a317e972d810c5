use std::io::Cursor;
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage};

use crate::error::ContainerError;
use crate::frame::CanonicalFrame;

/// Writes one frame as a still image, format chosen by the path extension.
pub fn save(frame: &CanonicalFrame, path: &Path) -> Result<(), ContainerError> {
    let img = RgbImage::from_raw(frame.width(), frame.height(), frame.to_rgb())
        .ok_or_else(|| ContainerError::Encode("frame buffer does not fit geometry".to_string()))?;
    img.save(path)
        .map_err(|e| ContainerError::Encode(format!("{}: {}", path.display(), e)))
}

/// Encodes one frame as a baseline JPEG, the sample format of both containers.
pub fn encode_jpeg(frame: &CanonicalFrame, quality: u8) -> Result<Vec<u8>, ContainerError> {
    let mut buf = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode(
            &frame.to_rgb(),
            frame.width(),
            frame.height(),
            ExtendedColorType::Rgb8,
        )
        .map_err(|e| ContainerError::Encode(e.to_string()))?;
    Ok(buf.into_inner())
}
