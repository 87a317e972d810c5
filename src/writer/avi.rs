//! RIFF AVI 1.0 writer with Motion-JPEG video, the widely playable fallback.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{still, ContainerBackend, VideoSink};
use crate::error::ContainerError;
use crate::frame::CanonicalFrame;

const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;
const CHUNK_ID: &[u8; 4] = b"00dc";

pub struct AviBackend {
    pub quality: u8,
}

impl Default for AviBackend {
    fn default() -> Self {
        Self { quality: 90 }
    }
}

impl ContainerBackend for AviBackend {
    fn name(&self) -> &'static str {
        "avi/mjpeg"
    }

    fn extension(&self) -> &'static str {
        "avi"
    }

    fn open(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Box<dyn VideoSink>, ContainerError> {
        Ok(Box::new(AviSink::create(
            path,
            width,
            height,
            fps,
            self.quality,
        )?))
    }
}

/// Header fields only known once the last frame is in.
struct Patches {
    riff_size: u64,
    total_frames: u64,
    avih_buffer_size: u64,
    stream_length: u64,
    strh_buffer_size: u64,
    movi_size: u64,
    /// Offset of the `movi` fourcc, the base of idx1 offsets.
    movi_base: u64,
}

struct IndexEntry {
    offset: u32,
    size: u32,
}

pub struct AviSink {
    path: PathBuf,
    out: BufWriter<File>,
    width: u32,
    height: u32,
    quality: u8,
    patches: Patches,
    position: u64,
    largest: u32,
    index: Vec<IndexEntry>,
}

impl AviSink {
    pub fn create(
        path: &Path,
        width: u32,
        height: u32,
        fps: u32,
        quality: u8,
    ) -> Result<Self, ContainerError> {
        if width == 0 || height == 0 || width > u16::MAX as u32 || height > u16::MAX as u32 {
            return Err(ContainerError::Geometry { width, height });
        }
        let fps = fps.max(1);
        let (header, patches) = build_header(width, height, fps);
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(&header)?;

        debug!("avi opened {} {}x{}@{}", path.display(), width, height, fps);
        Ok(Self {
            path: path.to_path_buf(),
            out,
            width,
            height,
            quality,
            patches,
            position: header.len() as u64,
            largest: 0,
            index: Vec::new(),
        })
    }

    fn patch(&mut self, at: u64, value: u32) -> Result<(), ContainerError> {
        self.out.seek(SeekFrom::Start(at))?;
        self.out.write_all(&value.to_le_bytes())?;
        Ok(())
    }
}

impl VideoSink for AviSink {
    fn path(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, frame: &CanonicalFrame) -> Result<(), ContainerError> {
        if frame.geometry() != (self.width, self.height) {
            return Err(ContainerError::Geometry {
                width: frame.width(),
                height: frame.height(),
            });
        }
        let jpeg = still::encode_jpeg(frame, self.quality)?;
        let padded = jpeg.len() as u64 + (jpeg.len() as u64 & 1);
        let index_len = 16 * (self.index.len() as u64 + 1) + 8;
        if self.position + 8 + padded + index_len > u32::MAX as u64 {
            return Err(ContainerError::Encode(
                "AVI 1.0 file size limit reached".to_string(),
            ));
        }
        let size = jpeg.len() as u32;

        let mut chunk = Vec::with_capacity(8 + padded as usize);
        chunk.extend_from_slice(CHUNK_ID);
        chunk.extend_from_slice(&size.to_le_bytes());
        chunk.extend_from_slice(&jpeg);
        if jpeg.len() % 2 == 1 {
            chunk.push(0);
        }
        self.out.write_all(&chunk)?;

        self.index.push(IndexEntry {
            offset: (self.position - self.patches.movi_base) as u32,
            size,
        });
        self.largest = self.largest.max(size);
        self.position += chunk.len() as u64;
        Ok(())
    }

    fn frames(&self) -> u64 {
        self.index.len() as u64
    }

    fn finish(mut self: Box<Self>) -> Result<(), ContainerError> {
        let movi_end = self.position;

        let mut idx1 = Vec::with_capacity(8 + 16 * self.index.len());
        idx1.extend_from_slice(b"idx1");
        idx1.extend_from_slice(&((16 * self.index.len()) as u32).to_le_bytes());
        for entry in &self.index {
            idx1.extend_from_slice(CHUNK_ID);
            idx1.extend_from_slice(&AVIIF_KEYFRAME.to_le_bytes());
            idx1.extend_from_slice(&entry.offset.to_le_bytes());
            idx1.extend_from_slice(&entry.size.to_le_bytes());
        }
        self.out.write_all(&idx1)?;
        let file_end = movi_end + idx1.len() as u64;

        let frames = self.index.len() as u32;
        let largest = self.largest;
        let p = &self.patches;
        let fields = [
            (p.riff_size, (file_end - 8) as u32),
            (p.total_frames, frames),
            (p.avih_buffer_size, largest),
            (p.stream_length, frames),
            (p.strh_buffer_size, largest),
            (p.movi_size, (movi_end - p.movi_base) as u32),
        ];
        for (at, value) in fields {
            self.patch(at, value)?;
        }
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        debug!("avi finished {} with {} frames", self.path.display(), frames);
        Ok(())
    }
}

fn build_header(width: u32, height: u32, fps: u32) -> (Vec<u8>, Patches) {
    let mut h = Vec::with_capacity(224);
    let here = |h: &Vec<u8>| h.len() as u64;

    h.extend_from_slice(b"RIFF");
    let riff_size = here(&h);
    le_u32(&mut h, 0);
    h.extend_from_slice(b"AVI ");

    h.extend_from_slice(b"LIST");
    le_u32(&mut h, 4 + (8 + 56) + (8 + 4 + (8 + 56) + (8 + 40)));
    h.extend_from_slice(b"hdrl");

    h.extend_from_slice(b"avih");
    le_u32(&mut h, 56);
    le_u32(&mut h, 1_000_000 / fps); // microseconds per frame
    le_u32(&mut h, 0); // max bytes per second
    le_u32(&mut h, 0); // padding granularity
    le_u32(&mut h, AVIF_HASINDEX);
    let total_frames = here(&h);
    le_u32(&mut h, 0);
    le_u32(&mut h, 0); // initial frames
    le_u32(&mut h, 1); // streams
    let avih_buffer_size = here(&h);
    le_u32(&mut h, 0);
    le_u32(&mut h, width);
    le_u32(&mut h, height);
    zeroes(&mut h, 16);

    h.extend_from_slice(b"LIST");
    le_u32(&mut h, 4 + (8 + 56) + (8 + 40));
    h.extend_from_slice(b"strl");

    h.extend_from_slice(b"strh");
    le_u32(&mut h, 56);
    h.extend_from_slice(b"vids");
    h.extend_from_slice(b"MJPG");
    le_u32(&mut h, 0); // flags
    le_u16(&mut h, 0); // priority
    le_u16(&mut h, 0); // language
    le_u32(&mut h, 0); // initial frames
    le_u32(&mut h, 1); // scale
    le_u32(&mut h, fps); // rate
    le_u32(&mut h, 0); // start
    let stream_length = here(&h);
    le_u32(&mut h, 0);
    let strh_buffer_size = here(&h);
    le_u32(&mut h, 0);
    le_u32(&mut h, u32::MAX); // default quality
    le_u32(&mut h, 0); // sample size
    le_u16(&mut h, 0);
    le_u16(&mut h, 0);
    le_u16(&mut h, width as u16);
    le_u16(&mut h, height as u16);

    h.extend_from_slice(b"strf");
    le_u32(&mut h, 40);
    le_u32(&mut h, 40); // BITMAPINFOHEADER size
    le_u32(&mut h, width);
    le_u32(&mut h, height);
    le_u16(&mut h, 1); // planes
    le_u16(&mut h, 24); // bit count
    h.extend_from_slice(b"MJPG");
    le_u32(&mut h, width * height * 3);
    zeroes(&mut h, 16); // resolution & palette

    h.extend_from_slice(b"LIST");
    let movi_size = here(&h);
    le_u32(&mut h, 0);
    let movi_base = here(&h);
    h.extend_from_slice(b"movi");

    (
        h,
        Patches {
            riff_size,
            total_frames,
            avih_buffer_size,
            stream_length,
            strh_buffer_size,
            movi_size,
            movi_base,
        },
    )
}

#[inline]
fn le_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

#[inline]
fn le_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

#[inline]
fn zeroes(buf: &mut Vec<u8>, n: usize) {
    buf.extend(std::iter::repeat_n(0u8, n));
}
