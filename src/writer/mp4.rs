//! Progressive ISO-BMFF writer carrying Motion-JPEG samples.
//!
//! Layout is `ftyp`, one `mdat` grown as frames arrive, and `moov` written
//! by [`VideoSink::finish`]. Until then the file has no index and is not
//! playable.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{still, ContainerBackend, VideoSink};
use crate::error::ContainerError;
use crate::frame::CanonicalFrame;

const TRACK_ID: u32 = 1;
/// MPEG-4 systems objectTypeIndication for JPEG.
const OTI_JPEG: u8 = 0x6C;

pub struct Mp4Backend {
    pub quality: u8,
}

impl Default for Mp4Backend {
    fn default() -> Self {
        Self { quality: 90 }
    }
}

impl ContainerBackend for Mp4Backend {
    fn name(&self) -> &'static str {
        "mp4/mjpeg"
    }

    fn extension(&self) -> &'static str {
        "mp4"
    }

    fn open(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Box<dyn VideoSink>, ContainerError> {
        Ok(Box::new(Mp4Sink::create(
            path,
            width,
            height,
            fps,
            self.quality,
        )?))
    }
}

pub struct Mp4Sink {
    path: PathBuf,
    out: BufWriter<File>,
    width: u32,
    height: u32,
    timescale: u32,
    quality: u8,
    mdat_start: u64,
    position: u64,
    offsets: Vec<u64>,
    sizes: Vec<u32>,
}

impl Mp4Sink {
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
        let mut out = BufWriter::new(File::create(path)?);

        let ftyp = build_ftyp();
        out.write_all(&ftyp)?;
        let mdat_start = ftyp.len() as u64;
        // size = 1 selects the 64-bit largesize that follows the type
        let mut mdat = Vec::with_capacity(16);
        be_u32(&mut mdat, 1);
        mdat.extend_from_slice(b"mdat");
        mdat.extend_from_slice(&0u64.to_be_bytes());
        out.write_all(&mdat)?;

        debug!("mp4 opened {} {}x{}@{}", path.display(), width, height, fps);
        Ok(Self {
            path: path.to_path_buf(),
            out,
            width,
            height,
            timescale: fps.max(1),
            quality,
            mdat_start,
            position: mdat_start + mdat.len() as u64,
            offsets: Vec::new(),
            sizes: Vec::new(),
        })
    }

    fn build_moov(&self) -> Vec<u8> {
        let duration = self.sizes.len() as u32;
        let mvhd = build_mvhd(self.timescale, duration, TRACK_ID + 1);
        let trak = self.build_trak(duration);
        make_box(b"moov", &[mvhd, trak].concat())
    }

    fn build_trak(&self, duration: u32) -> Vec<u8> {
        let tkhd = build_tkhd(TRACK_ID, duration, self.width, self.height);
        let mdhd = build_mdhd(self.timescale, duration);
        let hdlr = build_hdlr(b"vide", b"VideoHandler\0");
        let minf = make_box(
            b"minf",
            &[build_vmhd(), build_dinf(), self.build_stbl()].concat(),
        );
        let mdia = make_box(b"mdia", &[mdhd, hdlr, minf].concat());
        make_box(b"trak", &[tkhd, mdia].concat())
    }

    fn build_stbl(&self) -> Vec<u8> {
        let count = self.sizes.len() as u32;

        let stsd = {
            let mut payload = Vec::new();
            be_u32(&mut payload, 0);
            be_u32(&mut payload, 1);
            payload.extend_from_slice(&build_mp4v_sample_entry(self.width, self.height));
            make_box(b"stsd", &payload)
        };

        let stts = {
            let mut payload = Vec::with_capacity(16);
            be_u32(&mut payload, 0);
            if count == 0 {
                be_u32(&mut payload, 0);
            } else {
                be_u32(&mut payload, 1);
                be_u32(&mut payload, count);
                be_u32(&mut payload, 1); // one tick per frame
            }
            make_box(b"stts", &payload)
        };

        // one sample per chunk
        let stsc = {
            let mut payload = Vec::with_capacity(20);
            be_u32(&mut payload, 0);
            if count == 0 {
                be_u32(&mut payload, 0);
            } else {
                be_u32(&mut payload, 1);
                be_u32(&mut payload, 1);
                be_u32(&mut payload, 1);
                be_u32(&mut payload, 1);
            }
            make_box(b"stsc", &payload)
        };

        let stsz = {
            let mut payload = Vec::with_capacity(12 + 4 * self.sizes.len());
            be_u32(&mut payload, 0);
            be_u32(&mut payload, 0);
            be_u32(&mut payload, count);
            for size in &self.sizes {
                be_u32(&mut payload, *size);
            }
            make_box(b"stsz", &payload)
        };

        let co64 = {
            let mut payload = Vec::with_capacity(8 + 8 * self.offsets.len());
            be_u32(&mut payload, 0);
            be_u32(&mut payload, count);
            for offset in &self.offsets {
                payload.extend_from_slice(&offset.to_be_bytes());
            }
            make_box(b"co64", &payload)
        };

        make_box(b"stbl", &[stsd, stts, stsc, stsz, co64].concat())
    }
}

impl VideoSink for Mp4Sink {
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
        let size = u32::try_from(jpeg.len())
            .map_err(|_| ContainerError::Encode("sample larger than 4 GiB".to_string()))?;
        self.out.write_all(&jpeg)?;
        self.offsets.push(self.position);
        self.sizes.push(size);
        self.position += jpeg.len() as u64;
        Ok(())
    }

    fn frames(&self) -> u64 {
        self.sizes.len() as u64
    }

    fn finish(mut self: Box<Self>) -> Result<(), ContainerError> {
        let mdat_size = self.position - self.mdat_start;
        let moov = self.build_moov();
        self.out.write_all(&moov)?;
        self.out.seek(SeekFrom::Start(self.mdat_start + 8))?;
        self.out.write_all(&mdat_size.to_be_bytes())?;
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        debug!(
            "mp4 finished {} with {} samples",
            self.path.display(),
            self.sizes.len()
        );
        Ok(())
    }
}

fn build_ftyp() -> Vec<u8> {
    let mut payload = Vec::with_capacity(20);
    payload.extend_from_slice(b"isom");
    be_u32(&mut payload, 512);
    for brand in [b"isom", b"iso2", b"mp41"] {
        payload.extend_from_slice(brand);
    }
    make_box(b"ftyp", &payload)
}

fn build_mvhd(timescale: u32, duration: u32, next_track_id: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(100);
    be_u32(&mut payload, 0); // version & flags
    zeroes(&mut payload, 8); // creation & modification time
    be_u32(&mut payload, timescale);
    be_u32(&mut payload, duration);
    be_u32(&mut payload, 0x0001_0000); // rate 1.0
    be_u16(&mut payload, 0x0100); // volume 1.0
    be_u16(&mut payload, 0);
    zeroes(&mut payload, 8);
    unity_matrix(&mut payload);
    zeroes(&mut payload, 24); // pre_defined[6]
    be_u32(&mut payload, next_track_id);
    make_box(b"mvhd", &payload)
}

fn build_tkhd(track_id: u32, duration: u32, width: u32, height: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(84);
    be_u32(&mut payload, 0x0000_0007); // enabled, in movie, in preview
    zeroes(&mut payload, 8);
    be_u32(&mut payload, track_id);
    be_u32(&mut payload, 0);
    be_u32(&mut payload, duration);
    zeroes(&mut payload, 8);
    be_u16(&mut payload, 0); // layer
    be_u16(&mut payload, 0); // alternate group
    be_u16(&mut payload, 0); // volume
    be_u16(&mut payload, 0);
    unity_matrix(&mut payload);
    // 16.16 fixed point
    be_u32(&mut payload, width << 16);
    be_u32(&mut payload, height << 16);
    make_box(b"tkhd", &payload)
}

fn build_mdhd(timescale: u32, duration: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(24);
    be_u32(&mut payload, 0);
    zeroes(&mut payload, 8);
    be_u32(&mut payload, timescale);
    be_u32(&mut payload, duration);
    be_u16(&mut payload, 0x55c4); // und
    be_u16(&mut payload, 0);
    make_box(b"mdhd", &payload)
}

fn build_hdlr(typ: &[u8; 4], name: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(24 + name.len());
    be_u32(&mut payload, 0);
    be_u32(&mut payload, 0);
    payload.extend_from_slice(typ);
    zeroes(&mut payload, 12);
    payload.extend_from_slice(name);
    make_box(b"hdlr", &payload)
}

fn build_vmhd() -> Vec<u8> {
    let mut payload = Vec::with_capacity(12);
    be_u32(&mut payload, 0x0000_0001);
    zeroes(&mut payload, 8); // graphics mode & opcolor
    make_box(b"vmhd", &payload)
}

fn build_dinf() -> Vec<u8> {
    let url_box = {
        let mut payload = Vec::with_capacity(4);
        be_u32(&mut payload, 0x0000_0001); // media is in this file
        make_box(b"url ", &payload)
    };
    let mut dref = Vec::with_capacity(8 + url_box.len());
    be_u32(&mut dref, 0);
    be_u32(&mut dref, 1);
    dref.extend_from_slice(&url_box);
    make_box(b"dinf", &make_box(b"dref", &dref))
}

fn build_mp4v_sample_entry(width: u32, height: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(120);
    zeroes(&mut payload, 6);
    be_u16(&mut payload, 1); // data_reference_index
    zeroes(&mut payload, 16); // pre_defined & reserved
    be_u16(&mut payload, width as u16);
    be_u16(&mut payload, height as u16);
    be_u32(&mut payload, 0x0048_0000); // 72 dpi
    be_u32(&mut payload, 0x0048_0000);
    be_u32(&mut payload, 0);
    be_u16(&mut payload, 1); // frame_count
    let name = b"Motion JPEG";
    payload.push(name.len() as u8);
    payload.extend_from_slice(name);
    zeroes(&mut payload, 31 - name.len());
    be_u16(&mut payload, 0x0018); // depth
    be_u16(&mut payload, 0xFFFF); // pre_defined = -1
    payload.extend_from_slice(&build_esds());
    make_box(b"mp4v", &payload)
}

fn build_esds() -> Vec<u8> {
    let mut decoder_config = vec![OTI_JPEG, (0x04 << 2) | 0x01]; // visual stream
    zeroes(&mut decoder_config, 3); // bufferSizeDB
    be_u32(&mut decoder_config, 0); // max bitrate
    be_u32(&mut decoder_config, 0); // avg bitrate

    let mut es = Vec::with_capacity(32);
    be_u16(&mut es, TRACK_ID as u16);
    es.push(0);
    descriptor(&mut es, 0x04, &decoder_config);
    descriptor(&mut es, 0x06, &[0x02]); // SLConfig predefined MP4

    let mut payload = Vec::with_capacity(40);
    be_u32(&mut payload, 0);
    descriptor(&mut payload, 0x03, &es);
    make_box(b"esds", &payload)
}

fn descriptor(buf: &mut Vec<u8>, tag: u8, body: &[u8]) {
    buf.push(tag);
    buf.push(body.len() as u8);
    buf.extend_from_slice(body);
}

fn unity_matrix(buf: &mut Vec<u8>) {
    for v in [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        be_u32(buf, v);
    }
}

fn make_box(typ: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(8 + payload.len());
    let size = (8 + payload.len()) as u32;
    v.extend_from_slice(&size.to_be_bytes());
    v.extend_from_slice(typ);
    v.extend_from_slice(payload);
    v
}

#[inline]
fn be_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

#[inline]
fn be_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

#[inline]
fn zeroes(buf: &mut Vec<u8>, n: usize) {
    buf.extend(std::iter::repeat_n(0u8, n));
}
