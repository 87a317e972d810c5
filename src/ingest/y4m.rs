//! YUV4MPEG2 file source: uncompressed pictures, no decoder needed.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use super::source::{MediaPacket, PacketSource, Packetization, Payload, ReadEvent, StreamInfo};
use crate::codec::{AccessUnit, CodecId};
use crate::error::OpenError;
use crate::frame::PixelFormat;

const MAGIC: &str = "YUV4MPEG2";

pub struct Y4mSource {
    path: String,
    reader: Box<dyn BufRead + Send>,
    streams: Vec<StreamInfo>,
    frame_size: usize,
    frames: u32,
}

impl Y4mSource {
    pub fn open(path: &Path) -> Result<Self, OpenError> {
        let file = File::open(path)
            .map_err(|e| OpenError::SourceUnreachable(format!("{}: {}", path.display(), e)))?;
        Self::from_reader(path.display().to_string(), BufReader::new(file))
    }

    pub fn from_reader<R>(name: String, mut reader: R) -> Result<Self, OpenError>
    where
        R: BufRead + Send + 'static,
    {
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .map_err(|e| OpenError::InvalidDescriptor(e.to_string()))?;
        let header = parse_header(line.trim_end())?;

        let mut info = StreamInfo::video(0, Some(CodecId::Raw), "rawvideo", Packetization::AccessUnits);
        info.width = header.width;
        info.height = header.height;
        info.format = Some(header.format);
        debug!(
            "{}: {}x{} {} y4m",
            name, header.width, header.height, header.format
        );

        Ok(Self {
            path: name,
            reader: Box::new(reader),
            streams: vec![info],
            frame_size: header.frame_size(),
            frames: 0,
        })
    }
}

impl PacketSource for Y4mSource {
    fn describe(&self) -> String {
        format!("y4m {}", self.path)
    }

    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read(&mut self, _timeout: Duration) -> io::Result<ReadEvent> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(ReadEvent::Eof);
        }
        if !line.starts_with("FRAME") {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected FRAME marker, got {:?}", line.trim_end()),
            ));
        }
        let mut data = vec![0u8; self.frame_size];
        if let Err(e) = self.reader.read_exact(&mut data) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                warn!("{}: truncated final frame", self.path);
                return Ok(ReadEvent::Eof);
            }
            return Err(e);
        }
        let unit = AccessUnit {
            data: Bytes::from(data),
            keyframe: true,
            timestamp: self.frames,
        };
        self.frames += 1;
        Ok(ReadEvent::Packet(MediaPacket {
            stream: 0,
            payload: Payload::Unit(unit),
        }))
    }
}

struct Header {
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl Header {
    fn frame_size(&self) -> usize {
        let (w, h) = (self.width as usize, self.height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        match self.format {
            PixelFormat::I420 => w * h + 2 * cw * ch,
            PixelFormat::I422 => w * h + 2 * cw * h,
            PixelFormat::I444 => 3 * w * h,
            _ => w * h,
        }
    }
}

fn parse_header(line: &str) -> Result<Header, OpenError> {
    let mut params = line.split(' ');
    if params.next() != Some(MAGIC) {
        return Err(OpenError::InvalidDescriptor(
            "missing YUV4MPEG2 signature".to_string(),
        ));
    }
    let (mut width, mut height, mut format) = (0, 0, PixelFormat::I420);
    for param in params.filter(|p| !p.is_empty()) {
        let mut chars = param.chars();
        let tag = chars.next();
        let value = chars.as_str();
        match tag {
            Some('W') => width = value.parse().unwrap_or(0),
            Some('H') => height = value.parse().unwrap_or(0),
            Some('C') => {
                format = match value {
                    v if v.starts_with("420") => PixelFormat::I420,
                    "422" => PixelFormat::I422,
                    "444" => PixelFormat::I444,
                    "mono" => PixelFormat::Gray8,
                    other => {
                        return Err(OpenError::InvalidDescriptor(format!(
                            "unsupported y4m colorspace {}",
                            other
                        )))
                    }
                }
            }
            _ => {}
        }
    }
    if width == 0 || height == 0 {
        return Err(OpenError::InvalidDescriptor(
            "y4m header without geometry".to_string(),
        ));
    }
    Ok(Header {
        width,
        height,
        format,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn source(bytes: Vec<u8>) -> Y4mSource {
        Y4mSource::from_reader("test".to_string(), Cursor::new(bytes)).unwrap()
    }

    #[test]
    fn parses_header_tags() {
        let h = parse_header("YUV4MPEG2 W4 H2 F30:1 Ip A1:1 C420jpeg").unwrap();
        assert_eq!((h.width, h.height, h.format), (4, 2, PixelFormat::I420));
        assert_eq!(h.frame_size(), 8 + 2 + 2);
        let h = parse_header("YUV4MPEG2 W3 H3 Cmono").unwrap();
        assert_eq!(h.format, PixelFormat::Gray8);
        assert!(parse_header("YUV4MPEG2 W3").is_err());
        assert!(parse_header("RIFF W3 H3").is_err());
        assert!(parse_header("YUV4MPEG2 W3 H3 C411").is_err());
    }

    #[test]
    fn reads_frames_then_eof() {
        let mut bytes = b"YUV4MPEG2 W2 H2 Cmono\n".to_vec();
        for i in 0..2u8 {
            bytes.extend_from_slice(b"FRAME\n");
            bytes.extend_from_slice(&[i; 4]);
        }
        let mut src = source(bytes);
        assert_eq!(src.streams()[0].format, Some(PixelFormat::Gray8));
        for i in 0..2u8 {
            match src.read(Duration::ZERO).unwrap() {
                ReadEvent::Packet(MediaPacket {
                    payload: Payload::Unit(unit),
                    ..
                }) => {
                    assert_eq!(&unit.data[..], &[i; 4]);
                    assert!(unit.keyframe);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(matches!(src.read(Duration::ZERO).unwrap(), ReadEvent::Eof));
    }

    #[test]
    fn truncated_frame_ends_stream() {
        let mut bytes = b"YUV4MPEG2 W2 H2 Cmono\nFRAME\n".to_vec();
        bytes.extend_from_slice(&[1, 2]);
        let mut src = source(bytes);
        assert!(matches!(src.read(Duration::ZERO).unwrap(), ReadEvent::Eof));
    }

    #[test]
    fn garbage_between_frames_is_a_read_error() {
        let mut src = source(b"YUV4MPEG2 W2 H2 Cmono\nJUNK\n".to_vec());
        assert!(src.read(Duration::ZERO).is_err());
    }
}
