//! RTP payload reassembly into access units.

use anyhow::{anyhow, Result};
use bytes::BytesMut;
use webrtc::rtp::codecs::{vp8::Vp8Packet, vp9::Vp9Packet};
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Depacketizer;

use crate::codec::{AccessUnit, CodecId};

/// Returns `Ok(Some(unit))` once the marker bit closes a picture.
pub trait RtpParser: Send {
    fn push_packet(&mut self, pkt: &Packet) -> Result<Option<AccessUnit>>;
}

pub fn parser_for(codec: CodecId) -> Option<Box<dyn RtpParser>> {
    match codec {
        CodecId::H264 => Some(Box::new(H264RtpParser::new())),
        CodecId::Vp8 => Some(Box::new(Vp8RtpParser::new())),
        CodecId::Vp9 => Some(Box::new(Vp9RtpParser::new())),
        CodecId::Raw => None,
    }
}

fn take_unit(buffer: &mut BytesMut, keyframe: &mut bool, timestamp: u32) -> AccessUnit {
    let unit = AccessUnit {
        data: std::mem::take(buffer).freeze(),
        keyframe: *keyframe,
        timestamp,
    };
    *keyframe = false;
    unit
}

/// Single NALU, STAP-A and FU-A payloads to one Annex-B picture.
pub struct H264RtpParser {
    buffer: BytesMut,
    idr: bool,
    /// A FU-A start was seen and its end has not.
    in_fragment: bool,
}

impl Default for H264RtpParser {
    fn default() -> Self {
        Self::new()
    }
}

impl H264RtpParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            idr: false,
            in_fragment: false,
        }
    }

    #[inline]
    fn push_annexb_prefix(&mut self) {
        self.buffer.extend_from_slice(&[0, 0, 0, 1]);
    }

    #[inline]
    fn push_annexb_nalu(&mut self, nalu: &[u8]) {
        if nalu[0] & 0x1F == 5 {
            self.idr = true;
        }
        self.push_annexb_prefix();
        self.buffer.extend_from_slice(nalu);
    }
}

impl RtpParser for H264RtpParser {
    fn push_packet(&mut self, pkt: &Packet) -> Result<Option<AccessUnit>> {
        let payload = &pkt.payload;
        if payload.is_empty() {
            return Ok(None);
        }
        match payload[0] & 0x1F {
            1..=23 => self.push_annexb_nalu(payload),
            24 => {
                // STAP-A: header byte, then (size | nalu)*
                let mut offset = 1;
                while offset + 2 <= payload.len() {
                    let size = ((payload[offset] as usize) << 8) | payload[offset + 1] as usize;
                    offset += 2;
                    if size == 0 || offset + size > payload.len() {
                        break;
                    }
                    self.push_annexb_nalu(&payload[offset..offset + size]);
                    offset += size;
                }
            }
            28 => {
                if payload.len() < 2 {
                    return Err(anyhow!("FU-A payload too short"));
                }
                let fu_header = payload[1];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;
                let nal_unit_type = fu_header & 0x1F;
                if start {
                    let nri = payload[0] & 0x60;
                    self.push_annexb_prefix();
                    self.buffer.extend_from_slice(&[nri | nal_unit_type]);
                    if nal_unit_type == 5 {
                        self.idr = true;
                    }
                    self.in_fragment = true;
                }
                // a continuation without its start is unusable
                if self.in_fragment {
                    self.buffer.extend_from_slice(&payload[2..]);
                }
                if end {
                    self.in_fragment = false;
                }
            }
            _ => {}
        }

        if pkt.header.marker {
            self.in_fragment = false;
            if self.buffer.is_empty() {
                return Ok(None);
            }
            Ok(Some(take_unit(
                &mut self.buffer,
                &mut self.idr,
                pkt.header.timestamp,
            )))
        } else {
            Ok(None)
        }
    }
}

pub struct Vp8RtpParser {
    depacketizer: Vp8Packet,
    buffer: BytesMut,
    keyframe: bool,
}

impl Default for Vp8RtpParser {
    fn default() -> Self {
        Self::new()
    }
}

impl Vp8RtpParser {
    pub fn new() -> Self {
        Self {
            depacketizer: Vp8Packet::default(),
            buffer: BytesMut::new(),
            keyframe: false,
        }
    }
}

impl RtpParser for Vp8RtpParser {
    fn push_packet(&mut self, pkt: &Packet) -> Result<Option<AccessUnit>> {
        let payload = self
            .depacketizer
            .depacketize(&pkt.payload)
            .map_err(|e| anyhow!(e))?;
        if self.buffer.is_empty() && !payload.is_empty() {
            // frame tag: P bit clear on keyframes
            self.keyframe = payload[0] & 0x01 == 0;
        }
        self.buffer.extend_from_slice(&payload);
        if pkt.header.marker && !self.buffer.is_empty() {
            Ok(Some(take_unit(
                &mut self.buffer,
                &mut self.keyframe,
                pkt.header.timestamp,
            )))
        } else {
            Ok(None)
        }
    }
}

pub struct Vp9RtpParser {
    depacketizer: Vp9Packet,
    buffer: BytesMut,
    keyframe: bool,
}

impl Default for Vp9RtpParser {
    fn default() -> Self {
        Self::new()
    }
}

impl Vp9RtpParser {
    pub fn new() -> Self {
        Self {
            depacketizer: Vp9Packet::default(),
            buffer: BytesMut::new(),
            keyframe: false,
        }
    }
}

impl RtpParser for Vp9RtpParser {
    fn push_packet(&mut self, pkt: &Packet) -> Result<Option<AccessUnit>> {
        let payload = self
            .depacketizer
            .depacketize(&pkt.payload)
            .map_err(|e| anyhow!(e))?;
        if self.buffer.is_empty() && !payload.is_empty() {
            self.keyframe = vp9_is_keyframe(payload[0]);
        }
        self.buffer.extend_from_slice(&payload);
        if pkt.header.marker && !self.buffer.is_empty() {
            Ok(Some(take_unit(
                &mut self.buffer,
                &mut self.keyframe,
                pkt.header.timestamp,
            )))
        } else {
            Ok(None)
        }
    }
}

/// Reads frame_type from the first byte of a VP9 uncompressed header.
fn vp9_is_keyframe(b: u8) -> bool {
    if b >> 6 != 0b10 {
        return false;
    }
    let profile = ((b >> 5) & 1) | (((b >> 4) & 1) << 1);
    // profile 3 carries one reserved bit before show_existing_frame
    let shift = if profile == 3 { 2 } else { 3 };
    let show_existing = (b >> shift) & 1;
    let frame_type = (b >> (shift - 1)) & 1;
    show_existing == 0 && frame_type == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn packet(payload: &'static [u8], marker: bool, timestamp: u32) -> Packet {
        let mut pkt = Packet::default();
        pkt.header.marker = marker;
        pkt.header.timestamp = timestamp;
        pkt.payload = Bytes::from_static(payload);
        pkt
    }

    #[test]
    fn h264_single_nalu_idr() {
        let mut parser = H264RtpParser::new();
        let unit = parser
            .push_packet(&packet(&[0x65, 0xAA, 0xBB], true, 90))
            .unwrap()
            .expect("frame on marker");
        assert!(unit.keyframe);
        assert_eq!(unit.timestamp, 90);
        assert_eq!(&unit.data[..], &[0, 0, 0, 1, 0x65, 0xAA, 0xBB]);
    }

    #[test]
    fn h264_stap_a_and_fu_a() {
        let mut parser = H264RtpParser::new();
        // STAP-A with SPS (0x67) and PPS (0x68)
        let stap = packet(&[0x18, 0x00, 0x02, 0x67, 0x01, 0x00, 0x02, 0x68, 0x02], false, 1);
        assert!(parser.push_packet(&stap).unwrap().is_none());
        // IDR split across two FU-A fragments
        assert!(parser
            .push_packet(&packet(&[0x7C, 0x85, 0x01, 0x02], false, 1))
            .unwrap()
            .is_none());
        let unit = parser
            .push_packet(&packet(&[0x7C, 0x45, 0x03], true, 1))
            .unwrap()
            .unwrap();
        assert!(unit.keyframe);
        assert_eq!(
            &unit.data[..],
            &[0, 0, 0, 1, 0x67, 0x01, 0, 0, 0, 1, 0x68, 0x02, 0, 0, 0, 1, 0x65, 0x01, 0x02, 0x03]
        );
    }

    #[test]
    fn h264_orphan_fragment_is_dropped() {
        let mut parser = H264RtpParser::new();
        assert!(parser
            .push_packet(&packet(&[0x7C, 0x41, 0x09], true, 1))
            .unwrap()
            .is_none());
        let unit = parser
            .push_packet(&packet(&[0x41, 0x01], true, 2))
            .unwrap()
            .unwrap();
        assert!(!unit.keyframe);
        assert_eq!(&unit.data[..], &[0, 0, 0, 1, 0x41, 0x01]);
    }

    #[test]
    fn vp8_keyframe_bit() {
        let mut parser = Vp8RtpParser::new();
        // descriptor S=1 PID=0, then frame tag with P=0
        let unit = parser
            .push_packet(&packet(&[0x10, 0x00, 0x9D, 0x01, 0x2A], true, 3000))
            .unwrap()
            .unwrap();
        assert!(unit.keyframe);
        assert_eq!(&unit.data[..], &[0x00, 0x9D, 0x01, 0x2A]);

        let unit = parser
            .push_packet(&packet(&[0x10, 0x01, 0x00, 0x00], true, 6000))
            .unwrap()
            .unwrap();
        assert!(!unit.keyframe);
    }

    #[test]
    fn vp9_header_frame_type() {
        // frame_marker=2, profile 0, show_existing=0, frame_type=0
        assert!(vp9_is_keyframe(0b1000_0000));
        // frame_type=1
        assert!(!vp9_is_keyframe(0b1000_0100));
        // not a frame marker
        assert!(!vp9_is_keyframe(0x00));
    }

    #[test]
    fn no_parser_for_raw() {
        assert!(parser_for(CodecId::Raw).is_none());
        assert!(parser_for(CodecId::H264).is_some());
    }
}
