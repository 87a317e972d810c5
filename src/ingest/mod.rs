//! Stream decoder: packet source in, canonical frames out.
//!
//! [`StreamDecoder::open`] picks a video stream and builds everything a run
//! needs. [`StreamSession::run`] then blocks its thread until the source
//! ends, a fatal error occurs or someone calls [`StopHandle::request_stop`].

pub mod channel;
pub mod depacketize;
pub mod rtp;
mod source;
pub mod y4m;

use std::cmp::Reverse;
use std::io;
use std::mem;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

pub use self::source::{
    MediaKind, MediaPacket, PacketSource, Packetization, Payload, ReadEvent, StreamInfo,
};

use self::depacketize::{parser_for, RtpParser};
use crate::codec::{AccessUnit, DecoderRegistry, VideoDecoder};
use crate::convert::Converter;
use crate::error::{DecodeError, OpenError};
use crate::frame::{CanonicalFrame, RawFrame};

/// Upper bound for one blocking read, and so for stop latency.
pub const READ_POLL: Duration = Duration::from_millis(200);

/// Consecutive read failures tolerated before the session is considered broken.
pub const MAX_READ_ERRORS: u32 = 16;

/// How long, and how many bytes, to wait for a keyframe before decoding anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeLimits {
    pub analyze_duration: Duration,
    pub probe_size: usize,
}

impl Default for ProbeLimits {
    fn default() -> Self {
        Self {
            analyze_duration: Duration::from_secs(10),
            probe_size: 5_000_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Opening = 1,
    Receiving = 2,
    Draining = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SessionState::Opening,
            2 => SessionState::Receiving,
            3 => SessionState::Draining,
            4 => SessionState::Closed,
            _ => SessionState::Idle,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Marks the session closed when the run unwinds, on every exit path.
struct ClosedOnDrop(StateCell);

impl Drop for ClosedOnDrop {
    fn drop(&mut self) {
        self.0.set(SessionState::Closed);
    }
}

/// Cooperative stop flag. Cloneable, idempotent, usable from any thread.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct StreamDecoder {
    registry: Arc<DecoderRegistry>,
    limits: ProbeLimits,
    state: StateCell,
}

impl StreamDecoder {
    pub fn new(registry: Arc<DecoderRegistry>) -> Self {
        Self {
            registry,
            limits: ProbeLimits::default(),
            state: StateCell::default(),
        }
    }

    pub fn registry(&self) -> &DecoderRegistry {
        &self.registry
    }

    pub fn with_probe_limits(mut self, limits: ProbeLimits) -> Self {
        self.limits = limits;
        self
    }

    /// State of the most recently opened session.
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Resolves `url` to a source, see [`source_for_url`], and opens it.
    pub fn open_url(&self, url: &str) -> Result<StreamSession, OpenError> {
        self.state.set(SessionState::Opening);
        let source = source_for_url(url).inspect_err(|_| self.state.set(SessionState::Closed))?;
        self.open(source)
    }

    pub fn open(&self, source: Box<dyn PacketSource>) -> Result<StreamSession, OpenError> {
        self.state.set(SessionState::Opening);
        let describe = source.describe();
        match self.prepare(source) {
            Ok(session) => {
                info!(
                    "{}: decoding stream {} ({}, {}x{})",
                    describe,
                    session.stream.index,
                    session.stream.codec_name,
                    session.stream.width,
                    session.stream.height
                );
                Ok(session)
            }
            Err(e) => {
                warn!("{}: open failed: {}", describe, e);
                self.state.set(SessionState::Closed);
                Err(e)
            }
        }
    }

    fn prepare(&self, mut source: Box<dyn PacketSource>) -> Result<StreamSession, OpenError> {
        let stream = select_stream(source.streams())?.clone();
        let parser = match stream.packetization {
            Packetization::Rtp => {
                let codec = stream
                    .codec
                    .ok_or_else(|| OpenError::UnsupportedCodec(stream.codec_name.clone()))?;
                Some(parser_for(codec).ok_or_else(|| OpenError::UnsupportedCodec(codec.to_string()))?)
            }
            Packetization::AccessUnits => None,
        };
        let decoder = self.registry.create(&stream)?;
        source.select(stream.index)?;
        Ok(StreamSession {
            source,
            parser,
            decoder,
            stream,
            limits: self.limits,
            stop: StopHandle::default(),
            state: self.state.clone(),
        })
    }
}

/// `rtp://` and `udp://` URLs, `.sdp` descriptor files and `.y4m` files.
pub fn source_for_url(url: &str) -> Result<Box<dyn PacketSource>, OpenError> {
    if url.starts_with("rtp://") || url.starts_with("udp://") {
        return Ok(Box::new(rtp::RtpSource::from_url(url)?));
    }
    let path = Path::new(url.strip_prefix("file://").unwrap_or(url));
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("sdp") => Ok(Box::new(rtp::RtpSource::from_sdp_file(path)?)),
        Some("y4m") => Ok(Box::new(y4m::Y4mSource::open(path)?)),
        _ => Err(OpenError::InvalidDescriptor(format!(
            "don't know how to open {}",
            url
        ))),
    }
}

/// Largest advertised picture wins, ties go to the lowest index.
pub fn select_stream(streams: &[StreamInfo]) -> Result<&StreamInfo, OpenError> {
    streams
        .iter()
        .filter(|s| s.kind == MediaKind::Video)
        .max_by_key(|s| (s.pixel_count(), Reverse(s.index)))
        .ok_or(OpenError::NoVideoStream)
}

/// One ingestion run over an opened source.
pub struct StreamSession {
    source: Box<dyn PacketSource>,
    parser: Option<Box<dyn RtpParser>>,
    decoder: Box<dyn VideoDecoder>,
    stream: StreamInfo,
    limits: ProbeLimits,
    stop: StopHandle,
    state: StateCell,
}

impl StreamSession {
    pub fn stream(&self) -> &StreamInfo {
        &self.stream
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Blocks until end of stream, stop, or a fatal error. `on_frame` sees
    /// every converted frame in decode order.
    pub fn run<F>(self, mut on_frame: F) -> Result<(), DecodeError>
    where
        F: FnMut(CanonicalFrame),
    {
        let _closed = ClosedOnDrop(self.state.clone());
        let state = self.state;
        let stop = self.stop;
        let limits = self.limits;
        let stream = self.stream;
        let mut source = self.source;
        let mut parser = self.parser;
        let mut decoder = self.decoder;
        let mut converter: Option<Converter> = None;

        let describe = source.describe();
        let started = Instant::now();
        let mut probe = Some(Probe::default());
        let mut frames = Vec::new();
        let mut read_errors = 0u32;

        loop {
            if stop.is_stop_requested() {
                info!("{}: stop requested", describe);
                break;
            }

            let event = match source.read(READ_POLL) {
                Ok(event) => {
                    read_errors = 0;
                    event
                }
                Err(e) => {
                    read_errors += 1;
                    if read_errors > MAX_READ_ERRORS {
                        warn!("{}: giving up after {} read errors: {}", describe, read_errors, e);
                        return Err(DecodeError::Read(e.to_string()));
                    }
                    if is_transient(&e) {
                        debug!("{}: read error {}: {}", describe, read_errors, e);
                        continue;
                    }
                    info!("{}: read failed, ending stream: {}", describe, e);
                    break;
                }
            };

            let unit = match event {
                ReadEvent::Packet(packet) if packet.stream == stream.index => {
                    match assemble(packet.payload, parser.as_deref_mut()) {
                        Some(unit) => Some(unit),
                        None => continue,
                    }
                }
                ReadEvent::Packet(_) => continue,
                ReadEvent::Idle => None,
                ReadEvent::Eof => {
                    info!("{}: end of stream", describe);
                    break;
                }
            };

            let units = match probe.as_mut() {
                Some(p) => match p.admit(unit, started.elapsed(), &limits) {
                    Some(units) => {
                        probe = None;
                        state.set(SessionState::Receiving);
                        units
                    }
                    None => continue,
                },
                None => match unit {
                    Some(unit) => vec![unit],
                    None => continue,
                },
            };

            for unit in units {
                decode(&mut *decoder, &unit, &mut frames, &describe)?;
                deliver(&mut frames, &mut converter, &mut on_frame)?;
            }
        }

        state.set(SessionState::Draining);
        if let Some(p) = probe.take() {
            if !p.pending.is_empty() {
                warn!("{}: stream ended before a keyframe, decoding {} buffered units", describe, p.pending.len());
            }
            for unit in p.pending {
                decode(&mut *decoder, &unit, &mut frames, &describe)?;
                deliver(&mut frames, &mut converter, &mut on_frame)?;
            }
        }
        match decoder.flush(&mut frames) {
            Err(e @ DecodeError::ConversionInitFailed { .. }) => return Err(e),
            Err(e) => warn!("{}: flush: {}", describe, e),
            Ok(()) => {}
        }
        deliver(&mut frames, &mut converter, &mut on_frame)?;
        debug!("{}: session finished after {:?}", describe, started.elapsed());
        Ok(())
    }
}

/// Timeouts and interrupted reads are retried, anything else ends the stream.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    )
}

/// A corrupt unit is skipped. A decoder that cannot convert its own output
/// ends the session.
fn decode(
    decoder: &mut (dyn VideoDecoder + 'static),
    unit: &AccessUnit,
    frames: &mut Vec<RawFrame>,
    describe: &str,
) -> Result<(), DecodeError> {
    match decoder.decode(unit, frames) {
        Err(e @ DecodeError::ConversionInitFailed { .. }) => Err(e),
        Err(e) => {
            warn!("{}: {}", describe, e);
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

fn assemble(payload: Payload, parser: Option<&mut (dyn RtpParser + 'static)>) -> Option<AccessUnit> {
    match (payload, parser) {
        (Payload::Unit(unit), _) => Some(unit),
        (Payload::Rtp(packet), Some(parser)) => match parser.push_packet(&packet) {
            Ok(unit) => unit,
            Err(e) => {
                trace!("dropping RTP packet {}: {}", packet.header.sequence_number, e);
                None
            }
        },
        (Payload::Rtp(_), None) => None,
    }
}

/// Access units held back while waiting for the first keyframe.
#[derive(Default)]
struct Probe {
    pending: Vec<AccessUnit>,
    bytes: usize,
}

impl Probe {
    /// Returns the units to decode once probing is over.
    fn admit(
        &mut self,
        unit: Option<AccessUnit>,
        elapsed: Duration,
        limits: &ProbeLimits,
    ) -> Option<Vec<AccessUnit>> {
        if let Some(unit) = unit {
            if unit.keyframe {
                if !self.pending.is_empty() {
                    debug!("discarding {} units before first keyframe", self.pending.len());
                }
                return Some(vec![unit]);
            }
            self.bytes += unit.data.len();
            self.pending.push(unit);
        }
        if self.bytes > limits.probe_size || elapsed > limits.analyze_duration {
            if self.pending.is_empty() {
                return None;
            }
            warn!(
                "no keyframe within {:?} / {} bytes, decoding anyway",
                elapsed, self.bytes
            );
            return Some(mem::take(&mut self.pending));
        }
        None
    }
}

/// Converts and hands over everything the decoder produced, in order.
fn deliver<F>(
    frames: &mut Vec<RawFrame>,
    converter: &mut Option<Converter>,
    on_frame: &mut F,
) -> Result<(), DecodeError>
where
    F: FnMut(CanonicalFrame),
{
    for frame in frames.drain(..) {
        if !frame.has_valid_geometry() {
            trace!("dropping {:?}", frame);
            continue;
        }
        if !converter.as_ref().is_some_and(|c| c.matches(&frame)) {
            if let Some(old) = converter.as_ref() {
                let (w, h) = old.geometry();
                info!(
                    "resolution change {}x{} -> {}x{} {}",
                    w, h, frame.width, frame.height, frame.format
                );
            }
            *converter = Some(Converter::new(frame.width, frame.height, frame.format)?);
        }
        let Some(conv) = converter.as_ref() else {
            continue;
        };
        match conv.convert(&frame) {
            Ok(canonical) => on_frame(canonical),
            Err(e) => warn!("{}", e),
        }
    }
    Ok(())
}
