//! Frame persistence: numbered still images plus one video container.

pub mod avi;
pub mod mp4;
pub mod still;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, error, info, warn};

use crate::config::Output;
use crate::error::ContainerError;
use crate::frame::CanonicalFrame;

pub use avi::AviBackend;
pub use mp4::Mp4Backend;

/// An open video container accepting frames of one geometry.
pub trait VideoSink: Send {
    fn path(&self) -> &Path;

    fn append(&mut self, frame: &CanonicalFrame) -> Result<(), ContainerError>;

    fn frames(&self) -> u64;

    /// Writes the trailing index. Without it the file is not playable.
    fn finish(self: Box<Self>) -> Result<(), ContainerError>;
}

/// One codec/container combination in the fallback chain.
pub trait ContainerBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Extension used when this backend is a fallback for the configured path.
    fn extension(&self) -> &'static str;

    fn open(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Box<dyn VideoSink>, ContainerError>;
}

/// MP4 first, AVI as the widely supported fallback.
pub fn default_backends(quality: u8) -> Vec<Box<dyn ContainerBackend>> {
    vec![
        Box::new(Mp4Backend { quality }),
        Box::new(AviBackend { quality }),
    ]
}

struct State {
    frame_index: u64,
    sink: Option<Box<dyn VideoSink>>,
    geometry: Option<(u32, u32)>,
    frames_dir_ready: bool,
    video_enabled: bool,
    video_path: Option<PathBuf>,
    /// Index of the first backend worth trying on the next open.
    backend: usize,
    /// Containers opened so far, used to name the next one.
    segments: u32,
}

/// Thread-safe sink for canonical frames.
///
/// `on_frame` and `close` serialize on one lock. The container is opened
/// lazily from the first frame's geometry and reopened under a numbered
/// sibling name when the geometry changes or after `close`.
pub struct FrameWriter {
    frames_dir: PathBuf,
    write_images: bool,
    image_ext: String,
    video_path: PathBuf,
    fps: u32,
    backends: Vec<Box<dyn ContainerBackend>>,
    state: Mutex<State>,
}

impl FrameWriter {
    pub fn new(output: &Output) -> Self {
        Self::with_backends(output, default_backends(output.jpeg_quality))
    }

    pub fn with_backends(output: &Output, backends: Vec<Box<dyn ContainerBackend>>) -> Self {
        Self {
            frames_dir: output.dir.join("frames"),
            write_images: output.write_images,
            image_ext: output.image_ext.clone(),
            video_path: output.video_path.clone(),
            fps: output.fps,
            state: Mutex::new(State {
                frame_index: 0,
                sink: None,
                geometry: None,
                frames_dir_ready: false,
                video_enabled: output.write_video && !backends.is_empty(),
                video_path: None,
                backend: 0,
                segments: 0,
            }),
            backends,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn on_frame(&self, frame: CanonicalFrame) {
        let mut state = self.lock();

        if self.write_images && !state.frames_dir_ready {
            match fs::create_dir_all(&self.frames_dir) {
                Ok(()) => {
                    info!("writing frames to {}", self.frames_dir.display());
                    state.frames_dir_ready = true;
                }
                Err(e) => warn!("cannot create {}: {}", self.frames_dir.display(), e),
            }
        }

        if state.video_enabled {
            if state.sink.is_some() && state.geometry != Some(frame.geometry()) {
                info!(
                    "resolution changed from {:?} to {}x{}, starting a new container",
                    state.geometry,
                    frame.width(),
                    frame.height()
                );
                Self::finish_sink(&mut state);
            }
            if state.sink.is_none() {
                self.open_container(&mut state, frame.width(), frame.height());
            }
        }

        if self.write_images && state.frames_dir_ready {
            let path = self.frames_dir.join(frame_file_name(
                state.frame_index + 1,
                &self.image_ext,
            ));
            if let Err(e) = still::save(&frame, &path) {
                warn!("failed to write {}: {}", path.display(), e);
            }
        }

        if let Some(sink) = state.sink.as_mut() {
            if let Err(e) = sink.append(&frame) {
                warn!("failed to append frame to {}: {}", sink.path().display(), e);
            }
        }

        state.frame_index += 1;
    }

    /// Finalizes the open container, if any. Later frames open a new one.
    pub fn close(&self) {
        let mut state = self.lock();
        if state.sink.is_some() {
            Self::finish_sink(&mut state);
        }
        debug!("frame writer closed after {} frames", state.frame_index);
    }

    pub fn frame_count(&self) -> u64 {
        self.lock().frame_index
    }

    /// Path of the last container opened, which may differ from the configured one.
    pub fn video_path(&self) -> Option<PathBuf> {
        self.lock().video_path.clone()
    }

    pub fn video_enabled(&self) -> bool {
        self.lock().video_enabled
    }

    pub fn frames_dir(&self) -> &Path {
        &self.frames_dir
    }

    fn finish_sink(state: &mut State) {
        if let Some(sink) = state.sink.take() {
            let path = sink.path().to_path_buf();
            let frames = sink.frames();
            match sink.finish() {
                Ok(()) => info!("closed {} ({} frames)", path.display(), frames),
                Err(e) => error!("failed to finalize {}: {}", path.display(), e),
            }
        }
        state.geometry = None;
        state.segments += 1;
    }

    fn open_container(&self, state: &mut State, width: u32, height: u32) {
        let base = segment_path(&self.video_path, state.segments);
        if let Some(parent) = base.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!("cannot create {}: {}", parent.display(), e);
            }
        }

        for (i, backend) in self.backends.iter().enumerate().skip(state.backend) {
            let path = if i == 0 {
                base.clone()
            } else {
                base.with_extension(backend.extension())
            };
            match backend.open(&path, width, height, self.fps) {
                Ok(sink) => {
                    if i > state.backend {
                        warn!(
                            "{} unavailable, falling back to {} at {}",
                            self.backends[state.backend].name(),
                            backend.name(),
                            path.display()
                        );
                    } else {
                        info!(
                            "opened {} {}x{} at {}",
                            backend.name(),
                            width,
                            height,
                            path.display()
                        );
                    }
                    state.backend = i;
                    state.sink = Some(sink);
                    state.geometry = Some((width, height));
                    state.video_path = Some(path);
                    return;
                }
                Err(e) => warn!("{} failed at {}: {}", backend.name(), path.display(), e),
            }
        }

        warn!(
            "no video container could be opened for {}x{}, video output disabled",
            width, height
        );
        state.video_enabled = false;
    }
}

impl Drop for FrameWriter {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if state.sink.is_some() {
            warn!("frame writer dropped without close, finalizing video");
            Self::finish_sink(state);
        }
    }
}

/// `frame_00000001.png` for the first frame.
pub fn frame_file_name(number: u64, ext: &str) -> String {
    format!("frame_{number:08}.{ext}")
}

/// The configured path for the first container, `<stem>-<n>.<ext>` after that.
fn segment_path(path: &Path, segment: u32) -> PathBuf {
    if segment == 0 {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "capture".to_string());
    let name = match path.extension() {
        Some(ext) => format!("{}-{}.{}", stem, segment, ext.to_string_lossy()),
        None => format!("{}-{}", stem, segment),
    };
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{self, Sender};
    use std::sync::Arc;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Records container events instead of encoding.
    struct Recording {
        log: Log,
        /// Signalled when an append starts, which then takes `append_delay`.
        entered: Option<Mutex<Sender<()>>>,
        append_delay: Duration,
    }

    impl Recording {
        fn new(log: &Log) -> Self {
            Self {
                log: log.clone(),
                entered: None,
                append_delay: Duration::ZERO,
            }
        }
    }

    struct RecordingSink {
        path: PathBuf,
        log: Log,
        entered: Option<Sender<()>>,
        append_delay: Duration,
        frames: u64,
    }

    impl ContainerBackend for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn extension(&self) -> &'static str {
            "mp4"
        }

        fn open(
            &self,
            path: &Path,
            width: u32,
            height: u32,
            _fps: u32,
        ) -> Result<Box<dyn VideoSink>, ContainerError> {
            fs::write(path, b"")?;
            self.log.lock().unwrap().push(format!("open {}x{}", width, height));
            Ok(Box::new(RecordingSink {
                path: path.to_path_buf(),
                log: self.log.clone(),
                entered: self.entered.as_ref().map(|tx| tx.lock().unwrap().clone()),
                append_delay: self.append_delay,
                frames: 0,
            }))
        }
    }

    impl VideoSink for RecordingSink {
        fn path(&self) -> &Path {
            &self.path
        }

        fn append(&mut self, _frame: &CanonicalFrame) -> Result<(), ContainerError> {
            if let Some(tx) = &self.entered {
                let _ = tx.send(());
            }
            std::thread::sleep(self.append_delay);
            self.frames += 1;
            self.log.lock().unwrap().push("append".to_string());
            Ok(())
        }

        fn frames(&self) -> u64 {
            self.frames
        }

        fn finish(self: Box<Self>) -> Result<(), ContainerError> {
            self.log.lock().unwrap().push("finish".to_string());
            Ok(())
        }
    }

    fn gray(width: u32, height: u32) -> CanonicalFrame {
        CanonicalFrame::new(width, height, vec![128; (width * height * 3) as usize]).unwrap()
    }

    #[test]
    fn resolution_change_starts_numbered_containers_and_keeps_frame_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::default();
        let writer = FrameWriter::with_backends(
            &Output::in_dir(dir.path()),
            vec![Box::new(Recording::new(&log))],
        );
        writer.on_frame(gray(2, 2));
        writer.on_frame(gray(4, 4));
        writer.on_frame(gray(4, 4));
        writer.on_frame(gray(2, 2));
        writer.close();

        assert_eq!(writer.frame_count(), 4);
        for name in ["capture.mp4", "capture-1.mp4", "capture-2.mp4"] {
            assert!(dir.path().join(name).exists(), "{} missing", name);
        }
        assert_eq!(writer.video_path(), Some(dir.path().join("capture-2.mp4")));
        for n in 1..=4 {
            assert!(dir.path().join("frames").join(frame_file_name(n, "png")).exists());
        }
        assert_eq!(
            *log.lock().unwrap(),
            [
                "open 2x2", "append", "finish", "open 4x4", "append", "append", "finish",
                "open 2x2", "append", "finish",
            ]
        );
    }

    #[test]
    fn frames_are_counted_with_every_output_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::default();
        let mut output = Output::in_dir(dir.path());
        output.write_images = false;
        output.write_video = false;
        let writer = FrameWriter::with_backends(&output, vec![Box::new(Recording::new(&log))]);
        writer.on_frame(gray(2, 2));
        writer.on_frame(gray(2, 2));
        writer.close();

        assert_eq!(writer.frame_count(), 2);
        assert!(!writer.video_enabled());
        assert_eq!(writer.video_path(), None);
        assert!(!dir.path().join("frames").exists());
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn close_waits_for_the_frame_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::default();
        let (tx, rx) = mpsc::channel();
        let mut output = Output::in_dir(dir.path());
        output.write_images = false;
        let backend = Recording {
            log: log.clone(),
            entered: Some(Mutex::new(tx)),
            append_delay: Duration::from_millis(200),
        };
        let writer = Arc::new(FrameWriter::with_backends(&output, vec![Box::new(backend)]));

        let feeder = {
            let writer = writer.clone();
            std::thread::spawn(move || writer.on_frame(gray(2, 2)))
        };
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        writer.close();
        feeder.join().unwrap();

        assert_eq!(*log.lock().unwrap(), ["open 2x2", "append", "finish"]);
        assert_eq!(writer.frame_count(), 1);
    }

    #[test]
    fn frame_names_are_one_based_and_padded() {
        assert_eq!(frame_file_name(1, "png"), "frame_00000001.png");
        assert_eq!(frame_file_name(99_999_999, "jpg"), "frame_99999999.jpg");
    }

    #[test]
    fn segment_paths() {
        let base = Path::new("out/capture.mp4");
        assert_eq!(segment_path(base, 0), PathBuf::from("out/capture.mp4"));
        assert_eq!(segment_path(base, 2), PathBuf::from("out/capture-2.mp4"));
        assert_eq!(
            segment_path(base, 1).with_extension("avi"),
            PathBuf::from("out/capture-1.avi")
        );
    }
}
