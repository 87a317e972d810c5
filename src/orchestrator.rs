//! Wires one ingestion path to the frame writer and owns their lifetimes.
//!
//! The writer lives inside the orchestrator only. Ingestion threads and
//! engine callbacks reach it through a [`Weak`] reference, so nothing they
//! hold keeps it alive past [`Orchestrator::stop`].

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::codec::DecoderRegistry;
use crate::config::{Config, Mode};
use crate::error::OpenError;
use crate::ingest::channel::ChannelSource;
use crate::ingest::{PacketSource, StopHandle, StreamDecoder};
use crate::negotiate::engine::PeerFactory;
use crate::negotiate::rtc::{VideoTrackSink, WebrtcEngine};
use crate::negotiate::Negotiator;
use crate::signaling;
use crate::telemetry::Telemetry;
use crate::writer::FrameWriter;

/// Upper bound for each wait inside [`Orchestrator::stop`].
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

struct Ingestion {
    stop: StopHandle,
    thread: JoinHandle<()>,
}

#[derive(Default)]
struct Running {
    started: bool,
    ingestions: Vec<Ingestion>,
    negotiator: Option<Arc<Negotiator>>,
    signaling: Option<tokio::task::JoinHandle<()>>,
    signaling_addr: Option<SocketAddr>,
}

struct Inner {
    config: Config,
    telemetry: Telemetry,
    decoder: StreamDecoder,
    writer: FrameWriter,
    /// Cleared under the write lock before the writer is closed, so no
    /// frame can slip in after `stop`.
    accepting: RwLock<bool>,
    running: Mutex<Running>,
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
    /// Number of ingestion runs that have ended.
    finished: watch::Sender<usize>,
}

impl Inner {
    fn running(&self) -> std::sync::MutexGuard<'_, Running> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens `source` and decodes it on a dedicated thread.
    fn spawn_ingestion(self: &Arc<Self>, source: Box<dyn PacketSource>) -> Result<(), OpenError> {
        let describe = source.describe();
        if self.stopped.load(Ordering::Acquire) {
            warn!("{}: ignored, orchestrator is stopping", describe);
            return Ok(());
        }
        let session = self.decoder.open(source)?;

        // `stop` drains the list under this lock, so re-check before adding.
        let mut running = self.running();
        if self.stopped.load(Ordering::Acquire) {
            warn!("{}: ignored, orchestrator is stopping", describe);
            return Ok(());
        }
        running.ingestions.retain(|i| !i.thread.is_finished());

        let stop = session.stop_handle();
        let weak = Arc::downgrade(self);
        let telemetry = self.telemetry.clone();
        let thread = std::thread::Builder::new()
            .name("ingest".to_string())
            .spawn(move || {
                let _guard = telemetry.enter();
                let result = session.run(|frame| {
                    if let Some(inner) = weak.upgrade() {
                        let accepting = inner.accepting.read().unwrap_or_else(PoisonError::into_inner);
                        if *accepting {
                            inner.writer.on_frame(frame);
                        }
                    }
                });
                match result {
                    Ok(()) => info!("ingestion finished"),
                    Err(e) => error!("ingestion failed: {}", e),
                }
                if let Some(inner) = weak.upgrade() {
                    inner.finished.send_modify(|n| *n += 1);
                }
            })
            .map_err(|e| OpenError::SourceUnreachable(format!("cannot spawn ingestion thread: {}", e)))?;
        running.ingestions.push(Ingestion { stop, thread });
        Ok(())
    }
}

pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(config: Config, telemetry: Telemetry) -> Self {
        let writer = FrameWriter::new(&config.output);
        Self::with_parts(config, telemetry, DecoderRegistry::with_defaults(), writer)
    }

    pub fn with_parts(
        config: Config,
        telemetry: Telemetry,
        registry: DecoderRegistry,
        writer: FrameWriter,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (finished, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                decoder: StreamDecoder::new(Arc::new(registry)),
                config,
                telemetry,
                writer,
                accepting: RwLock::new(true),
                running: Mutex::new(Running::default()),
                stopped: AtomicBool::new(false),
                shutdown,
                finished,
            }),
        }
    }

    /// Starts the configured ingestion path and returns once it runs.
    pub async fn start(&self) -> anyhow::Result<()> {
        match self.inner.config.ingest.mode {
            Mode::Rtp => {
                self.mark_started()?;
                let source = crate::ingest::source_for_url(&self.inner.config.ingest.source)?;
                self.inner.spawn_ingestion(source)?;
                Ok(())
            }
            Mode::Webrtc => {
                let codecs = self.inner.decoder.registry().compressed();
                if codecs.is_empty() {
                    return Err(anyhow!(
                        "no H264/VP8/VP9 decoder in this build, enable the `ffmpeg` feature"
                    ));
                }
                info!("negotiable video codecs: {:?}", codecs);
                let servers = self
                    .inner
                    .config
                    .ice_servers
                    .iter()
                    .cloned()
                    .map(Into::into)
                    .collect();
                let engine =
                    WebrtcEngine::new(servers, self.video_sink(), self.inner.telemetry.clone())?;
                self.start_signaling(Arc::new(engine)).await
            }
        }
    }

    /// Decodes `source` instead of the configured one.
    pub fn start_with_source(&self, source: Box<dyn PacketSource>) -> anyhow::Result<()> {
        self.mark_started()?;
        self.inner.spawn_ingestion(source)?;
        Ok(())
    }

    /// Serves negotiation requests backed by `factory`. Video tracks handed
    /// to [`Self::video_sink`] start ingestion sessions.
    pub async fn start_signaling(&self, factory: Arc<dyn PeerFactory>) -> anyhow::Result<()> {
        self.mark_started()?;
        let cfg = &self.inner.config;
        let negotiator = Arc::new(Negotiator::new(
            factory,
            cfg.negotiation.timeout(),
            self.inner.telemetry.clone(),
        ));
        let listener = TcpListener::bind(cfg.signaling.listen)
            .await
            .with_context(|| format!("cannot listen on {}", cfg.signaling.listen))?;
        let addr = listener.local_addr()?;
        let app = signaling::router(negotiator.clone(), cfg.signaling.cors);

        let mut shutdown = self.inner.shutdown.subscribe();
        let server = self.inner.telemetry.spawn(async move {
            let signal = async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            };
            if let Err(e) = signaling::serve(listener, app, signal).await {
                error!("signaling server error: {}", e);
            }
        });

        let mut running = self.inner.running();
        running.negotiator = Some(negotiator);
        running.signaling = Some(server);
        running.signaling_addr = Some(addr);
        Ok(())
    }

    /// Callback for negotiated video tracks. Holds no strong reference.
    pub fn video_sink(&self) -> VideoTrackSink {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move |source: ChannelSource| {
            if let Some(inner) = weak.upgrade() {
                let _guard = inner.telemetry.enter();
                if let Err(e) = inner.spawn_ingestion(Box::new(source)) {
                    error!("cannot ingest negotiated track: {}", e);
                }
            }
        })
    }

    fn mark_started(&self) -> anyhow::Result<()> {
        let mut running = self.inner.running();
        if running.started {
            return Err(anyhow!("orchestrator already started"));
        }
        running.started = true;
        Ok(())
    }

    pub fn signaling_addr(&self) -> Option<SocketAddr> {
        self.inner.running().signaling_addr
    }

    pub fn negotiator(&self) -> Option<Arc<Negotiator>> {
        self.inner.running().negotiator.clone()
    }

    pub fn frame_count(&self) -> u64 {
        self.inner.writer.frame_count()
    }

    pub fn video_path(&self) -> Option<PathBuf> {
        self.inner.writer.video_path()
    }

    /// Resolves once an ingestion run has ended, for sources that finish.
    pub async fn finished(&self) {
        let mut rx = self.inner.finished.subscribe();
        let _ = rx.wait_for(|n| *n > 0).await;
    }

    /// Runs until `stop` resolves. In RTP mode the end of the single stream
    /// also ends the wait, returning `None`. WebRTC peers come and go, so
    /// there only `stop` counts.
    pub async fn wait<F: Future>(&self, stop: F) -> Option<F::Output> {
        match self.inner.config.ingest.mode {
            Mode::Rtp => tokio::select! {
                out = stop => Some(out),
                _ = self.finished() => None,
            },
            Mode::Webrtc => Some(stop.await),
        }
    }

    /// Stops ingestion, waits for it to quiesce and finalizes the outputs.
    /// Only the first call does anything.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("stopping");
        let _ = self.inner.shutdown.send(true);

        let (negotiator, server, ingestions) = {
            let mut running = self.inner.running();
            (
                running.negotiator.take(),
                running.signaling.take(),
                std::mem::take(&mut running.ingestions),
            )
        };
        if let Some(server) = server {
            if tokio::time::timeout(JOIN_TIMEOUT, server).await.is_err() {
                warn!("signaling did not shut down within {:?}", JOIN_TIMEOUT);
            }
        }
        if let Some(negotiator) = negotiator {
            negotiator.close().await;
        }

        for ingestion in &ingestions {
            ingestion.stop.request_stop();
        }
        for ingestion in ingestions {
            let join = tokio::task::spawn_blocking(move || ingestion.thread.join());
            match tokio::time::timeout(JOIN_TIMEOUT, join).await {
                Ok(Ok(Ok(()))) => {}
                Ok(_) => error!("ingestion thread panicked"),
                Err(_) => warn!("ingestion did not stop within {:?}", JOIN_TIMEOUT),
            }
        }

        let inner = self.inner.clone();
        let closed = tokio::task::spawn_blocking(move || {
            *inner.accepting.write().unwrap_or_else(PoisonError::into_inner) = false;
            inner.writer.close();
        });
        if closed.await.is_err() {
            error!("closing outputs panicked");
        }
        info!("stopped after {} frames", self.frame_count());
    }
}
