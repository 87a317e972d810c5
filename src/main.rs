use std::net::SocketAddr;
use std::path::PathBuf;

use clap::builder::BoolishValueParser;
use clap::Parser;
use tracing::{error, info};

use liveframe::config::{Config, Mode};
use liveframe::orchestrator::Orchestrator;
use liveframe::telemetry::Telemetry;

#[derive(Parser, Debug)]
#[command(name = "liveframe", version)]
struct Args {
    /// Set config file path
    #[arg(short, long)]
    config: Option<String>,
    /// RTP url, `.sdp` or `.y4m` file to capture
    #[arg(long)]
    rtp_url: Option<String>,
    /// Output directory, also moves the video to `<out>/capture.mp4`
    #[arg(long, visible_alias = "output")]
    out: Option<PathBuf>,
    /// Write every frame as an image (1|0)
    #[arg(long, value_parser = BoolishValueParser::new())]
    write_images: Option<bool>,
    /// Write frames into a video file (1|0)
    #[arg(long, value_parser = BoolishValueParser::new())]
    write_video: Option<bool>,
    #[arg(long)]
    fps: Option<u32>,
    /// Video file path, enables video output
    #[arg(long)]
    mp4: Option<PathBuf>,
    #[arg(long, value_enum)]
    mode: Option<Mode>,
    /// Signaling listen address for webrtc mode
    #[arg(long)]
    listen: Option<SocketAddr>,
}

impl Args {
    fn apply(&self, cfg: &mut Config) {
        if let Some(url) = &self.rtp_url {
            cfg.ingest.source = url.clone();
        }
        if let Some(out) = &self.out {
            cfg.output.video_path = out.join("capture.mp4");
            cfg.output.dir = out.clone();
        }
        if let Some(v) = self.write_images {
            cfg.output.write_images = v;
        }
        if let Some(v) = self.write_video {
            cfg.output.write_video = v;
        }
        if let Some(fps) = self.fps {
            cfg.output.fps = fps;
        }
        if let Some(mp4) = &self.mp4 {
            cfg.output.video_path = mp4.clone();
            cfg.output.write_video = true;
        }
        if let Some(mode) = self.mode {
            cfg.ingest.mode = mode;
        }
        if let Some(listen) = self.listen {
            cfg.signaling.listen = listen;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut cfg = Config::parse(args.config.as_deref())?;
    args.apply(&mut cfg);
    cfg.validate()?;

    let telemetry = Telemetry::new(&cfg.log.level);
    telemetry.instrument(run(cfg, telemetry.clone())).await
}

async fn run(cfg: Config, telemetry: Telemetry) -> anyhow::Result<()> {
    info!(
        "liveframe {} capturing {:?} into {}",
        env!("CARGO_PKG_VERSION"),
        cfg.ingest.mode,
        cfg.output.dir.display()
    );
    let orchestrator = Orchestrator::new(cfg, telemetry);
    if let Err(e) = orchestrator.start().await {
        error!("start failed: {:#}", e);
        orchestrator.stop().await;
        return Err(e);
    }

    match orchestrator.wait(signal::wait_for_stop_signal()).await {
        Some(signal) => info!("received {}, shutting down", signal),
        None => info!("stream ended"),
    }
    orchestrator.stop().await;
    if let Some(path) = orchestrator.video_path() {
        info!("video written to {}", path.display());
    }
    Ok(())
}
