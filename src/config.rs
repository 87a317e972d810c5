use std::{env, fs, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use webrtc::{ice, ice_transport::ice_server::RTCIceServer};

const SEARCH_PATHS: [&str; 2] = ["liveframe.toml", "/etc/liveframe/liveframe.toml"];

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub ingest: Ingest,
    #[serde(default)]
    pub output: Output,
    #[serde(default)]
    pub signaling: Signaling,
    #[serde(default)]
    pub negotiation: Negotiation,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServer>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: Default::default(),
            ingest: Default::default(),
            output: Default::default(),
            signaling: Default::default(),
            negotiation: Default::default(),
            ice_servers: default_ice_servers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    env::var("LOG_LEVEL").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug".to_string()
        } else {
            "info".to_string()
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Decode a local RTP/SDP/Y4M source.
    #[default]
    Rtp,
    /// Accept a WebRTC offer over HTTP and record the received video track.
    Webrtc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ingest {
    #[serde(default)]
    pub mode: Mode,
    /// `rtp://host:port[?codec=..&pt=..]`, an `.sdp` file or a `.y4m` file.
    #[serde(default = "default_source")]
    pub source: String,
}

impl Default for Ingest {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            source: default_source(),
        }
    }
}

fn default_source() -> String {
    "rtp://0.0.0.0:5004".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Output {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_true")]
    pub write_images: bool,
    #[serde(default = "default_true")]
    pub write_video: bool,
    #[serde(default = "default_video_path")]
    pub video_path: PathBuf,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_image_ext")]
    pub image_ext: String,
    /// Quality of the JPEG samples stored in the video container.
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

impl Default for Output {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            write_images: true,
            write_video: true,
            video_path: default_video_path(),
            fps: default_fps(),
            image_ext: default_image_ext(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Output {
    /// Output rooted at `dir`, video at `<dir>/capture.mp4`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            video_path: dir.join("capture.mp4"),
            dir,
            ..Default::default()
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("out")
}

fn default_video_path() -> PathBuf {
    default_output_dir().join("capture.mp4")
}

fn default_fps() -> u32 {
    30
}

fn default_image_ext() -> String {
    "png".to_string()
}

fn default_jpeg_quality() -> u8 {
    90
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signaling {
    #[serde(default = "default_signaling_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub cors: bool,
}

impl Default for Signaling {
    fn default() -> Self {
        Self {
            listen: default_signaling_listen(),
            cors: Default::default(),
        }
    }
}

fn default_signaling_listen() -> SocketAddr {
    let port = env::var("PORT").unwrap_or(String::from("8080"));
    SocketAddr::from_str(&format!("0.0.0.0:{}", port))
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Negotiation {
    #[serde(default = "default_negotiation_timeout")]
    pub timeout_ms: u64,
}

impl Negotiation {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for Negotiation {
    fn default() -> Self {
        Self {
            timeout_ms: default_negotiation_timeout(),
        }
    }
}

fn default_negotiation_timeout() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IceServer {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServer {
    pub fn validate(&self) -> webrtc::error::Result<()> {
        for url_str in &self.urls {
            let url = ice::url::Url::parse_url(url_str)?;
            if (url.scheme == ice::url::SchemeType::Turn
                || url.scheme == ice::url::SchemeType::Turns)
                && (self.username.is_empty() || self.credential.is_empty())
            {
                return Err(webrtc::Error::ErrNoTurnCredentials);
            }
        }
        Ok(())
    }
}

impl From<IceServer> for RTCIceServer {
    fn from(val: IceServer) -> Self {
        RTCIceServer {
            urls: val.urls,
            username: val.username,
            credential: val.credential,
            ..Default::default()
        }
    }
}

pub fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer {
        urls: vec!["stun:stun.l.google.com:19302".to_string()],
        username: "".to_string(),
        credential: "".to_string(),
    }]
}

impl Config {
    /// Loads `path` if given, else the first config file found, else defaults.
    pub fn parse(path: Option<&str>) -> anyhow::Result<Self> {
        let text = match path {
            Some(path) => fs::read_to_string(path)
                .with_context(|| format!("cannot read config {}", path))?,
            None => SEARCH_PATHS
                .iter()
                .find_map(|p| fs::read_to_string(p).ok())
                .unwrap_or_default(),
        };
        let cfg: Self = toml::from_str(&text).context("config parse error")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for ice_server in self.ice_servers.iter() {
            ice_server
                .validate()
                .map_err(|e| anyhow!("ice_server error: {}", e))?;
        }
        if self.output.fps == 0 {
            return Err(anyhow!("output.fps must be at least 1"));
        }
        if !(1..=100).contains(&self.output.jpeg_quality) {
            return Err(anyhow!("output.jpeg_quality must be within 1..=100"));
        }
        match image::ImageFormat::from_extension(&self.output.image_ext) {
            Some(format) if format.writing_enabled() => {}
            _ => {
                return Err(anyhow!(
                    "output.image_ext '{}' is not a writable image format",
                    self.output.image_ext
                ))
            }
        }
        if self.negotiation.timeout_ms == 0 {
            return Err(anyhow!("negotiation.timeout_ms must be positive"));
        }
        Ok(())
    }
}
