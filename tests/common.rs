#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use liveframe::config::{Config, Output};
use liveframe::negotiate::engine::{IceCandidate, PeerFactory, PeerSession};

pub const OFFER: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\nc=IN IP4 0.0.0.0\r\na=mid:0\r\na=rtpmap:96 VP8/90000\r\n";

pub const CANDIDATE: &str = "candidate:1 1 udp 2130706431 192.168.1.7 50000 typ host";

/// Writes a mono y4m clip whose frame `i` is filled with `i * 40`.
pub fn write_y4m(dir: &Path, width: u32, height: u32, frames: u8) -> PathBuf {
    let mut bytes = format!("YUV4MPEG2 W{} H{} F30:1 Cmono\n", width, height).into_bytes();
    for i in 0..frames {
        bytes.extend_from_slice(b"FRAME\n");
        bytes.extend(std::iter::repeat(i * 40).take((width * height) as usize));
    }
    let path = dir.join("clip.y4m");
    std::fs::write(&path, bytes).unwrap();
    path
}

pub fn config_in(dir: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.output = Output::in_dir(dir);
    cfg.signaling.listen = "127.0.0.1:0".parse().unwrap();
    cfg
}

/// Engine that completes every step immediately and records candidates.
#[derive(Default)]
pub struct FakeSession {
    pub candidates: Mutex<Vec<IceCandidate>>,
    closed: Mutex<bool>,
}

#[async_trait]
impl PeerSession for FakeSession {
    async fn set_remote_description(&self, _offer: String) -> Result<(), String> {
        Ok(())
    }

    async fn create_answer(&self) -> Result<String, String> {
        Ok(OFFER.replace("o=- 0 0", "o=- 1 1"))
    }

    async fn set_local_description(&self, _answer: String) -> Result<(), String> {
        Ok(())
    }

    async fn local_description(&self) -> Result<String, String> {
        self.create_answer().await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), String> {
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }

    async fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }
}

#[derive(Default)]
pub struct FakeFactory {
    pub sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeFactory {
    pub fn last(&self) -> Arc<FakeSession> {
        self.sessions.lock().unwrap().last().unwrap().clone()
    }
}

#[async_trait]
impl PeerFactory for FakeFactory {
    async fn create(&self) -> Result<Arc<dyn PeerSession>, String> {
        let session = Arc::new(FakeSession::default());
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}
