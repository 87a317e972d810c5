//! The webrtc-rs peer connection engine.

use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;

use super::engine::{IceCandidate, PeerFactory, PeerSession};
use crate::ingest::channel::ChannelSource;
use crate::telemetry::Telemetry;

/// Longest wait for local ICE gathering before answering anyway.
const GATHER_WAIT: Duration = Duration::from_secs(2);
const PLI_INTERVAL: Duration = Duration::from_secs(3);
/// Packets buffered between the track reader and the ingestion thread.
const TRACK_QUEUE: usize = 1024;

/// Receives the packet source of each remote video track.
pub type VideoTrackSink = Arc<dyn Fn(ChannelSource) + Send + Sync>;

pub fn create_api() -> Result<API> {
    let mut m = MediaEngine::default();
    m.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut m)?;

    Ok(APIBuilder::new()
        .with_media_engine(m)
        .with_interceptor_registry(registry)
        .build())
}

pub struct WebrtcEngine {
    api: API,
    config: RTCConfiguration,
    on_video: VideoTrackSink,
    telemetry: Telemetry,
}

impl WebrtcEngine {
    pub fn new(
        ice_servers: Vec<RTCIceServer>,
        on_video: VideoTrackSink,
        telemetry: Telemetry,
    ) -> Result<Self> {
        debug!("creating WebRTC API with {} ICE servers", ice_servers.len());
        Ok(Self {
            api: create_api()?,
            config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
            on_video,
            telemetry,
        })
    }
}

#[async_trait]
impl PeerFactory for WebrtcEngine {
    async fn create(&self) -> Result<Arc<dyn PeerSession>, String> {
        let peer = Arc::new(
            self.api
                .new_peer_connection(self.config.clone())
                .await
                .map_err(|e| e.to_string())?,
        );
        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            peer.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| e.to_string())?;
        }
        setup_handlers(&peer, self.on_video.clone(), self.telemetry.clone());
        Ok(Arc::new(WebrtcSession {
            peer,
            gathered: Mutex::new(None),
        }))
    }
}

fn setup_handlers(peer: &Arc<RTCPeerConnection>, on_video: VideoTrackSink, telemetry: Telemetry) {
    let pc = Arc::downgrade(peer);
    let t = telemetry.clone();
    peer.on_peer_connection_state_change(Box::new(move |s| {
        let pc = pc.clone();
        t.spawn(async move {
            match s {
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected => {
                    warn!("peer connection {}, closing", s);
                    if let Some(pc) = pc.upgrade() {
                        let _ = pc.close().await;
                    }
                }
                RTCPeerConnectionState::Closed => info!("peer connection closed"),
                _ => debug!("peer connection state: {}", s),
            }
        });
        Box::pin(async {})
    }));

    let t = telemetry.clone();
    peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        t.in_scope(|| match candidate {
            Some(c) => debug!("local candidate {} {}:{}", c.typ, c.address, c.port),
            None => debug!("local ICE gathering complete"),
        });
        Box::pin(async {})
    }));

    let pc = Arc::downgrade(peer);
    peer.on_track(Box::new(move |track, _, _| {
        let telemetry = telemetry.clone();
        if track.kind() == RTPCodecType::Video {
            attach_video(track, pc.clone(), &on_video, &telemetry);
        } else {
            telemetry.in_scope(|| info!("ignoring {} track {}", track.kind(), track.id()));
            // keep reading so the receiver's buffers do not back up
            telemetry.spawn(async move { while track.read_rtp().await.is_ok() {} });
        }
        Box::pin(async {})
    }));
}

/// Hands the track's packets to a new [`ChannelSource`] and keeps asking
/// the sender for keyframes while the track lives.
fn attach_video(
    track: Arc<TrackRemote>,
    pc: Weak<RTCPeerConnection>,
    on_video: &VideoTrackSink,
    telemetry: &Telemetry,
) {
    let codec = track.codec();
    let mime = codec.capability.mime_type.clone();
    let (tx, rx) = mpsc::sync_channel(TRACK_QUEUE);
    telemetry.in_scope(|| {
        info!(
            "video track {} ({}, pt {}, ssrc {})",
            track.id(),
            mime,
            codec.payload_type,
            track.ssrc()
        )
    });
    on_video(ChannelSource::new(
        format!("webrtc track {}", track.id()),
        &mime,
        codec.payload_type,
        rx,
    ));

    let ssrc = track.ssrc();
    telemetry.spawn(read_track(track, tx));
    telemetry.spawn(async move {
        let mut ticker = tokio::time::interval(PLI_INTERVAL);
        loop {
            ticker.tick().await;
            let Some(pc) = pc.upgrade() else { break };
            if pc.connection_state() == RTCPeerConnectionState::Closed {
                break;
            }
            let pli = PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc: ssrc,
            };
            if let Err(e) = pc.write_rtcp(&[Box::new(pli)]).await {
                debug!("PLI for {} not sent: {}", ssrc, e);
                break;
            }
        }
    });
}

async fn read_track(track: Arc<TrackRemote>, tx: SyncSender<webrtc::rtp::packet::Packet>) {
    let mut dropped = 0u64;
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => match tx.try_send(packet) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    trace!("ingestion behind, dropped {} packets", dropped);
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!("track {} has no consumer anymore", track.id());
                    break;
                }
            },
            Err(e) => {
                info!("track {} ended: {}", track.id(), e);
                break;
            }
        }
    }
    if dropped > 0 {
        warn!("track {}: {} packets dropped while ingestion lagged", track.id(), dropped);
    }
}

struct WebrtcSession {
    peer: Arc<RTCPeerConnection>,
    gathered: Mutex<Option<tokio::sync::mpsc::Receiver<()>>>,
}

#[async_trait]
impl PeerSession for WebrtcSession {
    async fn set_remote_description(&self, offer: String) -> Result<(), String> {
        let offer = RTCSessionDescription::offer(offer).map_err(|e| e.to_string())?;
        self.peer
            .set_remote_description(offer)
            .await
            .map_err(|e| e.to_string())
    }

    async fn create_answer(&self) -> Result<String, String> {
        self.peer
            .create_answer(None)
            .await
            .map(|answer| answer.sdp)
            .map_err(|e| e.to_string())
    }

    async fn set_local_description(&self, answer: String) -> Result<(), String> {
        let answer = RTCSessionDescription::answer(answer).map_err(|e| e.to_string())?;
        let gather_complete = self.peer.gathering_complete_promise().await;
        self.peer
            .set_local_description(answer)
            .await
            .map_err(|e| e.to_string())?;
        *self.gathered.lock().await = Some(gather_complete);
        Ok(())
    }

    async fn local_description(&self) -> Result<String, String> {
        if let Some(mut gather_complete) = self.gathered.lock().await.take() {
            if tokio::time::timeout(GATHER_WAIT, gather_complete.recv())
                .await
                .is_err()
            {
                warn!("ICE gathering timed out, answering with what we have");
            }
        }
        self.peer
            .local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| "no local description".to_string())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), String> {
        self.peer
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| e.to_string())
    }

    fn is_closed(&self) -> bool {
        matches!(
            self.peer.connection_state(),
            RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed
        )
    }

    async fn close(&self) {
        if let Err(e) = self.peer.close().await {
            warn!("closing peer connection: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_ice_servers;

    fn engine() -> WebrtcEngine {
        let servers = default_ice_servers().into_iter().map(Into::into).collect();
        WebrtcEngine::new(servers, Arc::new(|_: ChannelSource| {}), Telemetry::disabled()).unwrap()
    }

    #[tokio::test]
    async fn creates_recvonly_connection() {
        let engine = engine();
        let session = engine.create().await.unwrap();
        assert!(!session.is_closed());
        session.close().await;
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn rejects_garbage_remote_description() {
        let engine = engine();
        let session = engine.create().await.unwrap();
        assert!(session
            .set_remote_description("not sdp".to_string())
            .await
            .is_err());
        session.close().await;
    }
}
