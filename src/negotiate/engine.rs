//! Narrow interface to the peer connection engine.
//!
//! Every method completes one asynchronous engine step. Errors are plain
//! engine messages; the negotiator decides what they mean.

use std::sync::Arc;

use async_trait::async_trait;

/// One remote candidate as carried by the signaling transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    /// `candidate:<foundation> <component> ...`
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
    pub username_fragment: Option<String>,
}

#[async_trait]
pub trait PeerSession: Send + Sync {
    async fn set_remote_description(&self, offer: String) -> Result<(), String>;

    /// Returns the answer text to be applied by `set_local_description`.
    async fn create_answer(&self) -> Result<String, String>;

    async fn set_local_description(&self, answer: String) -> Result<(), String>;

    /// The applied local description, ready to send back to the remote.
    async fn local_description(&self) -> Result<String, String>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), String>;

    /// True once the connection failed or was closed.
    fn is_closed(&self) -> bool;

    async fn close(&self);
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn PeerSession>, String>;
}
