pub mod manager;
pub mod memory;
pub mod rtc;
pub mod state;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::SessionError;
use crate::models::PairingSession;

pub use self::manager::PeerManager;
pub use self::state::PeerState;

/// Events surfaced by a peer backend to the manager.
#[derive(Debug)]
pub enum PeerEvent {
    StateChanged(PeerState),
    /// Locally gathered ICE candidate to relay to the remote peer.
    LocalCandidate(String),
    CommandChannelOpen,
    /// Raw payload received on the command channel.
    CommandData(Bytes),
    /// Raw payload received on the video channel (may be a chunk).
    VideoData(Bytes),
}

/// The raw peer-to-peer pipe underneath the manager: description exchange,
/// candidates, and the two data paths. The manager owns all sequencing
/// (who offers, candidate buffering, retries); backends only refuse what is
/// physically impossible, e.g. a candidate before the remote description.
#[async_trait]
pub trait PeerBackend: Send + Sync {
    /// Offerer side: produce the local session description.
    async fn create_offer(&self) -> Result<String, SessionError>;
    /// Answerer side: apply a remote offer and produce the answer.
    async fn accept_offer(&self, sdp: &str) -> Result<String, SessionError>;
    /// Offerer side: apply the remote answer.
    async fn accept_answer(&self, sdp: &str) -> Result<(), SessionError>;
    /// Apply a remote ICE candidate. The remote description must already be
    /// applied.
    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), SessionError>;
    /// Send on the command channel; errors when it is not open.
    async fn send_command_data(&self, data: Bytes) -> Result<(), SessionError>;
    /// Send on the video channel; errors when it is not open.
    async fn send_video_data(&self, data: Bytes) -> Result<(), SessionError>;
    async fn close(&self);
}

/// Creates one backend per negotiation. A fresh backend is built for every
/// init and for every renegotiation the answerer accepts.
#[async_trait]
pub trait PeerBackendFactory: Send + Sync {
    async fn create(
        &self,
        session: &PairingSession,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerBackend>, SessionError>;
}
