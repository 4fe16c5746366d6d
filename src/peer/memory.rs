use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::{PeerBackend, PeerBackendFactory, PeerEvent, PeerState};
use crate::error::SessionError;
use crate::models::PairingSession;

/// Builds in-process backend pairs, rendezvous'd by session id: the first
/// half created for a session waits, the second links up with it. Used by
/// tests and the loopback demo in place of real WebRTC, with the same
/// observable sequencing: descriptions before candidates, data paths dead
/// until connected, and a disconnect event on the surviving half when its
/// peer closes.
#[derive(Clone, Default)]
pub struct MemoryBackendFactory {
    waiting: Arc<Mutex<HashMap<String, Arc<MemoryBackend>>>>,
}

impl MemoryBackendFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PeerBackendFactory for MemoryBackendFactory {
    async fn create(
        &self,
        session: &PairingSession,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerBackend>, SessionError> {
        let backend = Arc::new(MemoryBackend {
            events,
            peer: Mutex::new(None),
            remote_desc: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let mut waiting = self.waiting.lock().await;
        match waiting.remove(&session.session_id) {
            Some(other) if !other.closed.load(Ordering::Acquire) => {
                *backend.peer.lock().await = Some(Arc::downgrade(&other));
                *other.peer.lock().await = Some(Arc::downgrade(&backend));
            }
            _ => {
                waiting.insert(session.session_id.clone(), backend.clone());
            }
        }

        Ok(backend)
    }
}

/// One half of a linked pair. Offers and answers are opaque tokens; what
/// matters is the sequencing the manager must get right around them.
pub struct MemoryBackend {
    events: mpsc::Sender<PeerEvent>,
    peer: Mutex<Option<Weak<MemoryBackend>>>,
    remote_desc: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl MemoryBackend {
    async fn linked_peer(&self) -> Option<Arc<MemoryBackend>> {
        self.peer.lock().await.as_ref().and_then(Weak::upgrade)
    }

    async fn mark_connected(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if !self.connected.swap(true, Ordering::AcqRel) {
            let _ = self
                .events
                .send(PeerEvent::StateChanged(PeerState::Connected))
                .await;
            let _ = self.events.send(PeerEvent::CommandChannelOpen).await;
        }
    }

    /// Called by the closing peer on the surviving half.
    async fn peer_closed(&self) {
        *self.peer.lock().await = None;
        if self.connected.swap(false, Ordering::AcqRel) && !self.closed.load(Ordering::Acquire) {
            let _ = self
                .events
                .send(PeerEvent::StateChanged(PeerState::Disconnected))
                .await;
        }
    }

    async fn emit_local_candidate(&self) {
        let candidate = format!("memory-candidate:{}", uuid::Uuid::new_v4());
        let _ = self.events.send(PeerEvent::LocalCandidate(candidate)).await;
    }
}

#[async_trait]
impl PeerBackend for MemoryBackend {
    async fn create_offer(&self) -> Result<String, SessionError> {
        self.emit_local_candidate().await;
        Ok(format!("memory-offer:{}", uuid::Uuid::new_v4()))
    }

    async fn accept_offer(&self, _sdp: &str) -> Result<String, SessionError> {
        self.remote_desc.store(true, Ordering::Release);
        self.emit_local_candidate().await;
        Ok(format!("memory-answer:{}", uuid::Uuid::new_v4()))
    }

    async fn accept_answer(&self, _sdp: &str) -> Result<(), SessionError> {
        self.remote_desc.store(true, Ordering::Release);
        self.mark_connected().await;
        if let Some(peer) = self.linked_peer().await {
            peer.mark_connected().await;
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), SessionError> {
        if !self.remote_desc.load(Ordering::Acquire) {
            return Err(SessionError::NegotiationFailed(
                "candidate received before remote description".into(),
            ));
        }
        debug!("applied remote candidate {candidate}");
        Ok(())
    }

    async fn send_command_data(&self, data: Bytes) -> Result<(), SessionError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(SessionError::Transport("command channel not open".into()));
        }
        let peer = self
            .linked_peer()
            .await
            .ok_or_else(|| SessionError::Transport("peer is gone".into()))?;
        let _ = peer.events.send(PeerEvent::CommandData(data)).await;
        Ok(())
    }

    async fn send_video_data(&self, data: Bytes) -> Result<(), SessionError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(SessionError::Transport("video channel not open".into()));
        }
        let peer = self
            .linked_peer()
            .await
            .ok_or_else(|| SessionError::Transport("peer is gone".into()))?;
        let _ = peer.events.send(PeerEvent::VideoData(data)).await;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connected.store(false, Ordering::Release);
        let peer = self.peer.lock().await.take();
        if let Some(peer) = peer.as_ref().and_then(Weak::upgrade) {
            peer.peer_closed().await;
        }
    }
}
