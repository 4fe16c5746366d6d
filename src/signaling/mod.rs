pub mod gossip;
pub mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::models::{CommandFrame, PairingSession};
use self::transport::{SignalingTransport, TopicReceiver};

/// Wire protocol version carried in every envelope. Receivers drop envelopes
/// newer than this so paired clients on different releases fail loudly in
/// logs instead of misparsing each other.
pub const PROTOCOL_VERSION: u8 = 1;

fn default_version() -> u8 {
    PROTOCOL_VERSION
}

/// Typed signaling payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum SignalBody {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: String },
    Command(CommandFrame),
}

/// Envelope for everything crossing the signaling fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    #[serde(default = "default_version")]
    pub v: u8,
    pub session_id: String,
    pub sender_id: String,
    #[serde(flatten)]
    pub body: SignalBody,
}

/// Topic a session's signaling rides on.
pub fn session_topic(session_id: &str) -> String {
    format!("shuttr/session/{session_id}")
}

/// A session-scoped signaling channel over a pub/sub transport.
///
/// `open` resolves only once the underlying subscription is confirmed;
/// sends before that point cannot happen by construction. Sends are
/// best-effort with no delivery guarantee. Incoming messages arrive on the
/// receiver returned by `open`, in arrival order per sender (no cross-sender
/// ordering), already filtered down to this session and stripped of the
/// local device's own envelopes.
pub struct SignalingChannel {
    transport: Arc<dyn SignalingTransport>,
    topic: String,
    session_id: String,
    sender_id: String,
    closed: AtomicBool,
    pump: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("topic", &self.topic)
            .field("session_id", &self.session_id)
            .field("sender_id", &self.sender_id)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl SignalingChannel {
    /// Subscribe to the session topic. Fails with `ChannelUnavailable` if
    /// the transport cannot confirm the subscription within `open_timeout`.
    pub async fn open(
        transport: Arc<dyn SignalingTransport>,
        session: &PairingSession,
        open_timeout: Duration,
    ) -> Result<(Self, mpsc::Receiver<SignalingMessage>), SessionError> {
        let topic = session_topic(&session.session_id);
        let raw = timeout(open_timeout, transport.subscribe(&topic))
            .await
            .map_err(|_| {
                SessionError::ChannelUnavailable(format!(
                    "subscribe did not confirm within {open_timeout:?}"
                ))
            })??;

        let (tx, rx) = mpsc::channel(64);
        let pump = tokio::spawn(Self::pump(
            raw,
            tx,
            session.session_id.clone(),
            session.my_device_id.clone(),
        ));

        Ok((
            Self {
                transport,
                topic,
                session_id: session.session_id.clone(),
                sender_id: session.my_device_id.clone(),
                closed: AtomicBool::new(false),
                pump,
            },
            rx,
        ))
    }

    async fn pump(
        mut raw: TopicReceiver,
        tx: mpsc::Sender<SignalingMessage>,
        session_id: String,
        my_id: String,
    ) {
        while let Some(payload) = raw.recv().await {
            let msg: SignalingMessage = match serde_json::from_slice(&payload) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("dropping undecodable signaling payload: {e}");
                    continue;
                }
            };
            if msg.v > PROTOCOL_VERSION {
                warn!(
                    "dropping signaling message with unsupported version {} (ours: {})",
                    msg.v, PROTOCOL_VERSION
                );
                continue;
            }
            if msg.session_id != session_id || msg.sender_id == my_id {
                continue;
            }
            if tx.send(msg).await.is_err() {
                break;
            }
        }
    }

    /// Best-effort send; no delivery guarantee.
    pub async fn send(&self, body: SignalBody) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        let msg = SignalingMessage {
            v: PROTOCOL_VERSION,
            session_id: self.session_id.clone(),
            sender_id: self.sender_id.clone(),
            body,
        };
        let data =
            serde_json::to_vec(&msg).map_err(|e| SessionError::Transport(e.to_string()))?;
        self.transport.publish(&self.topic, Bytes::from(data)).await
    }

    /// Unsubscribe and release the channel. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pump.abort();
        self.transport.unsubscribe(&self.topic).await;
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;

    use super::transport::MemoryHub;
    use super::*;
    use crate::models::Role;

    fn session(device: &str, peer: &str) -> PairingSession {
        PairingSession {
            session_id: "sess-1".into(),
            my_device_id: device.into(),
            paired_device_id: peer.into(),
            role: Role::Camera,
            expires_at: Utc::now() + chrono::Duration::minutes(5),
        }
    }

    #[tokio::test]
    async fn delivers_peer_messages_and_filters_own() {
        let hub: Arc<dyn SignalingTransport> = Arc::new(MemoryHub::new());
        let (a, mut a_rx) = SignalingChannel::open(hub.clone(), &session("a", "b"), Duration::from_secs(1))
            .await
            .unwrap();
        let (b, mut b_rx) = SignalingChannel::open(hub.clone(), &session("b", "a"), Duration::from_secs(1))
            .await
            .unwrap();

        a.send(SignalBody::Offer { sdp: "o".into() }).await.unwrap();

        let got = b_rx.recv().await.unwrap();
        assert_eq!(got.sender_id, "a");
        assert!(matches!(got.body, SignalBody::Offer { .. }));
        // The sender never sees its own envelope.
        assert!(a_rx.try_recv().is_err());

        b.close().await;
        a.close().await;
        a.close().await; // idempotent
    }

    #[tokio::test]
    async fn drops_unsupported_versions_and_foreign_sessions() {
        let hub = Arc::new(MemoryHub::new());
        let (_ch, mut rx) = SignalingChannel::open(
            hub.clone() as Arc<dyn SignalingTransport>,
            &session("a", "b"),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        let newer = serde_json::json!({
            "v": PROTOCOL_VERSION + 1,
            "sessionId": "sess-1",
            "senderId": "b",
            "type": "offer",
            "payload": { "sdp": "x" },
        });
        let foreign = serde_json::json!({
            "v": PROTOCOL_VERSION,
            "sessionId": "other-session",
            "senderId": "b",
            "type": "offer",
            "payload": { "sdp": "x" },
        });
        let good = serde_json::json!({
            "v": PROTOCOL_VERSION,
            "sessionId": "sess-1",
            "senderId": "b",
            "type": "answer",
            "payload": { "sdp": "y" },
        });
        for msg in [&newer, &foreign, &good] {
            hub.publish(
                &session_topic("sess-1"),
                Bytes::from(serde_json::to_vec(msg).unwrap()),
            )
            .await
            .unwrap();
        }

        let got = rx.recv().await.unwrap();
        assert!(matches!(got.body, SignalBody::Answer { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn open_times_out_as_channel_unavailable() {
        struct StalledTransport;

        #[async_trait]
        impl SignalingTransport for StalledTransport {
            async fn subscribe(&self, _topic: &str) -> Result<TopicReceiver, SessionError> {
                std::future::pending().await
            }
            async fn publish(&self, _topic: &str, _payload: Bytes) -> Result<(), SessionError> {
                Ok(())
            }
            async fn unsubscribe(&self, _topic: &str) {}
        }

        let err = SignalingChannel::open(
            Arc::new(StalledTransport),
            &session("a", "b"),
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SessionError::ChannelUnavailable(_)));
    }

    #[test]
    fn envelope_defaults_missing_version_field() {
        // Envelopes from clients predating the version field parse as v1.
        let legacy = serde_json::json!({
            "sessionId": "s",
            "senderId": "d",
            "type": "ice-candidate",
            "payload": { "candidate": "c" },
        });
        let msg: SignalingMessage = serde_json::from_value(legacy).unwrap();
        assert_eq!(msg.v, PROTOCOL_VERSION);
    }
}
