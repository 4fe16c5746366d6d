use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::models::PairingSession;

/// Events emitted by the connection manager.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    NetworkChanged { is_connected: bool },
    /// The pairing session's validity window lapsed. Emitted once.
    SessionExpired,
    /// A reconnect driven by the lifecycle controller reached `connected`.
    ReconnectSucceeded,
}

/// A reachability feed. The gossip transport provides one from its swarm
/// connectivity; embedders with platform reachability APIs push into a
/// [`ManualNetwork`] instead.
pub trait NetworkSource: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Manually driven reachability source for tests, the demo, and platforms
/// that deliver reachability as callbacks.
pub struct ManualNetwork {
    tx: watch::Sender<bool>,
}

impl ManualNetwork {
    pub fn new(initially_connected: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_connected);
        Self { tx }
    }

    pub fn set_connected(&self, connected: bool) {
        let _ = self.tx.send(connected);
    }
}

impl NetworkSource for ManualNetwork {
    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Process-wide authority on network reachability and session validity.
///
/// Created once at startup and cloned into whoever needs it. It only emits
/// events; acting on them is the lifecycle controller's job, and it never
/// touches the peer connection itself.
#[derive(Clone)]
pub struct ConnectionManager {
    event_tx: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        let (event_tx, _rx) = broadcast::channel(64);
        Self { event_tx }
    }

    /// Subscribe to connection events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Watch a reachability source, re-emitting only actual changes.
    pub fn watch_network(&self, source: &dyn NetworkSource) -> JoinHandle<()> {
        let mut rx = source.subscribe();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let mut last = *rx.borrow();
            while rx.changed().await.is_ok() {
                let now = *rx.borrow();
                if now != last {
                    last = now;
                    info!("network reachability changed: connected={now}");
                    let _ = tx.send(ConnectionEvent::NetworkChanged { is_connected: now });
                }
            }
            debug!("network source closed");
        })
    }

    /// Emit `SessionExpired` once when the session's window lapses.
    pub fn watch_expiry(&self, session: &PairingSession) -> JoinHandle<()> {
        let expires_at = session.expires_at;
        let session_id = session.session_id.clone();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            if let Ok(remaining) = (expires_at - Utc::now()).to_std() {
                tokio::time::sleep(remaining).await;
            }
            info!(%session_id, "pairing session expired");
            let _ = tx.send(ConnectionEvent::SessionExpired);
        })
    }

    /// Reported by the lifecycle controller when a reconnect lands.
    pub fn report_reconnect_success(&self) {
        let _ = self.event_tx.send(ConnectionEvent::ReconnectSucceeded);
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::models::Role;

    #[tokio::test]
    async fn network_watch_dedups_consecutive_states() {
        let manager = ConnectionManager::new();
        let mut events = manager.subscribe();
        let network = ManualNetwork::new(true);
        let _watch = manager.watch_network(&network);

        // Pace the sends so the watcher observes every value; a watch
        // channel only keeps the latest.
        for connected in [true, false, false, true] {
            network.set_connected(connected);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let first = events.recv().await.unwrap();
        assert!(matches!(
            first,
            ConnectionEvent::NetworkChanged { is_connected: false }
        ));
        let second = events.recv().await.unwrap();
        assert!(matches!(
            second,
            ConnectionEvent::NetworkChanged { is_connected: true }
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn expiry_watch_fires_once_the_window_lapses() {
        let manager = ConnectionManager::new();
        let mut events = manager.subscribe();
        let session = PairingSession {
            session_id: "s".into(),
            my_device_id: "a".into(),
            paired_device_id: "b".into(),
            role: Role::Camera,
            expires_at: Utc::now() + chrono::Duration::milliseconds(50),
        };
        let _watch = manager.watch_expiry(&session);

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, ConnectionEvent::SessionExpired));
    }
}
