pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod media;
pub mod models;
pub mod pairing;
pub mod peer;
pub mod signaling;
mod singleflight;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

pub use crate::config::{CameraConfig, SessionConfig};
pub use crate::connection::{ConnectionEvent, ConnectionManager, ManualNetwork, NetworkSource};
pub use crate::error::{PairingError, SessionError};
pub use crate::events::{create_event_bus, AppEvent, EventReceiver, EventSender};
pub use crate::lifecycle::{
    run_lifecycle, AppPhase, AppStateSource, LifecycleCommand, LifecycleState, ManualAppState,
};
pub use crate::models::{CommandKind, Direction, PairingSession, Role, VideoFrame};
pub use crate::pairing::{MemoryPairingStore, PairingStore};
pub use crate::peer::{PeerBackendFactory, PeerManager, PeerState};
pub use crate::signaling::transport::{MemoryHub, SignalingTransport};

use crate::media::MediaSourceFactory;

/// Handles the embedding layer keeps for one mounted session.
#[derive(Clone)]
pub struct SessionContext {
    pub device_id: String,
    /// Command path to the paired device; UI buttons land here.
    pub manager: PeerManager,
    pub event_tx: EventSender,
    pub lifecycle_tx: mpsc::Sender<LifecycleCommand>,
    pub lifecycle_state: watch::Receiver<LifecycleState>,
}

impl SessionContext {
    pub fn subscribe(&self) -> EventReceiver {
        self.event_tx.subscribe()
    }
}

/// Wire a peer manager and lifecycle controller for a paired session and
/// spawn the controller. The returned handle resolves when the session
/// unmounts (shutdown command or expiry).
pub fn start_session(
    session: PairingSession,
    config: SessionConfig,
    transport: Arc<dyn SignalingTransport>,
    backends: Arc<dyn PeerBackendFactory>,
    media: Arc<dyn MediaSourceFactory>,
    connection: ConnectionManager,
    app_state: &dyn AppStateSource,
) -> (SessionContext, tokio::task::JoinHandle<()>) {
    let (event_tx, _event_rx) = create_event_bus();
    let (lifecycle_tx, lifecycle_rx) = mpsc::channel(16);
    let (state_tx, state_rx) = watch::channel(LifecycleState::default());

    let manager = PeerManager::new(config.clone(), event_tx.clone(), transport, backends, media);
    connection.watch_expiry(&session);

    let handle = tokio::spawn(run_lifecycle(
        manager.clone(),
        session.clone(),
        config,
        connection,
        app_state.subscribe(),
        lifecycle_rx,
        event_tx.clone(),
        state_tx,
    ));

    (
        SessionContext {
            device_id: session.my_device_id,
            manager,
            event_tx,
            lifecycle_tx,
            lifecycle_state: state_rx,
        },
        handle,
    )
}
