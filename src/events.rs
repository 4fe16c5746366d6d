use tokio::sync::broadcast;

use crate::error::SessionError;
use crate::models::{Direction, VideoFrame};
use crate::peer::PeerState;

/// Transport-agnostic application events.
/// Emitted by the session core, consumed by whatever UI layer embeds it.
/// Delivery is asynchronous; subscribers must not assume synchronous order
/// with respect to the call that caused an event.
#[derive(Debug, Clone)]
pub enum AppEvent {
    /// Peer connection state machine advanced. Emitted exactly once per
    /// transition, in transition order.
    ConnectionStateChanged { state: PeerState },
    /// A frame of the paired device's viewfinder.
    RemoteFrame(VideoFrame),
    /// A frame of the local viewfinder (camera role).
    LocalPreviewFrame(VideoFrame),
    /// The director asked for a framing adjustment.
    DirectionReceived { direction: Direction },
    /// The director triggered the shutter.
    CaptureRequested,
    /// The camera grabbed the frame for a capture. Persisting the record is
    /// the external store's job.
    PhotoCaptured(VideoFrame),
    FlashToggled { on: bool },
    /// Forwarded unmodified; never triggers a reconnect by itself.
    Error(SessionError),
    Reconnecting { attempt: u32 },
    Reconnected,
    /// Surfaced once; requires re-pairing and is never auto-retried.
    SessionExpired,
}

pub type EventSender = broadcast::Sender<AppEvent>;
pub type EventReceiver = broadcast::Receiver<AppEvent>;

pub fn create_event_bus() -> (EventSender, EventReceiver) {
    broadcast::channel(256)
}
