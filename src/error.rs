use thiserror::Error;

/// Session-level failure taxonomy.
///
/// Variants are `Clone` so errors can ride the broadcast event bus to the UI
/// layer unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The signaling transport could not confirm its subscription within the
    /// configured bound. Recoverable; retried through the lifecycle rules.
    #[error("signaling channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// `init` was requested while the manager already holds a live peer
    /// connection. Destroy it first, or await the coalesced in-flight init.
    #[error("peer connection is already initializing or initialized")]
    AlreadyInitializing,

    /// Offer/answer or candidate exchange did not converge. Recoverable via
    /// a full destroy + init cycle.
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Camera/permission/hardware failure. Fatal to publishing video, but
    /// the command path is still attempted.
    #[error("local media unavailable: {0}")]
    MediaUnavailable(String),

    /// The pairing session is past its validity window. Requires re-pairing;
    /// never auto-retried.
    #[error("pairing session expired")]
    SessionExpired,

    /// Underlying transport failure outside the cases above.
    #[error("transport error: {0}")]
    Transport(String),

    /// The manager has been destroyed and holds no connection.
    #[error("peer connection is closed")]
    Closed,
}

/// Failures of the pairing handshake against the external store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingError {
    /// Rejected before any store call: codes are fixed-length numeric.
    #[error("pairing code must be {expected} digits")]
    InvalidCodeFormat { expected: usize },

    #[error("no pairing found for that code")]
    UnknownCode,

    /// A device cannot hold two concurrently active sessions.
    #[error("device already holds an active session")]
    AlreadyPaired,

    #[error("pairing store error: {0}")]
    Store(String),
}
