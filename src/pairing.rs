use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use tokio::sync::{Mutex, Notify};
use tracing::info;

use crate::error::PairingError;
use crate::models::{PairingSession, Role};

/// Pairing codes are fixed-length numeric strings.
pub const CODE_LEN: usize = 4;

/// Validate a code's format. Runs before any store call, so a malformed
/// code never costs a network round-trip.
pub fn validate_code(code: &str) -> Result<(), PairingError> {
    if code.len() != CODE_LEN || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PairingError::InvalidCodeFormat { expected: CODE_LEN });
    }
    Ok(())
}

fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| char::from(b'0' + rng.gen_range(0..10)))
        .collect()
}

/// The external pairing store, behind the handshake this core depends on:
/// create → exchange code → join → role assignment.
///
/// Role assignment is the store's decision; this system pairs the code
/// creator as the camera (the device being aimed initiates) and the joiner
/// as the director, which also fixes the offerer role with no tie-break.
#[async_trait]
pub trait PairingStore: Send + Sync {
    /// Request a fresh pairing code for this device.
    async fn create_pairing(&self, device_id: &str) -> Result<String, PairingError>;
    /// Redeem a code; returns the joiner's session. Implementations must
    /// validate the code format before any I/O.
    async fn join_pairing(&self, device_id: &str, code: &str)
        -> Result<PairingSession, PairingError>;
    /// Tear down this device's active session (both sides).
    async fn unpair(&self, device_id: &str) -> Result<(), PairingError>;
    /// Realtime-notification half of the handshake: resolves once a peer
    /// has joined and a session exists for this device.
    async fn wait_for_session(&self, device_id: &str) -> Result<PairingSession, PairingError>;
}

#[derive(Default)]
struct StoreInner {
    /// code -> creator device id
    pending: HashMap<String, String>,
    /// device id -> active session
    sessions: HashMap<String, PairingSession>,
}

/// In-memory pairing store powering tests and the loopback demo. Enforces
/// the same invariants the production store does: one camera and one
/// director per session, and at most one active session per device.
pub struct MemoryPairingStore {
    session_ttl: ChronoDuration,
    inner: Mutex<StoreInner>,
    joined: Notify,
}

impl MemoryPairingStore {
    pub fn new(session_ttl: ChronoDuration) -> Self {
        Self {
            session_ttl,
            inner: Mutex::new(StoreInner::default()),
            joined: Notify::new(),
        }
    }
}

impl Default for MemoryPairingStore {
    fn default() -> Self {
        Self::new(ChronoDuration::hours(1))
    }
}

#[async_trait]
impl PairingStore for MemoryPairingStore {
    async fn create_pairing(&self, device_id: &str) -> Result<String, PairingError> {
        let mut inner = self.inner.lock().await;
        if inner.sessions.contains_key(device_id)
            || inner.pending.values().any(|creator| creator == device_id)
        {
            return Err(PairingError::AlreadyPaired);
        }

        let mut code = generate_code();
        while inner.pending.contains_key(&code) {
            code = generate_code();
        }
        inner.pending.insert(code.clone(), device_id.to_string());
        info!(%device_id, "pairing code created");
        Ok(code)
    }

    async fn join_pairing(
        &self,
        device_id: &str,
        code: &str,
    ) -> Result<PairingSession, PairingError> {
        validate_code(code)?;

        let mut inner = self.inner.lock().await;
        if inner.sessions.contains_key(device_id) {
            return Err(PairingError::AlreadyPaired);
        }
        let creator = inner
            .pending
            .remove(code)
            .ok_or(PairingError::UnknownCode)?;
        if creator == device_id {
            return Err(PairingError::Store(
                "a device cannot join its own pairing code".into(),
            ));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let expires_at = Utc::now() + self.session_ttl;

        let creator_session = PairingSession {
            session_id: session_id.clone(),
            my_device_id: creator.clone(),
            paired_device_id: device_id.to_string(),
            role: Role::Camera,
            expires_at,
        };
        let joiner_session = PairingSession {
            session_id: session_id.clone(),
            my_device_id: device_id.to_string(),
            paired_device_id: creator.clone(),
            role: Role::Director,
            expires_at,
        };
        inner.sessions.insert(creator, creator_session);
        inner
            .sessions
            .insert(device_id.to_string(), joiner_session.clone());
        drop(inner);

        self.joined.notify_waiters();
        info!(%session_id, "pairing joined");
        Ok(joiner_session)
    }

    async fn unpair(&self, device_id: &str) -> Result<(), PairingError> {
        let mut inner = self.inner.lock().await;
        inner.pending.retain(|_, creator| creator != device_id);
        if let Some(session) = inner.sessions.remove(device_id) {
            // The session dies for both sides.
            inner.sessions.remove(&session.paired_device_id);
            info!(session_id = %session.session_id, "unpaired");
        }
        Ok(())
    }

    async fn wait_for_session(&self, device_id: &str) -> Result<PairingSession, PairingError> {
        loop {
            let notified = self.joined.notified();
            {
                let inner = self.inner.lock().await;
                if let Some(session) = inner.sessions.get(device_id) {
                    return Ok(session.clone());
                }
            }
            notified.await;
        }
    }
}
