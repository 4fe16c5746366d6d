use std::time::Duration;

use crate::models::Role;

/// Capture format requested from the local camera.
#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub device_index: Option<u32>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_index: None,
            width: 640,
            height: 480,
            fps: 15,
        }
    }
}

/// Tunables for one session.
///
/// The settle delays are deliberately configuration rather than constants;
/// they pace reconnect attempts so the network stack has time to stabilize
/// after device unlock or an interface change.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on waiting for the signaling subscription acknowledgment.
    pub channel_open_timeout: Duration,
    /// Bound on reaching `connected` after an init begins negotiating.
    pub negotiation_timeout: Duration,
    /// Interval at which the camera re-sends its offer until answered.
    pub offer_retry_interval: Duration,
    /// Settle before the reconnect scheduled on foreground return.
    pub foreground_settle: Duration,
    /// Settle before the reconnect scheduled on network restoration. Longer
    /// than the foreground case: interface recovery is slower than unlock.
    pub network_settle: Duration,
    /// Settle before a user-triggered reconnect.
    pub manual_settle: Duration,
    /// Auto-reconnects stop after this many consecutive failed attempts.
    pub max_reconnect_attempts: u32,
    /// Whether backgrounding disables local video tracks.
    pub pause_video_on_background: bool,
    /// STUN/TURN urls for the peer connection.
    pub ice_servers: Vec<String>,
    pub camera: CameraConfig,
}

impl SessionConfig {
    /// Defaults for a role: only the camera pauses video on background.
    pub fn for_role(role: Role) -> Self {
        Self {
            pause_video_on_background: role.is_camera(),
            ..Self::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_open_timeout: Duration::from_secs(10),
            negotiation_timeout: Duration::from_secs(30),
            offer_retry_interval: Duration::from_secs(2),
            foreground_settle: Duration::from_millis(1000),
            network_settle: Duration::from_millis(2000),
            manual_settle: Duration::from_millis(500),
            max_reconnect_attempts: 5,
            pause_video_on_background: true,
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            camera: CameraConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_on_background_defaults_per_role() {
        assert!(SessionConfig::for_role(Role::Camera).pause_video_on_background);
        assert!(!SessionConfig::for_role(Role::Director).pause_video_on_background);
    }
}
