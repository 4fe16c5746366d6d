use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which side of the session this device plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Publishes the viewfinder and executes capture. Always the offerer.
    Camera,
    /// Watches the viewfinder and sends framing commands. Always the answerer.
    Director,
}

impl Role {
    pub fn is_camera(self) -> bool {
        matches!(self, Role::Camera)
    }
}

/// A paired two-device session as handed out by the pairing store.
///
/// Exactly one camera and one director per session; a device never holds two
/// concurrently active sessions (the store enforces both).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingSession {
    pub session_id: String,
    pub my_device_id: String,
    pub paired_device_id: String,
    pub role: Role,
    pub expires_at: DateTime<Utc>,
}

impl PairingSession {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Framing directions the director can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
    Closer,
    Back,
}

/// Command kinds carried over the command path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum CommandKind {
    Direction { direction: Direction },
    Capture,
    FlashToggle,
}

/// A command plus its per-sender sequence number.
///
/// Receivers keep the highest sequence seen and drop stale or duplicate
/// frames, so a command arriving over both the data channel and the
/// signaling fallback cannot double-apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandFrame {
    pub seq: u64,
    #[serde(flatten)]
    pub kind: CommandKind,
}

/// A single JPEG-encoded video frame.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_frame_round_trips_with_flattened_kind() {
        let frame = CommandFrame {
            seq: 7,
            kind: CommandKind::Direction {
                direction: Direction::Closer,
            },
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["seq"], 7);
        assert_eq!(json["command"], "direction");
        assert_eq!(json["direction"], "closer");

        let back: CommandFrame = serde_json::from_value(json).unwrap();
        assert_eq!(back.seq, 7);
        assert_eq!(
            back.kind,
            CommandKind::Direction {
                direction: Direction::Closer
            }
        );
    }

    #[test]
    fn expired_session_is_detected() {
        let session = PairingSession {
            session_id: "s".into(),
            my_device_id: "a".into(),
            paired_device_id: "b".into(),
            role: Role::Camera,
            expires_at: Utc::now() - chrono::Duration::seconds(1),
        };
        assert!(session.is_expired());
    }
}
