pub mod camera;
pub mod pattern;

use tokio::sync::mpsc;

use crate::config::CameraConfig;
use crate::error::SessionError;
use crate::models::VideoFrame;

/// Handle to a running local media source.
///
/// The peer manager owns the source for one init/destroy cycle and is the
/// only place it gets disposed; the lifecycle controller is limited to
/// flipping the enabled/flash flags.
pub trait MediaSource: Send + Sync {
    /// Gate frame production without tearing the source down. Cheap, so the
    /// lifecycle can flip it on every background/foreground transition.
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    /// Best-effort torch control; returns false when the source cannot
    /// honor it.
    fn set_flash(&self, on: bool) -> bool;
    /// Stop capture and release the device.
    fn stop(&self);
}

/// Opens local media. The camera role gets one source per init.
pub trait MediaSourceFactory: Send + Sync {
    fn open(
        &self,
        config: &CameraConfig,
    ) -> Result<(Box<dyn MediaSource>, mpsc::Receiver<VideoFrame>), SessionError>;
}
