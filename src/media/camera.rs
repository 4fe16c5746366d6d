use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
};
use nokhwa::Camera;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::{MediaSource, MediaSourceFactory};
use crate::config::CameraConfig;
use crate::error::SessionError;
use crate::models::VideoFrame;

/// Camera device info for device pickers.
#[derive(Debug, Clone)]
pub struct CameraDevice {
    pub index: u32,
    pub name: String,
    pub is_default: bool,
}

/// List available cameras.
pub fn list_cameras() -> Vec<CameraDevice> {
    match nokhwa::query(nokhwa::utils::ApiBackend::Auto) {
        Ok(devices) => devices
            .into_iter()
            .enumerate()
            .map(|(i, info)| CameraDevice {
                index: info.index().as_index().unwrap_or(i as u32),
                name: info.human_name().to_string(),
                is_default: i == 0,
            })
            .collect(),
        Err(e) => {
            warn!("failed to query cameras: {e}");
            Vec::new()
        }
    }
}

/// A camera capturing on a dedicated thread, handing out JPEG frames.
///
/// The nokhwa `Camera` is not `Send`, so it lives entirely on the capture
/// thread; this handle only carries control flags.
pub struct CameraSource {
    running: Arc<AtomicBool>,
    enabled: Arc<AtomicBool>,
    _thread: std::thread::JoinHandle<()>,
}

impl MediaSource for CameraSource {
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn set_flash(&self, _on: bool) -> bool {
        // No torch control through nokhwa; the UI falls back to a screen
        // flash on capture.
        false
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

/// Opens real camera devices.
#[derive(Debug, Clone, Default)]
pub struct CameraSourceFactory;

impl MediaSourceFactory for CameraSourceFactory {
    fn open(
        &self,
        config: &CameraConfig,
    ) -> Result<(Box<dyn MediaSource>, mpsc::Receiver<VideoFrame>), SessionError> {
        let (source, rx) = start_camera(config)?;
        Ok((Box::new(source), rx))
    }
}

/// Start capturing from a camera. Frames arrive JPEG-encoded; while the
/// source is disabled the thread keeps the device open but emits nothing.
fn start_camera(
    config: &CameraConfig,
) -> Result<(CameraSource, mpsc::Receiver<VideoFrame>), SessionError> {
    let (tx, rx) = mpsc::channel::<VideoFrame>(16);
    let running = Arc::new(AtomicBool::new(true));
    let enabled = Arc::new(AtomicBool::new(true));

    let running_thread = running.clone();
    let enabled_thread = enabled.clone();
    let index = CameraIndex::Index(config.device_index.unwrap_or(0));
    let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
        CameraFormat::new(
            Resolution::new(config.width, config.height),
            FrameFormat::MJPEG,
            config.fps,
        ),
    ));
    let frame_interval = Duration::from_millis(1000 / config.fps.max(1) as u64);

    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();

    let thread = std::thread::spawn(move || {
        let mut camera = match Camera::new(index, requested) {
            Ok(c) => c,
            Err(e) => {
                let _ = ready_tx.send(Err(format!("failed to open camera: {e}")));
                return;
            }
        };

        if let Err(e) = camera.open_stream() {
            let _ = ready_tx.send(Err(format!("failed to open camera stream: {e}")));
            return;
        }

        info!("camera started: {}", camera.info().human_name());
        let _ = ready_tx.send(Ok(()));

        while running_thread.load(Ordering::Relaxed) {
            if !enabled_thread.load(Ordering::Relaxed) {
                std::thread::sleep(frame_interval);
                continue;
            }
            match camera.frame() {
                Ok(frame) => {
                    let resolution = frame.resolution();
                    match frame.decode_image::<RgbFormat>() {
                        Ok(rgb_image) => {
                            let mut jpeg_buf = Vec::new();
                            let mut cursor = std::io::Cursor::new(&mut jpeg_buf);
                            if let Err(e) =
                                rgb_image.write_to(&mut cursor, image::ImageFormat::Jpeg)
                            {
                                error!("JPEG encode failed: {e}");
                                continue;
                            }
                            let _ = tx.try_send(VideoFrame {
                                jpeg: jpeg_buf,
                                width: resolution.width(),
                                height: resolution.height(),
                            });
                        }
                        Err(e) => {
                            error!("frame decode failed: {e}");
                        }
                    }
                }
                Err(e) => {
                    if running_thread.load(Ordering::Relaxed) {
                        error!("camera frame error: {e}");
                    }
                    break;
                }
            }

            std::thread::sleep(frame_interval);
        }

        drop(camera);
        info!("camera capture thread exiting");
    });

    match ready_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(SessionError::MediaUnavailable(e)),
        Err(_) => {
            return Err(SessionError::MediaUnavailable(
                "camera thread panicked during startup".into(),
            ))
        }
    }

    Ok((
        CameraSource {
            running,
            enabled,
            _thread: thread,
        },
        rx,
    ))
}
