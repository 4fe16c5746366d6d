use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::{Rgb, RgbImage};
use tokio::sync::mpsc;
use tracing::error;

use super::{MediaSource, MediaSourceFactory};
use crate::config::CameraConfig;
use crate::error::SessionError;
use crate::models::VideoFrame;

const PALETTE: [[u8; 3]; 6] = [
    [200, 60, 60],
    [60, 200, 60],
    [60, 60, 200],
    [200, 200, 60],
    [60, 200, 200],
    [200, 60, 200],
];

/// Synthetic source emitting solid-color JPEG frames at the configured
/// cadence. Used by tests and the loopback demo so no hardware is needed;
/// "flash" renders the frame white, which makes torch behavior observable.
pub struct TestPatternSource {
    enabled: Arc<AtomicBool>,
    flash: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl MediaSource for TestPatternSource {
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn set_flash(&self, on: bool) -> bool {
        self.flash.store(on, Ordering::Relaxed);
        true
    }

    fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for TestPatternSource {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Opens synthetic pattern sources.
#[derive(Debug, Clone, Default)]
pub struct TestPatternFactory;

impl MediaSourceFactory for TestPatternFactory {
    fn open(
        &self,
        config: &CameraConfig,
    ) -> Result<(Box<dyn MediaSource>, mpsc::Receiver<VideoFrame>), SessionError> {
        let (tx, rx) = mpsc::channel::<VideoFrame>(16);
        let enabled = Arc::new(AtomicBool::new(true));
        let flash = Arc::new(AtomicBool::new(false));

        let width = config.width;
        let height = config.height;
        let interval = Duration::from_millis(1000 / config.fps.max(1) as u64);
        let enabled_task = enabled.clone();
        let flash_task = flash.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut frame_index: usize = 0;
            loop {
                ticker.tick().await;
                if !enabled_task.load(Ordering::Relaxed) {
                    continue;
                }
                let color = if flash_task.load(Ordering::Relaxed) {
                    [255, 255, 255]
                } else {
                    PALETTE[frame_index % PALETTE.len()]
                };
                frame_index = frame_index.wrapping_add(1);

                let img = RgbImage::from_pixel(width, height, Rgb(color));
                let mut jpeg_buf = Vec::new();
                let mut cursor = std::io::Cursor::new(&mut jpeg_buf);
                if let Err(e) = img.write_to(&mut cursor, image::ImageFormat::Jpeg) {
                    error!("pattern JPEG encode failed: {e}");
                    continue;
                }
                if tx
                    .try_send(VideoFrame {
                        jpeg: jpeg_buf,
                        width,
                        height,
                    })
                    .is_err()
                    && tx.is_closed()
                {
                    break;
                }
            }
        });

        Ok((
            Box::new(TestPatternSource {
                enabled,
                flash,
                task,
            }),
            rx,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emits_frames_and_respects_enabled_gate() {
        let factory = TestPatternFactory;
        let config = CameraConfig {
            fps: 100,
            width: 8,
            height: 8,
            ..CameraConfig::default()
        };
        let (source, mut rx) = factory.open(&config).unwrap();

        let frame = rx.recv().await.expect("pattern frame");
        assert_eq!(frame.width, 8);
        assert!(!frame.jpeg.is_empty());

        source.set_enabled(false);
        // Drain anything produced before the gate closed.
        tokio::time::sleep(Duration::from_millis(50)).await;
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        source.set_enabled(true);
        assert!(rx.recv().await.is_some());
        source.stop();
    }
}
