use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
};
use nokhwa::Camera;
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::error::MediaError;

use super::ProbeOutcome;

/// Camera device info surfaced to the readiness room / UI.
#[derive(Debug, Clone, Serialize)]
pub struct CameraDevice {
    pub index: u32,
    pub name: String,
    pub is_default: bool,
}

/// A single video frame: JPEG-encoded bytes.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub jpeg_data: Vec<u8>,
    pub width: u32,
    pub height: u32,
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
            warn!("failed to query cameras: {}", e);
            Vec::new()
        }
    }
}

fn classify_camera_error(err: &nokhwa::NokhwaError) -> MediaError {
    let text = err.to_string();
    if text.to_lowercase().contains("denied") || text.to_lowercase().contains("permission") {
        MediaError::AccessDenied(text)
    } else {
        MediaError::Unavailable(text)
    }
}

/// Send+Sync camera handle. The nokhwa Camera lives on a dedicated thread.
pub struct CameraHandle {
    running: Arc<AtomicBool>,
    _thread: std::thread::JoinHandle<()>,
}

unsafe impl Send for CameraHandle {}
unsafe impl Sync for CameraHandle {}

impl CameraHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Drop for CameraHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

/// Start capturing video from a camera.
/// Returns JPEG-encoded frames via the channel.
/// Target: 1280x720 @ 30fps, closest supported match.
pub fn start_camera(
    device_index: Option<u32>,
) -> Result<(CameraHandle, mpsc::Receiver<VideoFrame>), MediaError> {
    let (tx, rx) = mpsc::channel::<VideoFrame>(16);
    let running = Arc::new(AtomicBool::new(true));
    let running_thread = running.clone();

    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), MediaError>>();

    let thread = std::thread::spawn(move || {
        let index = CameraIndex::Index(device_index.unwrap_or(0));

        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
            CameraFormat::new(Resolution::new(1280, 720), FrameFormat::MJPEG, 30),
        ));

        let mut camera = match Camera::new(index, requested) {
            Ok(c) => c,
            Err(e) => {
                let _ = ready_tx.send(Err(classify_camera_error(&e)));
                return;
            }
        };

        if let Err(e) = camera.open_stream() {
            let _ = ready_tx.send(Err(classify_camera_error(&e)));
            return;
        }

        let info = camera.info();
        info!("camera started: {} ({}x{})", info.human_name(), 1280, 720);
        let _ = ready_tx.send(Ok(()));

        while running_thread.load(Ordering::Relaxed) {
            match camera.frame() {
                Ok(frame) => {
                    let resolution = frame.resolution();
                    let decoded = frame.decode_image::<RgbFormat>();
                    match decoded {
                        Ok(rgb_image) => {
                            // Encode as JPEG
                            let mut jpeg_buf = Vec::new();
                            let mut cursor = std::io::Cursor::new(&mut jpeg_buf);
                            if let Err(e) =
                                rgb_image.write_to(&mut cursor, image::ImageFormat::Jpeg)
                            {
                                error!("JPEG encode failed: {}", e);
                                continue;
                            }
                            let _ = tx.try_send(VideoFrame {
                                jpeg_data: jpeg_buf,
                                width: resolution.width(),
                                height: resolution.height(),
                            });
                        }
                        Err(e) => {
                            error!("frame decode failed: {}", e);
                        }
                    }
                }
                Err(e) => {
                    if running_thread.load(Ordering::Relaxed) {
                        error!("camera frame error: {}", e);
                    }
                    break;
                }
            }

            // ~30 fps
            std::thread::sleep(Duration::from_millis(33));
        }

        drop(camera);
        info!("camera capture thread exiting");
    });

    match ready_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(MediaError::Backend("camera thread panicked".into())),
    }

    Ok((CameraHandle { running, _thread: thread }, rx))
}

/// Bounded camera readiness probe: re-acquires a stream scoped to the
/// selected device and passes on the first delivered frame. The frame also
/// serves as the visual preview for the readiness room.
///
/// Blocking; call through `spawn_blocking` from async code.
pub fn probe_camera(device_index: Option<u32>, timeout: Duration) -> (ProbeOutcome, Option<VideoFrame>) {
    let (handle, mut rx) = match start_camera(device_index) {
        Ok(pair) => pair,
        Err(e) => return (ProbeOutcome::Failed(e.to_string()), None),
    };

    let deadline = std::time::Instant::now() + timeout;
    loop {
        match rx.try_recv() {
            Ok(frame) => {
                handle.stop();
                return (ProbeOutcome::Passed, Some(frame));
            }
            Err(mpsc::error::TryRecvError::Empty) => {
                if std::time::Instant::now() >= deadline {
                    handle.stop();
                    return (ProbeOutcome::TimedOut, None);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(mpsc::error::TryRecvError::Disconnected) => {
                return (ProbeOutcome::Failed("camera stream ended".into()), None);
            }
        }
    }
}
