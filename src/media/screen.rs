use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::MediaError;

use super::video::VideoFrame;

/// Send+Sync screen capture handle. The ffmpeg child and its reader live on
/// a dedicated thread.
pub struct ScreenCaptureHandle {
    running: Arc<AtomicBool>,
    _thread: std::thread::JoinHandle<()>,
}

unsafe impl Send for ScreenCaptureHandle {}
unsafe impl Sync for ScreenCaptureHandle {}

impl ScreenCaptureHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Drop for ScreenCaptureHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

/// Start screen capture via an ffmpeg subprocess emitting an MJPEG pipe.
/// Frames arrive JPEG-encoded, same shape as camera frames, so the call
/// engine can feed either into the outbound screen track.
pub fn start_screen_capture(
) -> Result<(ScreenCaptureHandle, mpsc::Receiver<VideoFrame>), MediaError> {
    let ffmpeg = find_ffmpeg().ok_or_else(|| {
        MediaError::Unavailable(
            "no screen capture method available; install ffmpeg for screen sharing".into(),
        )
    })?;

    let (tx, rx) = mpsc::channel::<VideoFrame>(16);
    let running = Arc::new(AtomicBool::new(true));
    let running_thread = running.clone();

    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), MediaError>>();

    let thread = std::thread::spawn(move || {
        let mut child = match spawn_ffmpeg(&ffmpeg) {
            Ok(c) => c,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };

        let mut stdout = match child.stdout.take() {
            Some(s) => s,
            None => {
                let _ = ready_tx.send(Err(MediaError::Backend(
                    "ffmpeg produced no stdout pipe".into(),
                )));
                return;
            }
        };

        info!("screen capture started via ffmpeg");
        let _ = ready_tx.send(Ok(()));

        // MJPEG stream: frames delimited by JPEG SOI (FFD8) / EOI (FFD9).
        let mut pending: Vec<u8> = Vec::new();
        let mut buf = [0u8; 65536];

        while running_thread.load(Ordering::Relaxed) {
            match stdout.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    while let Some(frame) = take_jpeg_frame(&mut pending) {
                        let _ = tx.try_send(VideoFrame {
                            jpeg_data: frame,
                            width: 0,
                            height: 0,
                        });
                    }
                }
                Err(e) => {
                    if running_thread.load(Ordering::Relaxed) {
                        error!("screen capture read error: {}", e);
                    }
                    break;
                }
            }
        }

        let _ = child.kill();
        let _ = child.wait();
        info!("screen capture thread exiting");
    });

    match ready_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(MediaError::Backend("screen capture thread panicked".into())),
    }

    Ok((ScreenCaptureHandle { running, _thread: thread }, rx))
}

/// Extract one complete JPEG frame from the front of the buffer, if present.
fn take_jpeg_frame(pending: &mut Vec<u8>) -> Option<Vec<u8>> {
    let start = pending.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end_rel = pending[start..].windows(2).position(|w| w == [0xFF, 0xD9])?;
    let end = start + end_rel + 2;
    let frame = pending[start..end].to_vec();
    pending.drain(..end);
    Some(frame)
}

/// Check a list of ffmpeg candidate paths and return the first that works.
fn find_ffmpeg() -> Option<String> {
    let candidates = ["ffmpeg", "/usr/bin/ffmpeg", "/usr/local/bin/ffmpeg"];
    for candidate in candidates {
        if Command::new(candidate)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok()
        {
            debug!("found ffmpeg at: {}", candidate);
            return Some(candidate.to_string());
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn spawn_ffmpeg(ffmpeg: &str) -> Result<Child, MediaError> {
    let display = std::env::var("DISPLAY").unwrap_or_else(|_| ":0".into());
    Command::new(ffmpeg)
        .args([
            "-f", "x11grab", "-framerate", "10", "-i", &display,
            "-vf", "scale=1280:-2",
            "-f", "image2pipe", "-vcodec", "mjpeg", "-q:v", "7", "-",
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| MediaError::Backend(format!("failed to spawn ffmpeg: {e}")))
}

#[cfg(target_os = "macos")]
fn spawn_ffmpeg(ffmpeg: &str) -> Result<Child, MediaError> {
    Command::new(ffmpeg)
        .args([
            "-f", "avfoundation", "-framerate", "10", "-capture_cursor", "1", "-i", "1:none",
            "-vf", "scale=1280:-2",
            "-f", "image2pipe", "-vcodec", "mjpeg", "-q:v", "7", "-",
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| MediaError::Backend(format!("failed to spawn ffmpeg: {e}")))
}

#[cfg(target_os = "windows")]
fn spawn_ffmpeg(ffmpeg: &str) -> Result<Child, MediaError> {
    Command::new(ffmpeg)
        .args([
            "-f", "gdigrab", "-framerate", "10", "-i", "desktop",
            "-vf", "scale=1280:-2",
            "-f", "image2pipe", "-vcodec", "mjpeg", "-q:v", "7", "-",
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| MediaError::Backend(format!("failed to spawn ffmpeg: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jpeg_frames_split_on_markers() {
        let mut buf = vec![
            0x00, 0x01, // leading noise
            0xFF, 0xD8, 0xAA, 0xBB, 0xFF, 0xD9, // frame 1
            0xFF, 0xD8, 0xCC, // partial frame 2
        ];
        let frame = take_jpeg_frame(&mut buf).unwrap();
        assert_eq!(frame, vec![0xFF, 0xD8, 0xAA, 0xBB, 0xFF, 0xD9]);
        assert_eq!(take_jpeg_frame(&mut buf), None);

        buf.extend_from_slice(&[0xFF, 0xD9]);
        let frame = take_jpeg_frame(&mut buf).unwrap();
        assert_eq!(frame, vec![0xFF, 0xD8, 0xCC, 0xFF, 0xD9]);
        assert!(buf.is_empty());
    }
}
