use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::error::MediaError;

use super::ProbeOutcome;

/// Audio device info surfaced to the readiness room / UI.
#[derive(Debug, Clone, Serialize)]
pub struct AudioDevice {
    pub name: String,
    pub is_input: bool,
    pub is_default: bool,
}

/// List available input and output audio devices.
pub fn list_devices() -> Vec<AudioDevice> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            if let Ok(name) = device.name() {
                let is_default = default_input_name.as_deref() == Some(&name);
                devices.push(AudioDevice { name, is_input: true, is_default });
            }
        }
    }

    if let Ok(output_devices) = host.output_devices() {
        for device in output_devices {
            if let Ok(name) = device.name() {
                let is_default = default_output_name.as_deref() == Some(&name);
                devices.push(AudioDevice { name, is_input: false, is_default });
            }
        }
    }

    devices
}

fn classify_build_error(err: cpal::BuildStreamError) -> MediaError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => {
            MediaError::Unavailable("audio device is no longer available".into())
        }
        other => {
            let text = other.to_string();
            if text.to_lowercase().contains("denied")
                || text.to_lowercase().contains("permission")
            {
                MediaError::AccessDenied(text)
            } else {
                MediaError::Backend(text)
            }
        }
    }
}

fn find_input_device(
    host: &cpal::Host,
    device_name: Option<&str>,
) -> Result<cpal::Device, MediaError> {
    if let Some(wanted) = device_name {
        if let Ok(mut devices) = host.input_devices() {
            if let Some(device) =
                devices.find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            {
                return Ok(device);
            }
        }
        return Err(MediaError::Unavailable(format!(
            "input device '{wanted}' not found"
        )));
    }
    host.default_input_device()
        .ok_or_else(|| MediaError::Unavailable("no input device available".into()))
}

/// Send+Sync capture handle. The cpal::Stream (which is !Send) lives on a
/// dedicated thread; we communicate via the `running` flag.
pub struct CaptureHandle {
    running: Arc<AtomicBool>,
    _thread: std::thread::JoinHandle<()>,
}

// Safety: The cpal::Stream is confined to its own thread.
// We only share the AtomicBool flag across threads.
unsafe impl Send for CaptureHandle {}
unsafe impl Sync for CaptureHandle {}

impl CaptureHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

/// Start capturing audio from the selected (or default) input device.
/// Returns a receiver of f32 PCM frames (mono, 48kHz, 960-sample chunks =
/// 20ms). The CaptureHandle must be kept alive to maintain the stream.
/// Echo cancellation, noise suppression, and gain control ride on whatever
/// the platform capture stack provides; cpal exposes no knobs for them.
pub fn start_capture(
    device_name: Option<&str>,
) -> Result<(CaptureHandle, mpsc::Receiver<Vec<f32>>), MediaError> {
    let (tx, rx) = mpsc::channel::<Vec<f32>>(64);
    let running = Arc::new(AtomicBool::new(true));
    let running_thread = running.clone();
    let running_callback = running.clone();
    let wanted = device_name.map(|s| s.to_string());

    // Build the stream on a dedicated thread so the !Send cpal::Stream
    // never crosses a thread boundary.
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), MediaError>>();

    let thread = std::thread::spawn(move || {
        let host = cpal::default_host();
        let device = match find_input_device(&host, wanted.as_deref()) {
            Ok(d) => d,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };

        let device_name = device.name().unwrap_or_else(|_| "unknown".into());
        info!("using input device: {}", device_name);

        let config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(48000),
            buffer_size: cpal::BufferSize::Default,
        };

        let mut buffer = Vec::with_capacity(960);

        let stream = match device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if !running_callback.load(Ordering::Relaxed) {
                    return;
                }
                for &sample in data {
                    buffer.push(sample);
                    if buffer.len() == 960 {
                        let frame = buffer.clone();
                        buffer.clear();
                        let _ = tx.try_send(frame);
                    }
                }
            },
            move |err| {
                error!("audio capture error: {}", err);
            },
            None,
        ) {
            Ok(s) => s,
            Err(e) => {
                let _ = ready_tx.send(Err(classify_build_error(e)));
                return;
            }
        };

        if let Err(e) = stream.play() {
            let _ = ready_tx.send(Err(MediaError::Backend(format!(
                "failed to start capture: {e}"
            ))));
            return;
        }

        info!("audio capture started (48kHz mono, 20ms frames)");
        let _ = ready_tx.send(Ok(()));

        // Keep the stream alive until stopped
        while running_thread.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(50));
        }

        drop(stream);
        info!("audio capture thread exiting");
    });

    match ready_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(MediaError::Backend("audio capture thread panicked".into())),
    }

    Ok((CaptureHandle { running, _thread: thread }, rx))
}

/// Send+Sync playback handle. The cpal::Stream lives on a dedicated thread.
pub struct PlaybackHandle {
    running: Arc<AtomicBool>,
    _thread: std::thread::JoinHandle<()>,
}

unsafe impl Send for PlaybackHandle {}
unsafe impl Sync for PlaybackHandle {}

impl PlaybackHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Drop for PlaybackHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

/// Start audio playback on the default output device.
/// Returns a sender that accepts f32 PCM frames for playback.
pub fn start_playback(
    _device_name: Option<&str>,
) -> Result<(PlaybackHandle, mpsc::Sender<Vec<f32>>), MediaError> {
    let (tx, rx) = mpsc::channel::<Vec<f32>>(64);
    let running = Arc::new(AtomicBool::new(true));
    let running_thread = running.clone();
    let running_callback = running.clone();

    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), MediaError>>();

    let thread = std::thread::spawn(move || {
        let host = cpal::default_host();
        let device = match host.default_output_device() {
            Some(d) => d,
            None => {
                let _ = ready_tx.send(Err(MediaError::Unavailable(
                    "no output device available".into(),
                )));
                return;
            }
        };

        let device_name = device.name().unwrap_or_else(|_| "unknown".into());
        info!("using output device: {}", device_name);

        let config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(48000),
            buffer_size: cpal::BufferSize::Default,
        };

        // Ring buffer for playback
        let ring = Arc::new(std::sync::Mutex::new(
            std::collections::VecDeque::<f32>::with_capacity(48000),
        ));
        let ring_reader = ring.clone();
        let ring_writer = ring.clone();

        // Receive frames in a background thread and push to ring buffer
        let mut rx = rx;
        std::thread::spawn(move || {
            while let Some(frame) = rx.blocking_recv() {
                let mut ring = ring_writer.lock().unwrap();
                // Limit buffer to ~100ms to avoid latency buildup
                while ring.len() > 4800 {
                    ring.pop_front();
                }
                ring.extend(frame.iter());
            }
        });

        let stream = match device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                if !running_callback.load(Ordering::Relaxed) {
                    data.fill(0.0);
                    return;
                }
                let mut ring = ring_reader.lock().unwrap();
                for sample in data.iter_mut() {
                    *sample = ring.pop_front().unwrap_or(0.0);
                }
            },
            move |err| {
                error!("audio playback error: {}", err);
            },
            None,
        ) {
            Ok(s) => s,
            Err(e) => {
                let _ = ready_tx.send(Err(classify_build_error(e)));
                return;
            }
        };

        if let Err(e) = stream.play() {
            let _ = ready_tx.send(Err(MediaError::Backend(format!(
                "failed to start playback: {e}"
            ))));
            return;
        }

        info!("audio playback started (48kHz mono)");
        let _ = ready_tx.send(Ok(()));

        while running_thread.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(50));
        }

        drop(stream);
        info!("audio playback thread exiting");
    });

    match ready_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(MediaError::Backend("audio playback thread panicked".into())),
    }

    Ok((PlaybackHandle { running, _thread: thread }, tx))
}

/// Bounded microphone readiness probe. Re-acquires a capture stream scoped
/// to the selected device and watches 100ms windows of samples; the probe
/// passes the first time a window carries non-zero average energy, and
/// resolves to an explicit timeout at the deadline instead of polling
/// forever.
///
/// Blocking; call through `spawn_blocking` from async code.
pub fn probe_microphone(device_name: Option<&str>, timeout: Duration) -> ProbeOutcome {
    const WINDOW: Duration = Duration::from_millis(100);

    let (handle, mut rx) = match start_capture(device_name) {
        Ok(pair) => pair,
        Err(e) => return ProbeOutcome::Failed(e.to_string()),
    };

    let deadline = Instant::now() + timeout;
    loop {
        let window_end = Instant::now() + WINDOW;
        let mut energy = 0.0f64;
        let mut samples = 0usize;

        while Instant::now() < window_end {
            match rx.try_recv() {
                Ok(frame) => {
                    for s in &frame {
                        energy += (s * s) as f64;
                    }
                    samples += frame.len();
                }
                Err(mpsc::error::TryRecvError::Empty) => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return ProbeOutcome::Failed("capture stream ended".into());
                }
            }
        }

        if samples > 0 && energy / samples as f64 > 0.0 {
            handle.stop();
            return ProbeOutcome::Passed;
        }

        if Instant::now() >= deadline {
            handle.stop();
            return ProbeOutcome::TimedOut;
        }
    }
}
