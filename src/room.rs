use std::time::Duration;
use tracing::info;

use crate::media::audio::{self, AudioDevice};
use crate::media::video::{self, CameraDevice, VideoFrame};
use crate::media::ProbeOutcome;

/// Pre-call readiness room: device enumeration, camera and microphone
/// checks, and the join gate. Lives entirely on the local side; nothing
/// here touches the wire.
pub struct ReadinessRoom {
    probe_timeout: Duration,
    pub selected_camera: Option<u32>,
    pub selected_microphone: Option<String>,
    camera_check: Option<ProbeOutcome>,
    microphone_check: Option<ProbeOutcome>,
}

impl ReadinessRoom {
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            probe_timeout,
            selected_camera: None,
            selected_microphone: None,
            camera_check: None,
            microphone_check: None,
        }
    }

    pub fn list_cameras(&self) -> Vec<CameraDevice> {
        video::list_cameras()
    }

    pub fn list_audio_devices(&self) -> Vec<AudioDevice> {
        audio::list_devices()
    }

    /// Changing the selected camera invalidates its previous check result.
    pub fn select_camera(&mut self, index: Option<u32>) {
        if self.selected_camera != index {
            self.selected_camera = index;
            self.camera_check = None;
        }
    }

    pub fn select_microphone(&mut self, name: Option<String>) {
        if self.selected_microphone != name {
            self.selected_microphone = name;
            self.microphone_check = None;
        }
    }

    /// Run the camera check against the selected device. Returns the first
    /// captured frame as a preview when the check passes.
    pub async fn test_camera(&mut self) -> (ProbeOutcome, Option<VideoFrame>) {
        let index = self.selected_camera;
        let timeout = self.probe_timeout;
        let (outcome, preview) =
            tokio::task::spawn_blocking(move || video::probe_camera(index, timeout))
                .await
                .unwrap_or_else(|e| (ProbeOutcome::Failed(format!("camera check panicked: {e}")), None));
        info!("camera check: {:?}", outcome);
        self.camera_check = Some(outcome.clone());
        (outcome, preview)
    }

    /// Run the microphone check against the selected device.
    pub async fn test_microphone(&mut self) -> ProbeOutcome {
        let name = self.selected_microphone.clone();
        let timeout = self.probe_timeout;
        let outcome =
            tokio::task::spawn_blocking(move || audio::probe_microphone(name.as_deref(), timeout))
                .await
                .unwrap_or_else(|e| ProbeOutcome::Failed(format!("microphone check panicked: {e}")));
        info!("microphone check: {:?}", outcome);
        self.microphone_check = Some(outcome.clone());
        outcome
    }

    pub fn camera_check(&self) -> Option<&ProbeOutcome> {
        self.camera_check.as_ref()
    }

    pub fn microphone_check(&self) -> Option<&ProbeOutcome> {
        self.microphone_check.as_ref()
    }

    /// Joining is blocked only when both checks ran and both failed. A
    /// device that was never tested does not count against joining, and one
    /// working device is enough for a degraded call.
    pub fn can_join(&self) -> bool {
        let camera_failed = matches!(
            self.camera_check,
            Some(ProbeOutcome::TimedOut) | Some(ProbeOutcome::Failed(_))
        );
        let microphone_failed = matches!(
            self.microphone_check,
            Some(ProbeOutcome::TimedOut) | Some(ProbeOutcome::Failed(_))
        );
        !(camera_failed && microphone_failed)
    }
}
