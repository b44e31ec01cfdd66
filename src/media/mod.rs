pub mod acquire;
pub mod audio;
pub mod codec;
pub mod video;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

pub use acquire::acquire;
pub use video::VideoFrame;

/// Why local capture could not be opened. The class is surfaced for user
/// messaging; the audio-only fallback decision is made by the caller.
#[derive(Debug, Clone, Error)]
pub enum MediaError {
    #[error("capture permission denied: {0}")]
    PermissionDenied(String),
    #[error("capture device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture device busy: {0}")]
    DeviceBusy(String),
    #[error("requested capture format unsupported: {0}")]
    ConstraintsUnsatisfiable(String),
    #[error("capture unavailable in this environment: {0}")]
    InsecureContext(String),
    #[error("capture failed: {0}")]
    Unknown(String),
}

impl MediaError {
    /// Short actionable text for the UI layer.
    pub fn user_hint(&self) -> &'static str {
        match self {
            MediaError::PermissionDenied(_) => "Allow camera and microphone access, then retry.",
            MediaError::DeviceNotFound(_) => "Connect a microphone or camera, then retry.",
            MediaError::DeviceBusy(_) => "Close other apps using the camera or microphone, then retry.",
            MediaError::ConstraintsUnsatisfiable(_) => "Your device does not support the requested capture settings.",
            MediaError::InsecureContext(_) => "Capture is not available in this environment.",
            MediaError::Unknown(_) => "Could not start camera or microphone.",
        }
    }
}

/// Observer for a handle's released state, usable by tasks that outlive the
/// handle itself (e.g. cleanup of a cancelled acquisition).
#[derive(Debug, Clone)]
pub struct ReleaseProbe(Arc<AtomicBool>);

impl ReleaseProbe {
    pub fn is_released(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Exclusive owner of the opened capture and playback devices.
/// Devices stay held until `release` is called; release is idempotent.
pub struct MediaHandle {
    capture: Option<audio::CaptureHandle>,
    playback: Option<audio::PlaybackHandle>,
    camera: Option<video::CameraHandle>,
    released: Arc<AtomicBool>,
}

impl MediaHandle {
    pub fn new(
        capture: Option<audio::CaptureHandle>,
        playback: Option<audio::PlaybackHandle>,
        camera: Option<video::CameraHandle>,
    ) -> Self {
        Self {
            capture,
            playback,
            camera,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn has_video(&self) -> bool {
        self.camera.is_some()
    }

    /// Stop and drop the camera only, keeping audio devices open.
    pub fn stop_camera(&mut self) {
        if let Some(camera) = self.camera.take() {
            camera.stop();
        }
    }

    /// Attach a (re)opened camera to a live handle.
    pub fn set_camera(&mut self, camera: video::CameraHandle) {
        self.stop_camera();
        self.camera = Some(camera);
    }

    /// Stop all capture and playback. Safe to call more than once; only the
    /// first call does any work.
    pub fn release(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(playback) = self.playback.take() {
            playback.stop();
        }
        if let Some(camera) = self.camera.take() {
            camera.stop();
        }
        tracing::info!("media devices released");
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn release_probe(&self) -> ReleaseProbe {
        ReleaseProbe(self.released.clone())
    }
}

impl Drop for MediaHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Everything `acquire` hands back: the device owner plus the data ends the
/// session wires into its transport.
pub struct AcquiredMedia {
    pub handle: MediaHandle,
    /// 20 ms mono PCM frames from the microphone.
    pub capture_rx: mpsc::Receiver<Vec<f32>>,
    /// Sink for decoded remote PCM frames.
    pub playback_tx: mpsc::Sender<Vec<f32>>,
    /// JPEG camera frames; `None` on an audio-only acquisition.
    pub camera_rx: Option<mpsc::Receiver<video::VideoFrame>>,
}

impl AcquiredMedia {
    pub fn has_video(&self) -> bool {
        self.camera_rx.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_is_idempotent() {
        let mut handle = MediaHandle::new(None, None, None);
        let probe = handle.release_probe();
        assert!(!handle.is_released());
        handle.release();
        handle.release();
        assert!(handle.is_released());
        assert!(probe.is_released());
    }
}
