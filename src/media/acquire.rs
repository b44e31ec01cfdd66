use tracing::{info, warn};

use super::{audio, video, AcquiredMedia, MediaError, MediaHandle};

/// Open local capture for a consultation: microphone and speaker always,
/// camera when `want_video` is set.
///
/// Blocking (device opening can take real time); callers run it on a
/// blocking thread. Either everything requested is acquired or nothing is
/// left open: a camera failure after audio succeeded releases the audio
/// devices before the error is returned, so the caller can retry audio-only
/// against a clean slate.
pub fn acquire(want_video: bool) -> Result<AcquiredMedia, MediaError> {
    let (capture, capture_rx) = audio::start_capture(None).map_err(|e| classify(&e))?;

    let (playback, playback_tx) = match audio::start_playback(None) {
        Ok(parts) => parts,
        Err(e) => {
            capture.stop();
            return Err(classify(&e));
        }
    };

    let (camera, camera_rx) = if want_video {
        match video::start_camera(None) {
            Ok((handle, rx)) => (Some(handle), Some(rx)),
            Err(e) => {
                capture.stop();
                playback.stop();
                return Err(classify(&e));
            }
        }
    } else {
        (None, None)
    };

    info!(video = camera.is_some(), "local media acquired");
    Ok(AcquiredMedia {
        handle: MediaHandle::new(Some(capture), Some(playback), camera),
        capture_rx,
        playback_tx,
        camera_rx,
    })
}

/// Map a device-layer error message onto the reportable failure classes.
/// cpal and nokhwa surface OS errors as strings, so this goes by the
/// phrasing the common backends use.
pub fn classify(detail: &str) -> MediaError {
    let lower = detail.to_lowercase();
    let owned = detail.to_string();

    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        MediaError::PermissionDenied(owned)
    } else if lower.contains("no input device")
        || lower.contains("no output device")
        || lower.contains("not found")
        || lower.contains("no such device")
    {
        MediaError::DeviceNotFound(owned)
    } else if lower.contains("busy") || lower.contains("in use") || lower.contains("resource") {
        MediaError::DeviceBusy(owned)
    } else if lower.contains("format")
        || lower.contains("config")
        || lower.contains("unsupported")
        || lower.contains("sample rate")
    {
        MediaError::ConstraintsUnsatisfiable(owned)
    } else if lower.contains("host unavailable") || lower.contains("backend") {
        MediaError::InsecureContext(owned)
    } else {
        warn!("unclassified capture error: {}", detail);
        MediaError::Unknown(owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_common_backend_phrasings() {
        assert!(matches!(
            classify("Access permission denied by the OS"),
            MediaError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify("no input device available"),
            MediaError::DeviceNotFound(_)
        ));
        assert!(matches!(
            classify("device busy: already in use"),
            MediaError::DeviceBusy(_)
        ));
        assert!(matches!(
            classify("unsupported stream config"),
            MediaError::ConstraintsUnsatisfiable(_)
        ));
        assert!(matches!(classify("something odd"), MediaError::Unknown(_)));
    }
}
