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
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const CAPTURE_WIDTH: u32 = 640;
const CAPTURE_HEIGHT: u32 = 480;
const CAPTURE_FPS: u32 = 15;

/// Camera device info for UI device pickers.
#[derive(Debug, Clone, Serialize)]
pub struct CameraDevice {
    pub index: u32,
    pub name: String,
    pub is_default: bool,
}

/// A single JPEG-encoded video frame.
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

/// Open a camera and start producing JPEG frames at 640x480, ~15 fps.
/// The frame channel closes when the camera stops or fails, which is how
/// the session notices local video loss.
pub fn start_camera(
    device_index: Option<u32>,
) -> Result<(CameraHandle, mpsc::Receiver<VideoFrame>), String> {
    let (tx, rx) = mpsc::channel::<VideoFrame>(16);
    let running = Arc::new(AtomicBool::new(true));
    let running_thread = running.clone();

    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();

    let thread = std::thread::spawn(move || {
        let index = CameraIndex::Index(device_index.unwrap_or(0));
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
            CameraFormat::new(
                Resolution::new(CAPTURE_WIDTH, CAPTURE_HEIGHT),
                FrameFormat::MJPEG,
                CAPTURE_FPS,
            ),
        ));

        let mut camera = match Camera::new(index, requested) {
            Ok(c) => c,
            Err(e) => {
                let _ = ready_tx.send(Err(format!("failed to open camera: {}", e)));
                return;
            }
        };
        if let Err(e) = camera.open_stream() {
            let _ = ready_tx.send(Err(format!("failed to open camera stream: {}", e)));
            return;
        }

        info!(
            "camera started: {} ({}x{})",
            camera.info().human_name(),
            CAPTURE_WIDTH,
            CAPTURE_HEIGHT
        );
        let _ = ready_tx.send(Ok(()));

        while running_thread.load(Ordering::Relaxed) {
            match camera.frame() {
                Ok(frame) => {
                    let resolution = frame.resolution();
                    match frame.decode_image::<RgbFormat>() {
                        Ok(rgb) => {
                            let mut jpeg = Vec::new();
                            let mut cursor = std::io::Cursor::new(&mut jpeg);
                            if let Err(e) = rgb.write_to(&mut cursor, image::ImageFormat::Jpeg) {
                                error!("jpeg encode failed: {}", e);
                                continue;
                            }
                            let _ = tx.try_send(VideoFrame {
                                jpeg_data: jpeg,
                                width: resolution.width(),
                                height: resolution.height(),
                            });
                        }
                        Err(e) => error!("camera frame decode failed: {}", e),
                    }
                }
                Err(e) => {
                    if running_thread.load(Ordering::Relaxed) {
                        error!("camera frame error: {}", e);
                    }
                    break;
                }
            }
            std::thread::sleep(std::time::Duration::from_millis(1000 / CAPTURE_FPS as u64));
        }

        drop(camera);
        info!("camera capture thread exiting");
    });

    match ready_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err("camera thread panicked".into()),
    }

    Ok((
        CameraHandle {
            running,
            _thread: thread,
        },
        rx,
    ))
}
