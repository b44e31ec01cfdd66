use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tracing::{error, info};

use super::codec::{FRAME_SAMPLES, SAMPLE_RATE};

/// Audio device info for UI device pickers.
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

    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(inputs) = host.input_devices() {
        for device in inputs {
            if let Ok(name) = device.name() {
                devices.push(AudioDevice {
                    is_default: default_input.as_deref() == Some(&name),
                    name,
                    is_input: true,
                });
            }
        }
    }
    if let Ok(outputs) = host.output_devices() {
        for device in outputs {
            if let Ok(name) = device.name() {
                devices.push(AudioDevice {
                    is_default: default_output.as_deref() == Some(&name),
                    name,
                    is_input: false,
                });
            }
        }
    }

    devices
}

/// Send+Sync capture handle. The cpal::Stream (which is !Send) lives on a
/// dedicated thread; stopping flips the shared `running` flag.
pub struct CaptureHandle {
    running: Arc<AtomicBool>,
    _thread: std::thread::JoinHandle<()>,
}

// Safety: the cpal::Stream never leaves its thread; only the AtomicBool is
// shared.
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

fn find_input_device(host: &cpal::Host, name: Option<&str>) -> Option<cpal::Device> {
    match name {
        Some(wanted) => host
            .input_devices()
            .ok()?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false)),
        None => host.default_input_device(),
    }
}

fn find_output_device(host: &cpal::Host, name: Option<&str>) -> Option<cpal::Device> {
    match name {
        Some(wanted) => host
            .output_devices()
            .ok()?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false)),
        None => host.default_output_device(),
    }
}

fn mono_config() -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    }
}

/// Start capturing from an input device (the default one if `device_name`
/// is `None`). Produces mono 48 kHz f32 PCM in 20 ms frames. The returned
/// handle must be kept alive to keep the stream open.
pub fn start_capture(
    device_name: Option<&str>,
) -> Result<(CaptureHandle, mpsc::Receiver<Vec<f32>>), String> {
    let (tx, rx) = mpsc::channel::<Vec<f32>>(64);
    let running = Arc::new(AtomicBool::new(true));
    let running_thread = running.clone();
    let running_callback = running.clone();
    let wanted = device_name.map(|s| s.to_string());

    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();

    let thread = std::thread::spawn(move || {
        let host = cpal::default_host();
        let Some(device) = find_input_device(&host, wanted.as_deref()) else {
            let _ = ready_tx.send(Err("no input device available".into()));
            return;
        };
        info!(
            "microphone: {}",
            device.name().unwrap_or_else(|_| "unknown".into())
        );

        let mut pending = Vec::with_capacity(FRAME_SAMPLES);
        let stream = match device.build_input_stream(
            &mono_config(),
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if !running_callback.load(Ordering::Relaxed) {
                    return;
                }
                pending.extend_from_slice(data);
                while pending.len() >= FRAME_SAMPLES {
                    let frame: Vec<f32> = pending.drain(..FRAME_SAMPLES).collect();
                    let _ = tx.try_send(frame);
                }
            },
            |err| error!("audio capture error: {}", err),
            None,
        ) {
            Ok(s) => s,
            Err(e) => {
                let _ = ready_tx.send(Err(format!("failed to build input stream: {}", e)));
                return;
            }
        };

        if let Err(e) = stream.play() {
            let _ = ready_tx.send(Err(format!("failed to start capture: {}", e)));
            return;
        }
        let _ = ready_tx.send(Ok(()));

        while running_thread.load(Ordering::Relaxed) {
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        drop(stream);
        info!("audio capture thread exiting");
    });

    match ready_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err("audio capture thread panicked".into()),
    }

    Ok((
        CaptureHandle {
            running,
            _thread: thread,
        },
        rx,
    ))
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

/// Start playback on an output device (the default one if `device_name` is
/// `None`). Returns a sender accepting mono f32 PCM frames.
pub fn start_playback(
    device_name: Option<&str>,
) -> Result<(PlaybackHandle, mpsc::Sender<Vec<f32>>), String> {
    let (tx, mut rx) = mpsc::channel::<Vec<f32>>(64);
    let running = Arc::new(AtomicBool::new(true));
    let running_thread = running.clone();
    let running_callback = running.clone();
    let wanted = device_name.map(|s| s.to_string());

    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();

    let thread = std::thread::spawn(move || {
        let host = cpal::default_host();
        let Some(device) = find_output_device(&host, wanted.as_deref()) else {
            let _ = ready_tx.send(Err("no output device available".into()));
            return;
        };
        info!(
            "speaker: {}",
            device.name().unwrap_or_else(|_| "unknown".into())
        );

        // Ring buffer between the frame receiver and the device callback,
        // capped at ~100 ms so latency cannot build up.
        let ring = Arc::new(std::sync::Mutex::new(
            std::collections::VecDeque::<f32>::with_capacity(SAMPLE_RATE as usize),
        ));
        let ring_reader = ring.clone();
        let ring_writer = ring.clone();
        let running_feeder = running_thread.clone();

        std::thread::spawn(move || {
            while let Some(frame) = rx.blocking_recv() {
                if !running_feeder.load(Ordering::Relaxed) {
                    break;
                }
                let mut ring = ring_writer.lock().unwrap();
                while ring.len() > SAMPLE_RATE as usize / 10 {
                    ring.pop_front();
                }
                ring.extend(frame);
            }
        });

        let stream = match device.build_output_stream(
            &mono_config(),
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
            |err| error!("audio playback error: {}", err),
            None,
        ) {
            Ok(s) => s,
            Err(e) => {
                let _ = ready_tx.send(Err(format!("failed to build output stream: {}", e)));
                return;
            }
        };

        if let Err(e) = stream.play() {
            let _ = ready_tx.send(Err(format!("failed to start playback: {}", e)));
            return;
        }
        let _ = ready_tx.send(Ok(()));

        while running_thread.load(Ordering::Relaxed) {
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        drop(stream);
        info!("audio playback thread exiting");
    });

    match ready_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err("audio playback thread panicked".into()),
    }

    Ok((
        PlaybackHandle {
            running,
            _thread: thread,
        },
        tx,
    ))
}
