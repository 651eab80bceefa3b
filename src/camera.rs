// src/camera.rs
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use egui::{ColorImage, TextureHandle, TextureOptions};
use image::{DynamicImage, RgbImage};
use log::{debug, error, info, warn};
use nokhwa::{
    pixel_format::{RgbFormat, YuyvFormat},
    utils::{
        ApiBackend, CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType,
        Resolution,
    },
    Camera, NokhwaError,
};
use serde::{Deserialize, Serialize};

use crate::{
    config::CameraConfig,
    data_url::DataUrl,
    error::{Error, Result},
};

/// Which way the camera should point. Drives device selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    #[default]
    User,
    Environment,
}

impl FacingMode {
    pub fn opposite(self) -> Self {
        match self {
            FacingMode::User => FacingMode::Environment,
            FacingMode::Environment => FacingMode::User,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub index: CameraIndex,
    pub name: String,
}

/// Outcome of handing a frame to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The UI still holds the previous frame; this one was dropped.
    Skipped,
    Disconnected,
}

/// Capture-thread end of the camera channels. Frames go through a single
/// slot so an idle UI never lets them pile up; errors are never dropped.
pub struct FrameSink {
    frames: Sender<Arc<RgbImage>>,
    errors: Sender<String>,
    ctx: egui::Context,
}

/// UI end of the camera channels.
pub struct FrameSource {
    frames: Receiver<Arc<RgbImage>>,
    errors: Receiver<String>,
}

pub fn frame_channel(ctx: egui::Context) -> (FrameSink, FrameSource) {
    let (frames_tx, frames_rx) = crossbeam_channel::bounded(1);
    let (errors_tx, errors_rx) = crossbeam_channel::unbounded();
    (
        FrameSink {
            frames: frames_tx,
            errors: errors_tx,
            ctx,
        },
        FrameSource {
            frames: frames_rx,
            errors: errors_rx,
        },
    )
}

impl FrameSink {
    pub fn frame(&self, frame: Arc<RgbImage>) -> Delivery {
        match self.frames.try_send(frame) {
            Ok(()) => {
                self.ctx.request_repaint();
                Delivery::Sent
            }
            Err(TrySendError::Full(_)) => Delivery::Skipped,
            Err(TrySendError::Disconnected(_)) => Delivery::Disconnected,
        }
    }

    pub fn error(&self, msg: String) {
        error!("{}", msg);
        let _ = self.errors.send(msg);
        self.ctx.request_repaint();
    }
}

/// What the UI picked up from the capture thread in one poll.
#[derive(Debug, Default)]
pub struct Drained {
    pub frame: Option<Arc<RgbImage>>,
    pub error: Option<String>,
    /// The capture thread has exited and everything it sent has been read.
    pub finished: bool,
}

impl FrameSource {
    pub fn drain(&self) -> Drained {
        let mut drained = Drained::default();
        loop {
            match self.errors.try_recv() {
                Ok(msg) => {
                    drained.error.get_or_insert(msg);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    drained.finished = true;
                    break;
                }
            }
        }
        drained.frame = self.frames.try_recv().ok();
        drained
    }
}

fn name_hint(name: &str) -> Option<FacingMode> {
    let name = name.to_lowercase();
    if ["back", "rear", "environment"].iter().any(|k| name.contains(k)) {
        Some(FacingMode::Environment)
    } else if ["front", "user", "face"].iter().any(|k| name.contains(k)) {
        Some(FacingMode::User)
    } else {
        None
    }
}

/// Picks a device for `facing`, never returning `exclude`.
///
/// Names win when they say which way they point; otherwise the first device
/// counts as user-facing and the last as environment-facing.
pub fn select_device(
    devices: &[DeviceInfo],
    facing: FacingMode,
    exclude: Option<&CameraIndex>,
) -> Option<CameraIndex> {
    let candidates: Vec<&DeviceInfo> = devices
        .iter()
        .filter(|d| Some(&d.index) != exclude)
        .collect();

    if let Some(d) = candidates.iter().find(|d| name_hint(&d.name) == Some(facing)) {
        return Some(d.index.clone());
    }
    let fallback = match facing {
        FacingMode::User => candidates.first(),
        FacingMode::Environment => candidates.last(),
    };
    fallback.map(|d| d.index.clone())
}

fn query_devices() -> Result<Vec<DeviceInfo>> {
    let devices = nokhwa::query(ApiBackend::Auto)?
        .into_iter()
        .map(|info| DeviceInfo {
            index: info.index().clone(),
            name: info.human_name(),
        })
        .collect::<Vec<_>>();
    debug!("Found cameras: {:?}", devices);
    Ok(devices)
}

/// A running capture thread and the device it owns.
struct ActiveStream {
    index: CameraIndex,
    source: FrameSource,
    stop_signal: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        self.stop_signal.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.join() {
                error!("Error joining camera thread: {:?}", e);
            } else {
                info!("Camera thread for {:?} joined.", self.index);
            }
        }
    }
}

/// Live preview plus still capture. The device stream lives on a background
/// thread and is released whenever the stream is stopped or the widget drops.
pub struct CameraWidget {
    ctx: egui::Context,
    config: CameraConfig,
    facing: FacingMode,
    stream: Option<ActiveStream>,
    latest_frame: Option<Arc<RgbImage>>,
    texture: Option<TextureHandle>,
}

impl CameraWidget {
    pub fn new(ctx: egui::Context, config: CameraConfig) -> Self {
        Self {
            ctx,
            facing: config.facing,
            config,
            stream: None,
            latest_frame: None,
            texture: None,
        }
    }

    pub fn facing(&self) -> FacingMode {
        self.facing
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }

    /// Opens a device for the current facing mode.
    pub fn start(&mut self) -> Result<()> {
        self.stop();
        let devices = query_devices()?;
        let index = select_device(&devices, self.facing, None)
            .ok_or_else(|| Error::Device("No camera found.".to_string()))?;
        self.spawn(index);
        Ok(())
    }

    /// Switches to a device for the opposite facing mode. With a single
    /// camera the current stream is left untouched.
    pub fn flip(&mut self) -> Result<()> {
        let devices = query_devices()?;
        let current = self.stream.as_ref().map(|s| s.index.clone());
        let target = self.facing.opposite();
        let index = select_device(&devices, target, current.as_ref())
            .filter(|_| devices.len() > 1)
            .ok_or_else(|| Error::Device("No other camera to switch to.".to_string()))?;

        info!("Flipping camera to {:?} ({:?})", target, index);
        self.stop();
        self.facing = target;
        self.spawn(index);
        Ok(())
    }

    /// Stops the capture thread and drops the last frame.
    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            info!("Camera stream stopped.");
        }
        self.latest_frame = None;
    }

    /// Encodes the most recent frame. The stream keeps running.
    pub fn capture(&self) -> Result<DataUrl> {
        let frame = self
            .latest_frame
            .as_ref()
            .ok_or_else(|| Error::Device("No frame received from camera yet.".to_string()))?;
        let image = DynamicImage::ImageRgb8(frame.as_ref().clone());
        DataUrl::encode_image(&image, self.config.capture_format)
    }

    /// Drains the capture thread. Returns the first error it reported, if any.
    pub fn poll(&mut self) -> Option<Error> {
        let drained = self.stream.as_ref()?.source.drain();

        if let Some(frame) = drained.frame {
            self.update_texture(&frame);
            self.latest_frame = Some(frame);
        }
        let mut failure = drained.error.map(Error::Device);
        if drained.finished {
            warn!("Camera thread exited.");
            self.stream = None;
            failure.get_or_insert(Error::Device("Camera stream ended unexpectedly.".to_string()));
        }
        failure
    }

    pub fn texture(&self) -> Option<&TextureHandle> {
        self.texture.as_ref()
    }

    fn update_texture(&mut self, frame: &RgbImage) {
        let size = [frame.width() as usize, frame.height() as usize];
        let color_image = ColorImage::from_rgb(size, frame.as_raw());
        match self.texture {
            Some(ref mut texture) => texture.set(color_image, TextureOptions::LINEAR),
            None => {
                info!("Creating preview texture with size: {:?}", size);
                self.texture = Some(self.ctx.load_texture(
                    "camera_preview",
                    color_image,
                    TextureOptions::LINEAR,
                ));
            }
        }
    }

    fn spawn(&mut self, index: CameraIndex) {
        let (sink, source) = frame_channel(self.ctx.clone());
        let stop_signal = Arc::new(AtomicBool::new(false));
        let handle =
            start_camera_thread(index.clone(), self.config.clone(), sink, stop_signal.clone());
        self.stream = Some(ActiveStream {
            index,
            source,
            stop_signal,
            handle: Some(handle),
        });
    }
}

pub fn start_camera_thread(
    index: CameraIndex,
    config: CameraConfig,
    sink: FrameSink,
    stop_signal: Arc<AtomicBool>,
) -> JoinHandle<()> {
    info!("Spawning camera capture thread for {:?}.", index);
    thread::spawn(move || {
        let mut camera = match open_camera(index, &config) {
            Ok(camera) => camera,
            Err(msg) => return sink.error(msg),
        };
        stream_frames(&mut camera, &sink, &stop_signal);
        // The device is released here on every path out of the loop.
        if let Err(e) = camera.stop_stream() {
            error!("Failed to stop camera stream cleanly: {}", e);
        }
        info!("Camera capture thread finished.");
    })
}

/// Opens the device with the configured YUYV format and starts its stream.
fn open_camera(index: CameraIndex, config: &CameraConfig) -> std::result::Result<Camera, String> {
    let resolution = Resolution::new(config.width, config.height);
    let wanted = CameraFormat::new(resolution, FrameFormat::YUYV, config.fps);
    let requested_format =
        RequestedFormat::new::<YuyvFormat>(RequestedFormatType::Closest(wanted));
    debug!("Requesting {:?} from {:?}", requested_format, index);

    let mut camera = Camera::new(index.clone(), requested_format)
        .or_else(|err| {
            warn!("Default backend failed: {}. Trying AVFoundation explicitly...", err);
            Camera::with_backend(index, requested_format, ApiBackend::AVFoundation)
        })
        .map_err(|err| format!("Failed to open camera: {}", err))?;
    info!("Camera opened with {:?}", camera.camera_format());

    camera
        .open_stream()
        .map_err(|err| format!("Failed to open stream: {}", err))?;
    Ok(camera)
}

fn stream_frames(camera: &mut Camera, sink: &FrameSink, stop_signal: &AtomicBool) {
    let mut skipped: u64 = 0;
    while !stop_signal.load(Ordering::Relaxed) {
        let frame = match camera.frame() {
            Ok(frame) => frame,
            Err(NokhwaError::ReadFrameError(msg)) if msg.contains("Timeout") => {
                warn!("Camera frame read timeout.");
                thread::sleep(Duration::from_millis(100));
                continue;
            }
            Err(err) => return sink.error(format!("Failed to capture frame: {}", err)),
        };
        let rgb = match frame.decode_image::<RgbFormat>() {
            Ok(rgb) => rgb,
            Err(err) => {
                warn!("Failed to decode frame to RGB: {}", err);
                thread::sleep(Duration::from_millis(50));
                continue;
            }
        };
        match sink.frame(Arc::new(rgb)) {
            Delivery::Sent => {}
            Delivery::Skipped => skipped += 1,
            Delivery::Disconnected => {
                info!("UI receiver disconnected. Stopping camera loop.");
                break;
            }
        }
    }
    debug!("Camera loop skipped {} frames the UI had no time for.", skipped);
}
