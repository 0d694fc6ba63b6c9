use anyhow::{Context, Result, anyhow};
use nokhwa::{
    Camera,
    pixel_format::RgbFormat,
    utils::{CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType},
};

use super::{rgba_converter, source::resize_frame};
use crate::types::Frame;

// Prefer pixel formats that are widely supported on macOS (the built-in cameras
// often reject YUYV even though Nokhwa reports it).
const PREFERRED_PIXEL_FORMATS: &[FrameFormat] = &[
    FrameFormat::RAWRGB,
    FrameFormat::RAWBGR,
    FrameFormat::GRAY,
    FrameFormat::YUYV,
    FrameFormat::NV12,
    FrameFormat::MJPEG,
];

/// Consecutive failed reads tolerated before the camera is considered gone.
const MAX_READ_FAILURES: u32 = 30;

fn requested_formats() -> [RequestedFormat<'static>; 4] {
    [
        RequestedFormat::with_formats(
            RequestedFormatType::AbsoluteHighestFrameRate,
            PREFERRED_PIXEL_FORMATS,
        ),
        RequestedFormat::with_formats(
            RequestedFormatType::AbsoluteHighestResolution,
            PREFERRED_PIXEL_FORMATS,
        ),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::None),
    ]
}

fn build_camera(index: CameraIndex) -> Result<Camera> {
    let mut last_err = None;

    for requested in requested_formats() {
        match Camera::new(index.clone(), requested) {
            Ok(mut camera) => match camera.open_stream() {
                Ok(()) => return Ok(camera),
                Err(err) => last_err = Some(err.into()),
            },
            Err(err) => last_err = Some(err.into()),
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("failed to open camera with any supported format")))
}

/// A live capture device, stopped and released on drop.
pub struct CameraSource {
    camera: Camera,
    index: u32,
    width: u32,
    height: u32,
}

impl CameraSource {
    pub fn open(index: u32, width: u32, height: u32) -> Result<Self> {
        let camera = build_camera(CameraIndex::Index(index))
            .with_context(|| format!("failed to open camera {index}"))?;
        log::info!(
            "camera {index} streaming {} at {:?}",
            camera.info().human_name(),
            camera.resolution()
        );
        Ok(Self {
            camera,
            index,
            width,
            height,
        })
    }

    /// Reads until one frame converts cleanly; transient driver hiccups are
    /// logged and retried.
    pub fn next_frame(&mut self) -> Result<Frame> {
        for _ in 0..MAX_READ_FAILURES {
            let buffer = match self.camera.frame() {
                Ok(buffer) => buffer,
                Err(err) => {
                    log::warn!("camera frame read failed: {err:?}");
                    continue;
                }
            };
            match rgba_converter::camera_buffer_to_frame(&buffer) {
                Ok(frame) => return resize_frame(frame, self.width, self.height),
                Err(err) => log::warn!("failed to decode camera frame {err:?}"),
            }
        }
        Err(anyhow!(
            "camera {} produced no usable frame in {MAX_READ_FAILURES} attempts",
            self.index
        ))
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        if let Err(err) = self.camera.stop_stream() {
            log::warn!("failed to stop camera {}: {err:?}", self.index);
        }
        log::info!("camera {} released", self.index);
    }
}
