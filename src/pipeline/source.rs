use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result, anyhow, bail};
use fast_image_resize as fir;
use image::ImageFormat;
use rand::{RngCore, SeedableRng, rngs::StdRng};
use walkdir::WalkDir;

#[cfg(feature = "camera-nokhwa")]
use super::camera::CameraSource;
#[cfg(feature = "video-ffmpeg")]
use super::video::{VideoSource, open_video};
use crate::types::Frame;

/// Where frames come from, as given on the command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceSpec {
    Camera(u32),
    Noise,
    Path(PathBuf),
}

impl FromStr for SourceSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            bail!("empty frame source");
        }
        if s.eq_ignore_ascii_case("noise") {
            return Ok(Self::Noise);
        }
        if s.bytes().all(|b| b.is_ascii_digit()) {
            let index = s
                .parse()
                .with_context(|| format!("camera index {s} out of range"))?;
            return Ok(Self::Camera(index));
        }
        Ok(Self::Path(PathBuf::from(s)))
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Camera(index) => write!(f, "camera {index}"),
            Self::Noise => f.write_str("noise"),
            Self::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Synthetic uniform noise, useful when no camera is around.
pub struct NoiseSource {
    width: u32,
    height: u32,
    rng: StdRng,
}

impl NoiseSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn with_seed(width: u32, height: u32, seed: u64) -> Self {
        Self {
            width,
            height,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn next_frame(&mut self) -> Frame {
        let mut rgba = vec![0u8; Frame::expected_len(self.width, self.height)];
        self.rng.fill_bytes(&mut rgba);
        for px in rgba.chunks_exact_mut(4) {
            px[3] = 255;
        }
        Frame::new(rgba, self.width, self.height)
    }
}

/// A single image or a directory of images, replayed forever.
pub struct SequenceSource {
    frames: Vec<PathBuf>,
    cursor: usize,
    width: u32,
    height: u32,
    cached: Option<Frame>,
}

impl SequenceSource {
    pub fn open(path: &Path, width: u32, height: u32) -> Result<Self> {
        if !path.exists() {
            bail!("frame source {} does not exist", path.display());
        }

        let frames = if path.is_dir() {
            WalkDir::new(path)
                .max_depth(1)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.into_path())
                .filter(|p| p.is_file() && is_supported_image(p))
                .collect()
        } else {
            vec![path.to_path_buf()]
        };

        if frames.is_empty() {
            bail!("no images found in {}", path.display());
        }

        let mut source = Self {
            frames,
            cursor: 0,
            width,
            height,
            cached: None,
        };

        // Surface unreadable input at startup rather than on the first tick.
        let first = source.load(0)?;
        log::info!(
            "image source {} ready: {} frame(s), output {}x{}",
            path.display(),
            source.frames.len(),
            width,
            height
        );
        if source.frames.len() == 1 {
            source.cached = Some(first);
        }
        Ok(source)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn load(&self, index: usize) -> Result<Frame> {
        let path = &self.frames[index];
        let image = image::open(path)
            .with_context(|| format!("failed to read image {}", path.display()))?
            .to_rgba8();
        let (w, h) = image.dimensions();
        resize_frame(Frame::new(image.into_raw(), w, h), self.width, self.height)
    }

    pub fn next_frame(&mut self) -> Result<Frame> {
        if let Some(frame) = &self.cached {
            return Ok(frame.clone());
        }

        for _ in 0..self.frames.len() {
            if self.cursor == self.frames.len() {
                self.cursor = 0;
                log::info!("end of image sequence, restarting from the first frame");
            }
            let index = self.cursor;
            self.cursor += 1;
            match self.load(index) {
                Ok(frame) => return Ok(frame),
                Err(err) => log::warn!("skipping unreadable frame: {err:?}"),
            }
        }

        Err(anyhow!("no readable images left in sequence"))
    }
}

fn is_supported_image(path: &Path) -> bool {
    ImageFormat::from_path(path).is_ok_and(|format| format.can_read())
}

/// A regular file that is not a readable image is treated as a video.
fn is_video_file(path: &Path) -> bool {
    path.is_file() && !is_supported_image(path)
}

/// Scales `frame` to exactly `width`x`height`; a no-op when it already fits.
pub fn resize_frame(frame: Frame, width: u32, height: u32) -> Result<Frame> {
    if frame.width == width && frame.height == height {
        return Ok(frame);
    }
    if width == 0 || height == 0 {
        bail!("cannot resize to {width}x{height}");
    }

    let src = fir::images::Image::from_vec_u8(
        frame.width,
        frame.height,
        frame.rgba,
        fir::PixelType::U8x4,
    )?;
    let mut dst = fir::images::Image::new(width, height, fir::PixelType::U8x4);
    let options =
        fir::ResizeOptions::new().resize_alg(fir::ResizeAlg::Interpolation(fir::FilterType::Bilinear));
    fir::Resizer::new()
        .resize(&src, &mut dst, Some(&options))
        .context("fast resize failed")?;

    Ok(Frame::new(dst.into_vec(), width, height))
}

pub enum FrameSource {
    Noise(NoiseSource),
    Sequence(SequenceSource),
    #[cfg(feature = "video-ffmpeg")]
    Video(VideoSource),
    #[cfg(feature = "camera-nokhwa")]
    Camera(CameraSource),
}

impl FrameSource {
    pub fn open(spec: &SourceSpec, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("frame size must be non-zero, got {width}x{height}");
        }
        let source = match spec {
            SourceSpec::Noise => Self::Noise(NoiseSource::new(width, height)),
            #[cfg(feature = "video-ffmpeg")]
            SourceSpec::Path(path) if is_video_file(path) => {
                Self::Video(open_video(path, width, height)?)
            }
            #[cfg(not(feature = "video-ffmpeg"))]
            SourceSpec::Path(path) if is_video_file(path) => {
                bail!(
                    "{} is not an image and video support is not compiled in (enable `video-ffmpeg`)",
                    path.display()
                )
            }
            SourceSpec::Path(path) => Self::Sequence(SequenceSource::open(path, width, height)?),
            #[cfg(feature = "camera-nokhwa")]
            SourceSpec::Camera(index) => Self::Camera(CameraSource::open(*index, width, height)?),
            #[cfg(not(feature = "camera-nokhwa"))]
            SourceSpec::Camera(index) => {
                bail!("camera {index} requested but camera support is not compiled in")
            }
        };
        log::info!("frame source: {spec}");
        Ok(source)
    }

    pub fn next_frame(&mut self) -> Result<Frame> {
        match self {
            Self::Noise(noise) => Ok(noise.next_frame()),
            Self::Sequence(sequence) => sequence.next_frame(),
            #[cfg(feature = "video-ffmpeg")]
            Self::Video(video) => video.next_frame(),
            #[cfg(feature = "camera-nokhwa")]
            Self::Camera(camera) => camera.next_frame(),
        }
    }
}
