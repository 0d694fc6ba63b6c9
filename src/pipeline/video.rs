use anyhow::{Result, anyhow};

use crate::types::Frame;

/// A finite stream of frames that can be restarted from its first frame.
pub trait Rewind {
    /// Next frame, or `None` once the stream is exhausted.
    fn read_frame(&mut self) -> Result<Option<Frame>>;
    fn rewind(&mut self) -> Result<()>;
}

/// Replays a finite stream forever, seeking back to the start at the end.
pub struct Looping<R> {
    inner: R,
    name: String,
}

impl<R: Rewind> Looping<R> {
    pub fn new(inner: R, name: impl Into<String>) -> Self {
        Self {
            inner,
            name: name.into(),
        }
    }

    pub fn next_frame(&mut self) -> Result<Frame> {
        if let Some(frame) = self.inner.read_frame()? {
            return Ok(frame);
        }
        log::info!("end of {}, restarting from the first frame", self.name);
        self.inner.rewind()?;
        self.inner
            .read_frame()?
            .ok_or_else(|| anyhow!("{} produced no frames", self.name))
    }
}

#[cfg(feature = "video-ffmpeg")]
pub use ffmpeg_decoder::{VideoDecoder, VideoSource, open_video};

#[cfg(feature = "video-ffmpeg")]
mod ffmpeg_decoder {
    use std::path::Path;

    use anyhow::{Context, Result, anyhow};
    use ffmpeg_next as ffmpeg;
    use ffmpeg::{
        codec::decoder,
        format::{Pixel, context::Input},
        media,
        software::scaling,
        util::frame::video::Video,
    };

    use super::{Looping, Rewind};
    use crate::{pipeline::source::resize_frame, types::Frame};

    pub type VideoSource = Looping<VideoDecoder>;

    /// Decodes the best video stream of a container file to RGBA frames.
    pub struct VideoDecoder {
        input: Input,
        stream_index: usize,
        decoder: decoder::Video,
        scaler: scaling::Context,
        draining: bool,
        width: u32,
        height: u32,
    }

    impl VideoDecoder {
        pub fn open(path: &Path, width: u32, height: u32) -> Result<Self> {
            ffmpeg::init().context("failed to initialise ffmpeg")?;
            let input = ffmpeg::format::input(&path)
                .with_context(|| format!("failed to open video {}", path.display()))?;

            let (stream_index, decoder) = {
                let stream = input
                    .streams()
                    .best(media::Type::Video)
                    .ok_or_else(|| anyhow!("{} has no video stream", path.display()))?;
                let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
                    .context("failed to read codec parameters")?
                    .decoder()
                    .video()
                    .context("failed to open video decoder")?;
                (stream.index(), decoder)
            };

            let scaler = scaling::Context::get(
                decoder.format(),
                decoder.width(),
                decoder.height(),
                Pixel::RGBA,
                decoder.width(),
                decoder.height(),
                scaling::Flags::BILINEAR,
            )
            .context("failed to create RGBA scaler")?;

            log::info!(
                "video {} opened: {}x{} {:?}",
                path.display(),
                decoder.width(),
                decoder.height(),
                decoder.format()
            );

            Ok(Self {
                input,
                stream_index,
                decoder,
                scaler,
                draining: false,
                width,
                height,
            })
        }

        fn to_frame(&mut self, decoded: &Video) -> Result<Frame> {
            let mut rgba = Video::empty();
            self.scaler
                .run(decoded, &mut rgba)
                .context("failed to convert video frame to RGBA")?;

            let (w, h) = (rgba.width(), rgba.height());
            let stride = rgba.stride(0);
            let row = w as usize * 4;
            let data = rgba.data(0);
            let mut pixels = Vec::with_capacity(row * h as usize);
            for y in 0..h as usize {
                let start = y * stride;
                pixels.extend_from_slice(&data[start..start + row]);
            }
            resize_frame(Frame::new(pixels, w, h), self.width, self.height)
        }
    }

    impl Rewind for VideoDecoder {
        fn read_frame(&mut self) -> Result<Option<Frame>> {
            let mut decoded = Video::empty();
            loop {
                if self.decoder.receive_frame(&mut decoded).is_ok() {
                    return self.to_frame(&decoded).map(Some);
                }
                if self.draining {
                    return Ok(None);
                }

                let mut packet = ffmpeg::Packet::empty();
                match packet.read(&mut self.input) {
                    Ok(()) => {
                        if packet.stream() == self.stream_index {
                            self.decoder
                                .send_packet(&packet)
                                .context("failed to feed video decoder")?;
                        }
                    }
                    Err(ffmpeg::Error::Eof) => {
                        self.decoder.send_eof().context("failed to flush video decoder")?;
                        self.draining = true;
                    }
                    Err(err) => return Err(err).context("failed to read video packet"),
                }
            }
        }

        fn rewind(&mut self) -> Result<()> {
            self.input
                .seek(0, ..)
                .context("failed to seek video to the start")?;
            self.decoder.flush();
            self.draining = false;
            Ok(())
        }
    }

    /// Opens `path` as a looping source, decoding one frame up front so a
    /// broken file fails at startup.
    pub fn open_video(path: &Path, width: u32, height: u32) -> Result<VideoSource> {
        let mut decoder = VideoDecoder::open(path, width, height)?;
        decoder
            .read_frame()?
            .ok_or_else(|| anyhow!("{} contains no decodable frames", path.display()))?;
        decoder.rewind()?;
        Ok(Looping::new(decoder, format!("video {}", path.display())))
    }
}
