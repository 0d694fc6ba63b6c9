use image::{ExtendedColorType, codecs::jpeg::JpegEncoder};
use rayon::prelude::*;
use zune_jpeg::{
    JpegDecoder,
    zune_core::{bytestream::ZCursor, colorspace::ColorSpace, options::DecoderOptions},
};

use crate::types::Frame;

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame buffer size mismatch: got {got}, expected {expected}")]
    BufferSize { got: usize, expected: usize },
    #[error("jpeg encode failed: {0}")]
    Encode(#[from] image::ImageError),
    #[error("jpeg decode failed: {0}")]
    Decode(String),
}

#[derive(Clone, Copy, Debug)]
pub struct FrameCodec {
    quality: u8,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl FrameCodec {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>, CodecError> {
        let expected = Frame::expected_len(frame.width, frame.height);
        if frame.rgba.len() != expected {
            return Err(CodecError::BufferSize {
                got: frame.rgba.len(),
                expected,
            });
        }

        let rgb: Vec<u8> = frame
            .rgba
            .par_chunks_exact(4)
            .flat_map_iter(|px| [px[0], px[1], px[2]])
            .collect();

        let mut out = Vec::with_capacity(expected / 8);
        let mut encoder = JpegEncoder::new_with_quality(&mut out, self.quality);
        encoder.encode(&rgb, frame.width, frame.height, ExtendedColorType::Rgb8)?;
        Ok(out)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Frame, CodecError> {
        if bytes.is_empty() {
            return Err(CodecError::Decode("empty message".into()));
        }

        let options = DecoderOptions::default().jpeg_set_out_colorspace(ColorSpace::RGBA);
        let mut decoder = JpegDecoder::new_with_options(ZCursor::new(bytes), options);
        let rgba = decoder
            .decode()
            .map_err(|err| CodecError::Decode(format!("{err:?}")))?;

        let info = decoder
            .info()
            .ok_or_else(|| CodecError::Decode("decoder reported no image info".into()))?;
        let width = u32::from(info.width);
        let height = u32::from(info.height);

        let expected = Frame::expected_len(width, height);
        if rgba.len() < expected {
            return Err(CodecError::Decode(format!(
                "decode produced too few bytes: got {}, expected {expected}",
                rgba.len()
            )));
        }

        let mut rgba = rgba;
        rgba.truncate(expected);
        Ok(Frame::new(rgba, width, height))
    }
}
