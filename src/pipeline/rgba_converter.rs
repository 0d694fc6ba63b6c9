use anyhow::{Result, anyhow};
use nokhwa::{Buffer, utils::FrameFormat};
use rayon::prelude::*;
use yuv::{
    YuvBiPlanarImage, YuvConversionMode, YuvPackedImage, YuvRange, YuvStandardMatrix,
    yuv_nv12_to_rgba, yuyv422_to_rgba,
};

use crate::{codec::FrameCodec, types::Frame};

/// Converts whatever pixel layout the driver handed us into an RGBA frame.
pub fn camera_buffer_to_frame(buffer: &Buffer) -> Result<Frame> {
    let resolution = buffer.resolution();
    let width = resolution.width_x;
    let height = resolution.height_y;
    let data = buffer.buffer();

    let rgba = match buffer.source_frame_format() {
        FrameFormat::NV12 => nv12_to_rgba(data, width, height)?,
        FrameFormat::YUYV => yuyv_to_rgba(data, width, height)?,
        // MJPEG carries its own dimensions, which win over the negotiated ones.
        FrameFormat::MJPEG => return FrameCodec::default().decode(data).map_err(Into::into),
        FrameFormat::RAWRGB => rgb_like_to_rgba(data, width, height, false)?,
        FrameFormat::RAWBGR => rgb_like_to_rgba(data, width, height, true)?,
        FrameFormat::GRAY => gray_to_rgba(data, width, height)?,
    };

    Ok(Frame::new(rgba, width, height))
}

fn nv12_to_rgba(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let y_plane_len = width as usize * height as usize;
    let uv_plane_len = y_plane_len / 2;

    if data.len() < y_plane_len + uv_plane_len {
        return Err(anyhow!(
            "NV12 buffer too small: got {}, expected {}",
            data.len(),
            y_plane_len + uv_plane_len
        ));
    }

    let mut rgba = vec![0u8; y_plane_len * 4];
    let image = YuvBiPlanarImage {
        y_plane: &data[..y_plane_len],
        y_stride: width,
        uv_plane: &data[y_plane_len..y_plane_len + uv_plane_len],
        uv_stride: width,
        width,
        height,
    };

    yuv_nv12_to_rgba(
        &image,
        &mut rgba,
        width * 4,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
        YuvConversionMode::Balanced,
    )
    .map_err(|err| anyhow!("NV12 to RGBA failed: {err:?}"))?;

    Ok(rgba)
}

fn yuyv_to_rgba(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let expected_len = width as usize * height as usize * 2;
    if data.len() < expected_len {
        return Err(anyhow!(
            "YUYV buffer too small: got {}, expected {}",
            data.len(),
            expected_len
        ));
    }

    let mut rgba = vec![0u8; Frame::expected_len(width, height)];
    let packed = YuvPackedImage {
        yuy: data,
        yuy_stride: width * 2,
        width,
        height,
    };

    yuyv422_to_rgba(
        &packed,
        &mut rgba,
        width * 4,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
    )
    .map_err(|err| anyhow!("YUYV422 to RGBA failed: {err:?}"))?;

    Ok(rgba)
}

fn rgb_like_to_rgba(data: &[u8], width: u32, height: u32, swap_rb: bool) -> Result<Vec<u8>> {
    let expected_len = width as usize * height as usize * 3;
    if data.len() < expected_len {
        return Err(anyhow!(
            "RGB buffer too small: got {}, expected {}",
            data.len(),
            expected_len
        ));
    }

    let mut rgba = vec![0u8; Frame::expected_len(width, height)];
    rgba.par_chunks_mut(4)
        .zip(data[..expected_len].par_chunks_exact(3))
        .for_each(|(dst, src)| {
            let (r, b) = if swap_rb { (src[2], src[0]) } else { (src[0], src[2]) };
            dst[0] = r;
            dst[1] = src[1];
            dst[2] = b;
            dst[3] = 255;
        });

    Ok(rgba)
}

fn gray_to_rgba(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let expected_len = width as usize * height as usize;
    if data.len() < expected_len {
        return Err(anyhow!(
            "GRAY buffer too small: got {}, expected {}",
            data.len(),
            expected_len
        ));
    }

    let mut rgba = vec![0u8; expected_len * 4];
    rgba.par_chunks_mut(4)
        .zip(data[..expected_len].par_iter().copied())
        .for_each(|(dst, value)| {
            dst[..3].fill(value);
            dst[3] = 255;
        });

    Ok(rgba)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgr_is_swapped_into_rgba() {
        let bgr = [1, 2, 3, 4, 5, 6];
        assert_eq!(
            rgb_like_to_rgba(&bgr, 2, 1, true).unwrap(),
            vec![3, 2, 1, 255, 6, 5, 4, 255]
        );
        assert_eq!(
            rgb_like_to_rgba(&bgr, 2, 1, false).unwrap(),
            vec![1, 2, 3, 255, 4, 5, 6, 255]
        );
    }

    #[test]
    fn gray_expands_to_opaque_rgba() {
        assert_eq!(
            gray_to_rgba(&[9, 200], 2, 1).unwrap(),
            vec![9, 9, 9, 255, 200, 200, 200, 255]
        );
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert!(rgb_like_to_rgba(&[0; 5], 2, 1, false).is_err());
        assert!(gray_to_rgba(&[0; 3], 2, 2).is_err());
        assert!(yuyv_to_rgba(&[0; 7], 2, 2).is_err());
        assert!(nv12_to_rgba(&[0; 5], 2, 2).is_err());
    }
}
