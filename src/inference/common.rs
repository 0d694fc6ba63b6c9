use std::cmp::Ordering;

use anyhow::{Context, Result, anyhow, bail};
use fast_image_resize as fir;
use ndarray::{Array4, ArrayView2};
use rayon::prelude::*;

use crate::types::{ClassScore, Detection, Frame, Keypoint, KeypointSet, NUM_KEYPOINTS};

pub const DETECT_INPUT_SIZE: u32 = 640;
pub const CLASSIFY_INPUT_SIZE: u32 = 224;
pub const TOP_K_CLASSES: usize = 5;

const PAD_VALUE: u8 = 114;
const BOX_ROWS: usize = 4;
const MASK_COEFFICIENTS: usize = 32;
const KEYPOINT_ROWS: usize = NUM_KEYPOINTS * 3;

/// Thresholds applied when turning raw head output into detections.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DecodeConfig {
    pub confidence: f32,
    pub iou: f32,
    pub max_detections: usize,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            confidence: 0.25,
            iou: 0.7,
            max_detections: 300,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LetterboxInfo {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub orig_w: u32,
    pub orig_h: u32,
}

impl LetterboxInfo {
    /// Maps a point in model input pixels back to `[0, 1]` of the source frame.
    pub fn normalize(&self, x: f32, y: f32) -> (f32, f32) {
        let px = (x - self.pad_x) / self.scale;
        let py = (y - self.pad_y) / self.scale;
        (
            (px / self.orig_w.max(1) as f32).clamp(0.0, 1.0),
            (py / self.orig_h.max(1) as f32).clamp(0.0, 1.0),
        )
    }

    fn normalize_box(&self, cx: f32, cy: f32, w: f32, h: f32) -> [f32; 4] {
        let (x1, y1) = self.normalize(cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = self.normalize(cx + w / 2.0, cy + h / 2.0);
        [x1, y1, x2, y2]
    }
}

/// Resizes `frame` into a `target_size` square, keeping aspect ratio and
/// padding with grey, and lays it out as a `[1, 3, H, W]` tensor in `0..1`.
pub fn prepare_letterbox(frame: &Frame, target_size: u32) -> Result<(Array4<f32>, LetterboxInfo)> {
    let expected_len = Frame::expected_len(frame.width, frame.height);
    if frame.rgba.len() != expected_len || expected_len == 0 {
        return Err(anyhow!(
            "frame buffer size mismatch: got {}, expected {}",
            frame.rgba.len(),
            expected_len
        ));
    }

    let scale = target_size as f32 / (frame.width.max(frame.height) as f32);
    let new_w = ((frame.width as f32 * scale).round() as u32).clamp(1, target_size);
    let new_h = ((frame.height as f32 * scale).round() as u32).clamp(1, target_size);

    let src_image = fir::images::Image::from_vec_u8(
        frame.width,
        frame.height,
        frame.rgba.clone(),
        fir::PixelType::U8x4,
    )?;
    let mut dst_image = fir::images::Image::new(new_w, new_h, fir::PixelType::U8x4);
    let mut resizer = fir::Resizer::new();
    let resize_options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Interpolation(fir::FilterType::Bilinear));
    resizer
        .resize(&src_image, &mut dst_image, Some(&resize_options))
        .context("fast resize failed")?;
    let resized = dst_image.into_vec();

    let side = target_size as usize;
    let pad_x = (side - new_w as usize) / 2;
    let pad_y = (side - new_h as usize) / 2;
    let mut canvas = vec![PAD_VALUE; side * side * 4];
    let dst_stride = side * 4;
    let src_stride = new_w as usize * 4;
    for row in 0..(new_h as usize) {
        let dst_offset = (pad_y + row) * dst_stride + pad_x * 4;
        let src_offset = row * src_stride;
        canvas[dst_offset..dst_offset + src_stride]
            .copy_from_slice(&resized[src_offset..src_offset + src_stride]);
    }

    let plane = side * side;
    let mut planar = vec![0f32; plane * 3];
    let (red, rest) = planar.split_at_mut(plane);
    let (green, blue) = rest.split_at_mut(plane);
    red.par_iter_mut()
        .zip(green.par_iter_mut())
        .zip(blue.par_iter_mut())
        .zip(canvas.par_chunks_exact(4))
        .for_each(|(((r, g), b), px)| {
            *r = px[0] as f32 / 255.0;
            *g = px[1] as f32 / 255.0;
            *b = px[2] as f32 / 255.0;
        });

    let input = Array4::<f32>::from_shape_vec((1, 3, side, side), planar)
        .map_err(|err| anyhow!("failed to build input tensor: {err}"))?;

    let letterbox = LetterboxInfo {
        scale,
        pad_x: pad_x as f32,
        pad_y: pad_y as f32,
        orig_w: frame.width,
        orig_h: frame.height,
    };

    Ok((input, letterbox))
}

/// Puts a head output into `[features, anchors]` order. Exports differ on
/// which axis comes first; anchors always outnumber features.
pub fn features_first(output: ArrayView2<'_, f32>) -> ArrayView2<'_, f32> {
    if output.nrows() > output.ncols() {
        output.reversed_axes()
    } else {
        output
    }
}

/// Best class per anchor for detect heads (`4 + classes` rows) and segment
/// heads (`4 + classes + 32` rows, mask coefficients ignored).
pub fn decode_boxes(
    output: ArrayView2<'_, f32>,
    mask_rows: bool,
    letterbox: &LetterboxInfo,
    cfg: &DecodeConfig,
) -> Result<Vec<Detection>> {
    let output = features_first(output);
    let extra = if mask_rows { MASK_COEFFICIENTS } else { 0 };
    let rows = output.nrows();
    if rows <= BOX_ROWS + extra {
        bail!("head output has {rows} rows, too few for boxes and class scores");
    }
    let classes = rows - BOX_ROWS - extra;

    let mut candidates = Vec::new();
    for anchor in output.columns() {
        let (class_id, score) = (0..classes)
            .map(|c| (c, anchor[BOX_ROWS + c]))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
            .unwrap_or((0, 0.0));
        if score.is_nan() || score <= cfg.confidence {
            continue;
        }
        candidates.push(Detection {
            bbox: letterbox.normalize_box(anchor[0], anchor[1], anchor[2], anchor[3]),
            score,
            class_id,
            track_id: None,
        });
    }

    let keep = nms(&candidates, cfg.iou, cfg.max_detections);
    Ok(keep.into_iter().map(|i| candidates[i].clone()).collect())
}

/// Person boxes with 17 landmarks each, highest score first.
pub fn decode_pose(
    output: ArrayView2<'_, f32>,
    letterbox: &LetterboxInfo,
    cfg: &DecodeConfig,
) -> Result<Vec<(Detection, KeypointSet)>> {
    let output = features_first(output);
    let rows = output.nrows();
    if rows < BOX_ROWS + 1 + KEYPOINT_ROWS {
        bail!("pose head output has {rows} rows, expected at least {}", BOX_ROWS + 1 + KEYPOINT_ROWS);
    }
    let classes = rows - BOX_ROWS - KEYPOINT_ROWS;
    let kp_offset = BOX_ROWS + classes;

    let mut candidates = Vec::new();
    let mut landmarks = Vec::new();
    for anchor in output.columns() {
        let score = (0..classes)
            .map(|c| anchor[BOX_ROWS + c])
            .fold(f32::MIN, f32::max);
        if score.is_nan() || score <= cfg.confidence {
            continue;
        }
        candidates.push(Detection {
            bbox: letterbox.normalize_box(anchor[0], anchor[1], anchor[2], anchor[3]),
            score,
            class_id: 0,
            track_id: None,
        });
        let points = (0..NUM_KEYPOINTS)
            .map(|k| {
                let base = kp_offset + k * 3;
                let (x, y) = letterbox.normalize(anchor[base], anchor[base + 1]);
                Keypoint::new(x, y, anchor[base + 2])
            })
            .collect();
        landmarks.push(KeypointSet::new(points));
    }

    let keep = nms(&candidates, cfg.iou, cfg.max_detections);
    Ok(keep
        .into_iter()
        .map(|i| (candidates[i].clone(), landmarks[i].clone()))
        .collect())
}

/// Highest `k` class scores from a classification head.
pub fn top_classes(scores: &[f32], k: usize) -> Vec<ClassScore> {
    let mut ranked: Vec<ClassScore> = scores
        .iter()
        .enumerate()
        .map(|(class_id, &score)| ClassScore { class_id, score })
        .collect();
    ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    ranked.truncate(k);
    ranked
}

/// Class-aware greedy NMS. Returns kept indices, best score first.
pub fn nms(candidates: &[Detection], threshold: f32, top_k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|a, b| {
        candidates[*b]
            .score
            .partial_cmp(&candidates[*a].score)
            .unwrap_or(Ordering::Equal)
    });

    let mut keep: Vec<usize> = Vec::new();
    'outer: for &idx in &order {
        for &k in &keep {
            if candidates[idx].class_id == candidates[k].class_id
                && candidates[idx].iou(&candidates[k]) > threshold
            {
                continue 'outer;
            }
        }
        keep.push(idx);
        if keep.len() >= top_k {
            break;
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;

    use super::*;

    fn identity_letterbox(side: u32) -> LetterboxInfo {
        LetterboxInfo {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
            orig_w: side,
            orig_h: side,
        }
    }

    fn det(bbox: [f32; 4], score: f32, class_id: usize) -> Detection {
        Detection {
            bbox,
            score,
            class_id,
            track_id: None,
        }
    }

    #[test]
    fn letterbox_pads_short_side() {
        let frame = Frame::new(vec![255; 64 * 32 * 4], 64, 32);
        let (input, info) = prepare_letterbox(&frame, 32).unwrap();
        assert_eq!(input.shape(), &[1, 3, 32, 32]);
        assert_eq!(info.scale, 0.5);
        assert_eq!(info.pad_y, 8.0);

        let pad = PAD_VALUE as f32 / 255.0;
        assert!((input[[0, 0, 0, 0]] - pad).abs() < 1e-6);
        assert!(input[[0, 2, 16, 16]] > 0.99);
    }

    #[test]
    fn letterbox_rejects_bad_buffers() {
        let frame = Frame::new(vec![0; 10], 4, 4);
        assert!(prepare_letterbox(&frame, 32).is_err());
    }

    #[test]
    fn normalize_undoes_letterbox() {
        let info = LetterboxInfo {
            scale: 0.5,
            pad_x: 0.0,
            pad_y: 80.0,
            orig_w: 1280,
            orig_h: 960,
        };
        let (x, y) = info.normalize(160.0, 80.0 + 240.0);
        assert!((x - 0.25).abs() < 1e-6);
        assert!((y - 0.5).abs() < 1e-6);
        assert_eq!(info.normalize(-50.0, 5000.0), (0.0, 1.0));
    }

    /// Lays `anchors` out as columns of a `[features, anchors]` head, padded
    /// with empty anchors so anchors outnumber features as in real exports.
    fn head(anchors: &[Vec<f32>]) -> Array2<f32> {
        let rows = anchors[0].len();
        let mut out = Array2::zeros((rows, rows + 1));
        for (j, anchor) in anchors.iter().enumerate() {
            for (i, value) in anchor.iter().enumerate() {
                out[[i, j]] = *value;
            }
        }
        out
    }

    #[test]
    fn detect_head_keeps_confident_anchors() {
        // cx, cy, w, h, class0, class1
        let output = head(&[
            vec![50.0, 50.0, 20.0, 20.0, 0.9, 0.05],
            vec![50.0, 50.0, 20.0, 20.0, 0.1, 0.8],
            vec![20.0, 80.0, 10.0, 10.0, 0.05, 0.1],
        ]);

        let dets = decode_boxes(output.view(), false, &identity_letterbox(100), &DecodeConfig::default())
            .unwrap();
        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].class_id, 0);
        assert!((dets[0].score - 0.9).abs() < 1e-6);
        assert_eq!(dets[0].bbox, [0.4, 0.4, 0.6, 0.6]);
        assert_eq!(dets[1].class_id, 1);
    }

    #[test]
    fn transposed_output_is_accepted() {
        let output = head(&[vec![50.0, 50.0, 10.0, 10.0, 0.9]]);
        let dets = decode_boxes(output.t(), false, &identity_letterbox(100), &DecodeConfig::default())
            .unwrap();
        assert_eq!(dets.len(), 1);
    }

    #[test]
    fn segment_head_ignores_mask_rows() {
        let mut anchor = vec![50.0, 50.0, 10.0, 10.0, 0.7];
        anchor.extend(std::iter::repeat_n(5.0, MASK_COEFFICIENTS));
        let output = head(&[anchor]);
        let dets = decode_boxes(output.view(), true, &identity_letterbox(100), &DecodeConfig::default())
            .unwrap();
        assert_eq!(dets.len(), 1);
        assert!((dets[0].score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn pose_head_yields_normalized_landmarks() {
        let mut anchor = vec![50.0, 50.0, 40.0, 80.0, 0.95];
        for k in 0..NUM_KEYPOINTS {
            anchor.extend([k as f32 * 5.0, 25.0, 0.9]);
        }
        let mut weak = anchor.clone();
        weak[4] = 0.1;
        let output = head(&[anchor, weak]);

        let people = decode_pose(output.view(), &identity_letterbox(100), &DecodeConfig::default())
            .unwrap();
        assert_eq!(people.len(), 1);
        let (person, keypoints) = &people[0];
        assert!((person.score - 0.95).abs() < 1e-6);
        assert_eq!(keypoints.len(), NUM_KEYPOINTS);
        let wrist = keypoints.get(9).unwrap();
        assert!((wrist.x - 0.45).abs() < 1e-6);
        assert!((wrist.y - 0.25).abs() < 1e-6);
    }

    #[test]
    fn pose_head_with_too_few_rows_is_an_error() {
        let output = Array2::<f32>::zeros((10, 3));
        assert!(decode_pose(output.view(), &identity_letterbox(100), &DecodeConfig::default()).is_err());
    }

    #[test]
    fn nms_suppresses_same_class_overlap_only() {
        let candidates = vec![
            det([0.1, 0.1, 0.5, 0.5], 0.9, 0),
            det([0.12, 0.12, 0.5, 0.5], 0.8, 0),
            det([0.12, 0.12, 0.5, 0.5], 0.7, 1),
            det([0.6, 0.6, 0.9, 0.9], 0.6, 0),
        ];
        assert_eq!(nms(&candidates, 0.7, 10), vec![0, 2, 3]);
        assert_eq!(nms(&candidates, 0.7, 2), vec![0, 2]);
    }

    #[test]
    fn top_classes_are_sorted() {
        let scores = [0.1, 0.5, 0.05, 0.3, 0.02, 0.03];
        let top = top_classes(&scores, 3);
        let ids: Vec<usize> = top.iter().map(|c| c.class_id).collect();
        assert_eq!(ids, vec![1, 3, 0]);
    }
}
