use std::cmp::Ordering;

use crate::types::Detection;

pub const DEFAULT_MATCH_IOU: f32 = 0.3;
pub const DEFAULT_MAX_MISSED: u32 = 30;

#[derive(Clone, Debug)]
struct Track {
    id: u32,
    detection: Detection,
    missed: u32,
}

/// Keeps ids stable across frames by greedily pairing each new box with the
/// most-overlapping live track of the same class.
#[derive(Debug)]
pub struct IouTracker {
    tracks: Vec<Track>,
    next_id: u32,
    match_iou: f32,
    max_missed: u32,
}

impl Default for IouTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_IOU, DEFAULT_MAX_MISSED)
    }
}

impl IouTracker {
    pub fn new(match_iou: f32, max_missed: u32) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            match_iou,
            max_missed,
        }
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.len()
    }

    /// Assigns `track_id` on every detection and ages out tracks that went
    /// unmatched for too long.
    pub fn update(&mut self, detections: &mut [Detection]) {
        let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
        for (t, track) in self.tracks.iter().enumerate() {
            for (d, det) in detections.iter().enumerate() {
                if track.detection.class_id != det.class_id {
                    continue;
                }
                let overlap = track.detection.iou(det);
                if overlap >= self.match_iou {
                    pairs.push((overlap, t, d));
                }
            }
        }
        pairs.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        let mut track_taken = vec![false; self.tracks.len()];
        let mut det_taken = vec![false; detections.len()];
        for (_, t, d) in pairs {
            if track_taken[t] || det_taken[d] {
                continue;
            }
            track_taken[t] = true;
            det_taken[d] = true;
            let track = &mut self.tracks[t];
            detections[d].track_id = Some(track.id);
            track.detection = detections[d].clone();
            track.missed = 0;
        }

        for (track, taken) in self.tracks.iter_mut().zip(&track_taken) {
            if !taken {
                track.missed += 1;
            }
        }
        let max_missed = self.max_missed;
        self.tracks.retain(|track| track.missed <= max_missed);

        for (det, taken) in detections.iter_mut().zip(det_taken) {
            if taken {
                continue;
            }
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1).max(1);
            det.track_id = Some(id);
            self.tracks.push(Track {
                id,
                detection: det.clone(),
                missed: 0,
            });
        }
    }
}
