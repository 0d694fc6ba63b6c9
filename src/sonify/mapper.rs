use crate::types::{Keypoint, KeypointSet, LEFT_WRIST, RIGHT_WRIST};

use super::{Note, Scale};

pub const CONFIDENCE_THRESHOLD: f32 = 0.5;

/// Duration class used when the hand that picks it is out of view.
pub const DEFAULT_DURATION_CLASS: usize = 2;

/// Scale position for a normalized height. Top of frame maps to the last
/// (highest) entry, bottom of frame to the first.
pub fn note_index(y: f32, len: usize) -> usize {
    quantize(1.0 - y, len)
}

/// Duration class for a normalized height. Top of frame is the longest class.
pub fn duration_index(y: f32, classes: usize) -> usize {
    quantize(y, classes)
}

fn quantize(value: f32, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let value = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
    ((value * (len - 1) as f32) as usize).min(len - 1)
}

/// A landmark counts only when it is confidently seen and not the `(0, 0)`
/// placeholder.
pub fn is_present(kp: &Keypoint, threshold: f32) -> bool {
    kp.confidence > threshold && !kp.is_sentinel() && kp.x.is_finite() && kp.y.is_finite()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Hand {
    Left,
    Right,
}

impl Hand {
    pub const ALL: [Hand; 2] = [Hand::Left, Hand::Right];

    pub fn landmark(self) -> usize {
        match self {
            Hand::Left => LEFT_WRIST,
            Hand::Right => RIGHT_WRIST,
        }
    }

    pub fn opposite(self) -> Hand {
        match self {
            Hand::Left => Hand::Right,
            Hand::Right => Hand::Left,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Hand::Left => "left",
            Hand::Right => "right",
        }
    }
}

/// Edge-triggered note state for one hand.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Voice {
    last_note: Option<Note>,
}

impl Voice {
    pub fn last_note(&self) -> Option<Note> {
        self.last_note
    }

    /// Feeds this cycle's candidate and returns the note to sound, if it
    /// changed. `None` silences the voice.
    pub fn update(&mut self, candidate: Option<Note>) -> Option<Note> {
        let fire = match candidate {
            Some(note) if self.last_note != Some(note) => Some(note),
            _ => None,
        };
        self.last_note = candidate;
        fire
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NoteEvent {
    pub hand: Hand,
    pub note: Note,
    pub duration_class: usize,
}

/// Turns wrist heights into note events.
///
/// Each wrist drives its own voice: its height picks the pitch, and the
/// other wrist's height picks the duration class.
#[derive(Debug)]
pub struct PoseMusicMapper {
    scale: Scale,
    duration_classes: usize,
    left: Voice,
    right: Voice,
}

impl PoseMusicMapper {
    pub fn new(scale: Scale, duration_classes: usize) -> Self {
        Self {
            scale,
            duration_classes: duration_classes.max(1),
            left: Voice::default(),
            right: Voice::default(),
        }
    }

    pub fn voice(&self, hand: Hand) -> &Voice {
        match hand {
            Hand::Left => &self.left,
            Hand::Right => &self.right,
        }
    }

    fn voice_mut(&mut self, hand: Hand) -> &mut Voice {
        match hand {
            Hand::Left => &mut self.left,
            Hand::Right => &mut self.right,
        }
    }

    fn wrist<'a>(&self, keypoints: Option<&'a KeypointSet>, hand: Hand) -> Option<&'a Keypoint> {
        keypoints?
            .get(hand.landmark())
            .filter(|kp| is_present(kp, CONFIDENCE_THRESHOLD))
    }

    /// One state update per inference result. `None` means nobody was
    /// detected, which silences both voices.
    pub fn process(&mut self, keypoints: Option<&KeypointSet>) -> Vec<NoteEvent> {
        let mut events = Vec::new();

        for hand in Hand::ALL {
            let duration_class = self
                .wrist(keypoints, hand.opposite())
                .map(|kp| duration_index(kp.y, self.duration_classes))
                .unwrap_or_else(|| DEFAULT_DURATION_CLASS.min(self.duration_classes - 1));
            let candidate = self
                .wrist(keypoints, hand)
                .map(|kp| self.scale.note_for_height(kp.y));

            if let Some(note) = self.voice_mut(hand).update(candidate) {
                events.push(NoteEvent {
                    hand,
                    note,
                    duration_class,
                });
            }
        }

        events
    }
}
