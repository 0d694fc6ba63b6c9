pub mod bank;
pub mod mapper;

use std::sync::Arc;

use crate::{audio::Playback, types::InferenceOutput};

pub use bank::{DECAY_FACTORS, SoundBank, SynthError, Waveform};
pub use mapper::{Hand, NoteEvent, PoseMusicMapper, Voice};

/// MIDI note number.
pub type Note = u8;

pub const PENTATONIC: [Note; 16] = [60, 62, 64, 67, 69, 72, 74, 76, 79, 81, 84, 86, 88, 91, 93, 96];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scale {
    notes: Vec<Note>,
}

impl Scale {
    pub fn new(notes: Vec<Note>) -> Result<Self, SynthError> {
        if notes.is_empty() {
            return Err(SynthError::EmptyScale);
        }
        if notes.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(SynthError::UnorderedScale);
        }
        Ok(Self { notes })
    }

    pub fn pentatonic() -> Self {
        Self {
            notes: PENTATONIC.to_vec(),
        }
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn lowest(&self) -> Note {
        self.notes[0]
    }

    pub fn highest(&self) -> Note {
        self.notes[self.notes.len() - 1]
    }

    pub fn note_for_height(&self, y: f32) -> Note {
        self.notes[mapper::note_index(y, self.notes.len())]
    }
}

impl Default for Scale {
    fn default() -> Self {
        Self::pentatonic()
    }
}

/// Owns the bank, the mapper state and the playback sink for one consumer.
pub struct Sonifier<P: Playback> {
    bank: Arc<SoundBank>,
    mapper: PoseMusicMapper,
    playback: P,
}

impl<P: Playback> Sonifier<P> {
    pub fn new(scale: Scale, bank: Arc<SoundBank>, playback: P) -> Self {
        let mapper = PoseMusicMapper::new(scale, bank.duration_classes());
        Self {
            bank,
            mapper,
            playback,
        }
    }

    /// Updates both voices from one inference result and triggers playback
    /// for every voice whose note changed. Returns the events that fired.
    pub fn handle(&mut self, output: &InferenceOutput) -> Vec<NoteEvent> {
        let events = self.mapper.process(output.keypoints());
        for event in &events {
            match self.bank.get(event.duration_class, event.note) {
                Some(wave) => {
                    log::debug!(
                        "{} hand -> note {} (duration class {})",
                        event.hand.label(),
                        event.note,
                        event.duration_class
                    );
                    self.playback.play(Arc::clone(wave));
                }
                None => log::warn!(
                    "no bank entry for note {} in duration class {}",
                    event.note,
                    event.duration_class
                ),
            }
        }
        events
    }

    pub fn mapper(&self) -> &PoseMusicMapper {
        &self.mapper
    }

    pub fn playback(&self) -> &P {
        &self.playback
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::types::{Keypoint, KeypointSet, LEFT_WRIST, NUM_KEYPOINTS};

    #[derive(Default)]
    struct Recorder {
        played: Mutex<Vec<Arc<Waveform>>>,
    }

    impl Playback for Recorder {
        fn play(&self, waveform: Arc<Waveform>) {
            self.played.lock().unwrap().push(waveform);
        }
    }

    impl Recorder {
        fn count(&self) -> usize {
            self.played.lock().unwrap().len()
        }
    }

    fn left_hand_at(y: f32, confidence: f32) -> InferenceOutput {
        let mut points = vec![Keypoint::default(); NUM_KEYPOINTS];
        points[LEFT_WRIST] = Keypoint::new(0.5, y, confidence);
        InferenceOutput::Keypoints {
            person: KeypointSet::new(points),
            detections: Vec::new(),
        }
    }

    fn sonifier() -> Sonifier<Recorder> {
        let scale = Scale::pentatonic();
        let bank = SoundBank::build(&scale, &DECAY_FACTORS, 22_050).unwrap();
        Sonifier::new(scale, Arc::new(bank), Recorder::default())
    }

    #[test]
    fn scale_rejects_empty_and_unordered() {
        assert!(matches!(Scale::new(vec![]), Err(SynthError::EmptyScale)));
        assert!(matches!(
            Scale::new(vec![60, 60, 62]),
            Err(SynthError::UnorderedScale)
        ));
        assert_eq!(Scale::default().len(), 16);
    }

    #[test]
    fn note_change_plays_matching_bank_entry() {
        let mut s = sonifier();
        s.handle(&left_hand_at(0.1, 0.9));
        s.handle(&left_hand_at(0.9, 0.9));

        let played = s.playback().played.lock().unwrap();
        assert_eq!(played.len(), 2);
        let expected = s
            .bank
            .get(mapper::DEFAULT_DURATION_CLASS, Scale::pentatonic().note_for_height(0.9))
            .unwrap();
        assert!(Arc::ptr_eq(&played[1], expected));
    }

    #[test]
    fn repeated_note_is_not_replayed() {
        let mut s = sonifier();
        s.handle(&left_hand_at(0.3, 0.9));
        s.handle(&left_hand_at(0.3, 0.9));
        assert_eq!(s.playback().count(), 1);
    }

    #[test]
    fn weak_detection_is_silent() {
        let mut s = sonifier();
        let events = s.handle(&left_hand_at(0.3, 0.4));
        assert!(events.is_empty());
        assert_eq!(s.playback().count(), 0);
        assert_eq!(s.mapper().voice(Hand::Left).last_note(), None);
    }

    #[test]
    fn non_pose_results_silence_voices() {
        let mut s = sonifier();
        s.handle(&left_hand_at(0.3, 0.9));
        s.handle(&InferenceOutput::Detections(Vec::new()));
        s.handle(&left_hand_at(0.3, 0.9));
        assert_eq!(s.playback().count(), 2);
    }
}
