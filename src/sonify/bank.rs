use std::{collections::HashMap, f32::consts::TAU, sync::Arc};

use rayon::prelude::*;

use super::{Note, Scale};

pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;
pub const BUFFER_SECONDS: f32 = 2.0;
pub const CHANNELS: usize = 2;

/// Half of full scale, so overlapping voices have room before clipping.
pub const PEAK_AMPLITUDE: f32 = (i16::MAX / 2) as f32;

/// Harmonic multiple and its relative amplitude.
const HARMONICS: [(f32, f32); 5] = [(1.0, 1.0), (2.0, 0.5), (3.0, 0.25), (4.0, 0.125), (5.0, 0.06)];

/// Decay coefficients per duration class; higher decays faster.
pub const DECAY_FACTORS: [f32; 5] = [1.0, 3.0, 5.0, 8.0, 15.0];

#[derive(Debug, thiserror::Error)]
pub enum SynthError {
    #[error("scale is empty")]
    EmptyScale,
    #[error("scale must be strictly ascending")]
    UnorderedScale,
    #[error("no duration classes configured")]
    NoDurationClasses,
    #[error("decay factor {0} must be finite and positive")]
    InvalidDecay(f32),
    #[error("sample rate must be non-zero")]
    InvalidSampleRate,
    #[error("note {note} is outside the MIDI range")]
    InvalidNote { note: Note },
    #[error("note {note} at {freq_hz:.1} Hz is above the {nyquist_hz:.1} Hz Nyquist limit")]
    AboveNyquist {
        note: Note,
        freq_hz: f32,
        nyquist_hz: f32,
    },
}

/// Equal-tempered frequency of a MIDI note, A4 = 440 Hz at note 69.
pub fn note_frequency(note: Note) -> f32 {
    440.0 * 2f32.powf((note as f32 - 69.0) / 12.0)
}

/// Interleaved stereo, 16-bit, immutable once built.
#[derive(Debug, PartialEq)]
pub struct Waveform {
    samples: Vec<i16>,
    sample_rate: u32,
}

impl Waveform {
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> usize {
        CHANNELS
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / CHANNELS
    }

    pub fn peak(&self) -> i16 {
        self.samples
            .iter()
            .map(|s| s.saturating_abs())
            .max()
            .unwrap_or(0)
    }

    /// Left and right samples at `frame`.
    pub fn frame(&self, frame: usize) -> Option<[i16; CHANNELS]> {
        let start = frame.checked_mul(CHANNELS)?;
        let slice = self.samples.get(start..start + CHANNELS)?;
        Some([slice[0], slice[1]])
    }
}

/// Every `(duration class, note)` timbre, synthesized up front.
#[derive(Debug)]
pub struct SoundBank {
    entries: HashMap<(usize, Note), Arc<Waveform>>,
    duration_classes: usize,
    sample_rate: u32,
}

impl SoundBank {
    pub fn build(scale: &Scale, decay_factors: &[f32], sample_rate: u32) -> Result<Self, SynthError> {
        if decay_factors.is_empty() {
            return Err(SynthError::NoDurationClasses);
        }
        if sample_rate == 0 {
            return Err(SynthError::InvalidSampleRate);
        }
        if let Some(&bad) = decay_factors
            .iter()
            .find(|d| !d.is_finite() || **d <= 0.0)
        {
            return Err(SynthError::InvalidDecay(bad));
        }
        for &note in scale.notes() {
            validate_note(note, sample_rate)?;
        }

        let jobs: Vec<(usize, f32, Note)> = decay_factors
            .iter()
            .enumerate()
            .flat_map(|(class, &decay)| scale.notes().iter().map(move |&note| (class, decay, note)))
            .collect();

        let entries = jobs
            .into_par_iter()
            .map(|(class, decay, note)| {
                let wave = synthesize(note, decay, sample_rate);
                ((class, note), Arc::new(wave))
            })
            .collect::<HashMap<_, _>>();

        log::info!(
            "sound bank ready: {} duration classes x {} notes at {} Hz",
            decay_factors.len(),
            scale.len(),
            sample_rate
        );

        Ok(Self {
            entries,
            duration_classes: decay_factors.len(),
            sample_rate,
        })
    }

    pub fn get(&self, duration_class: usize, note: Note) -> Option<&Arc<Waveform>> {
        self.entries.get(&(duration_class, note))
    }

    pub fn duration_classes(&self) -> usize {
        self.duration_classes
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn validate_note(note: Note, sample_rate: u32) -> Result<(), SynthError> {
    if note > 127 {
        return Err(SynthError::InvalidNote { note });
    }
    let nyquist_hz = nyquist(sample_rate);
    let freq_hz = note_frequency(note);
    if freq_hz >= nyquist_hz {
        return Err(SynthError::AboveNyquist {
            note,
            freq_hz,
            nyquist_hz,
        });
    }
    Ok(())
}

fn nyquist(sample_rate: u32) -> f32 {
    sample_rate as f32 / 2.0
}

/// Partials of `freq` that the sample rate can represent. Upper harmonics of
/// high notes are left out on low-rate devices.
fn audible_harmonics(freq: f32, sample_rate: u32) -> Vec<(f32, f32)> {
    let limit = nyquist(sample_rate);
    HARMONICS
        .iter()
        .copied()
        .filter(|&(multiple, _)| freq * multiple < limit)
        .collect()
}

fn synthesize(note: Note, decay: f32, sample_rate: u32) -> Waveform {
    let frames = (sample_rate as f32 * BUFFER_SECONDS) as usize;
    let freq = note_frequency(note);
    let step = 1.0 / sample_rate as f32;
    let partials = audible_harmonics(freq, sample_rate);

    let tone: Vec<f32> = (0..frames)
        .map(|i| {
            let t = i as f32 * step;
            partials
                .iter()
                .map(|&(multiple, amp)| amp * (TAU * freq * multiple * t).sin())
                .sum()
        })
        .collect();

    let peak = tone.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
    let norm = if peak > 0.0 { 1.0 / peak } else { 0.0 };

    let mut samples = Vec::with_capacity(frames * CHANNELS);
    for (i, s) in tone.iter().enumerate() {
        let t = i as f32 * step;
        let value = (s * norm * (-decay * t).exp() * PEAK_AMPLITUDE) as i16;
        samples.extend_from_slice(&[value; CHANNELS]);
    }

    Waveform {
        samples,
        sample_rate,
    }
}
