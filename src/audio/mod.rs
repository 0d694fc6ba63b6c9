#[cfg(feature = "audio-cpal")]
mod device;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::sonify::Waveform;

/// Voices mixed at once; the oldest is cut when a new one arrives.
pub const MAX_ACTIVE_VOICES: usize = 32;
const QUEUE_DEPTH: usize = 64;

pub trait Playback {
    /// Starts playing `waveform` and returns immediately.
    fn play(&self, waveform: Arc<Waveform>);
}

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("no default audio output device")]
    NoDevice,
    #[error("failed to query output config: {0}")]
    Config(String),
    #[error("unsupported sample format {0}")]
    UnsupportedFormat(String),
    #[error("audio stream failed: {0}")]
    Stream(String),
    #[error("built without audio output support")]
    Unavailable,
}

struct ActiveVoice {
    wave: Arc<Waveform>,
    cursor: usize,
}

/// Sums queued waveforms into stereo frames.
pub struct Mixer {
    incoming: Receiver<Arc<Waveform>>,
    active: Vec<ActiveVoice>,
    max_voices: usize,
}

impl Mixer {
    pub fn new(incoming: Receiver<Arc<Waveform>>, max_voices: usize) -> Self {
        Self {
            incoming,
            active: Vec::with_capacity(max_voices),
            max_voices: max_voices.max(1),
        }
    }

    pub fn active_voices(&self) -> usize {
        self.active.len()
    }

    /// Drops finished voices and admits newly queued ones. Called once per
    /// device buffer.
    pub fn pull_pending(&mut self) {
        self.active.retain(|v| v.cursor < v.wave.frames());
        while let Ok(wave) = self.incoming.try_recv() {
            if self.active.len() >= self.max_voices {
                self.active.remove(0);
            }
            self.active.push(ActiveVoice { wave, cursor: 0 });
        }
    }

    pub fn next_frame(&mut self) -> [i16; 2] {
        let mut left: i32 = 0;
        let mut right: i32 = 0;
        for voice in &mut self.active {
            if let Some([l, r]) = voice.wave.frame(voice.cursor) {
                left += l as i32;
                right += r as i32;
                voice.cursor += 1;
            }
        }
        [clamp_i16(left), clamp_i16(right)]
    }
}

fn clamp_i16(value: i32) -> i16 {
    value.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

/// Owns the output device for the lifetime of a consumer.
///
/// Dropping the engine stops and releases the device, so every exit path
/// of the serve loop cleans up.
pub struct AudioEngine {
    queue: Sender<Arc<Waveform>>,
    sample_rate: u32,
    dropped: AtomicUsize,
    #[cfg(feature = "audio-cpal")]
    stream: Option<cpal::Stream>,
}

impl AudioEngine {
    /// Opens the default output device.
    #[cfg(feature = "audio-cpal")]
    pub fn open() -> Result<Self, AudioError> {
        let (queue, incoming) = bounded(QUEUE_DEPTH);
        let (stream, sample_rate) = device::open_output(Mixer::new(incoming, MAX_ACTIVE_VOICES))?;
        log::info!("audio output open at {sample_rate} Hz");
        Ok(Self {
            queue,
            sample_rate,
            dropped: AtomicUsize::new(0),
            stream: Some(stream),
        })
    }

    #[cfg(not(feature = "audio-cpal"))]
    pub fn open() -> Result<Self, AudioError> {
        Err(AudioError::Unavailable)
    }

    /// An engine with no device behind it; `play` is a no-op.
    pub fn silent(sample_rate: u32) -> Self {
        let (queue, _) = bounded(0);
        Self {
            queue,
            sample_rate,
            dropped: AtomicUsize::new(0),
            #[cfg(feature = "audio-cpal")]
            stream: None,
        }
    }

    pub fn is_silent(&self) -> bool {
        #[cfg(feature = "audio-cpal")]
        {
            self.stream.is_none()
        }
        #[cfg(not(feature = "audio-cpal"))]
        {
            true
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn close(self) {
        drop(self);
    }
}

impl Playback for AudioEngine {
    fn play(&self, waveform: Arc<Waveform>) {
        match self.queue.try_send(waveform) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("playback queue full, note dropped");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        let dropped = self.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            log::info!("{dropped} note(s) dropped while the playback queue was full");
        }
        #[cfg(feature = "audio-cpal")]
        if let Some(stream) = self.stream.take() {
            if let Err(err) = cpal::traits::StreamTrait::pause(&stream) {
                log::debug!("failed to pause audio stream: {err}");
            }
            log::info!("audio output closed");
        }
    }
}
