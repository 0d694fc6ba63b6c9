use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, bail};

use crate::{
    audio::{AudioEngine, Playback},
    codec::FrameCodec,
    config::ServeArgs,
    inference::{InferenceEngine, OrtEngine, Task},
    model_download::{MODEL_DIR, resolve_model},
    sonify::{DECAY_FACTORS, Scale, Sonifier, SoundBank},
    transport::{Endpoint, Subscriber, TransportError},
    types::InferenceOutput,
};

/// How long one receive waits before the stop flag is checked again.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServeStats {
    pub received: u64,
    pub decode_failures: u64,
    pub inference_failures: u64,
    pub processed: u64,
    pub notes: u64,
}

/// Everything one consumer iteration needs, passed in rather than global.
pub struct Consumer<E: InferenceEngine, P: Playback> {
    codec: FrameCodec,
    engine: E,
    sonifier: Option<Sonifier<P>>,
    headless: bool,
    stats: ServeStats,
}

impl<E: InferenceEngine, P: Playback> Consumer<E, P> {
    pub fn new(engine: E, sonifier: Option<Sonifier<P>>, headless: bool) -> Self {
        Self {
            codec: FrameCodec::default(),
            engine,
            sonifier,
            headless,
            stats: ServeStats::default(),
        }
    }

    pub fn stats(&self) -> ServeStats {
        self.stats
    }

    pub fn sonifier(&self) -> Option<&Sonifier<P>> {
        self.sonifier.as_ref()
    }

    /// Handles one frame message. Undecodable messages and failed inference
    /// are logged and skipped; `None` means the frame produced no result.
    pub fn process_message(&mut self, message: &[u8]) -> Option<InferenceOutput> {
        self.stats.received += 1;

        let frame = match self.codec.decode(message) {
            Ok(frame) => frame,
            Err(err) => {
                self.stats.decode_failures += 1;
                log::warn!("dropping undecodable frame ({} bytes): {err}", message.len());
                return None;
            }
        };

        let output = match self.engine.infer(&frame) {
            Ok(output) => output,
            Err(err) => {
                self.stats.inference_failures += 1;
                log::warn!("inference failed: {err:?}");
                return None;
            }
        };
        self.stats.processed += 1;

        let count = output.detection_count();
        if self.headless {
            log::info!("processed frame with {count} detections");
        } else {
            log::debug!(
                "processed {}x{} frame with {count} detections",
                frame.width, frame.height
            );
        }

        if let Some(sonifier) = self.sonifier.as_mut() {
            self.stats.notes += sonifier.handle(&output).len() as u64;
        }

        Some(output)
    }

    /// Runs until `stop` is raised or the subscriber shuts down.
    pub fn run(&mut self, subscriber: &Subscriber, stop: &AtomicBool) -> Result<ServeStats> {
        log::info!(
            "serving {} results from {}",
            self.engine.task(),
            subscriber.endpoint()
        );

        while !stop.load(Ordering::SeqCst) {
            let message = match subscriber.recv_latest(POLL_INTERVAL) {
                Ok(message) => message,
                Err(TransportError::Timeout) => continue,
                Err(TransportError::Closed) => bail!("subscriber closed unexpectedly"),
                Err(err) => {
                    log::warn!("receive failed: {err}");
                    continue;
                }
            };
            self.process_message(&message);
        }

        let stats = self.stats;
        log::info!(
            "serve loop stopped: {} received, {} processed, {} undecodable, {} inference failures, {} notes",
            stats.received,
            stats.processed,
            stats.decode_failures,
            stats.inference_failures,
            stats.notes
        );
        Ok(stats)
    }
}

/// Opens the audio device, falling back to silent playback if there is none,
/// then builds the sound bank at the rate the device runs at.
pub fn build_sonifier(fallback_rate: u32) -> Result<Sonifier<AudioEngine>> {
    let engine = match AudioEngine::open() {
        Ok(engine) => engine,
        Err(err) => {
            log::error!("audio output unavailable, continuing without sound: {err}");
            AudioEngine::silent(fallback_rate)
        }
    };

    let scale = Scale::pentatonic();
    let bank = SoundBank::build(&scale, &DECAY_FACTORS, engine.sample_rate())
        .context("failed to build sound bank")?;
    Ok(Sonifier::new(scale, Arc::new(bank), engine))
}

/// Entry point of the `serve` subcommand.
pub fn serve(args: &ServeArgs, stop: &AtomicBool) -> Result<()> {
    let sonifier = if args.sonify {
        if args.task != Task::Pose {
            log::warn!(
                "--sonify needs --task pose; {} results carry no keypoints and stay silent",
                args.task
            );
        }
        Some(build_sonifier(args.sample_rate)?)
    } else {
        None
    };

    let model_path = resolve_model(&args.model, Path::new(MODEL_DIR))
        .with_context(|| format!("failed to resolve model {}", args.model))?;
    let engine = OrtEngine::load(&model_path, args.task, args.decode_config())?;

    let endpoint = Endpoint::remote(args.host.clone(), args.port);
    let subscriber = Subscriber::connect(&endpoint, args.queue_depth)?;

    let mut consumer = Consumer::new(engine, sonifier, args.headless);
    consumer.run(&subscriber, stop)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        pipeline::NoiseSource,
        sonify::Waveform,
        types::{Frame, Keypoint, KeypointSet, LEFT_WRIST, NUM_KEYPOINTS},
    };

    /// Reports a left wrist whose height follows the red value of the
    /// first pixel, or fails on demand.
    struct ScriptedEngine {
        fail: bool,
    }

    impl InferenceEngine for ScriptedEngine {
        fn task(&self) -> Task {
            Task::Pose
        }

        fn infer(&mut self, frame: &Frame) -> anyhow::Result<InferenceOutput> {
            if self.fail {
                anyhow::bail!("model exploded");
            }
            let mut points = vec![Keypoint::default(); NUM_KEYPOINTS];
            let y = if frame.rgba[0] > 127 { 0.1 } else { 0.9 };
            points[LEFT_WRIST] = Keypoint::new(0.5, y, 0.9);
            Ok(InferenceOutput::Keypoints {
                person: KeypointSet::new(points),
                detections: Vec::new(),
            })
        }
    }

    #[derive(Default)]
    struct Recorder {
        played: Mutex<usize>,
    }

    impl Playback for Recorder {
        fn play(&self, _waveform: Arc<Waveform>) {
            *self.played.lock().unwrap() += 1;
        }
    }

    fn solid(shade: u8) -> Vec<u8> {
        let frame = Frame::new([shade, shade, shade, 255].repeat(32 * 32), 32, 32);
        FrameCodec::default().encode(&frame).unwrap()
    }

    fn sonifier() -> Sonifier<Recorder> {
        let scale = Scale::pentatonic();
        let bank = SoundBank::build(&scale, &DECAY_FACTORS, 22_050).unwrap();
        Sonifier::new(scale, Arc::new(bank), Recorder::default())
    }

    #[test]
    fn garbage_messages_are_skipped() {
        let mut consumer = Consumer::<_, Recorder>::new(ScriptedEngine { fail: false }, None, true);
        assert!(consumer.process_message(b"definitely not jpeg").is_none());
        let noise = NoiseSource::with_seed(32, 32, 5).next_frame();
        let good = FrameCodec::default().encode(&noise).unwrap();
        assert!(consumer.process_message(&good).is_some());

        let stats = consumer.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(stats.processed, 1);
    }

    #[test]
    fn inference_failure_skips_frame() {
        let mut consumer = Consumer::<_, Recorder>::new(ScriptedEngine { fail: true }, None, false);
        assert!(consumer.process_message(&solid(200)).is_none());
        assert_eq!(consumer.stats().inference_failures, 1);
    }

    #[test]
    fn pose_changes_trigger_notes_once() {
        let mut consumer = Consumer::new(ScriptedEngine { fail: false }, Some(sonifier()), true);
        for message in [solid(250), solid(250), solid(10), solid(10)] {
            consumer.process_message(&message);
        }
        assert_eq!(consumer.stats().notes, 2);
        let played = *consumer.sonifier().unwrap().playback().played.lock().unwrap();
        assert_eq!(played, 2);
    }
}
