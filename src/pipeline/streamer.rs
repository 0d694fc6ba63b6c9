use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use anyhow::Result;

use super::source::{FrameSource, SourceSpec};
use crate::{
    codec::FrameCodec,
    config::StreamArgs,
    transport::{Endpoint, Publisher},
};

pub const DEFAULT_FPS: f64 = 10.0;
pub const MIN_FPS: f64 = 0.01;
pub const MAX_FPS: f64 = 1000.0;

/// Fixed-rate ticker. A tick that runs late pushes the schedule back rather
/// than bursting to catch up.
#[derive(Debug)]
pub struct FramePacer {
    interval: Duration,
    next: Option<Instant>,
}

impl FramePacer {
    pub fn new(fps: f64) -> Self {
        let fps = if fps.is_finite() && fps > 0.0 {
            fps.clamp(MIN_FPS, MAX_FPS)
        } else {
            DEFAULT_FPS
        };
        Self {
            interval: Duration::from_secs_f64(1.0 / fps),
            next: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sleeps until the next tick is due. The first call returns immediately.
    pub fn wait(&mut self) {
        let now = Instant::now();
        let due = self.next.unwrap_or(now);
        if due > now {
            thread::sleep(due - now);
        }
        let fired = due.max(now);
        self.next = Some(fired + self.interval);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub captured: u64,
    pub published: u64,
    pub failed: u64,
}

/// Capture, encode and publish one frame per tick until `stop` is raised.
///
/// Per-frame capture and encode failures are logged and skipped. The source
/// and publisher stay owned by the caller so they are released on return.
pub fn run_stream_loop(
    source: &mut FrameSource,
    codec: &FrameCodec,
    publisher: &mut Publisher,
    pacer: &mut FramePacer,
    stop: &AtomicBool,
) -> Result<StreamStats> {
    let mut stats = StreamStats::default();
    log::info!(
        "streaming every {:?} at JPEG quality {}",
        pacer.interval(),
        codec.quality()
    );

    while !stop.load(Ordering::SeqCst) {
        pacer.wait();
        if stop.load(Ordering::SeqCst) {
            break;
        }

        let frame = match source.next_frame() {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("frame capture failed: {err:?}");
                stats.failed += 1;
                continue;
            }
        };
        stats.captured += 1;

        let encoded = match codec.encode(&frame) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("frame encode failed: {err:?}");
                stats.failed += 1;
                continue;
            }
        };

        let receivers = publisher.publish(&encoded);
        stats.published += 1;
        log::debug!(
            "published {}x{} frame ({} bytes) to {receivers} subscriber(s)",
            frame.width,
            frame.height,
            encoded.len()
        );
    }

    log::info!(
        "stream stopped after {} frames ({} failures)",
        stats.published, stats.failed
    );
    Ok(stats)
}

/// Entry point of the `stream` subcommand. The source and publisher are
/// dropped on return, releasing the camera and the port.
pub fn stream(args: &StreamArgs, stop: &AtomicBool) -> Result<()> {
    let spec: SourceSpec = args.source.parse()?;
    let mut publisher = Publisher::bind(&Endpoint::any(args.port), args.high_water_mark)?;
    let mut source = FrameSource::open(&spec, args.width, args.height)?;
    let codec = FrameCodec::new(args.quality);
    let mut pacer = FramePacer::new(args.fps);

    run_stream_loop(&mut source, &codec, &mut publisher, &mut pacer, stop)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_tick_is_immediate() {
        let mut pacer = FramePacer::new(2.0);
        let started = Instant::now();
        pacer.wait();
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn ticks_are_spaced_by_interval() {
        let mut pacer = FramePacer::new(20.0);
        let started = Instant::now();
        for _ in 0..5 {
            pacer.wait();
        }
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(600), "{elapsed:?}");
    }

    #[test]
    fn late_ticks_do_not_burst() {
        let mut pacer = FramePacer::new(20.0);
        pacer.wait();
        thread::sleep(Duration::from_millis(200));
        pacer.wait();

        let started = Instant::now();
        pacer.wait();
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn invalid_rate_falls_back_to_default() {
        assert_eq!(FramePacer::new(0.0).interval(), Duration::from_millis(100));
        assert_eq!(FramePacer::new(f64::NAN).interval(), Duration::from_millis(100));
    }

    #[test]
    fn extreme_rates_are_clamped() {
        let slowest = FramePacer::new(1e-20).interval();
        assert!(slowest >= Duration::from_secs(99) && slowest <= Duration::from_secs(101));

        let fastest = FramePacer::new(1e12).interval();
        assert!(fastest >= Duration::from_micros(999) && fastest <= Duration::from_micros(1001));
    }
}
