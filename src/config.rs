use clap::{Args, Parser, Subcommand, builder::RangedU64ValueParser};

use crate::{
    codec::DEFAULT_JPEG_QUALITY,
    inference::{DecodeConfig, Task},
    sonify::bank::DEFAULT_SAMPLE_RATE,
    transport::{DEFAULT_HIGH_WATER_MARK, DEFAULT_PORT, DEFAULT_QUEUE_DEPTH},
};

/// Upper bound for per-connection queues; channels allocate their capacity up front.
const MAX_QUEUE_LEN: u64 = 1024;

fn queue_len_parser() -> RangedU64ValueParser<usize> {
    RangedU64ValueParser::<usize>::new().range(1..=MAX_QUEUE_LEN)
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay camera frames to a pose model and play the pose as music", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Capture frames and publish them as JPEG at a fixed rate.
    Stream(StreamArgs),
    /// Subscribe to a frame stream, run inference, and optionally sonify poses.
    Serve(ServeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct StreamArgs {
    /// Port to publish on, on every interface.
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Camera index, image file, directory of images, video file, or `noise`.
    #[arg(long, env = "SOURCE", default_value = "0")]
    pub source: String,

    /// Frames per second, clamped to 0.01..=1000.
    #[arg(long, env = "FPS", default_value_t = 10.0)]
    pub fps: f64,

    #[arg(long, env = "WIDTH", default_value_t = 640)]
    pub width: u32,

    #[arg(long, env = "HEIGHT", default_value_t = 480)]
    pub height: u32,

    #[arg(long, env = "QUALITY", default_value_t = DEFAULT_JPEG_QUALITY,
          value_parser = clap::value_parser!(u8).range(1..=100))]
    pub quality: u8,

    /// Messages queued per subscriber before new ones are dropped for it.
    #[arg(long, env = "HIGH_WATER_MARK", default_value_t = DEFAULT_HIGH_WATER_MARK,
          value_parser = queue_len_parser())]
    pub high_water_mark: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Host of the publisher to subscribe to.
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Path to an ONNX model, or an http(s) URL to download it from.
    #[arg(long, env = "MODEL", default_value = "models/yolov8n-pose.onnx")]
    pub model: String,

    #[arg(long, env = "TASK", value_enum, default_value_t = Task::Pose)]
    pub task: Task,

    /// Log a summary line for every processed frame.
    #[arg(long, env = "HEADLESS")]
    pub headless: bool,

    /// Map wrist heights to notes and play them.
    #[arg(long, env = "SONIFY")]
    pub sonify: bool,

    /// Minimum detection score.
    #[arg(long, env = "CONFIDENCE", default_value_t = 0.25)]
    pub confidence: f32,

    /// IoU above which overlapping boxes of one class are merged.
    #[arg(long, env = "IOU", default_value_t = 0.7)]
    pub iou: f32,

    /// Sample rate used when no audio device is available.
    #[arg(long, env = "SAMPLE_RATE", default_value_t = DEFAULT_SAMPLE_RATE)]
    pub sample_rate: u32,

    /// Frames buffered on the receiving side.
    #[arg(long, env = "QUEUE_DEPTH", default_value_t = DEFAULT_QUEUE_DEPTH,
          value_parser = queue_len_parser())]
    pub queue_depth: usize,
}

impl ServeArgs {
    pub fn decode_config(&self) -> DecodeConfig {
        DecodeConfig {
            confidence: self.confidence,
            iou: self.iou,
            ..DecodeConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn stream_defaults() {
        let cli = Cli::try_parse_from(["pose-relay", "stream", "--source", "noise"]).unwrap();
        let Command::Stream(args) = cli.command else {
            panic!("expected stream");
        };
        assert_eq!(args.source, "noise");
        assert_eq!(args.fps, 10.0);
        assert_eq!((args.width, args.height), (640, 480));
        assert_eq!(args.quality, 80);
    }

    #[test]
    fn serve_flags_parse() {
        let cli = Cli::try_parse_from([
            "pose-relay",
            "serve",
            "--host",
            "10.0.0.5",
            "--port",
            "6000",
            "--task",
            "track",
            "--headless",
            "--sonify",
        ])
        .unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.host, "10.0.0.5");
        assert_eq!(args.port, 6000);
        assert_eq!(args.task, Task::Track);
        assert!(args.headless && args.sonify);
        assert_eq!(args.decode_config().iou, 0.7);
    }

    #[test]
    fn rejects_out_of_range_quality() {
        assert!(Cli::try_parse_from(["pose-relay", "stream", "--quality", "0"]).is_err());
        assert!(Cli::try_parse_from(["pose-relay", "serve", "--task", "dance"]).is_err());
    }

    #[test]
    fn queue_lengths_are_bounded() {
        let huge = usize::MAX.to_string();
        assert!(Cli::try_parse_from(["pose-relay", "stream", "--high-water-mark", &huge]).is_err());
        assert!(Cli::try_parse_from(["pose-relay", "stream", "--high-water-mark", "0"]).is_err());
        assert!(Cli::try_parse_from(["pose-relay", "serve", "--queue-depth", "1025"]).is_err());

        let cli = Cli::try_parse_from(["pose-relay", "serve", "--queue-depth", "1024"]).unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.queue_depth, 1024);
    }
}
