#[cfg(feature = "camera-nokhwa")]
pub mod camera;
#[cfg(feature = "camera-nokhwa")]
pub mod rgba_converter;
pub mod source;
pub mod streamer;
pub mod video;

pub use source::{FrameSource, NoiseSource, SequenceSource, SourceSpec};
pub use streamer::{FramePacer, StreamStats, run_stream_loop, stream};
