pub mod audio;
pub mod codec;
pub mod config;
pub mod inference;
pub mod model_download;
pub mod pipeline;
pub mod server;
pub mod sonify;
pub mod transport;
pub mod types;

pub use codec::{CodecError, FrameCodec};
pub use types::{Frame, InferenceOutput, Keypoint, KeypointSet};
