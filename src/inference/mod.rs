pub mod common;
mod ort;
pub mod tracker;

use std::fmt;

use crate::types::{Frame, InferenceOutput};

pub use self::ort::OrtEngine;
pub use common::DecodeConfig;
pub use tracker::IouTracker;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Task {
    Detect,
    Segment,
    #[default]
    Pose,
    Classify,
    Track,
}

impl Task {
    pub fn input_size(self) -> u32 {
        match self {
            Task::Classify => common::CLASSIFY_INPUT_SIZE,
            _ => common::DETECT_INPUT_SIZE,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Task::Detect => "detect",
            Task::Segment => "segment",
            Task::Pose => "pose",
            Task::Classify => "classify",
            Task::Track => "track",
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub trait InferenceEngine {
    fn task(&self) -> Task;

    /// Runs the model on one frame. May block for as long as the model takes.
    fn infer(&mut self, frame: &Frame) -> anyhow::Result<InferenceOutput>;
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
    fn task(&self) -> Task {
        (**self).task()
    }

    fn infer(&mut self, frame: &Frame) -> anyhow::Result<InferenceOutput> {
        (**self).infer(frame)
    }
}
