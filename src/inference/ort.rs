use std::path::Path;

use anyhow::{Context, Result, anyhow};
use ndarray::{ArrayView2, ArrayViewD, Axis, Ix2};
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;

use super::{
    InferenceEngine, Task,
    common::{self, DecodeConfig, TOP_K_CLASSES},
    tracker::IouTracker,
};
use crate::types::{Frame, InferenceOutput};

/// YOLO-family ONNX model run through ONNX Runtime.
pub struct OrtEngine {
    session: Session,
    task: Task,
    decode: DecodeConfig,
    tracker: Option<IouTracker>,
}

impl OrtEngine {
    pub fn load(model_path: &Path, task: Task, decode: DecodeConfig) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(2)?
            .commit_from_file(model_path)
            .with_context(|| format!("failed to load ORT session from {}", model_path.display()))?;

        log::info!(
            "{task} model ready from {} (input {}px, confidence > {}, iou {})",
            model_path.display(),
            task.input_size(),
            decode.confidence,
            decode.iou
        );

        Ok(Self {
            session,
            task,
            decode,
            tracker: (task == Task::Track).then(IouTracker::default),
        })
    }
}

impl InferenceEngine for OrtEngine {
    fn task(&self) -> Task {
        self.task
    }

    fn infer(&mut self, frame: &Frame) -> Result<InferenceOutput> {
        let (input, letterbox) = common::prepare_letterbox(frame, self.task.input_size())?;
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("failed to run ORT session")?;

        if outputs.len() < 1 {
            return Err(anyhow!("model returned no outputs"));
        }
        let raw = outputs[0].try_extract_array::<f32>()?;

        let output = match self.task {
            Task::Classify => {
                let scores: Vec<f32> = raw.iter().copied().collect();
                InferenceOutput::Classification(common::top_classes(&scores, TOP_K_CLASSES))
            }
            Task::Pose => {
                let head = first_batch(&raw, self.task)?;
                let people = common::decode_pose(head, &letterbox, &self.decode)?;
                let detections = people.iter().map(|(det, _)| det.clone()).collect();
                match people.into_iter().next() {
                    Some((_, person)) => InferenceOutput::Keypoints { person, detections },
                    None => InferenceOutput::None,
                }
            }
            Task::Segment => {
                let head = first_batch(&raw, self.task)?;
                InferenceOutput::Detections(common::decode_boxes(head, true, &letterbox, &self.decode)?)
            }
            Task::Detect | Task::Track => {
                let head = first_batch(&raw, self.task)?;
                let mut detections = common::decode_boxes(head, false, &letterbox, &self.decode)?;
                if let Some(tracker) = self.tracker.as_mut() {
                    tracker.update(&mut detections);
                }
                InferenceOutput::Detections(detections)
            }
        };

        Ok(output)
    }
}

fn first_batch<'a>(raw: &'a ArrayViewD<'_, f32>, task: Task) -> Result<ArrayView2<'a, f32>> {
    if raw.ndim() != 3 {
        return Err(anyhow!(
            "unexpected {task} head shape {:?}, need [batch, features, anchors]",
            raw.shape()
        ));
    }
    raw.index_axis(Axis(0), 0)
        .into_dimensionality::<Ix2>()
        .context("head output is not two-dimensional")
}
