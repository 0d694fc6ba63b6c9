/// COCO-17 landmark ids used by the pose heads we load.
pub const NUM_KEYPOINTS: usize = 17;
pub const LEFT_WRIST: usize = 9;
pub const RIGHT_WRIST: usize = 10;

#[derive(Clone, Debug)]
pub struct Frame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(rgba: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            rgba,
            width,
            height,
        }
    }

    pub fn expected_len(width: u32, height: u32) -> usize {
        (width as usize)
            .saturating_mul(height as usize)
            .saturating_mul(4)
    }
}

/// A single landmark in normalized image coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, confidence: f32) -> Self {
        Self { x, y, confidence }
    }

    /// `(0, 0)` is what pose heads report for landmarks they did not observe.
    pub fn is_sentinel(&self) -> bool {
        self.x == 0.0 && self.y == 0.0
    }
}

/// Landmarks of one person, indexed by landmark id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeypointSet {
    points: Vec<Keypoint>,
}

impl KeypointSet {
    pub fn new(points: Vec<Keypoint>) -> Self {
        Self { points }
    }

    pub fn get(&self, landmark: usize) -> Option<&Keypoint> {
        self.points.get(landmark)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Axis-aligned box in normalized coordinates `[x1, y1, x2, y2]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: [f32; 4],
    pub score: f32,
    pub class_id: usize,
    pub track_id: Option<u32>,
}

impl Detection {
    pub fn area(&self) -> f32 {
        let [x1, y1, x2, y2] = self.bbox;
        (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
    }

    pub fn iou(&self, other: &Detection) -> f32 {
        let ix1 = self.bbox[0].max(other.bbox[0]);
        let iy1 = self.bbox[1].max(other.bbox[1]);
        let ix2 = self.bbox[2].min(other.bbox[2]);
        let iy2 = self.bbox[3].min(other.bbox[3]);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 { 0.0 } else { inter / union }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClassScore {
    pub class_id: usize,
    pub score: f32,
}

/// What one inference call produced.
#[derive(Clone, Debug, PartialEq)]
pub enum InferenceOutput {
    Detections(Vec<Detection>),
    /// Keypoints of the first detected person, plus every box the head returned.
    Keypoints {
        person: KeypointSet,
        detections: Vec<Detection>,
    },
    Classification(Vec<ClassScore>),
    None,
}

impl InferenceOutput {
    pub fn detection_count(&self) -> usize {
        match self {
            InferenceOutput::Detections(detections) => detections.len(),
            InferenceOutput::Keypoints { detections, .. } => detections.len(),
            InferenceOutput::Classification(_) | InferenceOutput::None => 0,
        }
    }

    pub fn keypoints(&self) -> Option<&KeypointSet> {
        match self {
            InferenceOutput::Keypoints { person, .. } => Some(person),
            _ => None,
        }
    }
}
