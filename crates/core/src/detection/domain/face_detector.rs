use crate::shared::bbox::BoundingBox;
use crate::shared::frame::Frame;

/// Error type returned by external model backends.
pub type BackendError = Box<dyn std::error::Error + Send + Sync>;

/// A face found by a detector in one frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f64,
}

impl Detection {
    pub fn new(bbox: BoundingBox, confidence: f64) -> Self {
        Self { bbox, confidence }
    }
}

/// Domain interface for face detection.
///
/// One call handles a whole batch and must return exactly one detection
/// list per input frame, in input order. Each detection worker owns its own
/// instance, hence `&mut self` and no `Sync` bound.
pub trait FaceDetector: Send {
    fn detect(&mut self, frames: &[&Frame]) -> Result<Vec<Vec<Detection>>, BackendError>;
}
