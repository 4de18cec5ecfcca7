use crate::detection::domain::face_detector::BackendError;
use crate::shared::frame::Frame;

/// Domain interface for turning a face crop into an embedding vector.
///
/// Each recognition worker owns its own embedder, so implementations may
/// hold a model session mutably.
pub trait FaceEmbedder: Send {
    fn embed(&mut self, crop: &Frame) -> Result<Vec<f32>, BackendError>;
}
