use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::capture::domain::camera_source::CaptureError;
use crate::capture::infrastructure::image_sequence_source::{list_images, load_frame};
use crate::detection::domain::face_detector::{BackendError, FaceDetector};
use crate::recognition::domain::face_embedder::FaceEmbedder;
use crate::recognition::domain::identity_store::IdentityStore;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("face model failed on {path}: {source}")]
    Backend {
        path: PathBuf,
        #[source]
        source: BackendError,
    },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct GallerySummary {
    pub enrolled: Vec<String>,
    /// Gallery images where no face was found.
    pub skipped: Vec<PathBuf>,
}

/// Enrolls a directory of reference photos: read → detect → crop the
/// largest face → embed → enroll under the file stem.
///
/// Several photos of one person (`ada.jpg`, `ada.2.jpg`) are enrolled as
/// separate references for the same name; the name is the stem up to its
/// first dot.
pub struct EnrollGalleryUseCase {
    detector: Box<dyn FaceDetector>,
    embedder: Box<dyn FaceEmbedder>,
}

impl EnrollGalleryUseCase {
    pub fn new(detector: Box<dyn FaceDetector>, embedder: Box<dyn FaceEmbedder>) -> Self {
        Self { detector, embedder }
    }

    pub fn execute(
        &mut self,
        gallery_dir: &Path,
        store: &mut IdentityStore,
    ) -> Result<GallerySummary, GalleryError> {
        let mut summary = GallerySummary::default();
        for path in list_images(gallery_dir)? {
            let Some(name) = identity_name(&path) else {
                continue;
            };
            let frame = load_frame(&path, 0, Duration::ZERO)?;
            let backend_err = |source| GalleryError::Backend {
                path: path.clone(),
                source,
            };

            let detections = self
                .detector
                .detect(&[&frame])
                .map_err(backend_err)?
                .into_iter()
                .next()
                .unwrap_or_default();
            let largest = detections
                .iter()
                .max_by(|a, b| a.bbox.area().total_cmp(&b.bbox.area()));
            let Some(crop) = largest.and_then(|d| frame.crop(&d.bbox)) else {
                log::warn!("No face found in gallery image {}", path.display());
                summary.skipped.push(path);
                continue;
            };

            let embedding = self.embedder.embed(&crop).map_err(backend_err)?;
            store.enroll(&name, embedding);
            log::info!("Enrolled {name} from {}", path.display());
            summary.enrolled.push(name);
        }
        Ok(summary)
    }
}

fn identity_name(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let name = stem.split('.').next().unwrap_or(stem).trim();
    (!name.is_empty()).then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::domain::face_detector::Detection;
    use crate::shared::bbox::BoundingBox;
    use crate::shared::frame::Frame;
    use crate::shared::identity::Identity;
    use tempfile::TempDir;

    /// Finds a small and a large face unless the image is mostly black.
    struct StubDetector;

    impl FaceDetector for StubDetector {
        fn detect(&mut self, frames: &[&Frame]) -> Result<Vec<Vec<Detection>>, BackendError> {
            Ok(frames
                .iter()
                .map(|f| {
                    if f.data()[0] < 10 {
                        return Vec::new();
                    }
                    vec![
                        Detection::new(BoundingBox::new(0.0, 0.0, 2.0, 2.0), 0.9),
                        Detection::new(BoundingBox::new(4.0, 4.0, 8.0, 8.0), 0.8),
                    ]
                })
                .collect())
        }
    }

    /// Embeds a crop as its width and the red channel of its first pixel.
    struct StubEmbedder;

    impl FaceEmbedder for StubEmbedder {
        fn embed(&mut self, crop: &Frame) -> Result<Vec<f32>, BackendError> {
            Ok(vec![crop.width() as f32, crop.data()[0] as f32])
        }
    }

    fn use_case() -> EnrollGalleryUseCase {
        EnrollGalleryUseCase::new(Box::new(StubDetector), Box::new(StubEmbedder))
    }

    fn write_image(dir: &Path, name: &str, red: u8) {
        let img = image::RgbImage::from_pixel(12, 12, image::Rgb([red, 0, 0]));
        img.save(dir.join(name)).unwrap();
    }

    #[test]
    fn test_enrolls_largest_face_per_image() {
        let dir = TempDir::new().unwrap();
        write_image(dir.path(), "ada.png", 200);
        write_image(dir.path(), "ada.2.png", 180);
        write_image(dir.path(), "grace.png", 40);

        let mut store = IdentityStore::new(0.45);
        let mut use_case = use_case();
        let summary = use_case.execute(dir.path(), &mut store).unwrap();

        assert_eq!(summary.enrolled, vec!["ada", "ada", "grace"]);
        assert!(summary.skipped.is_empty());
        assert_eq!(store.reference_count("ada"), 2);
        assert_eq!(store.reference_count("grace"), 1);
        // The 8x8 face was embedded, not the 2x2 one.
        let matched = store.compare(&[8.0, 200.0]);
        assert_eq!(matched.identity, Identity::Known("ada".into()));
    }

    #[test]
    fn test_image_without_face_is_skipped() {
        let dir = TempDir::new().unwrap();
        write_image(dir.path(), "nobody.png", 0);

        let mut store = IdentityStore::new(0.45);
        let mut use_case = use_case();
        let summary = use_case.execute(dir.path(), &mut store).unwrap();

        assert!(summary.enrolled.is_empty());
        assert_eq!(summary.skipped, vec![dir.path().join("nobody.png")]);
        assert!(store.is_empty());
    }

    #[test]
    fn test_missing_gallery_is_capture_error() {
        let mut store = IdentityStore::new(0.45);
        let mut use_case = use_case();
        assert!(matches!(
            use_case.execute(Path::new("/nonexistent/gallery"), &mut store),
            Err(GalleryError::Capture(_))
        ));
    }

    #[test]
    fn test_identity_name_from_stem() {
        assert_eq!(identity_name(Path::new("/g/ada.jpg")), Some("ada".into()));
        assert_eq!(identity_name(Path::new("/g/ada.side.jpg")), Some("ada".into()));
        assert_eq!(identity_name(Path::new("/g/.jpg")), None);
    }
}
