use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::domain::camera_source::{CameraSource, CaptureError};
use crate::capture::frame_buffer::FrameBuffer;
use crate::shared::constants::IMAGE_EXTENSIONS;
use crate::shared::frame::{Frame, FrameId, FrameShape};

/// Replays a directory of still images as a camera stream.
///
/// Files are read in lexicographic order. Frame ids start at 0 and
/// timestamps advance by `1 / fps` per frame, so dwell-time logic behaves as
/// it would on a live camera running at that rate.
pub struct ImageSequenceSource {
    paths: Vec<PathBuf>,
    next_index: usize,
    fps: f64,
}

impl ImageSequenceSource {
    pub fn open(dir: &Path, fps: f64) -> Result<Self, CaptureError> {
        let paths = list_images(dir)?;
        if paths.is_empty() {
            return Err(CaptureError::Empty(dir.to_path_buf()));
        }
        log::info!("Replaying {} frames from {}", paths.len(), dir.display());
        Ok(Self {
            paths,
            next_index: 0,
            fps: if fps > 0.0 { fps } else { 30.0 },
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl ImageSequenceSource {
    /// Path, id and timestamp of the next frame, advancing the cursor.
    fn advance(&mut self) -> Option<(PathBuf, FrameId, Duration)> {
        let path = self.paths.get(self.next_index)?.clone();
        let frame_id = self.next_index as FrameId;
        let timestamp = Duration::from_secs_f64(self.next_index as f64 / self.fps);
        self.next_index += 1;
        Some((path, frame_id, timestamp))
    }
}

impl CameraSource for ImageSequenceSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        let Some((path, frame_id, timestamp)) = self.advance() else {
            return Ok(None);
        };
        load_frame(&path, frame_id, timestamp).map(Some)
    }

    /// Decodes the next image and copies it into the buffer's pooled
    /// storage, so steady-state replay reuses frame memory.
    fn capture_into(&mut self, buffer: &FrameBuffer) -> Result<Option<bool>, CaptureError> {
        let Some((path, frame_id, timestamp)) = self.advance() else {
            return Ok(None);
        };
        let rgb = decode_rgb(&path)?;
        let shape = FrameShape::new(rgb.width(), rgb.height(), 3);
        buffer
            .put_copy(rgb.as_raw(), shape, frame_id, timestamp)
            .map(Some)
    }

    fn fps(&self) -> Option<f64> {
        Some(self.fps)
    }
}

/// Decodes one image file into an RGB frame.
pub fn load_frame(
    path: &Path,
    frame_id: FrameId,
    timestamp: Duration,
) -> Result<Frame, CaptureError> {
    let rgb = decode_rgb(path)?;
    let (width, height) = rgb.dimensions();
    Ok(Frame::new(
        rgb.into_raw(),
        width,
        height,
        3,
        frame_id,
        timestamp,
    ))
}

fn decode_rgb(path: &Path) -> Result<image::RgbImage, CaptureError> {
    let decoded = image::open(path).map_err(|source| CaptureError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(decoded.to_rgb8())
}

/// Lists image files directly inside `dir`, sorted by file name.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>, CaptureError> {
    let list_err = |source| CaptureError::List {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(list_err)? {
        let path = entry.map_err(list_err)?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if path.is_file() && is_image {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
