use std::path::PathBuf;

use thiserror::Error;

use crate::capture::frame_buffer::FrameBuffer;
use crate::shared::frame::Frame;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to list frames in {path}: {source}")]
    List {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode frame {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("no frames found in {0}")]
    Empty(PathBuf),
    #[error("frame data is {actual} bytes, expected {expected}")]
    ShapeMismatch { expected: usize, actual: usize },
}

/// Source of captured frames.
///
/// Implementations assign each frame a monotonically increasing id and a
/// capture timestamp. `Ok(None)` marks the end of the stream.
pub trait CameraSource: Send {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError>;

    /// Captures the next frame straight into `buffer`.
    ///
    /// Returns `Ok(None)` at the end of the stream, otherwise the result of
    /// [`FrameBuffer::put`]. Sources that decode into their own memory
    /// should override this to copy into the buffer's pooled storage.
    fn capture_into(&mut self, buffer: &FrameBuffer) -> Result<Option<bool>, CaptureError> {
        Ok(self.next_frame()?.map(|frame| buffer.put(frame)))
    }

    /// Nominal frame rate, if the source has one.
    fn fps(&self) -> Option<f64> {
        None
    }
}
