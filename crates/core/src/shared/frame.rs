use std::time::Duration;

use ndarray::ArrayView3;

use super::bbox::BoundingBox;

/// Monotonically increasing id assigned to each captured frame.
pub type FrameId = u64;

/// Storage layout of a frame: `(width, height, channels)`.
///
/// Frame storage is pooled per shape, so two frames with the same shape
/// can exchange their pixel buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameShape {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

impl FrameShape {
    pub fn new(width: u32, height: u32, channels: u8) -> Self {
        Self {
            width,
            height,
            channels,
        }
    }

    pub fn byte_len(&self) -> usize {
        (self.width as usize) * (self.height as usize) * (self.channels as usize)
    }
}

/// A single captured frame: contiguous RGB bytes in row-major order,
/// tagged with its capture id and timestamp.
///
/// The timestamp is the capture time relative to the start of the stream.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    shape: FrameShape,
    frame_id: FrameId,
    timestamp: Duration,
}

impl Frame {
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        channels: u8,
        frame_id: FrameId,
        timestamp: Duration,
    ) -> Self {
        let shape = FrameShape::new(width, height, channels);
        debug_assert_eq!(
            data.len(),
            shape.byte_len(),
            "data length must equal width * height * channels"
        );
        Self {
            data,
            shape,
            frame_id,
            timestamp,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Releases the pixel storage so it can be handed back to a pool.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn width(&self) -> u32 {
        self.shape.width
    }

    pub fn height(&self) -> u32 {
        self.shape.height
    }

    pub fn channels(&self) -> u8 {
        self.shape.channels
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn as_ndarray(&self) -> ArrayView3<'_, u8> {
        ArrayView3::from_shape(self.dims(), &self.data)
            .expect("Frame data length must match dimensions")
    }

    /// Copies the pixels inside `bbox` (clamped to the frame) into a new frame.
    ///
    /// Returns `None` when the clamped box is empty.
    pub fn crop(&self, bbox: &BoundingBox) -> Option<Frame> {
        let clamped = bbox.clamp_to(self.width() as f64, self.height() as f64)?;
        let x0 = clamped.x.floor() as usize;
        let y0 = clamped.y.floor() as usize;
        let w = (clamped.width.ceil() as usize).min(self.width() as usize - x0);
        let h = (clamped.height.ceil() as usize).min(self.height() as usize - y0);
        if w == 0 || h == 0 {
            return None;
        }

        let c = self.channels() as usize;
        let stride = self.width() as usize * c;
        let mut data = Vec::with_capacity(w * h * c);
        for row in y0..y0 + h {
            let start = row * stride + x0 * c;
            data.extend_from_slice(&self.data[start..start + w * c]);
        }
        Some(Frame::new(
            data,
            w as u32,
            h as u32,
            self.channels(),
            self.frame_id,
            self.timestamp,
        ))
    }

    fn dims(&self) -> (usize, usize, usize) {
        (
            self.shape.height as usize,
            self.shape.width as usize,
            self.shape.channels as usize,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(data: Vec<u8>, width: u32, height: u32) -> Frame {
        Frame::new(data, width, height, 3, 7, Duration::from_millis(250))
    }

    #[test]
    fn test_construction_and_accessors() {
        let data = vec![0u8; 12]; // 2x2x3
        let f = frame(data.clone(), 2, 2);
        assert_eq!(f.width(), 2);
        assert_eq!(f.height(), 2);
        assert_eq!(f.channels(), 3);
        assert_eq!(f.frame_id(), 7);
        assert_eq!(f.timestamp(), Duration::from_millis(250));
        assert_eq!(f.data(), &data[..]);
        assert_eq!(f.shape(), FrameShape::new(2, 2, 3));
    }

    #[test]
    #[should_panic(expected = "data length must equal width * height * channels")]
    fn test_mismatched_data_length_panics_in_debug() {
        frame(vec![0u8; 10], 2, 2);
    }

    #[test]
    fn test_into_data_returns_storage() {
        let f = frame(vec![9u8; 12], 2, 2);
        let data = f.into_data();
        assert_eq!(data.len(), 12);
        assert!(data.iter().all(|&b| b == 9));
    }

    #[test]
    fn test_as_ndarray_pixel_access() {
        let mut data = vec![0u8; 12];
        data[6] = 255; // row=1, col=0, R
        let f = frame(data, 2, 2);
        let arr = f.as_ndarray();
        assert_eq!(arr.shape(), &[2, 2, 3]);
        assert_eq!(arr[[1, 0, 0]], 255);
        assert_eq!(arr[[1, 0, 1]], 0);
    }

    #[test]
    fn test_crop_copies_inner_pixels() {
        // 4x4 frame where each pixel's R channel is its column index.
        let mut data = vec![0u8; 4 * 4 * 3];
        for y in 0..4 {
            for x in 0..4 {
                data[(y * 4 + x) * 3] = x as u8;
            }
        }
        let f = frame(data, 4, 4);
        let crop = f.crop(&BoundingBox::new(1.0, 1.0, 2.0, 2.0)).unwrap();

        assert_eq!(crop.width(), 2);
        assert_eq!(crop.height(), 2);
        assert_eq!(crop.frame_id(), 7);
        assert_eq!(crop.as_ndarray()[[0, 0, 0]], 1);
        assert_eq!(crop.as_ndarray()[[1, 1, 0]], 2);
    }

    #[test]
    fn test_crop_clamps_to_frame() {
        let f = frame(vec![0u8; 4 * 4 * 3], 4, 4);
        let crop = f.crop(&BoundingBox::new(-2.0, 2.0, 10.0, 10.0)).unwrap();
        assert_eq!(crop.width(), 4);
        assert_eq!(crop.height(), 2);
    }

    #[test]
    fn test_crop_outside_frame_is_none() {
        let f = frame(vec![0u8; 4 * 4 * 3], 4, 4);
        assert!(f.crop(&BoundingBox::new(10.0, 10.0, 5.0, 5.0)).is_none());
    }
}
