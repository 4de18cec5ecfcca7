/// ArcFace face embedder using ONNX Runtime.
///
/// Produces L2-normalized embeddings, so the identity store can compare
/// them by dot product.
use std::path::Path;

use ndarray::Array4;

use crate::detection::domain::face_detector::BackendError;
use crate::recognition::domain::face_embedder::FaceEmbedder;
use crate::recognition::domain::identity_store::l2_normalize;
use crate::shared::frame::Frame;
use crate::shared::onnx_session::open_session;

const INPUT_SIZE: usize = 112;
const NORM_MEAN: f32 = 127.5;
const NORM_STD: f32 = 127.5;

pub struct OnnxArcFaceEmbedder {
    session: ort::session::Session,
}

impl OnnxArcFaceEmbedder {
    pub fn new(model_path: &Path, intra_threads: usize) -> Result<Self, BackendError> {
        Ok(Self {
            session: open_session(model_path, intra_threads)?,
        })
    }
}

impl FaceEmbedder for OnnxArcFaceEmbedder {
    fn embed(&mut self, crop: &Frame) -> Result<Vec<f32>, BackendError> {
        if crop.width() == 0 || crop.height() == 0 {
            return Err("empty face crop".into());
        }
        let input_value = ort::value::Tensor::from_array(preprocess(crop))?;
        let outputs = self.session.run(ort::inputs![input_value])?;
        let embedding = outputs[0].try_extract_array::<f32>()?;
        let mut embedding = embedding
            .as_slice()
            .ok_or("cannot get embedding slice")?
            .to_vec();
        l2_normalize(&mut embedding);
        Ok(embedding)
    }
}

/// Resize crop to 112x112, normalize to [-1, 1], NCHW layout.
fn preprocess(crop: &Frame) -> Array4<f32> {
    let src = crop.as_ndarray();
    let src_h = crop.height() as usize;
    let src_w = crop.width() as usize;
    let channels = crop.channels() as usize;

    let mut tensor = Array4::<f32>::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
    for y in 0..INPUT_SIZE {
        let src_y = (((y as f64 + 0.5) * src_h as f64 / INPUT_SIZE as f64) as usize).min(src_h - 1);
        for x in 0..INPUT_SIZE {
            let src_x =
                (((x as f64 + 0.5) * src_w as f64 / INPUT_SIZE as f64) as usize).min(src_w - 1);
            for c in 0..3 {
                let value = src[[src_y, src_x, c.min(channels - 1)]] as f32;
                tensor[[0, c, y, x]] = (value - NORM_MEAN) / NORM_STD;
            }
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn crop(width: u32, height: u32, value: u8) -> Frame {
        Frame::new(
            vec![value; (width * height * 3) as usize],
            width,
            height,
            3,
            0,
            Duration::ZERO,
        )
    }

    #[test]
    fn test_preprocess_shape() {
        assert_eq!(preprocess(&crop(50, 30, 128)).shape(), &[1, 3, 112, 112]);
    }

    #[test]
    fn test_preprocess_normalization_bounds() {
        let white = preprocess(&crop(10, 10, 255));
        let black = preprocess(&crop(10, 10, 0));
        assert!((white[[0, 0, 0, 0]] - 1.0).abs() < 0.01);
        assert!((black[[0, 2, 111, 111]] + 1.0).abs() < 0.01);
    }

    #[test]
    fn test_preprocess_keeps_channel_order() {
        let mut data = Vec::new();
        for _ in 0..4 {
            data.extend_from_slice(&[255, 0, 128]);
        }
        let tensor = preprocess(&Frame::new(data, 2, 2, 3, 0, Duration::ZERO));
        assert!((tensor[[0, 0, 50, 50]] - 1.0).abs() < 0.01);
        assert!((tensor[[0, 1, 50, 50]] + 1.0).abs() < 0.01);
        assert!(tensor[[0, 2, 50, 50]].abs() < 0.01);
    }
}
