/// YOLO face detector using ONNX Runtime via `ort`.
///
/// Handles letterbox preprocessing, batched inference and NMS
/// post-processing. Each detection worker owns its own instance, so the
/// session is never shared between threads.
use std::path::Path;

use ndarray::{s, Array4};

use crate::detection::domain::face_detector::{BackendError, Detection, FaceDetector};
use crate::shared::bbox::BoundingBox;
use crate::shared::frame::Frame;
use crate::shared::onnx_session::open_session;

/// Fallback YOLO model input resolution when the model doesn't specify dimensions.
const DEFAULT_INPUT_SIZE: u32 = 640;

/// Default confidence threshold for face detection.
pub const DEFAULT_CONFIDENCE: f64 = 0.25;

/// NMS IoU threshold.
const NMS_IOU_THRESH: f64 = 0.45;

/// Letterbox padding value (YOLO convention).
const PAD_VALUE: f32 = 114.0 / 255.0;

pub struct OnnxYoloDetector {
    session: ort::session::Session,
    confidence: f64,
    input_size: u32,
    /// Whether the model accepts more than one image per run.
    dynamic_batch: bool,
}

impl OnnxYoloDetector {
    /// Load a YOLO ONNX model and prepare for inference.
    ///
    /// The input resolution is read from the model's input shape (expecting
    /// NCHW), falling back to 640 if the shape is dynamic. A dynamic batch
    /// dimension lets a whole worker batch go through one `run` call.
    pub fn new(
        model_path: &Path,
        confidence: f64,
        intra_threads: usize,
    ) -> Result<Self, BackendError> {
        let session = open_session(model_path, intra_threads)?;

        let input_shape = session.inputs().first().and_then(|input| {
            if let ort::value::ValueType::Tensor { ref shape, .. } = input.dtype() {
                (shape.len() >= 4).then(|| (shape[0], shape[2]))
            } else {
                None
            }
        });
        let (batch_dim, height_dim) = input_shape.unwrap_or((1, -1));
        let input_size = if height_dim > 0 {
            height_dim as u32
        } else {
            DEFAULT_INPUT_SIZE
        };
        log::debug!(
            "Loaded YOLO model {} (input {input_size}px, batch dim {batch_dim})",
            model_path.display()
        );

        Ok(Self {
            session,
            confidence,
            input_size,
            dynamic_batch: batch_dim <= 0,
        })
    }

    fn infer(&mut self, input: Array4<f32>) -> Result<(Vec<usize>, Vec<f32>), BackendError> {
        let input_value = ort::value::Tensor::from_array(input)?;
        let outputs = self.session.run(ort::inputs![input_value])?;
        if outputs.len() == 0 {
            return Err("YOLO model produced no outputs".into());
        }
        let tensor = outputs[0].try_extract_array::<f32>()?;
        let shape = tensor.shape().to_vec();
        if shape.len() != 3 {
            return Err(format!("unexpected YOLO output shape: {shape:?}").into());
        }
        let data = tensor
            .as_slice()
            .ok_or("YOLO output is not contiguous")?
            .to_vec();
        Ok((shape, data))
    }
}

impl FaceDetector for OnnxYoloDetector {
    fn detect(&mut self, frames: &[&Frame]) -> Result<Vec<Vec<Detection>>, BackendError> {
        let size = self.input_size as usize;
        let letterboxed: Vec<Letterbox> = frames
            .iter()
            .map(|f| letterbox(f, self.input_size))
            .collect();

        if self.dynamic_batch && letterboxed.len() > 1 {
            let mut batch = Array4::<f32>::zeros((letterboxed.len(), 3, size, size));
            for (i, lb) in letterboxed.iter().enumerate() {
                batch.slice_mut(s![i..i + 1, .., .., ..]).assign(&lb.tensor);
            }
            let (shape, data) = self.infer(batch)?;
            let per_frame = split_batch(&shape, &data, frames.len())?;
            return Ok(letterboxed
                .iter()
                .zip(frames)
                .zip(per_frame)
                .map(|((lb, frame), rows)| self.postprocess(rows, shape[1], shape[2], lb, frame))
                .collect());
        }

        let mut results = Vec::with_capacity(frames.len());
        for (mut lb, frame) in letterboxed.into_iter().zip(frames) {
            let (shape, data) = self.infer(std::mem::take(&mut lb.tensor))?;
            results.push(self.postprocess(&data, shape[1], shape[2], &lb, frame));
        }
        Ok(results)
    }
}

impl OnnxYoloDetector {
    /// Decodes one image's output rows into frame-space detections.
    fn postprocess(
        &self,
        data: &[f32],
        dim_a: usize,
        dim_b: usize,
        lb: &Letterbox,
        frame: &Frame,
    ) -> Vec<Detection> {
        let raw = parse_rows(data, dim_a, dim_b, self.confidence, lb);
        nms(raw, NMS_IOU_THRESH)
            .into_iter()
            .filter_map(|d| {
                d.bbox
                    .clamp_to(frame.width() as f64, frame.height() as f64)
                    .map(|bbox| Detection::new(bbox, d.confidence))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Preprocessing
// ---------------------------------------------------------------------------

struct Letterbox {
    /// `[1, 3, S, S]` normalized RGB.
    tensor: Array4<f32>,
    scale: f64,
    pad_x: u32,
    pad_y: u32,
}

/// Letterbox-resize a frame to `target_size` × `target_size`.
fn letterbox(frame: &Frame, target_size: u32) -> Letterbox {
    let fw = frame.width() as f64;
    let fh = frame.height() as f64;
    let target = target_size as f64;

    let scale = (target / fw).min(target / fh);
    let new_w = ((fw * scale).round() as u32).min(target_size);
    let new_h = ((fh * scale).round() as u32).min(target_size);
    let pad_x = (target_size - new_w) / 2;
    let pad_y = (target_size - new_h) / 2;

    let mut tensor =
        Array4::<f32>::from_elem((1, 3, target_size as usize, target_size as usize), PAD_VALUE);

    let src = frame.as_ndarray();
    let src_h = frame.height() as usize;
    let src_w = frame.width() as usize;
    let channels = (frame.channels() as usize).min(3);

    // Nearest-neighbor resize into the padded region.
    for y in 0..new_h as usize {
        let src_y = ((y as f64 / scale) as usize).min(src_h - 1);
        for x in 0..new_w as usize {
            let src_x = ((x as f64 / scale) as usize).min(src_w - 1);
            let ty = pad_y as usize + y;
            let tx = pad_x as usize + x;
            for c in 0..3 {
                // Grayscale frames repeat their single channel.
                let sc = c.min(channels - 1);
                tensor[[0, c, ty, tx]] = src[[src_y, src_x, sc]] as f32 / 255.0;
            }
        }
    }

    Letterbox {
        tensor,
        scale,
        pad_x,
        pad_y,
    }
}

// ---------------------------------------------------------------------------
// Postprocessing
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
struct RawDetection {
    bbox: BoundingBox,
    confidence: f64,
}

/// Reads `[cx, cy, w, h, conf, ...]` rows from one image's output.
///
/// YOLO exports either `[features, detections]` (transposed) or
/// `[detections, features]`; the smaller dimension is taken as features.
fn parse_rows(
    data: &[f32],
    dim_a: usize,
    dim_b: usize,
    min_confidence: f64,
    lb: &Letterbox,
) -> Vec<RawDetection> {
    let transposed = dim_a < dim_b;
    let (num_dets, num_feats) = if transposed {
        (dim_b, dim_a)
    } else {
        (dim_a, dim_b)
    };
    if num_feats < 5 {
        return Vec::new();
    }
    let value = |det: usize, feat: usize| -> f64 {
        let index = if transposed {
            feat * num_dets + det
        } else {
            det * num_feats + feat
        };
        data[index] as f64
    };

    let pad_x = lb.pad_x as f64;
    let pad_y = lb.pad_y as f64;
    (0..num_dets)
        .filter_map(|i| {
            let confidence = value(i, 4);
            if confidence < min_confidence {
                return None;
            }
            let (cx, cy, w, h) = (value(i, 0), value(i, 1), value(i, 2), value(i, 3));
            Some(RawDetection {
                bbox: BoundingBox::from_corners(
                    (cx - w / 2.0 - pad_x) / lb.scale,
                    (cy - h / 2.0 - pad_y) / lb.scale,
                    (cx + w / 2.0 - pad_x) / lb.scale,
                    (cy + h / 2.0 - pad_y) / lb.scale,
                ),
                confidence,
            })
        })
        .collect()
}

/// Greedy NMS: sort by confidence descending, suppress overlapping boxes.
fn nms(mut dets: Vec<RawDetection>, iou_thresh: f64) -> Vec<RawDetection> {
    dets.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<RawDetection> = Vec::new();
    for det in dets {
        if keep.iter().all(|k| k.bbox.iou(&det.bbox) <= iou_thresh) {
            keep.push(det);
        }
    }
    keep
}

/// Splits a batched `[batch, a, b]` output into one row block per frame.
fn split_batch<'a>(
    shape: &[usize],
    data: &'a [f32],
    frames: usize,
) -> Result<Vec<&'a [f32]>, BackendError> {
    let per_frame = shape[1] * shape[2];
    if shape[0] != frames || data.len() != frames * per_frame {
        return Err(format!(
            "YOLO output shape {shape:?} does not match a batch of {frames} frames"
        )
        .into());
    }
    Ok(data.chunks_exact(per_frame.max(1)).collect())
}
