//! Constant-velocity Kalman filter over a face's center point.
//!
//! State is `[x, y, vx, vy]` in pixels and pixels/frame; only the center
//! `[x, y]` is observed. Alongside the filter each predictor keeps a
//! confidence score in `[0, 1]` that the tracker uses to decide when a
//! full detection pass is needed.

use ndarray::{arr1, arr2, Array1, Array2};

/// Process noise added to every state component per frame.
const PROCESS_NOISE: f64 = 0.01;
/// Measurement noise on the observed center, in pixels squared.
const MEASUREMENT_NOISE: f64 = 1.0;
const INITIAL_POSITION_VARIANCE: f64 = 10.0;
const INITIAL_VELOCITY_VARIANCE: f64 = 100.0;

/// Normalized errors at or below this restore confidence instead of decaying it.
const LOW_ERROR: f64 = 0.1;
/// Largest per-step confidence decay factor.
const MAX_DECAY: f64 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Prediction {
    pub center: (f64, f64),
    pub confidence: f64,
}

#[derive(Clone, Debug)]
pub struct MotionPredictor {
    state: Array1<f64>,
    covariance: Array2<f64>,
    transition: Array2<f64>,
    observation: Array2<f64>,
    process_noise: Array2<f64>,
    measurement_noise: Array2<f64>,
    confidence: f64,
}

impl MotionPredictor {
    /// Starts a filter at `center` with zero velocity and full confidence.
    pub fn new(center: (f64, f64)) -> Self {
        Self {
            state: arr1(&[center.0, center.1, 0.0, 0.0]),
            covariance: Array2::from_diag(&arr1(&[
                INITIAL_POSITION_VARIANCE,
                INITIAL_POSITION_VARIANCE,
                INITIAL_VELOCITY_VARIANCE,
                INITIAL_VELOCITY_VARIANCE,
            ])),
            transition: arr2(&[
                [1.0, 0.0, 1.0, 0.0],
                [0.0, 1.0, 0.0, 1.0],
                [0.0, 0.0, 1.0, 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ]),
            observation: arr2(&[[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0]]),
            process_noise: Array2::eye(4) * PROCESS_NOISE,
            measurement_noise: Array2::eye(2) * MEASUREMENT_NOISE,
            confidence: 1.0,
        }
    }

    /// Advances the state by one frame.
    ///
    /// Confidence is left unchanged; it only moves on [`correct`](Self::correct)
    /// or [`mark_missed`](Self::mark_missed).
    pub fn predict(&mut self) -> Prediction {
        self.state = self.transition.dot(&self.state);
        self.covariance =
            self.transition.dot(&self.covariance).dot(&self.transition.t()) + &self.process_noise;
        Prediction {
            center: self.center(),
            confidence: self.confidence,
        }
    }

    /// Standard Kalman update with a measured center.
    ///
    /// `scale` normalizes the distance between the prior prediction and the
    /// measurement (the tracker passes the box diagonal). Returns that
    /// normalized prediction error.
    pub fn correct(&mut self, measurement: (f64, f64), scale: f64) -> f64 {
        let (px, py) = self.center();
        let error = (measurement.0 - px).hypot(measurement.1 - py) / scale.max(1.0);

        let innovation = arr1(&[measurement.0, measurement.1]) - self.observation.dot(&self.state);
        let innovation_cov = self
            .observation
            .dot(&self.covariance)
            .dot(&self.observation.t())
            + &self.measurement_noise;

        if let Some(inv) = invert_2x2(&innovation_cov) {
            let gain = self.covariance.dot(&self.observation.t()).dot(&inv);
            self.state = &self.state + &gain.dot(&innovation);
            let identity = Array2::<f64>::eye(4);
            self.covariance = (identity - gain.dot(&self.observation)).dot(&self.covariance);
        }

        self.confidence = if error <= LOW_ERROR {
            1.0 - error
        } else {
            self.confidence * (1.0 - error.min(MAX_DECAY))
        };
        error
    }

    /// Decays confidence for a frame where the track went unmatched.
    ///
    /// An absent correction is treated as a saturated prediction error.
    pub fn mark_missed(&mut self) {
        self.confidence *= 1.0 - MAX_DECAY;
    }

    pub fn center(&self) -> (f64, f64) {
        (self.state[0], self.state[1])
    }

    pub fn velocity(&self) -> (f64, f64) {
        (self.state[2], self.state[3])
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }
}

fn invert_2x2(m: &Array2<f64>) -> Option<Array2<f64>> {
    let (a, b, c, d) = (m[[0, 0]], m[[0, 1]], m[[1, 0]], m[[1, 1]]);
    let det = a * d - b * c;
    if det.abs() < 1e-12 {
        return None;
    }
    Some(arr2(&[[d, -b], [-c, a]]) / det)
}
