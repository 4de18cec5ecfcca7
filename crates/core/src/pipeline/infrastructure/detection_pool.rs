use std::sync::Arc;
use std::time::{Duration, Instant};

use super::worker_pool::{
    PoolHealth, PoolSettings, PoolStats, ShutdownReport, StageFactory, Submission, WorkerPool,
    WorkerStage,
};
use crate::detection::domain::face_detector::{BackendError, Detection, FaceDetector};
use crate::pipeline::pipeline_error::PipelineError;
use crate::pipeline::pipeline_logger::PipelineLogger;
use crate::shared::config::PipelineConfig;
use crate::shared::frame::{Frame, FrameId};

pub const DETECTION_STAGE: &str = "detect";

/// Builds the detector for one worker.
pub type DetectorFactory =
    Arc<dyn Fn(usize) -> Result<Box<dyn FaceDetector>, BackendError> + Send + Sync>;

#[derive(Clone, Debug, PartialEq)]
pub enum DetectionOutcome {
    Detected(Vec<Detection>),
    Failed(String),
}

/// Detections for one frame, tagged with the frame they came from.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionResult {
    pub frame_id: FrameId,
    pub timestamp: Duration,
    pub outcome: DetectionOutcome,
    /// Time spent on the batch this frame was part of.
    pub elapsed: Duration,
}

pub struct DetectionStage {
    detector: Box<dyn FaceDetector>,
}

impl WorkerStage for DetectionStage {
    type Input = Arc<Frame>;
    type Output = DetectionResult;

    fn process(&mut self, batch: &[Arc<Frame>]) -> Result<Vec<DetectionResult>, BackendError> {
        let start = Instant::now();
        let frames: Vec<&Frame> = batch.iter().map(Arc::as_ref).collect();
        let per_frame = self.detector.detect(&frames)?;
        if per_frame.len() != batch.len() {
            return Err(format!(
                "detector returned {} results for {} frames",
                per_frame.len(),
                batch.len()
            )
            .into());
        }
        let elapsed = start.elapsed();
        Ok(batch
            .iter()
            .zip(per_frame)
            .map(|(frame, detections)| DetectionResult {
                frame_id: frame.frame_id(),
                timestamp: frame.timestamp(),
                outcome: DetectionOutcome::Detected(detections),
                elapsed,
            })
            .collect())
    }

    fn failure(frame: &Arc<Frame>, reason: &str) -> DetectionResult {
        DetectionResult {
            frame_id: frame.frame_id(),
            timestamp: frame.timestamp(),
            outcome: DetectionOutcome::Failed(reason.to_string()),
            elapsed: Duration::ZERO,
        }
    }
}

/// Parallel face detection over batches of frames.
pub struct DetectionPool {
    pool: WorkerPool<DetectionStage>,
}

impl DetectionPool {
    pub fn spawn(
        config: &PipelineConfig,
        factory: DetectorFactory,
        logger: Arc<dyn PipelineLogger>,
    ) -> Result<Self, PipelineError> {
        let settings = PoolSettings {
            name: DETECTION_STAGE,
            workers: config.num_detection_workers,
            queue_capacity: config.detection_queue_capacity(),
            batch_size: config.batch_size,
            batch_timeout: Duration::from_millis(config.batch_timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            shutdown_timeout: Duration::from_millis(config.shutdown_timeout_ms),
            max_restarts: config.max_worker_restarts,
        };
        let stage_factory: StageFactory<DetectionStage> =
            Arc::new(move |index| factory(index).map(|detector| DetectionStage { detector }));
        Ok(Self {
            pool: WorkerPool::spawn(settings, stage_factory, logger)?,
        })
    }

    /// Queues a frame for detection, skipping it if the queue is saturated.
    pub fn put_frame(&self, frame: Arc<Frame>) -> Submission {
        self.pool.submit(frame)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<DetectionResult> {
        self.pool.recv_timeout(timeout)
    }

    pub fn drain(&self) -> Vec<DetectionResult> {
        self.pool.drain()
    }

    pub fn pending(&self) -> usize {
        self.pool.pending()
    }

    pub fn health(&self) -> PoolHealth {
        self.pool.health()
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn shutdown(&mut self) -> ShutdownReport {
        self.pool.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::pipeline_logger::{NullPipelineLogger, StdoutPipelineLogger};
    use crate::shared::bbox::BoundingBox;

    /// Reports one face per frame at `x = frame_id`; fails on frame 13.
    struct FakeDetector;

    impl FaceDetector for FakeDetector {
        fn detect(&mut self, frames: &[&Frame]) -> Result<Vec<Vec<Detection>>, BackendError> {
            if frames.iter().any(|f| f.frame_id() == 13) {
                return Err("unlucky frame".into());
            }
            Ok(frames
                .iter()
                .map(|f| {
                    vec![Detection::new(
                        BoundingBox::new(f.frame_id() as f64, 0.0, 10.0, 10.0),
                        0.9,
                    )]
                })
                .collect())
        }
    }

    /// Drops the last result of every batch.
    struct ShortDetector;

    impl FaceDetector for ShortDetector {
        fn detect(&mut self, frames: &[&Frame]) -> Result<Vec<Vec<Detection>>, BackendError> {
            Ok(vec![Vec::new(); frames.len().saturating_sub(1)])
        }
    }

    fn frame(frame_id: FrameId) -> Arc<Frame> {
        Arc::new(Frame::new(
            vec![0u8; 4 * 4 * 3],
            4,
            4,
            3,
            frame_id,
            Duration::from_millis(frame_id * 10),
        ))
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            num_detection_workers: 2,
            batch_size: 2,
            poll_interval_ms: 10,
            ..PipelineConfig::default()
        }
    }

    fn collect(pool: &DetectionPool, n: usize) -> Vec<DetectionResult> {
        let mut results: Vec<_> = (0..n)
            .filter_map(|_| pool.recv_timeout(Duration::from_secs(2)))
            .collect();
        results.sort_by_key(|r| r.frame_id);
        results
    }

    #[test]
    fn test_results_tagged_with_frame_id() {
        let factory: DetectorFactory = Arc::new(|_| Ok(Box::new(FakeDetector)));
        let logger = Arc::new(StdoutPipelineLogger::new());
        let mut pool = DetectionPool::spawn(&config(), factory, logger.clone()).unwrap();
        for id in 0..5 {
            assert_eq!(pool.put_frame(frame(id)), Submission::Accepted);
        }
        let results = collect(&pool, 5);
        for (id, result) in results.iter().enumerate() {
            assert_eq!(result.frame_id, id as FrameId);
            assert_eq!(result.timestamp, Duration::from_millis(id as u64 * 10));
            match &result.outcome {
                DetectionOutcome::Detected(d) => assert_eq!(d[0].bbox.x, id as f64),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(logger.timings_for(DETECTION_STAGE).is_some());
        assert_eq!(pool.shutdown().detached, 0);
    }

    #[test]
    fn test_detector_error_marks_frames_failed() {
        let factory: DetectorFactory = Arc::new(|_| Ok(Box::new(FakeDetector)));
        let cfg = PipelineConfig {
            num_detection_workers: 1,
            batch_size: 1,
            ..config()
        };
        let pool = DetectionPool::spawn(&cfg, factory, Arc::new(NullPipelineLogger)).unwrap();
        pool.put_frame(frame(13));
        pool.put_frame(frame(14));
        let results = collect(&pool, 2);
        assert!(matches!(results[0].outcome, DetectionOutcome::Failed(_)));
        assert!(matches!(results[1].outcome, DetectionOutcome::Detected(_)));
        assert_eq!(pool.stats().failed, 1);
    }

    #[test]
    fn test_result_count_mismatch_is_failure() {
        let factory: DetectorFactory = Arc::new(|_| Ok(Box::new(ShortDetector)));
        let cfg = PipelineConfig {
            num_detection_workers: 1,
            batch_size: 1,
            ..config()
        };
        let pool = DetectionPool::spawn(&cfg, factory, Arc::new(NullPipelineLogger)).unwrap();
        pool.put_frame(frame(0));
        let result = pool.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(result.outcome, DetectionOutcome::Failed(_)));
    }

    #[test]
    fn test_backend_construction_error() {
        let factory: DetectorFactory = Arc::new(|_| Err("model missing".into()));
        let result = DetectionPool::spawn(&config(), factory, Arc::new(NullPipelineLogger));
        assert!(matches!(
            result,
            Err(PipelineError::Backend { pool: DETECTION_STAGE, .. })
        ));
    }
}
