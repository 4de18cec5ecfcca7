use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use super::worker_pool::{
    PoolHealth, PoolSettings, PoolStats, ShutdownReport, StageFactory, Submission, WorkerPool,
    WorkerStage,
};
use crate::detection::domain::face_detector::BackendError;
use crate::pipeline::pipeline_error::PipelineError;
use crate::pipeline::pipeline_logger::PipelineLogger;
use crate::recognition::domain::face_embedder::FaceEmbedder;
use crate::recognition::domain::identity_store::SharedIdentityStore;
use crate::shared::config::PipelineConfig;
use crate::shared::frame::{Frame, FrameId};
use crate::shared::identity::Identity;
use crate::tracking::track::TrackId;

pub const RECOGNITION_STAGE: &str = "recognize";

/// Builds the embedder for one worker.
pub type EmbedderFactory =
    Arc<dyn Fn(usize) -> Result<Box<dyn FaceEmbedder>, BackendError> + Send + Sync>;

/// What to recognize: a face crop still to be embedded, or a ready embedding.
#[derive(Clone, Debug)]
pub enum FaceSample {
    Crop(Frame),
    Embedding(Vec<f32>),
}

#[derive(Clone, Debug)]
pub struct RecognitionRequest {
    pub track_id: TrackId,
    pub frame_id: FrameId,
    pub sample: FaceSample,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RecognitionOutcome {
    Matched {
        identity: Identity,
        score: f64,
        embedding: Vec<f32>,
    },
    Failed(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecognitionResult {
    pub track_id: TrackId,
    pub frame_id: FrameId,
    pub outcome: RecognitionOutcome,
    pub elapsed: Duration,
}

pub struct RecognitionStage {
    embedder: Box<dyn FaceEmbedder>,
    store: SharedIdentityStore,
}

impl RecognitionStage {
    fn recognize(&mut self, request: &RecognitionRequest) -> RecognitionResult {
        let start = Instant::now();
        let embedding = match &request.sample {
            FaceSample::Embedding(e) => Ok(e.clone()),
            FaceSample::Crop(crop) => self.embedder.embed(crop),
        };
        let outcome = match embedding {
            Ok(embedding) => {
                // Read lock only around the comparison, never around the model.
                let matched = self
                    .store
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .compare(&embedding);
                RecognitionOutcome::Matched {
                    identity: matched.identity,
                    score: matched.score,
                    embedding,
                }
            }
            Err(e) => {
                log::warn!("Embedding failed for track {}: {e}", request.track_id);
                RecognitionOutcome::Failed(e.to_string())
            }
        };
        RecognitionResult {
            track_id: request.track_id,
            frame_id: request.frame_id,
            outcome,
            elapsed: start.elapsed(),
        }
    }
}

impl WorkerStage for RecognitionStage {
    type Input = RecognitionRequest;
    type Output = RecognitionResult;

    fn process(
        &mut self,
        batch: &[RecognitionRequest],
    ) -> Result<Vec<RecognitionResult>, BackendError> {
        Ok(batch.iter().map(|r| self.recognize(r)).collect())
    }

    fn failure(request: &RecognitionRequest, reason: &str) -> RecognitionResult {
        RecognitionResult {
            track_id: request.track_id,
            frame_id: request.frame_id,
            outcome: RecognitionOutcome::Failed(reason.to_string()),
            elapsed: Duration::ZERO,
        }
    }
}

/// Parallel identity resolution for face crops.
///
/// All workers read the shared identity store concurrently; enrollment
/// takes the write lock between comparisons.
pub struct RecognitionPool {
    pool: WorkerPool<RecognitionStage>,
    store: SharedIdentityStore,
}

impl RecognitionPool {
    pub fn spawn(
        config: &PipelineConfig,
        factory: EmbedderFactory,
        store: SharedIdentityStore,
        logger: Arc<dyn PipelineLogger>,
    ) -> Result<Self, PipelineError> {
        let settings = PoolSettings {
            name: RECOGNITION_STAGE,
            workers: config.num_recognition_workers,
            queue_capacity: config.recognition_queue_capacity(),
            batch_size: config.batch_size,
            batch_timeout: Duration::from_millis(config.batch_timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            shutdown_timeout: Duration::from_millis(config.shutdown_timeout_ms),
            max_restarts: config.max_worker_restarts,
        };
        let worker_store = store.clone();
        let stage_factory: StageFactory<RecognitionStage> = Arc::new(move |index| {
            factory(index).map(|embedder| RecognitionStage {
                embedder,
                store: worker_store.clone(),
            })
        });
        Ok(Self {
            pool: WorkerPool::spawn(settings, stage_factory, logger)?,
            store,
        })
    }

    pub fn submit(&self, request: RecognitionRequest) -> Submission {
        self.pool.submit(request)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<RecognitionResult> {
        self.pool.recv_timeout(timeout)
    }

    pub fn drain(&self) -> Vec<RecognitionResult> {
        self.pool.drain()
    }

    pub fn store(&self) -> &SharedIdentityStore {
        &self.store
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
