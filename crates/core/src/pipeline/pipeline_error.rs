use thiserror::Error;

use crate::detection::domain::face_detector::BackendError;
use crate::shared::config::ConfigError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn {pool} worker: {source}")]
    Spawn {
        pool: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create {pool} backend: {source}")]
    Backend {
        pool: &'static str,
        #[source]
        source: BackendError,
    },
    #[error("{pool} pool exhausted: every worker died and used up its restarts")]
    PoolExhausted { pool: &'static str },
    #[error("pipeline has been shut down")]
    ShutDown,
    #[error("no unknown face with id {0}")]
    UnknownFaceNotFound(u64),
}
