use std::path::Path;

use ort::execution_providers::ExecutionProviderDispatch;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;

use crate::detection::domain::face_detector::BackendError;

/// Opens an ONNX model for one worker thread.
///
/// Each pool worker owns its session, so inter-op parallelism is pinned to 1
/// and intra-op threads are split between workers by the caller.
pub fn open_session(model_path: &Path, intra_threads: usize) -> Result<Session, BackendError> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_inter_threads(1)?
        .with_intra_threads(intra_threads.max(1))?
        .with_execution_providers(preferred_execution_providers())?
        .commit_from_file(model_path)?;
    Ok(session)
}

/// Intra-op threads per worker when `workers` sessions share the machine.
pub fn threads_per_worker(workers: usize) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores / workers.max(1)).max(1)
}

/// Platform accelerator, if any. ONNX Runtime falls back to CPU when the
/// provider cannot be registered.
fn preferred_execution_providers() -> Vec<ExecutionProviderDispatch> {
    #[cfg(target_os = "macos")]
    {
        vec![ort::execution_providers::CoreMLExecutionProvider::default().build()]
    }
    #[cfg(target_os = "windows")]
    {
        vec![ort::execution_providers::DirectMLExecutionProvider::default().build()]
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        vec![]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threads_per_worker_never_zero() {
        assert!(threads_per_worker(0) >= 1);
        assert!(threads_per_worker(1) >= threads_per_worker(4));
        assert_eq!(threads_per_worker(usize::MAX), 1);
    }

    #[test]
    fn test_missing_model_is_error() {
        assert!(open_session(Path::new("/nonexistent/model.onnx"), 1).is_err());
    }
}
