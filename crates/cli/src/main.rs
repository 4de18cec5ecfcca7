use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;

use presence_core::capture::domain::camera_source::{CameraSource, CaptureError};
use presence_core::capture::frame_buffer::FrameBuffer;
use presence_core::capture::infrastructure::image_sequence_source::ImageSequenceSource;
use presence_core::detection::domain::face_detector::FaceDetector;
use presence_core::detection::infrastructure::onnx_yolo_detector::{
    OnnxYoloDetector, DEFAULT_CONFIDENCE,
};
use presence_core::pipeline::enroll_gallery_use_case::EnrollGalleryUseCase;
use presence_core::pipeline::infrastructure::detection_pool::DetectorFactory;
use presence_core::pipeline::infrastructure::recognition_pool::EmbedderFactory;
use presence_core::pipeline::pipeline_logger::{PipelineLogger, StdoutPipelineLogger};
use presence_core::pipeline::presence_pipeline::{PipelineBackends, PresencePipeline};
use presence_core::pipeline::sinks::{LogSink, PipelineSinks};
use presence_core::recognition::domain::face_embedder::FaceEmbedder;
use presence_core::recognition::domain::identity_store::IdentityStore;
use presence_core::recognition::infrastructure::onnx_arcface_embedder::OnnxArcFaceEmbedder;
use presence_core::shared::config::PipelineConfig;
use presence_core::shared::constants::{
    EMBEDDING_MODEL_NAME, EMBEDDING_MODEL_URL, YOLO_MODEL_NAME, YOLO_MODEL_URL,
};
use presence_core::shared::model_resolver;
use presence_core::shared::onnx_session::threads_per_worker;

/// Face tracking, recognition and presence confirmation over an image sequence.
#[derive(Parser)]
#[command(name = "presence")]
struct Cli {
    /// Directory of frames, replayed in file-name order.
    frames_dir: PathBuf,

    /// Pipeline config file (JSON). Defaults to the platform config location.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory of reference photos named after each person (`ada.jpg`).
    #[arg(long)]
    gallery: Option<PathBuf>,

    /// Frame rate used to timestamp the replayed frames.
    #[arg(long, default_value = "30")]
    fps: f64,

    /// Detection worker threads.
    #[arg(long)]
    detection_workers: Option<usize>,

    /// Recognition worker threads.
    #[arg(long)]
    recognition_workers: Option<usize>,

    /// Seconds a face must stay tracked before presence is confirmed.
    #[arg(long)]
    verification_secs: Option<f64>,

    /// Face detection confidence threshold (0.0-1.0).
    #[arg(long, default_value_t = DEFAULT_CONFIDENCE)]
    confidence: f64,
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    if !(0.0..=1.0).contains(&cli.confidence) {
        return Err(format!(
            "Confidence must be between 0.0 and 1.0, got {}",
            cli.confidence
        )
        .into());
    }

    let detector_model = resolve_model(YOLO_MODEL_NAME, YOLO_MODEL_URL)?;
    let embedder_model = resolve_model(EMBEDDING_MODEL_NAME, EMBEDDING_MODEL_URL)?;

    let mut store = IdentityStore::new(config.recognition_threshold);
    if let Some(gallery) = &cli.gallery {
        let threads = threads_per_worker(1);
        let detector = OnnxYoloDetector::new(&detector_model, cli.confidence, threads)
            .map_err(|e| -> Box<dyn std::error::Error> { e })?;
        let embedder = OnnxArcFaceEmbedder::new(&embedder_model, threads)
            .map_err(|e| -> Box<dyn std::error::Error> { e })?;
        let summary = EnrollGalleryUseCase::new(Box::new(detector), Box::new(embedder))
            .execute(gallery, &mut store)?;
        log::info!(
            "Gallery: {} references enrolled, {} images without a face",
            summary.enrolled.len(),
            summary.skipped.len()
        );
        log::info!("Enrolled identities: {}", store.names().join(", "));
    }

    let backends = PipelineBackends {
        detector_factory: detector_factory(
            detector_model,
            cli.confidence,
            threads_per_worker(config.num_detection_workers),
        ),
        embedder_factory: embedder_factory(
            embedder_model,
            threads_per_worker(config.num_recognition_workers),
        ),
        identity_store: store.into_shared(),
    };
    let sinks = PipelineSinks {
        tracks: Some(Box::new(LogSink)),
        presence: Some(Box::new(LogSink)),
        unknowns: Some(Box::new(LogSink)),
    };
    let logger = Arc::new(StdoutPipelineLogger::new());
    let mut pipeline = PresencePipeline::new(config, backends, sinks, logger.clone())?;

    let source = ImageSequenceSource::open(&cli.frames_dir, cli.fps)?;
    let total = source.len();
    let buffer = pipeline.frame_buffer();
    let capture = thread::Builder::new()
        .name("capture".into())
        .spawn(move || replay(source, &buffer))?;

    let mut processed = 0;
    while !capture.is_finished() || !pipeline.frame_buffer().is_empty() {
        let applied = pipeline.run_cycle()?.len();
        if applied > 0 {
            processed += applied;
            eprint!("\rProcessing frame {processed}/{total}");
        }
    }
    processed += pipeline.flush()?.len();
    eprintln!();

    let captured = capture.join().map_err(|_| "capture thread panicked")??;
    let status = pipeline.status();
    pipeline.shutdown();

    log::info!(
        "Captured {captured} frames, processed {processed}, dropped {} ({:.1}%)",
        status.frame_buffer.frames_dropped,
        status.frame_buffer.drop_ratio() * 100.0
    );
    log::debug!(
        "Frame storage: {} reused, {} allocated",
        status.frame_buffer.pool_hits,
        status.frame_buffer.pool_misses
    );
    let verified = status.presence.iter().filter(|(_, s)| s.verified).count();
    log::info!(
        "{} tracks live, {verified} presence-confirmed, {} unknown faces pending registration",
        status.tracks.len(),
        status.unknown_faces
    );
    logger.summary();
    Ok(())
}

/// Pushes every frame of `source` into the pipeline's buffer at the
/// source's frame rate, like a live camera would.
fn replay(mut source: ImageSequenceSource, buffer: &FrameBuffer) -> Result<usize, CaptureError> {
    let fps = source.fps().unwrap_or(30.0);
    let start = Instant::now();
    let mut count = 0;
    loop {
        let due = Duration::from_secs_f64(count as f64 / fps);
        if let Some(wait) = due.checked_sub(start.elapsed()) {
            thread::sleep(wait);
        }
        if source.capture_into(buffer)?.is_none() {
            return Ok(count);
        }
        count += 1;
    }
}

fn load_config(cli: &Cli) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    let path = cli.config.clone().or_else(PipelineConfig::default_path);
    let mut config = match path {
        Some(path) => PipelineConfig::load(&path)?,
        None => PipelineConfig::default(),
    };
    if let Some(n) = cli.detection_workers {
        config.num_detection_workers = n;
    }
    if let Some(n) = cli.recognition_workers {
        config.num_recognition_workers = n;
    }
    if let Some(secs) = cli.verification_secs {
        config.verification_time_secs = secs;
    }
    config.validate()?;
    Ok(config)
}

fn resolve_model(name: &str, url: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
    log::info!("Resolving model: {name}");
    let path = model_resolver::resolve(name, url, None, Some(Box::new(download_progress)))?;
    Ok(path)
}

fn detector_factory(model: PathBuf, confidence: f64, threads: usize) -> DetectorFactory {
    Arc::new(move |worker| {
        log::debug!("Loading detector for worker {worker}");
        let detector: Box<dyn FaceDetector> =
            Box::new(OnnxYoloDetector::new(&model, confidence, threads)?);
        Ok(detector)
    })
}

fn embedder_factory(model: PathBuf, threads: usize) -> EmbedderFactory {
    Arc::new(move |worker| {
        log::debug!("Loading embedder for worker {worker}");
        let embedder: Box<dyn FaceEmbedder> = Box::new(OnnxArcFaceEmbedder::new(&model, threads)?);
        Ok(embedder)
    })
}

fn download_progress(downloaded: u64, total: u64) {
    if total > 0 {
        let pct = (downloaded as f64 / total as f64 * 100.0) as u32;
        eprint!("\rDownloading model... {pct}%");
    } else {
        eprint!("\rDownloading model... {downloaded} bytes");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"{"num_detection_workers": 6, "max_unknowns": 3}"#).unwrap();

        let cli = Cli::parse_from([
            "presence",
            "frames",
            "--config",
            path.to_str().unwrap(),
            "--detection-workers",
            "2",
            "--verification-secs",
            "4.5",
        ]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.num_detection_workers, 2);
        assert_eq!(config.max_unknowns, 3);
        assert_eq!(config.verification_time_secs, 4.5);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let cli = Cli::parse_from([
            "presence",
            "frames",
            "--config",
            path.to_str().unwrap(),
            "--recognition-workers",
            "0",
        ]);
        assert!(load_config(&cli).is_err());
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["presence", "frames"]);
        assert_eq!(cli.fps, 30.0);
        assert_eq!(cli.confidence, DEFAULT_CONFIDENCE);
        assert!(cli.gallery.is_none());
    }
}
