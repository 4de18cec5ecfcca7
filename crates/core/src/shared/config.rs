use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::constants::APP_DIR_NAME;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Tunables for the whole pipeline.
///
/// Every field has a default, so a config file only needs to list the
/// options it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub num_detection_workers: usize,
    pub num_recognition_workers: usize,
    pub frame_buffer_capacity: usize,
    /// Spare buffers kept per frame shape for reuse.
    pub frame_pool_per_shape: usize,
    pub batch_size: usize,
    /// Pending detection requests beyond which new frames are skipped.
    /// Defaults to twice the detection worker count.
    pub input_queue_capacity: Option<usize>,
    pub recognition_queue_capacity: Option<usize>,
    /// How long a worker keeps collecting a batch after its first item.
    pub batch_timeout_ms: u64,
    /// Queue read timeout used by idle workers to re-check the shutdown flag.
    pub poll_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// How long one cycle waits for its frame's detections.
    pub detection_wait_ms: u64,
    pub max_worker_restarts: usize,

    pub iou_threshold: f64,
    pub max_tracking_age: u32,
    /// Consecutive misses after which a track is reported as lost.
    pub lost_threshold: u32,
    pub periodic_refresh_interval: u64,
    pub confidence_redetect_threshold: f64,

    pub recognition_threshold: f64,
    /// Frames after which a resolved identity is considered stale.
    pub recognition_refresh_interval: u64,

    pub verification_time_secs: f64,
    pub max_unknowns: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            num_detection_workers: 4,
            num_recognition_workers: 2,
            frame_buffer_capacity: 10,
            frame_pool_per_shape: 4,
            batch_size: 2,
            input_queue_capacity: None,
            recognition_queue_capacity: None,
            batch_timeout_ms: 5,
            poll_interval_ms: 100,
            shutdown_timeout_ms: 1000,
            detection_wait_ms: 500,
            max_worker_restarts: 3,
            iou_threshold: 0.3,
            max_tracking_age: 30,
            lost_threshold: 3,
            periodic_refresh_interval: 30,
            confidence_redetect_threshold: 0.6,
            recognition_threshold: 0.45,
            recognition_refresh_interval: 90,
            verification_time_secs: 10.0,
            max_unknowns: 10,
        }
    }
}

impl PipelineConfig {
    /// Platform config file location, e.g. `~/.config/PresenceTracker/pipeline.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR_NAME).join("pipeline.json"))
    }

    /// Loads and validates a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(write_err)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("num_detection_workers", self.num_detection_workers),
            ("num_recognition_workers", self.num_recognition_workers),
            ("frame_buffer_capacity", self.frame_buffer_capacity),
            ("batch_size", self.batch_size),
            ("max_unknowns", self.max_unknowns),
            (
                "input_queue_capacity",
                self.input_queue_capacity.unwrap_or(1),
            ),
            (
                "recognition_queue_capacity",
                self.recognition_queue_capacity.unwrap_or(1),
            ),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(invalid(field, "must be at least 1"));
            }
        }
        if self.periodic_refresh_interval == 0 {
            return Err(invalid("periodic_refresh_interval", "must be at least 1"));
        }
        let unit = [
            ("iou_threshold", self.iou_threshold),
            (
                "confidence_redetect_threshold",
                self.confidence_redetect_threshold,
            ),
            ("recognition_threshold", self.recognition_threshold),
        ];
        for (field, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(field, &format!("must be within 0.0-1.0, got {value}")));
            }
        }
        if !self.verification_time_secs.is_finite() || self.verification_time_secs < 0.0 {
            return Err(invalid(
                "verification_time_secs",
                "must be a non-negative number of seconds",
            ));
        }
        if self.lost_threshold > self.max_tracking_age {
            return Err(invalid(
                "lost_threshold",
                "must not exceed max_tracking_age",
            ));
        }
        Ok(())
    }

    pub fn detection_queue_capacity(&self) -> usize {
        self.input_queue_capacity
            .unwrap_or(2 * self.num_detection_workers)
    }

    pub fn recognition_queue_capacity(&self) -> usize {
        self.recognition_queue_capacity
            .unwrap_or(2 * self.num_recognition_workers)
    }

    pub fn verification_time(&self) -> Duration {
        Duration::from_secs_f64(self.verification_time_secs)
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.detection_queue_capacity(), 8);
        assert_eq!(config.recognition_queue_capacity(), 4);
        assert_eq!(config.verification_time(), Duration::from_secs(10));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = PipelineConfig::load(&tmp.path().join("absent.json")).unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_partial_file_overrides_only_listed_fields() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("pipeline.json");
        fs::write(&path, r#"{"num_detection_workers": 6, "input_queue_capacity": 30}"#).unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.num_detection_workers, 6);
        assert_eq!(config.detection_queue_capacity(), 30);
        assert_eq!(config.max_tracking_age, 30);
    }

    #[test]
    fn test_save_then_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("pipeline.json");
        let config = PipelineConfig {
            max_unknowns: 3,
            verification_time_secs: 2.5,
            ..PipelineConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(PipelineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("pipeline.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            PipelineConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[rstest]
    #[case::no_detection_workers(PipelineConfig { num_detection_workers: 0, ..PipelineConfig::default() }, "num_detection_workers")]
    #[case::zero_capacity(PipelineConfig { frame_buffer_capacity: 0, ..PipelineConfig::default() }, "frame_buffer_capacity")]
    #[case::zero_queue(PipelineConfig { input_queue_capacity: Some(0), ..PipelineConfig::default() }, "input_queue_capacity")]
    #[case::iou_above_one(PipelineConfig { iou_threshold: 1.5, ..PipelineConfig::default() }, "iou_threshold")]
    #[case::zero_refresh(PipelineConfig { periodic_refresh_interval: 0, ..PipelineConfig::default() }, "periodic_refresh_interval")]
    #[case::negative_dwell(PipelineConfig { verification_time_secs: -1.0, ..PipelineConfig::default() }, "verification_time_secs")]
    #[case::lost_after_removal(PipelineConfig { lost_threshold: 40, ..PipelineConfig::default() }, "lost_threshold")]
    fn test_validate_rejects(#[case] config: PipelineConfig, #[case] expected_field: &str) {
        match config.validate() {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, expected_field),
            other => panic!("expected invalid {expected_field}, got {other:?}"),
        }
    }
}
