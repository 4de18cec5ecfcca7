use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

/// Counter that drives the throughput line of the summary.
pub const FRAMES_COUNTER: &str = "frames";

/// Metrics context for pipeline stages.
///
/// Passed explicitly (as `Arc<dyn PipelineLogger>`) to the worker pools and
/// the orchestrator, which report from several threads at once; all
/// methods therefore take `&self`.
pub trait PipelineLogger: Send + Sync {
    /// Record how long a named stage took for one unit of work.
    fn timing(&self, stage: &str, duration_ms: f64);

    /// Record a point-in-time metric (e.g. queue depth, track count).
    fn metric(&self, name: &str, value: f64);

    /// Increment a named counter.
    fn count(&self, name: &str, delta: u64);

    /// Log a human-readable status message.
    fn info(&self, message: &str);

    /// Emit an end-of-run summary. Default: no-op.
    fn summary(&self) {}
}

/// Silent logger that discards all events. Used by tests and embedders that
/// collect their own metrics.
pub struct NullPipelineLogger;

impl PipelineLogger for NullPipelineLogger {
    fn timing(&self, _stage: &str, _duration_ms: f64) {}
    fn metric(&self, _name: &str, _value: f64) {}
    fn count(&self, _name: &str, _delta: u64) {}
    fn info(&self, _message: &str) {}
}

#[derive(Default)]
struct Recorded {
    timings: HashMap<String, Vec<f64>>,
    metrics: HashMap<String, Vec<f64>>,
    counters: HashMap<String, u64>,
    messages: Vec<String>,
}

/// CLI-oriented logger that aggregates per-stage timings, metrics and
/// counters and prints a summary when the run ends.
pub struct StdoutPipelineLogger {
    start_time: Instant,
    recorded: Mutex<Recorded>,
}

impl StdoutPipelineLogger {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            recorded: Mutex::new(Recorded::default()),
        }
    }

    /// Returns the formatted summary string, or `None` if no data recorded.
    pub fn summary_string(&self) -> Option<String> {
        let recorded = self.lock();
        if recorded.timings.is_empty() && recorded.metrics.is_empty() && recorded.counters.is_empty()
        {
            return None;
        }

        let elapsed_ms = self.start_time.elapsed().as_secs_f64() * 1000.0;
        let frames = recorded.counters.get(FRAMES_COUNTER).copied().unwrap_or(0);
        let mut lines = vec![format!(
            "Pipeline summary ({frames} frames, {:.1}s total):",
            elapsed_ms / 1000.0
        )];

        let mut stages: Vec<_> = recorded.timings.keys().collect();
        stages.sort();
        for stage in stages {
            let durations = &recorded.timings[stage];
            let total_ms: f64 = durations.iter().sum();
            let avg_ms = mean(durations);
            lines.push(format!(
                "  {stage:12}: avg {avg_ms:6.1}ms  total {total_ms:7.0}ms  ({} calls)",
                durations.len()
            ));
        }

        let mut metric_names: Vec<_> = recorded.metrics.keys().collect();
        metric_names.sort();
        for name in metric_names {
            let values = &recorded.metrics[name];
            let max = values.iter().copied().fold(f64::MIN, f64::max);
            lines.push(format!("  {name}: avg {:.1}  max {max:.1}", mean(values)));
        }

        let mut counter_names: Vec<_> = recorded.counters.keys().collect();
        counter_names.sort();
        for name in counter_names {
            lines.push(format!("  {name}: {}", recorded.counters[name]));
        }

        if frames > 0 && elapsed_ms > 0.0 {
            let fps = frames as f64 / (elapsed_ms / 1000.0);
            lines.push(format!("  Throughput: {fps:.1} fps"));
        }

        Some(lines.join("\n"))
    }

    /// Returns the timing data for a given stage.
    pub fn timings_for(&self, stage: &str) -> Option<Vec<f64>> {
        self.lock().timings.get(stage).cloned()
    }

    /// Returns the metric data for a given name.
    pub fn metrics_for(&self, name: &str) -> Option<Vec<f64>> {
        self.lock().metrics.get(name).cloned()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.lock().counters.get(name).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for StdoutPipelineLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineLogger for StdoutPipelineLogger {
    fn timing(&self, stage: &str, duration_ms: f64) {
        self.lock()
            .timings
            .entry(stage.to_string())
            .or_default()
            .push(duration_ms);
    }

    fn metric(&self, name: &str, value: f64) {
        self.lock()
            .metrics
            .entry(name.to_string())
            .or_default()
            .push(value);
    }

    fn count(&self, name: &str, delta: u64) {
        *self.lock().counters.entry(name.to_string()).or_default() += delta;
    }

    fn info(&self, message: &str) {
        self.lock().messages.push(message.to_string());
        log::info!("{message}");
    }

    fn summary(&self) {
        if let Some(text) = self.summary_string() {
            log::info!("\n\n{text}");
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
