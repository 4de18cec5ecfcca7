use std::collections::VecDeque;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::infrastructure::detection_pool::{
    DetectionOutcome, DetectionPool, DetectionResult, DetectorFactory,
};
use super::infrastructure::recognition_pool::{
    EmbedderFactory, FaceSample, RecognitionOutcome, RecognitionPool, RecognitionRequest,
};
use super::infrastructure::worker_pool::{PoolHealth, PoolStats, ShutdownReport, Submission};
use super::pipeline_error::PipelineError;
use super::pipeline_logger::{PipelineLogger, FRAMES_COUNTER};
use super::sinks::{PipelineSinks, PresenceConfirmed};
use crate::capture::frame_buffer::{FrameBuffer, FrameBufferStats};
use crate::detection::domain::face_detector::Detection;
use crate::recognition::domain::identity_store::SharedIdentityStore;
use crate::recognition::domain::unknown_face_pool::{UnknownFace, UnknownFacePool};
use crate::shared::config::PipelineConfig;
use crate::shared::frame::{Frame, FrameId};
use crate::shared::identity::Identity;
use crate::tracking::face_tracker::{FaceTracker, TrackerConfig, TrackerUpdate};
use crate::tracking::presence_verifier::{PresenceState, PresenceVerifier};
use crate::tracking::track::{TrackId, TrackSnapshot, TrackState};

/// Model backends wired in at startup.
pub struct PipelineBackends {
    pub detector_factory: DetectorFactory,
    pub embedder_factory: EmbedderFactory,
    pub identity_store: SharedIdentityStore,
}

/// How a cycle obtained (or did not obtain) detections for its frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DetectionStatus {
    Detected,
    /// Tracks were confident and the frame was not a refresh frame.
    SkippedByPolicy,
    /// The detection queue was saturated.
    SkippedByBackpressure,
    TimedOut,
    Failed,
    /// The frame was not newer than the last processed one.
    StaleFrame,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CycleReport {
    pub frame_id: FrameId,
    pub detection: DetectionStatus,
    pub tracks: usize,
    pub presence_events: Vec<PresenceConfirmed>,
    pub recognition_requests: usize,
    /// Detection or recognition results dropped because they were outdated.
    pub stale_results: usize,
    pub detection_health: PoolHealth,
    pub recognition_health: PoolHealth,
}

#[derive(Clone, Debug)]
pub struct PipelineStatus {
    pub frame_buffer: FrameBufferStats,
    pub detection: PoolStats,
    pub recognition: PoolStats,
    pub detection_health: PoolHealth,
    pub recognition_health: PoolHealth,
    pub tracks: Vec<TrackSnapshot>,
    pub presence: Vec<(TrackId, PresenceState)>,
    pub unknown_faces: usize,
}

/// Detection progress of one admitted frame.
enum FrameState {
    /// The tracker was lagging when the frame arrived; detection is decided
    /// once every earlier frame has been applied.
    Undecided,
    Awaiting { deadline: Instant },
    Ready {
        status: DetectionStatus,
        detections: Vec<Detection>,
    },
}

impl FrameState {
    fn ready(status: DetectionStatus) -> Self {
        FrameState::Ready {
            status,
            detections: Vec::new(),
        }
    }
}

struct InFlight {
    frame: Arc<Frame>,
    state: FrameState,
}

/// Turns a stream of frames into identified, presence-confirmed tracks.
///
/// Capture pushes frames into the shared [`FrameBuffer`] (directly or via
/// [`submit_frame`](Self::submit_frame)); the owner calls
/// [`run_cycle`](Self::run_cycle) in a loop. Each cycle admits at most one
/// new frame and submits it for detection, so up to the detection queue
/// capacity of frames are in flight across the worker pool at once. Frames
/// are applied to the tracker strictly in `frame_id` order as their
/// detections arrive: tracker update, recognition dispatch, recognition
/// results, presence.
pub struct PresencePipeline {
    config: PipelineConfig,
    frame_buffer: Arc<FrameBuffer>,
    detection: DetectionPool,
    recognition: RecognitionPool,
    tracker: FaceTracker,
    verifier: PresenceVerifier,
    unknowns: UnknownFacePool,
    sinks: PipelineSinks,
    logger: Arc<dyn PipelineLogger>,
    in_flight: VecDeque<InFlight>,
    window: usize,
    /// Outdated results seen since the last applied frame.
    stale_results: usize,
    health: (PoolHealth, PoolHealth),
    shut_down: bool,
}

impl PresencePipeline {
    pub fn new(
        config: PipelineConfig,
        backends: PipelineBackends,
        sinks: PipelineSinks,
        logger: Arc<dyn PipelineLogger>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let detection = DetectionPool::spawn(&config, backends.detector_factory, logger.clone())?;
        let recognition = RecognitionPool::spawn(
            &config,
            backends.embedder_factory,
            backends.identity_store,
            logger.clone(),
        )?;
        logger.info(&format!(
            "Pipeline started: {} detection / {} recognition workers",
            config.num_detection_workers, config.num_recognition_workers
        ));

        Ok(Self {
            frame_buffer: Arc::new(FrameBuffer::new(
                config.frame_buffer_capacity,
                config.frame_pool_per_shape,
            )),
            tracker: FaceTracker::new(TrackerConfig::from(&config)),
            verifier: PresenceVerifier::new(config.verification_time()),
            unknowns: UnknownFacePool::new(config.max_unknowns),
            detection,
            recognition,
            sinks,
            logger,
            in_flight: VecDeque::new(),
            window: config.detection_queue_capacity().max(1),
            stale_results: 0,
            health: (PoolHealth::Healthy, PoolHealth::Healthy),
            shut_down: false,
            config,
        })
    }

    /// Handle for a capture thread to push frames directly.
    pub fn frame_buffer(&self) -> Arc<FrameBuffer> {
        self.frame_buffer.clone()
    }

    /// Queues a captured frame. See [`FrameBuffer::put`].
    pub fn submit_frame(&self, frame: Frame) -> bool {
        self.frame_buffer.put(frame)
    }

    /// Admits the next buffered frame and applies every frame whose
    /// detections are settled.
    ///
    /// Returns one report per applied frame, in `frame_id` order, plus a
    /// report for an out-of-order frame rejected on admission. An empty
    /// result means nothing settled within the poll interval.
    pub fn run_cycle(&mut self) -> Result<Vec<CycleReport>, PipelineError> {
        if self.shut_down {
            return Err(PipelineError::ShutDown);
        }
        self.health = self.check_health()?;
        let poll = Duration::from_millis(self.config.poll_interval_ms);

        let mut reports = Vec::new();
        let mut admitted = false;
        if self.in_flight.len() < self.window {
            let next = if self.in_flight.is_empty() {
                self.frame_buffer.get(poll)
            } else {
                self.frame_buffer.try_get()
            };
            if let Some(frame) = next {
                admitted = true;
                reports.extend(self.admit(frame));
            }
        }

        self.collect_detections();
        if !admitted {
            self.wait_for_head(poll);
        }
        self.complete_ready(&mut reports);
        Ok(reports)
    }

    /// Blocks until every admitted frame has been applied, each bounded by
    /// `detection_wait_ms`. Returns their reports in `frame_id` order.
    pub fn flush(&mut self) -> Result<Vec<CycleReport>, PipelineError> {
        if self.shut_down {
            return Err(PipelineError::ShutDown);
        }
        let wait = Duration::from_millis(self.config.detection_wait_ms);
        let mut reports = Vec::new();
        loop {
            self.collect_detections();
            self.complete_ready(&mut reports);
            if self.in_flight.is_empty() {
                return Ok(reports);
            }
            self.health = self.check_health()?;
            self.wait_for_head(wait);
        }
    }

    /// Frames admitted but not yet applied to the tracker.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Pooled unknown faces, oldest first.
    pub fn unknown_faces(&self) -> Vec<UnknownFace> {
        self.unknowns.snapshot()
    }

    /// Enrolls a pooled unknown face under `name`, removes it from the pool
    /// and relabels its track if still live.
    pub fn register_unknown(&mut self, face_id: TrackId, name: &str) -> Result<(), PipelineError> {
        let face = self
            .unknowns
            .remove(face_id)
            .ok_or(PipelineError::UnknownFaceNotFound(face_id))?;
        self.recognition
            .store()
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .enroll(name, face.embedding);
        self.tracker
            .relabel(face_id, Identity::Known(name.to_string()));
        if let Some(sink) = self.sinks.unknowns.as_mut() {
            sink.on_unknown_removed(face_id);
        }
        self.logger
            .info(&format!("Registered unknown face {face_id} as {name}"));
        Ok(())
    }

    /// Drops a pooled unknown face without enrolling it.
    pub fn dismiss_unknown(&mut self, face_id: TrackId) -> bool {
        let removed = self.unknowns.remove(face_id).is_some();
        if removed {
            if let Some(sink) = self.sinks.unknowns.as_mut() {
                sink.on_unknown_removed(face_id);
            }
        }
        removed
    }

    /// Removes an enrolled identity. Live tracks carrying it lose their
    /// label and are recognized again on their next match.
    pub fn remove_identity(&mut self, name: &str) -> bool {
        let removed = self
            .recognition
            .store()
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        if removed {
            let cleared = self
                .tracker
                .forget_identity(&Identity::Known(name.to_string()));
            self.logger.info(&format!(
                "Removed identity {name} ({} live tracks relabeled)",
                cleared.len()
            ));
        }
        removed
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            frame_buffer: self.frame_buffer.stats(),
            detection: self.detection.stats(),
            recognition: self.recognition.stats(),
            detection_health: self.detection.health(),
            recognition_health: self.recognition.health(),
            tracks: self.tracker.snapshots(),
            presence: self.verifier.statuses(),
            unknown_faces: self.unknowns.len(),
        }
    }

    pub fn tracker(&self) -> &FaceTracker {
        &self.tracker
    }

    pub fn verifier(&self) -> &PresenceVerifier {
        &self.verifier
    }

    pub fn identity_store(&self) -> &SharedIdentityStore {
        self.recognition.store()
    }

    /// Stops both pools (bounded by `shutdown_timeout_ms` each) and drops
    /// buffered and in-flight frames. Later cycles fail with
    /// [`PipelineError::ShutDown`].
    pub fn shutdown(&mut self) -> (ShutdownReport, ShutdownReport) {
        if self.shut_down {
            return (ShutdownReport::default(), ShutdownReport::default());
        }
        self.shut_down = true;
        self.frame_buffer.clear();
        self.in_flight.clear();
        let detection = self.detection.shutdown();
        let recognition = self.recognition.shutdown();
        self.logger.info(&format!(
            "Pipeline stopped ({} detection / {} recognition workers detached)",
            detection.detached, recognition.detached
        ));
        (detection, recognition)
    }

    fn check_health(&self) -> Result<(PoolHealth, PoolHealth), PipelineError> {
        let detection = self.detection.health();
        let recognition = self.recognition.health();
        if detection == PoolHealth::Exhausted {
            return Err(PipelineError::PoolExhausted { pool: "detection" });
        }
        if recognition == PoolHealth::Exhausted {
            return Err(PipelineError::PoolExhausted {
                pool: "recognition",
            });
        }
        if (detection, recognition) != self.health {
            for (name, health) in [("detection", detection), ("recognition", recognition)] {
                if let PoolHealth::Degraded { alive, total } = health {
                    log::warn!("{name} pool degraded: {alive}/{total} workers alive");
                }
            }
        }
        Ok((detection, recognition))
    }

    /// Queues `frame` behind the frames already in flight. An out-of-order
    /// frame is rejected with a [`DetectionStatus::StaleFrame`] report.
    fn admit(&mut self, frame: Frame) -> Option<CycleReport> {
        let frame_id = frame.frame_id();
        let newest = self
            .in_flight
            .back()
            .map(|f| f.frame.frame_id())
            .or(self.tracker.last_frame());
        if newest.is_some_and(|last| frame_id <= last) {
            log::debug!("Skipping out-of-order frame {frame_id}");
            self.frame_buffer.recycle(frame);
            return Some(self.report(frame_id, DetectionStatus::StaleFrame, 0));
        }

        let frame = Arc::new(frame);
        // Submitting early on a lagging tracker at worst runs one detection
        // the policy would have skipped.
        let state = if self.tracker.should_detect(frame_id) {
            self.submit_detection(&frame)
        } else if self.in_flight.is_empty() {
            FrameState::ready(DetectionStatus::SkippedByPolicy)
        } else {
            FrameState::Undecided
        };
        self.in_flight.push_back(InFlight { frame, state });
        None
    }

    fn submit_detection(&self, frame: &Arc<Frame>) -> FrameState {
        match self.detection.put_frame(frame.clone()) {
            Submission::Accepted => FrameState::Awaiting {
                deadline: Instant::now() + Duration::from_millis(self.config.detection_wait_ms),
            },
            Submission::Skipped => {
                self.logger.count("detection_skipped", 1);
                FrameState::ready(DetectionStatus::SkippedByBackpressure)
            }
            Submission::Closed => FrameState::ready(DetectionStatus::Failed),
        }
    }

    fn collect_detections(&mut self) {
        for result in self.detection.drain() {
            self.receive(result);
        }
    }

    /// Waits up to `budget` for the oldest in-flight frame's detections.
    fn wait_for_head(&mut self, budget: Duration) {
        let until = Instant::now() + budget;
        while let Some(deadline) = self.head_deadline() {
            let remaining = deadline.min(until).saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            match self.detection.recv_timeout(remaining) {
                Some(result) => self.receive(result),
                None => return,
            }
        }
    }

    fn head_deadline(&self) -> Option<Instant> {
        match self.in_flight.front()?.state {
            FrameState::Awaiting { deadline } => Some(deadline),
            _ => None,
        }
    }

    /// Settles the in-flight frame `result` belongs to. Results for frames
    /// no longer awaited (timed out earlier) are counted as stale.
    fn receive(&mut self, result: DetectionResult) {
        let entry = self.in_flight.iter_mut().find(|f| {
            f.frame.frame_id() == result.frame_id
                && matches!(f.state, FrameState::Awaiting { .. })
        });
        let Some(entry) = entry else {
            log::debug!("Discarding late detections for frame {}", result.frame_id);
            self.stale_results += 1;
            return;
        };
        entry.state = match result.outcome {
            DetectionOutcome::Detected(detections) => FrameState::Ready {
                status: DetectionStatus::Detected,
                detections,
            },
            DetectionOutcome::Failed(reason) => {
                log::warn!("Detection failed for frame {}: {reason}", result.frame_id);
                FrameState::ready(DetectionStatus::Failed)
            }
        };
    }

    /// Applies in-flight frames from the front for as long as they are
    /// settled, deciding detection for frames that waited on the tracker.
    fn complete_ready(&mut self, reports: &mut Vec<CycleReport>) {
        loop {
            let Some(head) = self.in_flight.front() else {
                return;
            };
            let frame_id = head.frame.frame_id();
            let settled = match head.state {
                FrameState::Ready { .. } => None,
                FrameState::Undecided => Some(if self.tracker.should_detect(frame_id) {
                    let frame = head.frame.clone();
                    self.submit_detection(&frame)
                } else {
                    FrameState::ready(DetectionStatus::SkippedByPolicy)
                }),
                FrameState::Awaiting { deadline } if Instant::now() >= deadline => {
                    log::debug!("Detection for frame {frame_id} timed out");
                    Some(FrameState::ready(DetectionStatus::TimedOut))
                }
                FrameState::Awaiting { .. } => return,
            };
            if let Some(state) = settled {
                if let Some(head) = self.in_flight.front_mut() {
                    head.state = state;
                }
                continue;
            }
            if let Some(InFlight {
                frame,
                state: FrameState::Ready { status, detections },
            }) = self.in_flight.pop_front()
            {
                reports.push(self.apply_frame(frame, status, &detections));
            }
        }
    }

    /// Runs the tracker, recognition and presence steps for one frame.
    fn apply_frame(
        &mut self,
        frame: Arc<Frame>,
        status: DetectionStatus,
        detections: &[Detection],
    ) -> CycleReport {
        let started = Instant::now();
        let frame_id = frame.frame_id();
        let timestamp = frame.timestamp();
        let stale = std::mem::take(&mut self.stale_results);
        let mut report = self.report(frame_id, status, stale);

        let update = match status {
            DetectionStatus::Detected => self.tracker.update(frame_id, timestamp, detections),
            DetectionStatus::Failed | DetectionStatus::TimedOut => {
                self.tracker.miss(frame_id, timestamp)
            }
            DetectionStatus::SkippedByPolicy
            | DetectionStatus::SkippedByBackpressure
            | DetectionStatus::StaleFrame => self.tracker.coast(frame_id),
        };
        let update = update.unwrap_or_default();

        report.recognition_requests = self.dispatch_recognition(&frame);
        report.stale_results += self.apply_recognition_results();
        report.presence_events = self.check_presence(timestamp);
        self.forget_removed(&update);

        let snapshots = self.tracker.snapshots();
        report.tracks = snapshots.len();
        if let Some(sink) = self.sinks.tracks.as_mut() {
            sink.on_tracks(frame_id, timestamp, &snapshots);
        }

        self.logger.count(FRAMES_COUNTER, 1);
        self.logger
            .timing("cycle", started.elapsed().as_secs_f64() * 1000.0);
        self.logger.metric("tracks", snapshots.len() as f64);
        self.logger
            .metric("frames_in_flight", self.in_flight.len() as f64);
        self.logger
            .metric("detection_queue_depth", self.detection.pending() as f64);
        self.recycle(frame);
        report
    }

    fn report(&self, frame_id: FrameId, detection: DetectionStatus, stale: usize) -> CycleReport {
        CycleReport {
            frame_id,
            detection,
            tracks: self.tracker.len(),
            presence_events: Vec::new(),
            recognition_requests: 0,
            stale_results: stale,
            detection_health: self.health.0,
            recognition_health: self.health.1,
        }
    }

    fn dispatch_recognition(&mut self, frame: &Frame) -> usize {
        let mut submitted = 0;
        for track_id in self.tracker.tracks_needing_recognition(frame.frame_id()) {
            let Some(track) = self.tracker.get(track_id) else {
                continue;
            };
            let Some(crop) = frame.crop(&track.bbox()) else {
                continue;
            };
            let request = RecognitionRequest {
                track_id,
                frame_id: frame.frame_id(),
                sample: FaceSample::Crop(crop),
            };
            match self.recognition.submit(request) {
                Submission::Accepted => {
                    self.tracker.mark_recognition_pending(track_id, true);
                    submitted += 1;
                }
                Submission::Skipped => self.logger.count("recognition_skipped", 1),
                Submission::Closed => break,
            }
        }
        submitted
    }

    /// Applies every finished recognition result. Returns how many were stale.
    fn apply_recognition_results(&mut self) -> usize {
        let mut stale = 0;
        for result in self.recognition.drain() {
            let (identity, embedding) = match result.outcome {
                RecognitionOutcome::Matched {
                    identity,
                    embedding,
                    ..
                } => (identity, embedding),
                RecognitionOutcome::Failed(_) => {
                    self.tracker.mark_recognition_pending(result.track_id, false);
                    continue;
                }
            };
            if !self
                .tracker
                .apply_recognition(result.track_id, identity.clone(), result.frame_id)
            {
                stale += 1;
                continue;
            }
            match identity {
                Identity::Unknown => self.pool_unknown(result.track_id, embedding),
                Identity::Known(_) => {
                    if self.unknowns.remove(result.track_id).is_some() {
                        if let Some(sink) = self.sinks.unknowns.as_mut() {
                            sink.on_unknown_removed(result.track_id);
                        }
                    }
                }
            }
        }
        stale
    }

    fn pool_unknown(&mut self, track_id: TrackId, embedding: Vec<f32>) {
        let Some(first_seen) = self.tracker.get(track_id).map(|t| t.first_seen()) else {
            return;
        };
        let is_new = !self.unknowns.contains(track_id);
        let evicted = self.unknowns.insert(track_id, embedding, first_seen);
        let Some(sink) = self.sinks.unknowns.as_mut() else {
            return;
        };
        if let Some(evicted) = evicted {
            sink.on_unknown_removed(evicted.face_id);
        }
        if is_new {
            if let Some(face) = self.unknowns.get(track_id) {
                sink.on_unknown_added(face);
            }
        }
    }

    fn check_presence(&mut self, now: Duration) -> Vec<PresenceConfirmed> {
        let mut events = Vec::new();
        for track in self.tracker.tracks() {
            if track.state() != TrackState::Confirmed {
                continue;
            }
            if self.verifier.observe(track.id(), now) {
                events.push(PresenceConfirmed {
                    track_id: track.id(),
                    identity: track.identity().cloned(),
                    timestamp: now,
                });
            }
        }
        if let Some(sink) = self.sinks.presence.as_mut() {
            for event in &events {
                sink.on_presence_confirmed(event);
            }
        }
        if !events.is_empty() {
            self.logger.count("presence_confirmed", events.len() as u64);
        }
        events
    }

    fn forget_removed(&mut self, update: &TrackerUpdate) {
        for id in &update.removed {
            self.verifier.drop_track(*id);
        }
    }

    fn recycle(&self, frame: Arc<Frame>) {
        // A detection worker may still hold the frame after a timeout.
        if let Ok(frame) = Arc::try_unwrap(frame) {
            self.frame_buffer.recycle(frame);
        }
    }
}

impl Drop for PresencePipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}
