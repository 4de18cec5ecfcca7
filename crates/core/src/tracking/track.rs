use std::time::Duration;

use serde::Serialize;

use super::motion_predictor::MotionPredictor;
use crate::shared::bbox::BoundingBox;
use crate::shared::frame::FrameId;
use crate::shared::identity::Identity;

/// Unique, monotonically assigned track id. Never reused.
pub type TrackId = u64;

/// Lifecycle of a track.
///
/// `Removed` is terminal; removed tracks leave the tracker in the same
/// cycle and only appear in that cycle's update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize)]
pub enum TrackState {
    /// Created from an unmatched detection, not yet re-matched.
    #[default]
    Tentative,
    Confirmed,
    /// Missed for several frames, still predicted and matchable.
    Lost,
    Removed,
}

/// One subject followed across frames.
#[derive(Clone, Debug)]
pub struct Track {
    id: TrackId,
    bbox: BoundingBox,
    predictor: MotionPredictor,
    state: TrackState,
    missed_count: u32,
    first_seen: Duration,
    last_matched_frame: FrameId,
    identity: Option<Identity>,
    identity_frame: Option<FrameId>,
    recognition_pending: bool,
}

impl Track {
    pub(crate) fn new(id: TrackId, bbox: BoundingBox, frame_id: FrameId, first_seen: Duration) -> Self {
        Self {
            id,
            bbox,
            predictor: MotionPredictor::new(bbox.center()),
            state: TrackState::Tentative,
            missed_count: 0,
            first_seen,
            last_matched_frame: frame_id,
            identity: None,
            identity_frame: None,
            recognition_pending: false,
        }
    }

    /// Moves the box to the predicted center, keeping its size.
    pub(crate) fn predict(&mut self) {
        let (cx, cy) = self.predictor.predict().center;
        self.bbox = BoundingBox::from_center(cx, cy, self.bbox.width, self.bbox.height);
    }

    pub(crate) fn mark_matched(&mut self, bbox: BoundingBox, frame_id: FrameId) {
        self.predictor.correct(bbox.center(), bbox.diagonal());
        self.bbox = bbox;
        self.missed_count = 0;
        self.last_matched_frame = frame_id;
        self.state = TrackState::Confirmed;
    }

    /// Counts a miss and advances the lifecycle. Returns the new state.
    pub(crate) fn mark_missed(&mut self, lost_threshold: u32, max_age: u32) -> TrackState {
        self.missed_count += 1;
        self.predictor.mark_missed();
        if self.missed_count > max_age {
            self.state = TrackState::Removed;
        } else if self.missed_count >= lost_threshold {
            self.state = TrackState::Lost;
        }
        self.state
    }

    pub(crate) fn set_identity(&mut self, identity: Identity, frame_id: FrameId) {
        self.identity = Some(identity);
        self.identity_frame = Some(frame_id);
        self.recognition_pending = false;
    }

    pub(crate) fn clear_identity(&mut self) {
        self.identity = None;
        self.identity_frame = None;
    }

    pub(crate) fn set_recognition_pending(&mut self, pending: bool) {
        self.recognition_pending = pending;
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub fn confidence(&self) -> f64 {
        self.predictor.confidence()
    }

    pub fn missed_count(&self) -> u32 {
        self.missed_count
    }

    pub fn first_seen(&self) -> Duration {
        self.first_seen
    }

    pub fn last_matched_frame(&self) -> FrameId {
        self.last_matched_frame
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn identity_frame(&self) -> Option<FrameId> {
        self.identity_frame
    }

    pub fn recognition_pending(&self) -> bool {
        self.recognition_pending
    }

    pub fn velocity(&self) -> (f64, f64) {
        self.predictor.velocity()
    }

    pub fn snapshot(&self) -> TrackSnapshot {
        TrackSnapshot {
            track_id: self.id,
            bbox: self.bbox,
            identity: self.identity.clone(),
            confidence: self.confidence(),
            velocity: self.velocity(),
            state: self.state,
        }
    }
}

/// Per-frame view of a track handed to output sinks.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackSnapshot {
    pub track_id: TrackId,
    pub bbox: BoundingBox,
    pub identity: Option<Identity>,
    pub confidence: f64,
    /// Estimated motion in pixels per frame.
    pub velocity: (f64, f64),
    pub state: TrackState,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track() -> Track {
        Track::new(1, BoundingBox::new(0.0, 0.0, 40.0, 40.0), 0, Duration::ZERO)
    }

    #[test]
    fn test_new_track_is_tentative() {
        let t = track();
        assert_eq!(t.state(), TrackState::Tentative);
        assert_eq!(t.missed_count(), 0);
        assert!(t.identity().is_none());
        assert_eq!(t.confidence(), 1.0);
    }

    #[test]
    fn test_match_confirms_and_resets_misses() {
        let mut t = track();
        t.mark_missed(3, 30);
        t.predict();
        t.mark_matched(BoundingBox::new(2.0, 0.0, 40.0, 40.0), 5);
        assert_eq!(t.state(), TrackState::Confirmed);
        assert_eq!(t.missed_count(), 0);
        assert_eq!(t.last_matched_frame(), 5);
        assert_eq!(t.bbox(), BoundingBox::new(2.0, 0.0, 40.0, 40.0));
    }

    #[test]
    fn test_miss_lifecycle() {
        let mut t = track();
        assert_eq!(t.mark_missed(3, 5), TrackState::Tentative);
        assert_eq!(t.mark_missed(3, 5), TrackState::Tentative);
        assert_eq!(t.mark_missed(3, 5), TrackState::Lost);
        assert_eq!(t.mark_missed(3, 5), TrackState::Lost);
        assert_eq!(t.mark_missed(3, 5), TrackState::Lost);
        assert_eq!(t.mark_missed(3, 5), TrackState::Removed);
    }

    #[test]
    fn test_predict_keeps_box_size() {
        let mut t = track();
        t.predict();
        let b = t.bbox();
        assert_eq!((b.width, b.height), (40.0, 40.0));
        assert_eq!(b.center(), (20.0, 20.0));
    }

    #[test]
    fn test_set_identity_clears_pending() {
        let mut t = track();
        t.set_recognition_pending(true);
        t.set_identity(Identity::Known("ada".into()), 9);
        assert!(!t.recognition_pending());
        assert_eq!(t.identity_frame(), Some(9));
        assert_eq!(t.snapshot().identity, Some(Identity::Known("ada".into())));
    }

    #[test]
    fn test_snapshot_reports_learned_velocity() {
        let mut t = track();
        for k in 1..=10 {
            t.predict();
            t.mark_matched(BoundingBox::new(3.0 * k as f64, 0.0, 40.0, 40.0), k);
        }
        let (vx, vy) = t.snapshot().velocity;
        assert!((vx - 3.0).abs() < 0.5, "vx = {vx}");
        assert!(vy.abs() < 0.5, "vy = {vy}");
    }

    #[test]
    fn test_clear_identity_forgets_label() {
        let mut t = track();
        t.set_identity(Identity::Known("ada".into()), 4);
        t.clear_identity();
        assert!(t.identity().is_none());
        assert!(t.identity_frame().is_none());
    }
}
