use std::collections::BTreeMap;
use std::time::Duration;

use super::assignment::hungarian_assignment;
use super::track::{Track, TrackId, TrackSnapshot, TrackState};
use crate::detection::domain::face_detector::Detection;
use crate::shared::config::PipelineConfig;
use crate::shared::frame::FrameId;
use crate::shared::identity::Identity;

/// Tracker tunables, usually derived from [`PipelineConfig`].
#[derive(Clone, Debug, PartialEq)]
pub struct TrackerConfig {
    pub iou_threshold: f64,
    pub max_tracking_age: u32,
    pub lost_threshold: u32,
    pub periodic_refresh_interval: u64,
    pub confidence_redetect_threshold: f64,
    pub recognition_refresh_interval: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for TrackerConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            iou_threshold: config.iou_threshold,
            max_tracking_age: config.max_tracking_age,
            lost_threshold: config.lost_threshold,
            periodic_refresh_interval: config.periodic_refresh_interval.max(1),
            confidence_redetect_threshold: config.confidence_redetect_threshold,
            recognition_refresh_interval: config.recognition_refresh_interval,
        }
    }
}

/// What changed in one tracker cycle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackerUpdate {
    pub frame_id: FrameId,
    pub matched: Vec<TrackId>,
    pub created: Vec<TrackId>,
    /// Tracks that entered the `Lost` state this cycle.
    pub lost: Vec<TrackId>,
    pub removed: Vec<TrackId>,
}

/// Owns every live track and runs association for each processed frame.
///
/// All mutation happens through `&mut self`, so the caller serializes
/// updates. Frames must be applied in increasing `frame_id` order; a frame
/// at or before the last processed one is rejected as stale.
pub struct FaceTracker {
    config: TrackerConfig,
    tracks: BTreeMap<TrackId, Track>,
    next_id: TrackId,
    last_frame: Option<FrameId>,
}

impl FaceTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: BTreeMap::new(),
            next_id: 1,
            last_frame: None,
        }
    }

    /// Applies one frame's detections.
    ///
    /// Predicts every track, pairs tracks and detections by optimal
    /// assignment over `-IoU`, keeps pairs with `IoU >= iou_threshold`,
    /// spawns tentative tracks for unmatched detections and ages unmatched
    /// tracks. Returns `None` for a stale frame.
    pub fn update(
        &mut self,
        frame_id: FrameId,
        timestamp: Duration,
        detections: &[Detection],
    ) -> Option<TrackerUpdate> {
        if self.is_stale(frame_id) {
            log::debug!("Discarding stale detections for frame {frame_id}");
            return None;
        }
        self.last_frame = Some(frame_id);
        let mut update = TrackerUpdate {
            frame_id,
            ..TrackerUpdate::default()
        };

        for track in self.tracks.values_mut() {
            track.predict();
        }

        let ids: Vec<TrackId> = self.tracks.keys().copied().collect();
        let cost: Vec<Vec<f64>> = ids
            .iter()
            .map(|id| {
                let predicted = self.tracks[id].bbox();
                detections.iter().map(|d| -predicted.iou(&d.bbox)).collect()
            })
            .collect();

        let mut track_matched = vec![false; ids.len()];
        let mut detection_matched = vec![false; detections.len()];
        for (row, col) in hungarian_assignment(&cost) {
            if -cost[row][col] < self.config.iou_threshold {
                continue;
            }
            if let Some(track) = self.tracks.get_mut(&ids[row]) {
                track.mark_matched(detections[col].bbox, frame_id);
                track_matched[row] = true;
                detection_matched[col] = true;
                update.matched.push(ids[row]);
            }
        }

        for (row, id) in ids.iter().enumerate() {
            if track_matched[row] {
                continue;
            }
            let Some(track) = self.tracks.get_mut(id) else {
                continue;
            };
            let before = track.state();
            match track.mark_missed(self.config.lost_threshold, self.config.max_tracking_age) {
                TrackState::Removed => {
                    self.tracks.remove(id);
                    update.removed.push(*id);
                }
                TrackState::Lost if before != TrackState::Lost => update.lost.push(*id),
                _ => {}
            }
        }

        for (detection, _) in detections
            .iter()
            .zip(&detection_matched)
            .filter(|(_, matched)| !**matched)
        {
            let id = self.next_id;
            self.next_id += 1;
            self.tracks
                .insert(id, Track::new(id, detection.bbox, frame_id, timestamp));
            update.created.push(id);
        }

        if !update.removed.is_empty() {
            log::debug!("Frame {frame_id}: removed tracks {:?}", update.removed);
        }
        Some(update)
    }

    /// Applies a frame whose detection failed or timed out.
    ///
    /// No evidence came back, so every track counts a miss and moves along
    /// the Lost/Removed lifecycle exactly as if the frame had no faces.
    pub fn miss(&mut self, frame_id: FrameId, timestamp: Duration) -> Option<TrackerUpdate> {
        self.update(frame_id, timestamp, &[])
    }

    /// Advances every track by prediction only, for a frame where detection
    /// was deliberately skipped (policy or backpressure). No misses are
    /// counted.
    pub fn coast(&mut self, frame_id: FrameId) -> Option<TrackerUpdate> {
        if self.is_stale(frame_id) {
            return None;
        }
        self.last_frame = Some(frame_id);
        for track in self.tracks.values_mut() {
            track.predict();
        }
        Some(TrackerUpdate {
            frame_id,
            ..TrackerUpdate::default()
        })
    }

    /// Whether frame `frame_idx` needs a full detection pass.
    ///
    /// Detection is skipped only when every live track is confirmed and
    /// confident and the frame is not a periodic refresh frame. A tentative
    /// track can only be confirmed by a detection, so it always forces one.
    pub fn should_detect(&self, frame_idx: FrameId) -> bool {
        if self.tracks.is_empty() || frame_idx % self.config.periodic_refresh_interval == 0 {
            return true;
        }
        self.tracks.values().any(|t| {
            t.state() == TrackState::Tentative
                || t.confidence() < self.config.confidence_redetect_threshold
        })
    }

    /// Tracks matched in `frame_id` whose identity is missing or stale and
    /// that have no recognition request in flight.
    pub fn tracks_needing_recognition(&self, frame_id: FrameId) -> Vec<TrackId> {
        let refresh = self.config.recognition_refresh_interval;
        self.tracks
            .values()
            .filter(|t| t.last_matched_frame() == frame_id && !t.recognition_pending())
            .filter(|t| match t.identity_frame() {
                None => true,
                Some(at) => frame_id.saturating_sub(at) >= refresh,
            })
            .map(Track::id)
            .collect()
    }

    pub fn mark_recognition_pending(&mut self, track_id: TrackId, pending: bool) {
        if let Some(track) = self.tracks.get_mut(&track_id) {
            track.set_recognition_pending(pending);
        }
    }

    /// Records a recognition result computed from `frame_id`.
    ///
    /// Returns `false` when the track is gone or already holds an identity
    /// from a newer frame.
    pub fn apply_recognition(
        &mut self,
        track_id: TrackId,
        identity: Identity,
        frame_id: FrameId,
    ) -> bool {
        let Some(track) = self.tracks.get_mut(&track_id) else {
            return false;
        };
        if track.identity_frame().is_some_and(|at| at > frame_id) {
            track.set_recognition_pending(false);
            return false;
        }
        track.set_identity(identity, frame_id);
        true
    }

    /// Overrides a track's identity, e.g. after manual registration.
    pub fn relabel(&mut self, track_id: TrackId, identity: Identity) -> bool {
        let frame_id = self.last_frame.unwrap_or(0);
        match self.tracks.get_mut(&track_id) {
            Some(track) => {
                track.set_identity(identity, frame_id);
                true
            }
            None => false,
        }
    }

    /// Drops `identity` from every live track so each is recognized again
    /// on its next match. Returns the affected track ids.
    pub fn forget_identity(&mut self, identity: &Identity) -> Vec<TrackId> {
        let mut cleared = Vec::new();
        for track in self.tracks.values_mut() {
            if track.identity() == Some(identity) {
                track.clear_identity();
                cleared.push(track.id());
            }
        }
        cleared
    }

    pub fn get(&self, track_id: TrackId) -> Option<&Track> {
        self.tracks.get(&track_id)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn snapshots(&self) -> Vec<TrackSnapshot> {
        self.tracks.values().map(Track::snapshot).collect()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn last_frame(&self) -> Option<FrameId> {
        self.last_frame
    }

    pub fn is_stale(&self, frame_id: FrameId) -> bool {
        self.last_frame.is_some_and(|last| frame_id <= last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::bbox::BoundingBox;
    use rstest::rstest;

    fn det(x: f64, y: f64) -> Detection {
        Detection::new(BoundingBox::new(x, y, 50.0, 50.0), 0.9)
    }

    fn ts(frame_id: FrameId) -> Duration {
        Duration::from_millis(frame_id * 33)
    }

    fn tracker() -> FaceTracker {
        FaceTracker::new(TrackerConfig::default())
    }

    #[test]
    fn test_first_detection_creates_tentative_track() {
        let mut t = tracker();
        let update = t.update(0, ts(0), &[det(10.0, 10.0)]).unwrap();
        assert_eq!(update.created, vec![1]);
        assert_eq!(t.get(1).unwrap().state(), TrackState::Tentative);
    }

    #[test]
    fn test_single_subject_keeps_track_id() {
        let mut t = tracker();
        for frame in 0..60 {
            let x = 100.0 + 2.0 * frame as f64;
            let update = t.update(frame, ts(frame), &[det(x, 100.0)]).unwrap();
            if frame > 0 {
                assert_eq!(update.matched, vec![1]);
                assert!(update.created.is_empty());
            }
        }
        assert_eq!(t.len(), 1);
        let track = t.get(1).unwrap();
        assert_eq!(track.state(), TrackState::Confirmed);
        assert!(track.confidence() > 0.9);
    }

    #[test]
    fn test_two_subjects_keep_their_ids() {
        let mut t = tracker();
        t.update(0, ts(0), &[det(0.0, 0.0), det(300.0, 0.0)]);
        for frame in 1..10 {
            let dx = 3.0 * frame as f64;
            // Reverse the detection order to make sure association is by overlap.
            let update = t
                .update(frame, ts(frame), &[det(300.0 - dx, 0.0), det(dx, 0.0)])
                .unwrap();
            assert_eq!(update.matched, vec![1, 2]);
        }
        assert!(t.get(1).unwrap().bbox().x < 50.0);
        assert!(t.get(2).unwrap().bbox().x > 250.0);
    }

    #[test]
    fn test_low_overlap_spawns_new_track() {
        let mut t = tracker();
        t.update(0, ts(0), &[det(0.0, 0.0)]);
        let update = t.update(1, ts(1), &[det(200.0, 200.0)]).unwrap();
        assert!(update.matched.is_empty());
        assert_eq!(update.created, vec![2]);
        assert_eq!(t.get(1).unwrap().missed_count(), 1);
    }

    #[test]
    fn test_removed_exactly_after_max_age_misses() {
        let mut t = tracker();
        t.update(0, ts(0), &[det(0.0, 0.0)]);
        for miss in 1..=30 {
            let update = t.update(miss, ts(miss), &[]).unwrap();
            assert!(update.removed.is_empty(), "removed early at miss {miss}");
        }
        assert_eq!(t.get(1).unwrap().state(), TrackState::Lost);
        let update = t.update(31, ts(31), &[]).unwrap();
        assert_eq!(update.removed, vec![1]);
        assert!(t.is_empty());
    }

    #[test]
    fn test_lost_reported_once_and_recoverable() {
        let mut t = tracker();
        t.update(0, ts(0), &[det(0.0, 0.0)]);
        let mut lost_events = 0;
        for frame in 1..=5 {
            lost_events += t.update(frame, ts(frame), &[]).unwrap().lost.len();
        }
        assert_eq!(lost_events, 1);

        let update = t.update(6, ts(6), &[det(0.0, 0.0)]).unwrap();
        assert_eq!(update.matched, vec![1]);
        assert_eq!(t.get(1).unwrap().state(), TrackState::Confirmed);
    }

    #[test]
    fn test_track_ids_never_reused() {
        let mut t = FaceTracker::new(TrackerConfig {
            max_tracking_age: 1,
            lost_threshold: 1,
            ..TrackerConfig::default()
        });
        t.update(0, ts(0), &[det(0.0, 0.0)]);
        t.update(1, ts(1), &[]);
        t.update(2, ts(2), &[]);
        assert!(t.is_empty());
        let update = t.update(3, ts(3), &[det(0.0, 0.0)]).unwrap();
        assert_eq!(update.created, vec![2]);
    }

    #[rstest]
    #[case::same_frame(5)]
    #[case::older_frame(3)]
    fn test_stale_frames_rejected(#[case] frame_id: FrameId) {
        let mut t = tracker();
        t.update(5, ts(5), &[det(0.0, 0.0)]);
        assert!(t.update(frame_id, ts(frame_id), &[det(0.0, 0.0)]).is_none());
        assert!(t.coast(frame_id).is_none());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_coast_predicts_without_counting_misses() {
        let mut t = tracker();
        for frame in 0..10 {
            t.update(frame, ts(frame), &[det(10.0 * frame as f64, 0.0)]);
        }
        let before = t.get(1).unwrap().bbox().x;
        t.coast(10).unwrap();
        let track = t.get(1).unwrap();
        assert!(track.bbox().x > before);
        assert_eq!(track.missed_count(), 0);
    }

    #[test]
    fn test_failed_frames_count_misses_until_removal() {
        let mut t = FaceTracker::new(TrackerConfig {
            max_tracking_age: 3,
            lost_threshold: 2,
            ..TrackerConfig::default()
        });
        t.update(0, ts(0), &[det(0.0, 0.0)]);
        t.update(1, ts(1), &[det(0.0, 0.0)]);

        t.miss(2, ts(2)).unwrap();
        assert_eq!(t.get(1).unwrap().missed_count(), 1);
        let lost = t.miss(3, ts(3)).unwrap();
        assert_eq!(lost.lost, vec![1]);
        t.miss(4, ts(4)).unwrap();
        let removed = t.miss(5, ts(5)).unwrap();
        assert_eq!(removed.removed, vec![1]);
        assert!(t.is_empty());
    }

    #[test]
    fn test_forget_identity_clears_matching_tracks_only() {
        let mut t = tracker();
        t.update(0, ts(0), &[det(0.0, 0.0), det(200.0, 0.0)]);
        t.relabel(1, Identity::Known("ada".into()));
        t.relabel(2, Identity::Known("grace".into()));

        assert_eq!(t.forget_identity(&Identity::Known("ada".into())), vec![1]);
        assert!(t.get(1).unwrap().identity().is_none());
        assert_eq!(
            t.get(2).unwrap().identity(),
            Some(&Identity::Known("grace".into()))
        );
        t.update(1, ts(1), &[det(0.0, 0.0), det(200.0, 0.0)]);
        assert_eq!(t.tracks_needing_recognition(1), vec![1]);
    }

    #[test]
    fn test_should_detect_policy() {
        let mut t = tracker();
        assert!(t.should_detect(1), "no tracks forces detection");

        t.update(0, ts(0), &[det(0.0, 0.0)]);
        assert!(t.should_detect(1), "tentative track forces detection");

        t.update(1, ts(1), &[det(0.0, 0.0)]);
        assert!(!t.should_detect(2));
        assert!(t.should_detect(30), "periodic refresh");
        assert!(t.should_detect(60));

        t.update(2, ts(2), &[]);
        assert!(t.get(1).unwrap().confidence() < 0.6);
        assert!(t.should_detect(3), "low confidence forces detection");
    }

    #[test]
    fn test_recognition_needed_for_fresh_matches_only() {
        let mut t = tracker();
        t.update(0, ts(0), &[det(0.0, 0.0), det(300.0, 0.0)]);
        assert_eq!(t.tracks_needing_recognition(0), vec![1, 2]);

        t.mark_recognition_pending(1, true);
        assert_eq!(t.tracks_needing_recognition(0), vec![2]);

        t.update(1, ts(1), &[det(300.0, 0.0)]);
        assert_eq!(t.tracks_needing_recognition(1), vec![2]);
    }

    #[test]
    fn test_identity_goes_stale_after_refresh_interval() {
        let mut t = FaceTracker::new(TrackerConfig {
            recognition_refresh_interval: 5,
            ..TrackerConfig::default()
        });
        t.update(0, ts(0), &[det(0.0, 0.0)]);
        assert!(t.apply_recognition(1, Identity::Known("ada".into()), 0));
        for frame in 1..5 {
            t.update(frame, ts(frame), &[det(0.0, 0.0)]);
            assert!(t.tracks_needing_recognition(frame).is_empty());
        }
        t.update(5, ts(5), &[det(0.0, 0.0)]);
        assert_eq!(t.tracks_needing_recognition(5), vec![1]);
    }

    #[test]
    fn test_apply_recognition_ignores_older_results() {
        let mut t = tracker();
        t.update(0, ts(0), &[det(0.0, 0.0)]);
        assert!(t.apply_recognition(1, Identity::Known("new".into()), 8));
        assert!(!t.apply_recognition(1, Identity::Unknown, 4));
        assert_eq!(t.get(1).unwrap().identity(), Some(&Identity::Known("new".into())));
        assert!(!t.apply_recognition(99, Identity::Unknown, 9));
    }

    #[test]
    fn test_relabel_overrides_identity() {
        let mut t = tracker();
        t.update(0, ts(0), &[det(0.0, 0.0)]);
        t.apply_recognition(1, Identity::Unknown, 0);
        assert!(t.relabel(1, Identity::Known("grace".into())));
        assert_eq!(t.snapshots()[0].identity, Some(Identity::Known("grace".into())));
        assert!(!t.relabel(7, Identity::Unknown));
    }
}
