use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use super::track::TrackId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PresenceState {
    pub first_seen: Duration,
    pub verified: bool,
}

/// Dwell-time gate in front of "present" events.
///
/// A track is verified once it has been observed for at least
/// `verification_time` since its first observation. Verification fires once
/// per track id and never reverts. State is keyed by track id, so a subject
/// that comes back under a new id starts a fresh timer.
pub struct PresenceVerifier {
    verification_time: Duration,
    states: HashMap<TrackId, PresenceState>,
}

impl PresenceVerifier {
    pub fn new(verification_time: Duration) -> Self {
        Self {
            verification_time,
            states: HashMap::new(),
        }
    }

    /// Records an observation of `track_id` at `now`.
    ///
    /// Returns `true` exactly once per track: on the first observation at
    /// which the dwell time has been reached.
    pub fn observe(&mut self, track_id: TrackId, now: Duration) -> bool {
        let state = self.states.entry(track_id).or_insert(PresenceState {
            first_seen: now,
            verified: false,
        });
        if state.verified {
            return false;
        }
        if now.saturating_sub(state.first_seen) >= self.verification_time {
            state.verified = true;
            log::debug!("Track {track_id} verified present");
            return true;
        }
        false
    }

    /// Forgets a removed track.
    pub fn drop_track(&mut self, track_id: TrackId) {
        self.states.remove(&track_id);
    }

    pub fn is_verified(&self, track_id: TrackId) -> bool {
        self.states.get(&track_id).is_some_and(|s| s.verified)
    }

    /// Time observed so far, or `None` for an unknown track.
    pub fn presence_time(&self, track_id: TrackId, now: Duration) -> Option<Duration> {
        self.states
            .get(&track_id)
            .map(|s| now.saturating_sub(s.first_seen))
    }

    pub fn statuses(&self) -> Vec<(TrackId, PresenceState)> {
        let mut all: Vec<_> = self.states.iter().map(|(id, s)| (*id, *s)).collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn verification_time(&self) -> Duration {
        self.verification_time
    }
}
