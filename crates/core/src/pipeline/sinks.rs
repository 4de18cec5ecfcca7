use std::time::Duration;

use serde::Serialize;

use crate::recognition::domain::unknown_face_pool::UnknownFace;
use crate::shared::frame::FrameId;
use crate::shared::identity::Identity;
use crate::tracking::track::{TrackId, TrackSnapshot};

/// Emitted once per track when it passes the presence dwell time.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PresenceConfirmed {
    pub track_id: TrackId,
    /// Identity resolved so far, if recognition has answered yet.
    pub identity: Option<Identity>,
    pub timestamp: Duration,
}

/// Receives every track once per processed frame.
pub trait TrackSink: Send {
    fn on_tracks(&mut self, frame_id: FrameId, timestamp: Duration, tracks: &[TrackSnapshot]);
}

/// Receives presence confirmations, e.g. an attendance logger.
pub trait PresenceSink: Send {
    fn on_presence_confirmed(&mut self, event: &PresenceConfirmed);
}

/// Observes the unknown-face pool for a registration UI.
pub trait UnknownFaceSink: Send {
    fn on_unknown_added(&mut self, face: &UnknownFace);

    fn on_unknown_removed(&mut self, _face_id: TrackId) {}
}

/// Optional outputs wired into the pipeline at startup.
#[derive(Default)]
pub struct PipelineSinks {
    pub tracks: Option<Box<dyn TrackSink>>,
    pub presence: Option<Box<dyn PresenceSink>>,
    pub unknowns: Option<Box<dyn UnknownFaceSink>>,
}

/// Sinks that report through the `log` facade. Used by the CLI.
pub struct LogSink;

impl TrackSink for LogSink {
    fn on_tracks(&mut self, frame_id: FrameId, _timestamp: Duration, tracks: &[TrackSnapshot]) {
        for t in tracks {
            log::debug!(
                "frame {frame_id} track {} {:?} conf {:.2} v ({:.1}, {:.1}) identity {}",
                t.track_id,
                t.state,
                t.confidence,
                t.velocity.0,
                t.velocity.1,
                t.identity
                    .as_ref()
                    .map_or_else(|| "pending".to_string(), |i| i.to_string())
            );
        }
    }
}

impl PresenceSink for LogSink {
    fn on_presence_confirmed(&mut self, event: &PresenceConfirmed) {
        let who = event
            .identity
            .as_ref()
            .map_or_else(|| "unidentified".to_string(), |i| i.to_string());
        log::info!(
            "Presence confirmed: track {} ({who}) at {:.1}s",
            event.track_id,
            event.timestamp.as_secs_f64()
        );
    }
}

impl UnknownFaceSink for LogSink {
    fn on_unknown_added(&mut self, face: &UnknownFace) {
        log::info!(
            "Unknown face {} awaiting registration (first seen {:.1}s)",
            face.face_id,
            face.first_seen.as_secs_f64()
        );
    }

    fn on_unknown_removed(&mut self, face_id: TrackId) {
        log::info!("Unknown face {face_id} left the pool");
    }
}
