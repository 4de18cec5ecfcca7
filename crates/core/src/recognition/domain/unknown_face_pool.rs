use std::collections::HashMap;
use std::time::Duration;

use crate::tracking::track::TrackId;

/// An unidentified face waiting for manual registration. The face id is the
/// id of the track it came from.
#[derive(Clone, Debug, PartialEq)]
pub struct UnknownFace {
    pub face_id: TrackId,
    pub embedding: Vec<f32>,
    pub first_seen: Duration,
}

/// Capacity-bounded cache of unknown faces.
///
/// Inserting a new face into a full pool evicts the entry with the oldest
/// `first_seen` (ties broken by the lower face id). Re-inserting a face id
/// already present refreshes its embedding and keeps its `first_seen`.
pub struct UnknownFacePool {
    capacity: usize,
    entries: HashMap<TrackId, UnknownFace>,
}

impl UnknownFacePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
        }
    }

    /// Adds or refreshes a face. Returns the entry evicted to make room.
    pub fn insert(
        &mut self,
        face_id: TrackId,
        embedding: Vec<f32>,
        first_seen: Duration,
    ) -> Option<UnknownFace> {
        if let Some(existing) = self.entries.get_mut(&face_id) {
            existing.embedding = embedding;
            return None;
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.oldest_id().and_then(|id| self.entries.remove(&id))
        } else {
            None
        };
        self.entries.insert(
            face_id,
            UnknownFace {
                face_id,
                embedding,
                first_seen,
            },
        );
        evicted
    }

    pub fn remove(&mut self, face_id: TrackId) -> Option<UnknownFace> {
        self.entries.remove(&face_id)
    }

    pub fn get(&self, face_id: TrackId) -> Option<&UnknownFace> {
        self.entries.get(&face_id)
    }

    pub fn contains(&self, face_id: TrackId) -> bool {
        self.entries.contains_key(&face_id)
    }

    /// All entries, oldest first.
    pub fn snapshot(&self) -> Vec<UnknownFace> {
        let mut all: Vec<UnknownFace> = self.entries.values().cloned().collect();
        all.sort_by_key(|f| (f.first_seen, f.face_id));
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn oldest_id(&self) -> Option<TrackId> {
        self.entries
            .values()
            .min_by_key(|f| (f.first_seen, f.face_id))
            .map(|f| f.face_id)
    }
}
