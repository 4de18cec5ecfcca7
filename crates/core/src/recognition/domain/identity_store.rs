use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::shared::identity::Identity;

/// Identity store shared by recognition workers (readers) and enrollment
/// (writer).
pub type SharedIdentityStore = Arc<RwLock<IdentityStore>>;

/// Best match for one embedding.
///
/// `score` is the best cosine similarity found, reported even when it falls
/// below the threshold and the identity is `Unknown`.
#[derive(Clone, Debug, PartialEq)]
pub struct EmbeddingMatch {
    pub identity: Identity,
    pub score: f64,
}

/// Enrolled identities, each with one or more reference embeddings.
pub struct IdentityStore {
    threshold: f64,
    identities: BTreeMap<String, Vec<Vec<f32>>>,
}

impl IdentityStore {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            identities: BTreeMap::new(),
        }
    }

    pub fn into_shared(self) -> SharedIdentityStore {
        Arc::new(RwLock::new(self))
    }

    /// Adds a reference embedding for `name`, creating the identity if needed.
    pub fn enroll(&mut self, name: &str, mut embedding: Vec<f32>) {
        l2_normalize(&mut embedding);
        let references = self.identities.entry(name.to_string()).or_default();
        references.push(embedding);
        log::info!("Enrolled {name} ({} reference(s))", references.len());
    }

    /// Removes an identity with all its references.
    pub fn remove(&mut self, name: &str) -> bool {
        self.identities.remove(name).is_some()
    }

    /// Compares `embedding` against every reference and returns the best
    /// scoring identity, or `Unknown` when the best score is below the
    /// threshold. References of a different dimension are skipped.
    pub fn compare(&self, embedding: &[f32]) -> EmbeddingMatch {
        let mut query = embedding.to_vec();
        l2_normalize(&mut query);

        let mut best: Option<(&str, f64)> = None;
        for (name, references) in &self.identities {
            for reference in references.iter().filter(|r| r.len() == query.len()) {
                let score = cosine_similarity(&query, reference);
                if best.map_or(true, |(_, s)| score > s) {
                    best = Some((name.as_str(), score));
                }
            }
        }

        match best {
            Some((name, score)) if score >= self.threshold => EmbeddingMatch {
                identity: Identity::Known(name.to_string()),
                score,
            },
            Some((_, score)) => EmbeddingMatch {
                identity: Identity::Unknown,
                score,
            },
            None => EmbeddingMatch {
                identity: Identity::Unknown,
                score: 0.0,
            },
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.identities.keys().cloned().collect()
    }

    pub fn reference_count(&self, name: &str) -> usize {
        self.identities.get(name).map_or(0, Vec::len)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Dot product of L2-normalized vectors equals cosine similarity.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (*x as f64) * (*y as f64))
        .sum()
}
