//! 1:N similarity ranking of a probe embedding against the gallery.

use crate::types::{round5, Embedding, StoredEmbedding};
use serde::Serialize;

/// One gallery face that cleared the similarity threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectMatch {
    pub subject: String,
    /// Cosine similarity rounded to 5 decimal digits.
    pub similarity: f32,
}

/// Parameters for a single ranking pass.
#[derive(Debug, Clone, Copy)]
pub struct RankParams {
    pub similarity_threshold: f32,
    /// Maximum matches to return; 0 returns every match above threshold.
    pub prediction_count: usize,
}

/// Outcome of ranking a probe against a gallery.
#[derive(Debug, Clone, Default)]
pub struct Ranking {
    /// Matches at or above threshold, best first.
    pub matches: Vec<SubjectMatch>,
    /// Highest-scoring gallery entry regardless of threshold (unrounded).
    /// Diagnostic only; never surfaced as a match on its own.
    pub best: Option<(String, f32)>,
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn rank(&self, probe: &Embedding, gallery: &[StoredEmbedding], params: RankParams) -> Ranking;
}

/// Cosine similarity matcher. Always scores every gallery entry.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn rank(&self, probe: &Embedding, gallery: &[StoredEmbedding], params: RankParams) -> Ranking {
        let mut best: Option<(usize, f32)> = None;
        let mut matches = Vec::new();

        for (i, stored) in gallery.iter().enumerate() {
            let sim = probe.similarity(&stored.embedding);
            if best.map_or(true, |(_, b)| sim > b) {
                best = Some((i, sim));
            }
            if sim >= params.similarity_threshold {
                matches.push(SubjectMatch {
                    subject: stored.subject.clone(),
                    similarity: round5(sim),
                });
            }
        }

        // Stable: equal similarities keep gallery (insertion) order.
        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        if params.prediction_count > 0 {
            matches.truncate(params.prediction_count);
        }

        Ranking {
            matches,
            best: best.map(|(i, sim)| (gallery[i].subject.clone(), sim)),
        }
    }
}
