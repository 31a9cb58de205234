//! Matching live embeddings against the registry cache.

use crate::cache::EmbeddingCache;
use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum MatchError {
    #[error("threshold {0} is outside [0, 100]")]
    InvalidThreshold(f32),
    #[error("cannot compare {live} embeddings against a {cache} cache")]
    VariantMismatch { live: String, cache: String },
    #[error("live embedding has {live} dims, cache holds {cache}")]
    DimensionMismatch { live: usize, cache: usize },
}

/// A live face that cleared the threshold against a registry entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub identifier: String,
    /// Similarity percentage in [0, 100].
    pub similarity: f32,
    /// Index of the face within its frame.
    pub face_index: usize,
}

/// Strategy for picking a registry entry among those above the threshold.
pub trait Matcher {
    /// Index into `cache.entries()` and similarity of the chosen entry.
    fn select(&self, live: &Embedding, cache: &EmbeddingCache, threshold: f32) -> Option<(usize, f32)>;
}

/// First entry, in cache insertion order, at or above the threshold.
pub struct FirstAboveThreshold;

impl Matcher for FirstAboveThreshold {
    fn select(&self, live: &Embedding, cache: &EmbeddingCache, threshold: f32) -> Option<(usize, f32)> {
        cache.entries().iter().enumerate().find_map(|(i, entry)| {
            let sim = live.similarity_percent(&entry.embedding);
            (sim >= threshold).then_some((i, sim))
        })
    }
}

/// Highest-scoring entry at or above the threshold; earlier entries win ties.
pub struct BestMatch;

impl Matcher for BestMatch {
    fn select(&self, live: &Embedding, cache: &EmbeddingCache, threshold: f32) -> Option<(usize, f32)> {
        let mut best: Option<(usize, f32)> = None;
        for (i, entry) in cache.entries().iter().enumerate() {
            let sim = live.similarity_percent(&entry.embedding);
            if sim >= threshold && best.map_or(true, |(_, b)| sim > b) {
                best = Some((i, sim));
            }
        }
        best
    }
}

/// Configurable choice of [`Matcher`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    #[default]
    FirstAboveThreshold,
    BestMatch,
}

impl MatchPolicy {
    pub fn matcher(self) -> &'static dyn Matcher {
        match self {
            MatchPolicy::FirstAboveThreshold => &FirstAboveThreshold,
            MatchPolicy::BestMatch => &BestMatch,
        }
    }
}

/// Threshold plus policy, validated once.
#[derive(Debug, Clone, Copy)]
pub struct MatchEngine {
    threshold: f32,
    policy: MatchPolicy,
}

impl MatchEngine {
    pub fn new(threshold: f32, policy: MatchPolicy) -> Result<Self, MatchError> {
        if !(0.0..=100.0).contains(&threshold) {
            return Err(MatchError::InvalidThreshold(threshold));
        }
        Ok(Self { threshold, policy })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    /// Match one live face embedding against the cache.
    ///
    /// An empty cache never matches. Embeddings from another variant, or of
    /// another dimension, are rejected rather than compared.
    pub fn find_match(
        &self,
        live: &Embedding,
        cache: &EmbeddingCache,
        face_index: usize,
    ) -> Result<Option<MatchResult>, MatchError> {
        if cache.is_empty() {
            return Ok(None);
        }
        if live.variant != cache.variant() {
            return Err(MatchError::VariantMismatch {
                live: live.variant.clone(),
                cache: cache.variant().to_string(),
            });
        }
        if let Some(dim) = cache.dim() {
            if live.dim() != dim {
                return Err(MatchError::DimensionMismatch {
                    live: live.dim(),
                    cache: dim,
                });
            }
        }

        let hit = self.policy.matcher().select(live, cache, self.threshold);
        Ok(hit.map(|(idx, similarity)| MatchResult {
            identifier: cache.entries()[idx].identifier.clone(),
            similarity,
            face_index,
        }))
    }
}

/// First-above-threshold match of `live` against `cache`.
pub fn find_match(
    live: &Embedding,
    cache: &EmbeddingCache,
    threshold: f32,
) -> Result<Option<MatchResult>, MatchError> {
    MatchEngine::new(threshold, MatchPolicy::FirstAboveThreshold)?.find_match(live, cache, 0)
}
