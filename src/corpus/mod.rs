//! Corpus index: nearest-neighbor search over one source's descriptors.

pub mod artifact;
mod kdtree;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use kdtree::KdTree;

/// Neighbor returned by a corpus query.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    /// Index into the corpus's parallel time-offset sequence.
    pub frame: usize,
    /// Euclidean distance to the query point (lower is more similar).
    pub distance: f32,
}

/// Errors while building or reconstructing a corpus index.
#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("Invalid corpus: {0}")]
    InvalidCorpus(String),
    #[error("Invalid serialized index: {0}")]
    InvalidSerialized(String),
}

/// Portable form of a corpus index; reconstructs without re-analysis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerializedIndex(KdTree);

/// Immutable k-NN structure over one source buffer's descriptor sequence.
///
/// Built once, queried many times; safe to share by reference across
/// threads since nothing mutates after construction.
#[derive(Debug, Clone)]
pub struct CorpusIndex {
    tree: KdTree,
}

impl CorpusIndex {
    /// Build from the corpus descriptor sequence (one source buffer).
    pub fn build(descriptors: &[Vec<f32>]) -> Result<Self, CorpusError> {
        let tree = KdTree::build(descriptors).map_err(CorpusError::InvalidCorpus)?;
        Ok(Self { tree })
    }

    /// Number of indexed frames.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.len() == 0
    }

    /// Descriptor dimension this index was built over.
    pub fn dim(&self) -> usize {
        self.tree.dim()
    }

    /// Up to `k` nearest frames by Euclidean distance, ascending, ties
    /// broken by original frame order. `k` is coerced to at least 1; short
    /// corpora return every frame.
    pub fn query(&self, point: &[f32], k: usize) -> Vec<Neighbor> {
        self.tree
            .knn(point, k.max(1))
            .into_iter()
            .map(|(distance, frame)| Neighbor {
                frame: frame as usize,
                distance,
            })
            .collect()
    }

    /// Portable serialized form.
    pub fn serialize(&self) -> SerializedIndex {
        SerializedIndex(self.tree.clone())
    }

    /// Reconstruct from a serialized form, validating its invariants.
    pub fn deserialize(form: SerializedIndex) -> Result<Self, CorpusError> {
        form.0.validate().map_err(CorpusError::InvalidSerialized)?;
        Ok(Self { tree: form.0 })
    }
}
