//! Persisted per-source analysis record.
//!
//! One artifact per source file, produced at ingestion and reused until the
//! source changes: the serialized index plus the raw descriptor sequence,
//! time offsets, and the aggregate statistics that serve as default
//! calibration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{CorpusIndex, SerializedIndex};
use crate::analysis::BufferAnalysis;
use crate::artifact::{self, ArtifactError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusArtifact {
    /// Name of the analyzed source file.
    pub filename: String,
    pub index: SerializedIndex,
    pub descriptors: Vec<Vec<f32>>,
    pub times: Vec<f32>,
    pub means: Vec<f32>,
    pub stds: Vec<f32>,
    pub loudness_min: f32,
    pub loudness_max: f32,
}

impl CorpusArtifact {
    pub fn new(filename: String, analysis: BufferAnalysis, index: &CorpusIndex) -> Self {
        Self {
            filename,
            index: index.serialize(),
            descriptors: analysis.descriptors,
            times: analysis.times,
            means: analysis.means,
            stds: analysis.stds,
            loudness_min: analysis.loudness_min,
            loudness_max: analysis.loudness_max,
        }
    }

    /// Artifact filename for a given source file name.
    pub fn artifact_filename(source_name: &str) -> String {
        let stem = source_name.split('.').next().unwrap_or(source_name);
        format!("analysis_{stem}.json")
    }

    pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        let data = serde_json::to_vec(self).map_err(ArtifactError::Encode)?;
        artifact::write_atomic(path, &data)
    }

    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        let bytes = artifact::read_bytes(path)?;
        let loaded: Self =
            serde_json::from_slice(&bytes).map_err(|source| ArtifactError::Decode {
                path: path.to_path_buf(),
                source,
            })?;
        loaded.check_consistency(path)?;
        Ok(loaded)
    }

    /// Reconstruct the queryable index from the serialized form.
    pub fn build_index(&self) -> Result<CorpusIndex, super::CorpusError> {
        CorpusIndex::deserialize(self.index.clone())
    }

    fn check_consistency(&self, path: &Path) -> Result<(), ArtifactError> {
        let inconsistent = |detail: String| ArtifactError::Inconsistent {
            path: path.to_path_buf(),
            detail,
        };
        if self.descriptors.len() != self.times.len() {
            return Err(inconsistent(format!(
                "{} descriptors but {} time offsets",
                self.descriptors.len(),
                self.times.len()
            )));
        }
        if self.means.len() != self.stds.len() {
            return Err(inconsistent(format!(
                "means length {} does not match stds length {}",
                self.means.len(),
                self.stds.len()
            )));
        }
        let index = CorpusIndex::deserialize(self.index.clone())
            .map_err(|err| inconsistent(err.to_string()))?;
        if index.len() != self.descriptors.len() {
            return Err(inconsistent(format!(
                "index holds {} points but artifact has {} descriptors",
                index.len(),
                self.descriptors.len()
            )));
        }
        Ok(())
    }
}
