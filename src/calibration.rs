//! Calibration statistics mapping live input into the corpus descriptor
//! space.
//!
//! A short reference recording is analyzed once per performer/session; the
//! resulting per-coefficient mean/std and loudness range normalize every
//! live descriptor until the calibration is replaced. Statistics are
//! immutable after creation and replaced wholesale, so a reader holding an
//! old reference during a swap sees a consistent snapshot.

use std::path::Path;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::FormatItem, macros::format_description};

use crate::analysis::{BufferAnalysis, MfccExtractor};
use crate::artifact::{self, ArtifactError};

/// Normalization statistics derived from a reference recording.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalibrationStats {
    pub means: Vec<f32>,
    pub stds: Vec<f32>,
    pub loudness_min: f32,
    pub loudness_max: f32,
}

impl CalibrationStats {
    /// Identity statistics: normalization is the identity on coefficients
    /// and loudness is clamped into `[0, 1]` unscaled. Used until a real
    /// calibration is loaded.
    pub fn identity(coef_count: usize) -> Self {
        Self {
            means: vec![0.0; coef_count],
            stds: vec![1.0; coef_count],
            loudness_min: 0.0,
            loudness_max: 1.0,
        }
    }

    pub fn from_analysis(analysis: &BufferAnalysis) -> Self {
        Self {
            means: analysis.means.clone(),
            stds: analysis.stds.clone(),
            loudness_min: analysis.loudness_min,
            loudness_max: analysis.loudness_max,
        }
    }

    pub fn coef_count(&self) -> usize {
        self.means.len()
    }
}

/// Analyze a reference recording into calibration statistics.
pub fn compute_calibration(extractor: &MfccExtractor, reference: &[f32]) -> CalibrationStats {
    CalibrationStats::from_analysis(&extractor.analyze_buffer(reference))
}

/// Normalize one live descriptor + loudness pair.
///
/// Coefficients are z-scored against the calibration; a zero standard
/// deviation yields 0 for that coefficient rather than a division fault.
/// Loudness maps into `[0, 1]`, defined as 0 when the calibration loudness
/// range is empty.
pub fn normalize(descriptor: &[f32], loudness: f32, stats: &CalibrationStats) -> (Vec<f32>, f32) {
    let normalized: Vec<f32> = descriptor
        .iter()
        .enumerate()
        .map(|(i, &c)| {
            let mean = stats.means.get(i).copied().unwrap_or(0.0);
            let std = stats.stds.get(i).copied().unwrap_or(1.0);
            if std == 0.0 { 0.0 } else { (c - mean) / std }
        })
        .collect();
    let range = stats.loudness_max - stats.loudness_min;
    let normalized_loudness = if range == 0.0 {
        0.0
    } else {
        ((loudness - stats.loudness_min) / range).clamp(0.0, 1.0)
    };
    (normalized, normalized_loudness)
}

const FILENAME_FORMAT: &[FormatItem<'static>] =
    format_description!("[year][month][day]-[hour][minute][second]");

/// Timestamped filename for a calibration artifact.
pub fn calibration_filename(now: OffsetDateTime) -> String {
    let stamp = now
        .format(FILENAME_FORMAT)
        .unwrap_or_else(|_| "unknown".to_string());
    format!("calibration-{stamp}.json")
}

/// Save calibration statistics as JSON, atomically.
pub fn save_calibration(path: &Path, stats: &CalibrationStats) -> Result<(), ArtifactError> {
    let data = serde_json::to_vec_pretty(stats).map_err(ArtifactError::Encode)?;
    artifact::write_atomic(path, &data)
}

/// Load calibration statistics from JSON, validating coefficient counts.
pub fn load_calibration(path: &Path) -> Result<CalibrationStats, ArtifactError> {
    let bytes = artifact::read_bytes(path)?;
    let stats: CalibrationStats =
        serde_json::from_slice(&bytes).map_err(|source| ArtifactError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
    if stats.means.len() != stats.stds.len() {
        return Err(ArtifactError::Inconsistent {
            path: path.to_path_buf(),
            detail: format!(
                "means length {} does not match stds length {}",
                stats.means.len(),
                stats.stds.len()
            ),
        });
    }
    Ok(stats)
}
