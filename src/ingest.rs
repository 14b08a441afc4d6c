//! Offline ingestion: WAV file to corpus artifact.
//!
//! One source file yields one corpus: decode to mono, extract descriptors,
//! build the index, persist the artifact. Artifacts are reused until the
//! source changes, so ingestion skips files whose artifact already exists.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::analysis::{AnalysisConfig, ConfigError, MfccExtractor};
use crate::artifact::ArtifactError;
use crate::corpus::{CorpusError, CorpusIndex, artifact::CorpusArtifact};

/// Decoded mono audio ready for analysis.
#[derive(Debug, Clone)]
pub struct LoadedBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl LoadedBuffer {
    pub fn duration_seconds(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        source: hound::Error,
    },
    #[error("{path} contains no samples")]
    EmptyFile { path: PathBuf },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// Decode a WAV file and downmix to mono (channel average).
pub fn load_wav_mono(path: &Path) -> Result<LoadedBuffer, IngestError> {
    let decode_err = |source: hound::Error| IngestError::Decode {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = hound::WavReader::open(path).map_err(decode_err)?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(decode_err)?,
        hound::SampleFormat::Int => {
            let scale = 1.0_f32 / (1_i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<_, _>>()
                .map_err(decode_err)?
        }
    };
    if interleaved.is_empty() {
        return Err(IngestError::EmptyFile {
            path: path.to_path_buf(),
        });
    }
    let samples = downmix_to_mono(&interleaved, channels);
    Ok(LoadedBuffer {
        samples,
        sample_rate: spec.sample_rate,
    })
}

/// Analyze a loaded buffer and build its corpus artifact + queryable index.
pub fn ingest_buffer(
    config: AnalysisConfig,
    source_name: &str,
    buffer: &LoadedBuffer,
) -> Result<(CorpusArtifact, CorpusIndex), IngestError> {
    let extractor = MfccExtractor::new(config)?;
    let analysis = extractor.analyze_buffer(&buffer.samples);
    let index = CorpusIndex::build(&analysis.descriptors)?;
    let artifact = CorpusArtifact::new(source_name.to_string(), analysis, &index);
    Ok((artifact, index))
}

/// Ingest one WAV file into `out_dir`, skipping when its artifact already
/// exists. Returns the artifact path.
pub fn ingest_file(path: &Path, out_dir: &Path) -> Result<PathBuf, IngestError> {
    let source_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let artifact_path = out_dir.join(CorpusArtifact::artifact_filename(&source_name));
    if artifact_path.is_file() {
        info!("{} already analyzed, skipping", source_name);
        return Ok(artifact_path);
    }
    let buffer = load_wav_mono(path)?;
    let config = AnalysisConfig::for_sample_rate(buffer.sample_rate);
    let (artifact, index) = ingest_buffer(config, &source_name, &buffer)?;
    artifact.save(&artifact_path)?;
    info!(
        "Analyzed {} ({} frames, {:.2}s) -> {}",
        source_name,
        index.len(),
        buffer.duration_seconds(),
        artifact_path.display()
    );
    Ok(artifact_path)
}

fn downmix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}
