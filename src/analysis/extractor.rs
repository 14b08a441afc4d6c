//! Buffer and streaming MFCC extraction.

use thiserror::Error;

use super::fft::{Complex32, FftPlan, hann_window, power_spectrum};
use super::mel::MelBank;

/// Analysis parameters shared by the corpus and live paths.
///
/// Corpus descriptors and live targets are only comparable when both sides
/// were produced with the same configuration, so it is validated once here
/// and carried by every extractor.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisConfig {
    pub sample_rate: u32,
    pub frame_size: usize,
    pub hop_size: usize,
    pub band_count: usize,
    pub coef_count: usize,
    pub min_freq_hz: f32,
    pub max_freq_hz: f32,
    /// Whether DCT coefficient 0 (overall log-energy) participates in the
    /// descriptor. Must match between ingestion and live analysis.
    pub include_first_coef: bool,
}

impl AnalysisConfig {
    /// Installation defaults: frame 1024, hop 512, 24 mel bands, 12
    /// coefficients over 50-8000 Hz.
    pub fn for_sample_rate(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frame_size: 1024,
            hop_size: 512,
            band_count: 24,
            coef_count: 12,
            min_freq_hz: 50.0,
            max_freq_hz: 8_000.0,
            include_first_coef: true,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::ZeroSampleRate);
        }
        if self.frame_size == 0 || !self.frame_size.is_power_of_two() {
            return Err(ConfigError::BadFrameSize {
                frame_size: self.frame_size,
            });
        }
        if self.hop_size == 0 {
            return Err(ConfigError::ZeroHopSize);
        }
        if self.coef_count == 0 {
            return Err(ConfigError::ZeroCoefCount);
        }
        if self.band_count < self.coef_count {
            return Err(ConfigError::BandCountTooSmall {
                band_count: self.band_count,
                coef_count: self.coef_count,
            });
        }
        if !(self.min_freq_hz >= 0.0) || !(self.min_freq_hz < self.max_freq_hz) {
            return Err(ConfigError::BadFreqRange {
                min_freq_hz: self.min_freq_hz,
                max_freq_hz: self.max_freq_hz,
            });
        }
        Ok(())
    }
}

/// Construction-time configuration failures; fatal to the engine instance.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Sample rate must be positive")]
    ZeroSampleRate,
    #[error("Frame size must be a power of two, got {frame_size}")]
    BadFrameSize { frame_size: usize },
    #[error("Hop size must be positive")]
    ZeroHopSize,
    #[error("Coefficient count must be positive")]
    ZeroCoefCount,
    #[error("Band count {band_count} must be at least coefficient count {coef_count}")]
    BandCountTooSmall {
        band_count: usize,
        coef_count: usize,
    },
    #[error("Invalid frequency range: min {min_freq_hz} Hz, max {max_freq_hz} Hz")]
    BadFreqRange { min_freq_hz: f32, max_freq_hz: f32 },
}

/// Descriptors extracted from one sample buffer, with the per-call
/// aggregate statistics used as default calibration.
#[derive(Debug, Clone)]
pub struct BufferAnalysis {
    pub descriptors: Vec<Vec<f32>>,
    pub times: Vec<f32>,
    pub means: Vec<f32>,
    pub stds: Vec<f32>,
    pub loudness_min: f32,
    pub loudness_max: f32,
}

/// MFCC extractor over fixed analysis parameters.
///
/// The offline (whole-buffer) and online (single-frame) paths go through the
/// same per-frame computation, so corpus and live descriptors stay in the
/// same space.
pub struct MfccExtractor {
    config: AnalysisConfig,
    window: Vec<f32>,
    plan: FftPlan,
    mel: MelBank,
}

impl MfccExtractor {
    pub fn new(config: AnalysisConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let plan = FftPlan::new(config.frame_size).map_err(|_| ConfigError::BadFrameSize {
            frame_size: config.frame_size,
        })?;
        let mel = MelBank::new(
            config.sample_rate,
            config.frame_size,
            config.band_count,
            config.coef_count,
            config.min_freq_hz,
            config.max_freq_hz,
            config.include_first_coef,
        );
        let window = hann_window(config.frame_size);
        Ok(Self {
            config,
            window,
            plan,
            mel,
        })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Analyze a whole buffer at `hop_size` steps (complete frames only).
    pub fn analyze_buffer(&self, samples: &[f32]) -> BufferAnalysis {
        let frame_size = self.config.frame_size;
        let hop_size = self.config.hop_size;
        let sr = self.config.sample_rate as f32;
        let mut descriptors = Vec::new();
        let mut times = Vec::new();
        let mut loudness = Vec::new();
        let mut scratch = vec![Complex32::default(); frame_size];
        let mut start = 0usize;
        while start + frame_size <= samples.len() {
            let frame = &samples[start..start + frame_size];
            let (coefs, rms) = self.analyze_frame_into(frame, &mut scratch);
            descriptors.push(coefs);
            loudness.push(rms);
            times.push(start as f32 / sr);
            start += hop_size;
        }
        if descriptors.is_empty() {
            // Too short for a single frame: emit one silent frame so the
            // corpus invariant (at least one indexed point) holds.
            descriptors.push(vec![0.0_f32; self.config.coef_count]);
            loudness.push(0.0);
            times.push(0.0);
        }
        let (means, stds) = coefficient_stats(&descriptors, self.config.coef_count);
        let loudness_min = loudness.iter().copied().fold(f32::INFINITY, f32::min);
        let loudness_max = loudness.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        BufferAnalysis {
            descriptors,
            times,
            means,
            stds,
            loudness_min,
            loudness_max,
        }
    }

    /// One frame worth of samples to (descriptor, RMS loudness).
    ///
    /// `frame` must be exactly `frame_size` samples; the streaming analyzer
    /// guarantees this with its history buffer.
    pub fn analyze_frame(&self, frame: &[f32]) -> (Vec<f32>, f32) {
        let mut scratch = vec![Complex32::default(); self.config.frame_size];
        self.analyze_frame_into(frame, &mut scratch)
    }

    fn analyze_frame_into(&self, frame: &[f32], scratch: &mut [Complex32]) -> (Vec<f32>, f32) {
        for (i, cell) in scratch.iter_mut().enumerate() {
            let sample = frame.get(i).copied().unwrap_or(0.0);
            let win = self.window.get(i).copied().unwrap_or(1.0);
            *cell = Complex32::new(sanitize(sample) * win, 0.0);
        }
        if self.plan.process(scratch).is_err() {
            // Plan and scratch lengths are fixed at construction; unreachable
            // in practice, but a silent frame beats a panic on the hot path.
            return (vec![0.0_f32; self.config.coef_count], 0.0);
        }
        let power = power_spectrum(scratch);
        let coefs = self.mel.cepstrum_from_power(&power);
        (coefs, rms(frame))
    }
}

/// Online single-frame analysis over a sliding history of `frame_size`
/// samples, shifted by each incoming block.
///
/// When a block is at least `frame_size` long only its trailing samples are
/// kept; older samples are dropped rather than queued. This mirrors the
/// realtime behavior when the hop exceeds the analysis frame.
pub struct StreamingAnalyzer {
    extractor: MfccExtractor,
    history: Vec<f32>,
    scratch: Vec<Complex32>,
}

impl StreamingAnalyzer {
    pub fn new(config: AnalysisConfig) -> Result<Self, ConfigError> {
        let extractor = MfccExtractor::new(config)?;
        Ok(Self::from_extractor(extractor))
    }

    pub fn from_extractor(extractor: MfccExtractor) -> Self {
        let frame_size = extractor.config().frame_size;
        Self {
            extractor,
            history: vec![0.0_f32; frame_size],
            scratch: vec![Complex32::default(); frame_size],
        }
    }

    pub fn config(&self) -> &AnalysisConfig {
        self.extractor.config()
    }

    /// Shift in one block of input and analyze the updated frame.
    pub fn push_block(&mut self, block: &[f32]) -> (Vec<f32>, f32) {
        let frame_size = self.history.len();
        if block.len() >= frame_size {
            self.history
                .copy_from_slice(&block[block.len() - frame_size..]);
        } else {
            self.history.copy_within(block.len().., 0);
            self.history[frame_size - block.len()..].copy_from_slice(block);
        }
        self.extractor
            .analyze_frame_into(&self.history, &mut self.scratch)
    }

    /// Reset the history to silence (new streaming session).
    pub fn reset(&mut self) {
        self.history.fill(0.0);
    }
}

fn sanitize(sample: f32) -> f32 {
    if sample.is_finite() {
        sample.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

fn rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = frame.iter().map(|&v| (v as f64) * (v as f64)).sum();
    (sum_sq / frame.len() as f64).sqrt() as f32
}

fn coefficient_stats(descriptors: &[Vec<f32>], coef_count: usize) -> (Vec<f32>, Vec<f32>) {
    let n = descriptors.len().max(1) as f64;
    let mut sums = vec![0.0_f64; coef_count];
    let mut sq_sums = vec![0.0_f64; coef_count];
    for descriptor in descriptors {
        for (i, &c) in descriptor.iter().enumerate().take(coef_count) {
            sums[i] += c as f64;
            sq_sums[i] += (c as f64) * (c as f64);
        }
    }
    let means: Vec<f32> = sums.iter().map(|&s| (s / n) as f32).collect();
    let stds: Vec<f32> = sums
        .iter()
        .zip(&sq_sums)
        .map(|(&s, &sq)| {
            let mean = s / n;
            ((sq / n - mean * mean).max(0.0)).sqrt() as f32
        })
        .collect();
    (means, stds)
}
