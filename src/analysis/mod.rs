//! Timbral feature extraction (windowed FFT + mel filterbank + DCT).

mod extractor;
mod fft;
mod mel;

pub use extractor::{
    AnalysisConfig, BufferAnalysis, ConfigError, MfccExtractor, StreamingAnalyzer,
};
