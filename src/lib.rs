//! Corpus-based concatenative synthesis engine.
//!
//! Source recordings are analyzed offline into timbral descriptors
//! ([`analysis`]), indexed for nearest-neighbor matching ([`corpus`]), and
//! played back as grains by a scheduling engine ([`engine`]) driven by live
//! descriptors normalized through per-session statistics ([`calibration`]).

/// Timbral feature extraction (offline and streaming MFCC).
pub mod analysis;
/// Application directory helpers.
pub mod app_dirs;
/// Shared artifact persistence (atomic JSON writes).
pub mod artifact;
/// Calibration statistics and normalization.
pub mod calibration;
/// Nearest-neighbor corpus index and per-source artifacts.
pub mod corpus;
/// Grain scheduler, search worker, and trigger rendering.
pub mod engine;
/// Offline WAV ingestion front-end.
pub mod ingest;
/// Tracing setup for binaries.
pub mod logging;
