//! End-to-end ingestion: WAV file -> corpus artifact -> reconstructed index.

use std::path::Path;

use grainfield::analysis::{AnalysisConfig, MfccExtractor};
use grainfield::calibration::{
    CalibrationStats, compute_calibration, load_calibration, normalize, save_calibration,
};
use grainfield::corpus::artifact::CorpusArtifact;
use grainfield::ingest;
use tempfile::tempdir;

const SAMPLE_RATE: u32 = 48_000;

/// Two-second sweep with a loudness ramp so descriptors and loudness both
/// vary across the corpus.
fn write_sweep_wav(path: &Path) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    let frames = SAMPLE_RATE as usize * 2;
    for i in 0..frames {
        let t = i as f32 / SAMPLE_RATE as f32;
        let freq = 200.0 + 1800.0 * t / 2.0;
        let gain = 0.1 + 0.7 * t / 2.0;
        let v = (2.0 * std::f32::consts::PI * freq * t).sin() * gain;
        writer
            .write_sample((v * i16::MAX as f32) as i16)
            .unwrap();
    }
    writer.finalize().unwrap();
}

#[test]
fn ingested_artifact_round_trips_through_disk() {
    let dir = tempdir().unwrap();
    let wav = dir.path().join("sweep.wav");
    write_sweep_wav(&wav);

    let artifact_path = ingest::ingest_file(&wav, dir.path()).unwrap();
    let artifact = CorpusArtifact::load(&artifact_path).unwrap();

    // two seconds at frame 1024 / hop 512: (96000 - 1024) / 512 + 1 frames
    let expected_frames = (2 * SAMPLE_RATE as usize - 1024) / 512 + 1;
    assert_eq!(artifact.descriptors.len(), expected_frames);
    assert_eq!(artifact.times.len(), expected_frames);
    assert!(artifact.descriptors.iter().all(|d| d.len() == 12));
    assert!(artifact.loudness_min >= 0.0);
    assert!(artifact.loudness_max > artifact.loudness_min);

    // times step by the hop and stay within the buffer
    let hop_seconds = 512.0 / SAMPLE_RATE as f32;
    assert!((artifact.times[1] - artifact.times[0] - hop_seconds).abs() < 1e-6);
    assert!(*artifact.times.last().unwrap() < 2.0);

    // the reconstructed index answers the same queries as a fresh build
    let rebuilt = artifact.build_index().unwrap();
    let fresh = grainfield::corpus::CorpusIndex::build(&artifact.descriptors).unwrap();
    for frame in [0usize, 7, expected_frames - 1] {
        let q = &artifact.descriptors[frame];
        assert_eq!(rebuilt.query(q, 5), fresh.query(q, 5));
        assert_eq!(rebuilt.query(q, 1)[0].frame, frame);
    }
}

#[test]
fn calibration_from_reference_recording_normalizes_live_frames() {
    let dir = tempdir().unwrap();
    let wav = dir.path().join("reference.wav");
    write_sweep_wav(&wav);

    let buffer = ingest::load_wav_mono(&wav).unwrap();
    let extractor = MfccExtractor::new(AnalysisConfig::for_sample_rate(SAMPLE_RATE)).unwrap();
    let stats = compute_calibration(&extractor, &buffer.samples);

    let path = dir.path().join("calibration-test.json");
    save_calibration(&path, &stats).unwrap();
    let loaded = load_calibration(&path).unwrap();
    assert_eq!(loaded, stats);

    // a loudness inside the observed range lands strictly inside (0, 1)
    let mid_loudness = (stats.loudness_min + stats.loudness_max) * 0.5;
    let analysis = extractor.analyze_buffer(&buffer.samples);
    let (normalized, l) = normalize(&analysis.descriptors[3], mid_loudness, &loaded);
    assert_eq!(normalized.len(), 12);
    assert!(l > 0.0 && l < 1.0);
}

#[test]
fn identity_calibration_keeps_descriptors_raw() {
    let stats = CalibrationStats::identity(12);
    let descriptor: Vec<f32> = (0..12).map(|i| i as f32 * 0.3 - 1.0).collect();
    let (normalized, _) = normalize(&descriptor, 0.2, &stats);
    assert_eq!(normalized, descriptor);
}
