//! Grain trigger events and offline rendering.

/// One scheduled grain playback event.
///
/// Transient: computed per scheduling tick, consumed by the audio output
/// path and discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct GrainTrigger {
    /// Absolute start time on the logical clock, jitter included.
    pub start_time: f64,
    /// Offset into the source buffer, seconds. Always clamped so
    /// `source_offset + duration` stays inside the buffer.
    pub source_offset: f32,
    /// Grain length, seconds.
    pub duration: f32,
    /// Pitch shift in cents (semitones x 100).
    pub detune_cents: f32,
    /// Peak gain, reached at the grain midpoint.
    pub amplitude: f32,
}

/// dB to linear gain.
pub fn db_to_amplitude(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// Symmetric linear envelope: 0 at the edges, 1 at the midpoint.
pub fn envelope_gain(progress: f32) -> f32 {
    if !(0.0..=1.0).contains(&progress) {
        return 0.0;
    }
    if progress <= 0.5 {
        progress * 2.0
    } else {
        (1.0 - progress) * 2.0
    }
}

/// Mix one grain into `out`, where `out` starts at `timeline_start` on the
/// trigger's clock. Playback rate follows the detune (linear-interpolation
/// resampling); the envelope rises to `amplitude` at the grain midpoint and
/// falls back to zero at the end.
///
/// Offline verification path; the live installation hands triggers to an
/// external audio renderer instead.
pub fn render_grain(
    out: &mut [f32],
    sample_rate: u32,
    timeline_start: f64,
    trigger: &GrainTrigger,
    source: &[f32],
) {
    if sample_rate == 0 || trigger.duration <= 0.0 {
        return;
    }
    let sr = sample_rate as f64;
    let rate = 2.0_f64.powf(trigger.detune_cents as f64 / 1200.0);
    let grain_samples = (trigger.duration as f64 * sr) as usize;
    if grain_samples == 0 {
        return;
    }
    let out_start = (trigger.start_time - timeline_start) * sr;
    let source_start = trigger.source_offset as f64 * sr;
    for n in 0..grain_samples {
        let out_idx = out_start + n as f64;
        if out_idx < 0.0 {
            continue;
        }
        let out_idx = out_idx as usize;
        if out_idx >= out.len() {
            break;
        }
        let progress = n as f32 / grain_samples as f32;
        let gain = trigger.amplitude * envelope_gain(progress);
        let pos = source_start + n as f64 * rate;
        out[out_idx] += gain * sample_at(source, pos);
    }
}

fn sample_at(source: &[f32], pos: f64) -> f32 {
    if pos < 0.0 {
        return 0.0;
    }
    let idx = pos as usize;
    let frac = (pos - idx as f64) as f32;
    let a = source.get(idx).copied().unwrap_or(0.0);
    let b = source.get(idx + 1).copied().unwrap_or(0.0);
    a + (b - a) * frac
}
