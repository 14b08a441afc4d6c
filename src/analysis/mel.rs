//! Mel-scaled triangular filterbank and DCT-II decorrelation.

/// Maps a power spectrum to cepstral coefficients: triangular mel filters,
/// log compression, DCT-II. Filter weights are precomputed per (bin, weight)
/// pair so the per-frame cost is a sparse dot product.
pub(crate) struct MelBank {
    coef_count: usize,
    include_first_coef: bool,
    filters: Vec<Vec<(usize, f32)>>,
}

impl MelBank {
    pub(crate) fn new(
        sample_rate: u32,
        fft_len: usize,
        band_count: usize,
        coef_count: usize,
        min_freq_hz: f32,
        max_freq_hz: f32,
        include_first_coef: bool,
    ) -> Self {
        let bins = band_edge_bins(sample_rate, fft_len, band_count, min_freq_hz, max_freq_hz);
        let filters = triangle_filters(&bins, band_count);
        Self {
            coef_count,
            include_first_coef,
            filters,
        }
    }

    /// Cepstral coefficients for one frame's power spectrum.
    ///
    /// Always returns exactly `coef_count` values; when the first DCT
    /// coefficient is excluded the window starts at index 1 instead.
    pub(crate) fn cepstrum_from_power(&self, power: &[f32]) -> Vec<f32> {
        let mut log_energies = Vec::with_capacity(self.filters.len());
        for filter in &self.filters {
            let mut sum = 0.0_f64;
            for &(bin, weight) in filter {
                let p = power.get(bin).copied().unwrap_or(0.0).max(0.0) as f64;
                sum += p * weight as f64;
            }
            log_energies.push((sum.max(1e-12) as f32).ln());
        }
        let skip = usize::from(!self.include_first_coef);
        dct_ii(&log_energies, skip, self.coef_count)
    }
}

fn band_edge_bins(
    sample_rate: u32,
    fft_len: usize,
    band_count: usize,
    min_freq_hz: f32,
    max_freq_hz: f32,
) -> Vec<usize> {
    let nyquist = sample_rate.max(1) as f32 * 0.5;
    let max_freq = max_freq_hz.min(nyquist).max(min_freq_hz);
    let mel_min = hz_to_mel(min_freq_hz);
    let mel_max = hz_to_mel(max_freq);
    (0..(band_count + 2))
        .map(|i| {
            let t = i as f32 / (band_count + 1) as f32;
            let hz = mel_to_hz(mel_min + (mel_max - mel_min) * t);
            freq_to_bin(hz, sample_rate, fft_len)
        })
        .collect()
}

fn triangle_filters(bins: &[usize], band_count: usize) -> Vec<Vec<(usize, f32)>> {
    let mut filters = Vec::with_capacity(band_count);
    for m in 0..band_count {
        let left = bins[m];
        let center = bins[m + 1];
        let right = bins[m + 2].max(center + 1);
        filters.push(triangle_weights(left, center, right));
    }
    filters
}

fn triangle_weights(left: usize, center: usize, right: usize) -> Vec<(usize, f32)> {
    let mut weights = Vec::new();
    if right <= left {
        return weights;
    }
    for bin in left..=right {
        let w = if bin < center {
            if center == left {
                0.0
            } else {
                (bin as f32 - left as f32) / (center as f32 - left as f32)
            }
        } else if right == center {
            0.0
        } else {
            (right as f32 - bin as f32) / (right as f32 - center as f32)
        };
        if w > 0.0 {
            weights.push((bin, w));
        }
    }
    weights
}

fn freq_to_bin(freq_hz: f32, sample_rate: u32, fft_len: usize) -> usize {
    let nyquist = sample_rate.max(1) as f32 * 0.5;
    let freq = freq_hz.clamp(0.0, nyquist);
    (((freq * fft_len as f32) / sample_rate.max(1) as f32).floor() as usize).min(fft_len / 2)
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0_f32 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0_f32 * (10.0_f32.powf(mel / 2595.0) - 1.0)
}

fn dct_ii(values: &[f32], skip: usize, count: usize) -> Vec<f32> {
    let n = values.len().max(1) as f64;
    let mut out = Vec::with_capacity(count);
    for k in skip..(skip + count) {
        let mut sum = 0.0_f64;
        for (m, &v) in values.iter().enumerate() {
            let angle = std::f64::consts::PI * (k as f64) * ((m as f64) + 0.5) / n;
            sum += v as f64 * angle.cos();
        }
        out.push(sum as f32);
    }
    out
}
