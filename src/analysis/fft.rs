use std::f32::consts::PI;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Complex32 {
    pub(crate) re: f32,
    pub(crate) im: f32,
}

impl Complex32 {
    pub(crate) fn new(re: f32, im: f32) -> Self {
        Self { re, im }
    }

    fn mul(self, other: Self) -> Self {
        Self {
            re: self.re * other.re - self.im * other.im,
            im: self.re * other.im + self.im * other.re,
        }
    }

    fn add(self, other: Self) -> Self {
        Self {
            re: self.re + other.re,
            im: self.im + other.im,
        }
    }

    fn sub(self, other: Self) -> Self {
        Self {
            re: self.re - other.re,
            im: self.im - other.im,
        }
    }
}

pub(crate) fn hann_window(length: usize) -> Vec<f32> {
    if length <= 1 {
        return vec![1.0_f32; length.max(1)];
    }
    let denom = (length - 1) as f32;
    (0..length)
        .map(|n| 0.5_f32 * (1.0 - (2.0 * PI * n as f32 / denom).cos()))
        .collect()
}

/// Radix-2 FFT with precomputed bit-reversal swaps and twiddle tables.
///
/// The streaming analyzer runs one transform per hop; the plan keeps that
/// per-frame path free of table rebuilding.
pub(crate) struct FftPlan {
    len: usize,
    swaps: Vec<(usize, usize)>,
    stages: Vec<Vec<Complex32>>,
}

impl FftPlan {
    pub(crate) fn new(len: usize) -> Result<Self, String> {
        if len == 0 || !len.is_power_of_two() {
            return Err(format!("FFT length must be power-of-two, got {len}"));
        }
        Ok(Self {
            len,
            swaps: bit_reversal_swaps(len),
            stages: twiddle_stages(len),
        })
    }

    pub(crate) fn process(&self, buffer: &mut [Complex32]) -> Result<(), String> {
        if buffer.len() != self.len {
            return Err(format!(
                "FFT length mismatch: buffer {} plan {}",
                buffer.len(),
                self.len
            ));
        }
        for &(i, j) in &self.swaps {
            buffer.swap(i, j);
        }
        for stage in &self.stages {
            butterfly_stage(buffer, stage);
        }
        Ok(())
    }
}

fn bit_reversal_swaps(len: usize) -> Vec<(usize, usize)> {
    let mut swaps = Vec::new();
    let mut j = 0usize;
    for i in 1..len {
        let mut bit = len >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j ^= bit;
        if i < j {
            swaps.push((i, j));
        }
    }
    swaps
}

fn twiddle_stages(len: usize) -> Vec<Vec<Complex32>> {
    let mut stages = Vec::new();
    let mut step = 2usize;
    while step <= len {
        let half = step / 2;
        let angle = -2.0_f32 * PI / step as f32;
        let mut stage = Vec::with_capacity(half);
        for i in 0..half {
            let (sin, cos) = (angle * i as f32).sin_cos();
            stage.push(Complex32::new(cos, sin));
        }
        stages.push(stage);
        step *= 2;
    }
    stages
}

fn butterfly_stage(buffer: &mut [Complex32], twiddles: &[Complex32]) {
    let half = twiddles.len();
    let step = half * 2;
    for start in (0..buffer.len()).step_by(step) {
        for i in 0..half {
            let u = buffer[start + i];
            let v = buffer[start + i + half].mul(twiddles[i]);
            buffer[start + i] = u.add(v);
            buffer[start + i + half] = u.sub(v);
        }
    }
}

/// Power spectrum over the first `len/2 + 1` bins.
pub(crate) fn power_spectrum(fft: &[Complex32]) -> Vec<f32> {
    let bins = fft.len() / 2 + 1;
    let mut power = Vec::with_capacity(bins);
    for bin in 0..bins {
        let c = fft[bin];
        power.push((c.re * c.re + c.im * c.im).max(0.0));
    }
    power
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hann_window_is_symmetric_and_zero_at_edges() {
        let w = hann_window(16);
        assert!(w[0].abs() < 1e-6);
        assert!(w[15].abs() < 1e-6);
        assert!((w[3] - w[12]).abs() < 1e-6);
    }

    #[test]
    fn plan_rejects_non_power_of_two() {
        assert!(FftPlan::new(0).is_err());
        assert!(FftPlan::new(1000).is_err());
        assert!(FftPlan::new(1024).is_ok());
    }

    #[test]
    fn constant_signal_concentrates_in_dc_bin() {
        let plan = FftPlan::new(8).unwrap();
        let mut buf = vec![Complex32::new(1.0, 0.0); 8];
        plan.process(&mut buf).unwrap();
        assert!((buf[0].re - 8.0).abs() < 1e-4);
        for bin in 1..8 {
            assert!(buf[bin].re.abs() < 1e-4);
            assert!(buf[bin].im.abs() < 1e-4);
        }
    }

    #[test]
    fn sine_peaks_in_matching_bin() {
        let len = 64;
        let plan = FftPlan::new(len).unwrap();
        let cycle = 4.0_f32;
        let mut buf: Vec<Complex32> = (0..len)
            .map(|i| Complex32::new((2.0 * PI * cycle * i as f32 / len as f32).sin(), 0.0))
            .collect();
        plan.process(&mut buf).unwrap();
        let power = power_spectrum(&buf);
        let peak = power
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(bin, _)| bin)
            .unwrap();
        assert_eq!(peak, 4);
    }

    #[test]
    fn process_rejects_mismatched_buffer() {
        let plan = FftPlan::new(8).unwrap();
        let mut buf = vec![Complex32::default(); 16];
        assert!(plan.process(&mut buf).is_err());
    }
}
