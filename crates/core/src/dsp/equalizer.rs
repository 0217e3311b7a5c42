//! Stage 5: 18-band peaking equalizer
//!
//! Bands sit half an octave apart from C2 upward. Each band is an RBJ
//! peaking biquad run in transposed direct form II with f64 state.

use super::soft_clip;
use tracing::debug;

pub const EQ_BANDS: usize = 18;

/// Band centre frequencies in Hz
pub const EQ_FREQUENCIES: [f64; EQ_BANDS] = [
    65.406392, 92.498606, 130.81278, 184.99721, 261.62557, 369.99442, 523.25113, 739.9884,
    1046.5023, 1479.9768, 2093.0045, 2959.9536, 4186.0091, 5919.9072, 8372.0181, 11839.814,
    16744.036, 20000.0,
];

const EQ_Q: f64 = 1.41;
const MIN_GAIN: f32 = 0.01;
const MAX_GAIN: f32 = 10.0;
/// Bands closer to unity than this are bypassed
const UNITY_EPSILON: f32 = 1e-4;
/// Bands above this fraction of the sample rate are bypassed
const MAX_BAND_FRACTION: f64 = 0.45;

#[derive(Debug, Clone, Copy, Default)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Biquad {
    fn peaking(freq: f64, sample_rate: f64, gain: f32) -> Self {
        let a = (gain as f64).sqrt();
        let w0 = 2.0 * std::f64::consts::PI * freq / sample_rate;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * EQ_Q);
        let a0 = 1.0 + alpha / a;
        Self {
            b0: (1.0 + alpha * a) / a0,
            b1: (-2.0 * cos) / a0,
            b2: (1.0 - alpha * a) / a0,
            a1: (-2.0 * cos) / a0,
            a2: (1.0 - alpha / a) / a0,
        }
    }

    #[inline]
    fn run(&self, x: f64, z: &mut [f64; 2]) -> f64 {
        let y = self.b0 * x + z[0];
        z[0] = self.b1 * x - self.a1 * y + z[1];
        z[1] = self.b2 * x - self.a2 * y;
        y
    }
}

/// Multi-channel equalizer state
#[derive(Debug, Clone)]
pub struct Equalizer {
    sample_rate: u32,
    gains: [f32; EQ_BANDS],
    filters: [Biquad; EQ_BANDS],
    active: [bool; EQ_BANDS],
    normalize: bool,
    output_gain: f32,
    /// `state[channel][band]`
    state: Vec<[[f64; 2]; EQ_BANDS]>,
}

impl Equalizer {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        let mut eq = Self {
            sample_rate,
            gains: [1.0; EQ_BANDS],
            filters: [Biquad::default(); EQ_BANDS],
            active: [false; EQ_BANDS],
            normalize: false,
            output_gain: 1.0,
            state: vec![[[0.0; 2]; EQ_BANDS]; channels],
        };
        eq.rebuild();
        eq
    }

    pub fn gains(&self) -> &[f32; EQ_BANDS] {
        &self.gains
    }

    /// True when every band is bypassed
    pub fn is_flat(&self) -> bool {
        !self.active.iter().any(|&a| a)
    }

    pub fn output_gain(&self) -> f32 {
        self.output_gain
    }

    /// Replace band gains; filter state is kept so changes do not click
    pub fn set_gains(&mut self, gains: &[f32; EQ_BANDS]) {
        for (dst, &g) in self.gains.iter_mut().zip(gains) {
            if g.is_finite() {
                *dst = g.clamp(MIN_GAIN, MAX_GAIN);
            }
        }
        self.rebuild();
    }

    /// Scale the output down by the largest band boost
    pub fn set_normalization(&mut self, enabled: bool) {
        self.normalize = enabled;
        self.rebuild();
    }

    /// Clear filter memory; gains and coefficients are kept
    pub fn reset(&mut self) {
        for ch in &mut self.state {
            *ch = [[0.0; 2]; EQ_BANDS];
        }
    }

    fn rebuild(&mut self) {
        let fs = self.sample_rate as f64;
        for band in 0..EQ_BANDS {
            let gain = self.gains[band];
            let freq = EQ_FREQUENCIES[band];
            self.active[band] = (gain - 1.0).abs() >= UNITY_EPSILON && freq < MAX_BAND_FRACTION * fs;
            if self.active[band] {
                self.filters[band] = Biquad::peaking(freq, fs, gain);
            }
        }

        let max_boost = self
            .gains
            .iter()
            .zip(&self.active)
            .filter(|(_, active)| **active)
            .map(|(&g, _)| g)
            .fold(1.0f32, f32::max);
        self.output_gain = if self.normalize && max_boost > 1.0 {
            1.0 / max_boost
        } else {
            1.0
        };

        debug!(
            "Equalizer rebuilt: {} active bands at {} Hz, output gain {:.3}",
            self.active.iter().filter(|&&a| a).count(),
            self.sample_rate,
            self.output_gain
        );
    }

    /// Filter `frames` frames of each planar channel in place
    pub fn process(&mut self, channels: &mut [Vec<f32>], frames: usize) {
        if self.is_flat() {
            return;
        }
        if self.state.len() < channels.len() {
            self.state.resize(channels.len(), [[0.0; 2]; EQ_BANDS]);
        }

        let output_gain = self.output_gain;
        for (samples, state) in channels.iter_mut().zip(self.state.iter_mut()) {
            let n = frames.min(samples.len());
            for s in &mut samples[..n] {
                let mut x = *s;
                for band in 0..EQ_BANDS {
                    if !self.active[band] {
                        continue;
                    }
                    x = soft_clip(self.filters[band].run(x as f64, &mut state[band]) as f32);
                }
                *s = x * output_gain;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn tone(freq: f32, rate: f32, frames: usize, amp: f32) -> Vec<f32> {
        (0..frames).map(|i| (2.0 * PI * freq * i as f32 / rate).sin() * amp).collect()
    }

    fn rms(x: &[f32]) -> f32 {
        (x.iter().map(|s| s * s).sum::<f32>() / x.len() as f32).sqrt()
    }

    #[test]
    fn test_flat_is_bypassed_bit_exact() {
        let mut eq = Equalizer::new(48000, 1);
        assert!(eq.is_flat());
        let input = tone(1000.0, 48000.0, 480, 0.5);
        let mut buf = vec![input.clone()];
        eq.process(&mut buf, 480);
        assert_eq!(buf[0], input);
    }

    #[test]
    fn test_band_boost_and_cut() {
        let band = 8; // ~1046 Hz
        let freq = EQ_FREQUENCIES[band] as f32;

        let mut gains = [1.0; EQ_BANDS];
        gains[band] = 2.0;
        let mut eq = Equalizer::new(48000, 1);
        eq.set_gains(&gains);
        let mut buf = vec![tone(freq, 48000.0, 9600, 0.1)];
        eq.process(&mut buf, 9600);
        let boosted = rms(&buf[0][4800..]) / rms(&tone(freq, 48000.0, 4800, 0.1));
        assert!(boosted > 1.6 && boosted < 2.4, "boost {boosted}");

        gains[band] = 0.5;
        let mut eq = Equalizer::new(48000, 1);
        eq.set_gains(&gains);
        let mut buf = vec![tone(freq, 48000.0, 9600, 0.1)];
        eq.process(&mut buf, 9600);
        let cut = rms(&buf[0][4800..]) / rms(&tone(freq, 48000.0, 4800, 0.1));
        assert!(cut > 0.4 && cut < 0.6, "cut {cut}");
    }

    #[test]
    fn test_reset_clears_ringing_but_keeps_gains() {
        let mut gains = [1.0; EQ_BANDS];
        gains[2] = 4.0;
        let mut eq = Equalizer::new(48000, 1);
        eq.set_gains(&gains);

        let mut impulse = vec![vec![0.0f32; 64]];
        impulse[0][0] = 0.5;
        eq.process(&mut impulse, 64);
        let mut silence = vec![vec![0.0f32; 64]];
        eq.process(&mut silence, 64);
        assert!(silence[0].iter().any(|s| s.abs() > 1e-6));

        eq.reset();
        let mut silence = vec![vec![0.0f32; 64]];
        eq.process(&mut silence, 64);
        assert!(silence[0].iter().all(|&s| s == 0.0));
        assert_eq!(eq.gains()[2], 4.0);
        assert!(!eq.is_flat());
    }

    #[test]
    fn test_gains_clamped_and_nan_ignored() {
        let mut eq = Equalizer::new(48000, 2);
        let mut gains = [1.0; EQ_BANDS];
        gains[0] = 100.0;
        gains[1] = -3.0;
        gains[2] = f32::NAN;
        eq.set_gains(&gains);
        assert_eq!(eq.gains()[0], MAX_GAIN);
        assert_eq!(eq.gains()[1], MIN_GAIN);
        assert_eq!(eq.gains()[2], 1.0);
    }

    #[test]
    fn test_bands_above_nyquist_margin_bypassed() {
        let mut eq = Equalizer::new(8000, 1);
        let mut gains = [1.0; EQ_BANDS];
        gains[EQ_BANDS - 1] = 4.0;
        eq.set_gains(&gains);
        assert!(eq.is_flat());
    }

    #[test]
    fn test_normalization_scales_by_max_boost() {
        let mut eq = Equalizer::new(48000, 1);
        let mut gains = [1.0; EQ_BANDS];
        gains[4] = 4.0;
        eq.set_gains(&gains);
        eq.set_normalization(true);
        assert!((eq.output_gain() - 0.25).abs() < 1e-6);

        let mut buf = vec![tone(1000.0, 48000.0, 4800, 0.9)];
        eq.process(&mut buf, 4800);
        assert!(buf[0].iter().all(|s| s.is_finite() && s.abs() <= 1.0));
    }
}
