//! Stage 2: smoothed volume and optional loudness normalization

use super::soft_clip;

/// Levels below this RMS are treated as silence and leave the normalizer alone
const SILENCE_RMS: f32 = 1e-4;

/// Volume ramp plus RMS normalizer state for one stream
#[derive(Debug, Clone)]
pub struct VolumeStage {
    /// Gain currently applied; ramps towards the target every frame
    current: f32,
    smoothing: f32,
    norm_gain: f32,
    target_rms: f32,
    attack: f32,
    decay: f32,
    max_gain: f32,
}

impl VolumeStage {
    pub fn new(
        initial: f32,
        smoothing: f32,
        target_rms: f32,
        attack: f32,
        decay: f32,
        max_gain: f32,
    ) -> Self {
        Self {
            current: initial,
            smoothing,
            norm_gain: 1.0,
            target_rms,
            attack,
            decay,
            max_gain,
        }
    }

    /// Gain applied to the most recent frame
    pub fn current_gain(&self) -> f32 {
        self.current
    }

    /// Normalizer gain after the most recent chunk
    pub fn normalization_gain(&self) -> f32 {
        self.norm_gain
    }

    /// Apply the ramp (and normalizer when enabled) in place
    pub fn process(&mut self, samples: &mut [f32], channels: usize, target: f32, normalize: bool) {
        if channels == 0 {
            return;
        }

        let settled = (self.current - target).abs() < 1e-6;
        if settled {
            self.current = target;
            if (target - 1.0).abs() > f32::EPSILON {
                samples.iter_mut().for_each(|s| *s *= target);
            }
        } else {
            for frame in samples.chunks_exact_mut(channels) {
                self.current += (target - self.current) * self.smoothing;
                for s in frame {
                    *s *= self.current;
                }
            }
        }

        if !normalize {
            self.norm_gain = 1.0;
            return;
        }

        let rms = chunk_rms(samples);
        if rms > SILENCE_RMS {
            let desired = (self.target_rms / rms).min(self.max_gain);
            let coeff = if desired < self.norm_gain {
                self.attack
            } else {
                self.decay
            };
            self.norm_gain += (desired - self.norm_gain) * coeff;
        }
        let gain = self.norm_gain;
        for s in samples.iter_mut() {
            *s = soft_clip(*s * gain);
        }
    }
}

fn chunk_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}
