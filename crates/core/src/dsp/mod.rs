//! Per-stream DSP pipeline
//!
//! Stage order for one chunk: scale → volume → resample → channel mix →
//! equalize → downsample/convert. Each stage writes into its own scratch
//! buffer owned by the [`AudioProcessor`](processor::AudioProcessor).

pub mod equalizer;
pub mod mix;
pub mod processor;
pub mod resample;
pub mod scale;
pub mod volume;

pub use equalizer::{Equalizer, EQ_BANDS, EQ_FREQUENCIES};
pub use mix::{mix_saturating, ChannelMixer, MixMatrix, MixTaps, SpeakerLayout, SpeakerLayoutTable};
pub use processor::{
    AudioProcessor, ProcessorControls, ProcessorStats, MAX_PLAYBACK_RATE, MAX_VOLUME,
    MIN_PLAYBACK_RATE,
};
pub use resample::{ResampleQuality, StreamResampler};

/// Linear region of [`soft_clip`]
const SOFT_CLIP_KNEE: f32 = 0.8;
/// Input level where the cubic knee reaches full scale
const SOFT_CLIP_LIMIT: f32 = SOFT_CLIP_KNEE + 1.5 * (1.0 - SOFT_CLIP_KNEE);

/// Cubic soft clipper
///
/// Identity below ±0.8, a cubic knee that meets ±1.0 with zero slope at
/// ±1.1, hard limit beyond. Continuous in value and first derivative.
///
/// # Example
/// ```
/// use multiroom_core::dsp::soft_clip;
///
/// assert_eq!(soft_clip(0.5), 0.5);
/// assert!(soft_clip(0.95) < 0.95);
/// assert_eq!(soft_clip(3.0), 1.0);
/// assert_eq!(soft_clip(-3.0), -1.0);
/// ```
#[inline]
pub fn soft_clip(x: f32) -> f32 {
    let a = x.abs();
    if a <= SOFT_CLIP_KNEE {
        return x;
    }
    let y = if a >= SOFT_CLIP_LIMIT {
        1.0
    } else {
        let span = SOFT_CLIP_LIMIT - SOFT_CLIP_KNEE;
        let n = (a - SOFT_CLIP_KNEE) / span;
        (SOFT_CLIP_KNEE + span * (n - n * n * n / 3.0)).min(1.0)
    };
    y.copysign(x)
}
