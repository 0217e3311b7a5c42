//! Stream format auto-detection
//!
//! Raw bytes are reinterpreted under every candidate format (sample width,
//! byte order, channel count, 8-bit codec). Real audio is smooth: under the
//! right interpretation consecutive samples of one channel are close
//! together, under a wrong one they look like noise. Each candidate is
//! scored by
//!
//! ```text
//! mean |x[n] - x[n-1]|  /  mean |x - mean(x)|
//! ```
//!
//! per channel (lower is smoother). Noise scores around 1.4, a low-pitched
//! tone well under 0.1. The sample rate comes from arrival timing.

use crate::audio::format::{alaw_to_linear, mulaw_to_linear, pcm_full_scale, read_pcm};
use crate::audio::{ByteOrder, Codec, StreamProperties};
use crate::config::ProbeConfig;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Channel counts considered
const CHANNEL_CANDIDATES: [usize; 5] = [1, 2, 4, 6, 8];

/// Rates the estimate snaps to
const STANDARD_RATES: [u32; 12] = [
    8000, 11025, 16000, 22050, 24000, 32000, 44100, 48000, 88200, 96000, 176400, 192000,
];

/// Retained bytes are discarded in multiples of this so every candidate
/// frame size stays aligned
const ALIGN_BYTES: usize = 288;

/// Best interpretations rougher than this are not audio
const MAX_SMOOTH_SCORE: f64 = 0.5;

/// Candidates within this factor of the best are treated as ties
const TIE_FACTOR: f64 = 1.05;

/// Weight applied to the score of the 8-bit codec the histogram favours
const HISTOGRAM_BIAS: f64 = 0.8;

/// Mean deviation (fraction of full scale) below which input is silence
const MIN_ACTIVITY: f64 = 1e-4;

/// Cross-channel correlation above which channels look duplicated
const DUPLICATE_CORRELATION: f64 = 0.98;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    codec: Codec,
    width: usize,
    order: ByteOrder,
    channels: usize,
    score: f64,
    /// Mean deviation as a fraction of full scale
    activity: f64,
}

impl Candidate {
    fn same_format(&self, other: &Candidate) -> bool {
        self.codec == other.codec && self.width == other.width && self.order == other.order
    }
}

/// Per-stream format detector
#[derive(Debug)]
pub struct AudioFormatProbe {
    config: ProbeConfig,
    buffer: Vec<u8>,
    total_bytes: u64,
    first_chunk: Option<(Instant, usize)>,
    last_arrival: Option<Instant>,
    result: Option<StreamProperties>,
    confidence: f64,
    complete: bool,
}

impl AudioFormatProbe {
    pub fn new(config: ProbeConfig) -> Self {
        Self {
            buffer: Vec::with_capacity(config.max_probe_bytes),
            config,
            total_bytes: 0,
            first_chunk: None,
            last_arrival: None,
            result: None,
            confidence: 0.0,
            complete: false,
        }
    }

    /// Accumulate one chunk. Ignored once detection is complete.
    pub fn add_data(&mut self, bytes: &[u8], arrival: Instant) {
        if self.complete || bytes.is_empty() {
            return;
        }
        if self.first_chunk.is_none() {
            self.first_chunk = Some((arrival, bytes.len()));
        }
        self.last_arrival = Some(arrival);
        self.total_bytes += bytes.len() as u64;

        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() > self.config.max_probe_bytes {
            let excess = self.buffer.len() - self.config.max_probe_bytes;
            let discard = excess.div_ceil(ALIGN_BYTES) * ALIGN_BYTES;
            self.buffer.drain(..discard.min(self.buffer.len()));
        }
    }

    pub fn has_sufficient_data(&self) -> bool {
        self.buffer.len() >= self.config.min_probe_bytes
    }

    pub fn bytes_received(&self) -> u64 {
        self.total_bytes
    }

    pub fn is_detection_complete(&self) -> bool {
        self.complete
    }

    pub fn detected_properties(&self) -> Option<StreamProperties> {
        self.result
    }

    /// Confidence of the last detection attempt (0.0-1.0)
    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Try to detect the format from the data so far
    ///
    /// Returns false when there is not enough data, the input is silent or
    /// ambiguous, or confidence is below the configured minimum. A later
    /// call with more data may succeed. Once it returns true the result is
    /// locked.
    pub fn finalize_detection(&mut self) -> bool {
        if self.complete {
            return true;
        }
        if !self.has_sufficient_data() {
            debug!(
                "Probe has {} of {} bytes, not enough to detect",
                self.buffer.len(),
                self.config.min_probe_bytes
            );
            return false;
        }

        let Some((best, candidates)) = self.choose_candidate() else {
            self.confidence = 0.0;
            return false;
        };

        let (sample_rate, rate_fit) = self.estimate_rate(best.width * best.channels);
        let props = StreamProperties {
            codec: best.codec,
            bit_depth: (best.width * 8) as u8,
            channels: best.channels,
            byte_order: best.order,
            sample_rate,
        };

        let (format_margin, channel_margin) = self.margins(&best, &candidates);
        self.confidence = (0.5 * format_margin + 0.3 * channel_margin + 0.2 * rate_fit).clamp(0.0, 1.0);

        if self.confidence < self.config.min_confidence {
            debug!(
                "Probe candidate {:?} {}-bit {} ch rejected, confidence {:.2} < {:.2}",
                props.codec, props.bit_depth, props.channels, self.confidence, self.config.min_confidence
            );
            return false;
        }

        info!(
            "Detected stream format: {:?} {}-bit {:?} {} ch @ {} Hz (confidence {:.2})",
            props.codec,
            props.bit_depth,
            props.byte_order,
            props.channels,
            props.sample_rate,
            self.confidence
        );
        self.result = Some(props);
        self.complete = true;
        true
    }

    /// Clear all accumulated data and any locked result
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.total_bytes = 0;
        self.first_chunk = None;
        self.last_arrival = None;
        self.result = None;
        self.confidence = 0.0;
        self.complete = false;
    }

    fn choose_candidate(&self) -> Option<(Candidate, Vec<Candidate>)> {
        let candidates = self.score_all();
        let best_score = candidates
            .iter()
            .map(|c| c.score)
            .fold(f64::INFINITY, f64::min);

        if !best_score.is_finite() {
            debug!("Probe input is silent");
            return None;
        }
        if best_score > MAX_SMOOTH_SCORE {
            debug!("No smooth interpretation (best score {:.3})", best_score);
            return None;
        }

        let best = candidates
            .iter()
            .filter(|c| c.score <= best_score * TIE_FACTOR)
            .min_by(|a, b| a.channels.cmp(&b.channels).then(b.width.cmp(&a.width)))
            .copied()?;

        if best.activity < MIN_ACTIVITY {
            debug!("Probe input is near-silent (activity {:.2e})", best.activity);
            return None;
        }
        Some((best, candidates))
    }

    /// Score every candidate interpretation; rejected ones are omitted
    fn score_all(&self) -> Vec<Candidate> {
        let bytes = &self.buffer;
        let mut out = Vec::new();

        for width in [2usize, 3, 4] {
            for order in [ByteOrder::Little, ByteOrder::Big] {
                let usable = bytes.len() / width * width;
                let samples: Vec<f64> = bytes[..usable]
                    .chunks_exact(width)
                    .map(|c| read_pcm(c, (width * 8) as u8, order) as f64)
                    .collect();
                let low_halves: Option<Vec<f64>> = (width == 4).then(|| {
                    bytes[..usable]
                        .chunks_exact(4)
                        .map(|c| (read_pcm(c, 32, order) & 0xFFFF) as u16 as i16 as f64)
                        .collect()
                });
                let full_scale = pcm_full_scale((width * 8) as u8) as f64;

                for channels in CHANNEL_CANDIDATES {
                    let Some((score, activity)) = discontinuity(&samples, channels) else {
                        continue;
                    };
                    if let Some(low) = &low_halves {
                        if matches!(discontinuity(low, channels), Some((s, _)) if s < MAX_SMOOTH_SCORE) {
                            continue;
                        }
                    }
                    out.push(Candidate {
                        codec: Codec::Pcm,
                        width,
                        order,
                        channels,
                        score,
                        activity: activity / full_scale,
                    });
                }
            }
        }

        let favoured = histogram_cue(bytes);
        for codec in [Codec::Pcm, Codec::MuLaw, Codec::ALaw] {
            let (samples, full_scale): (Vec<f64>, f64) = match codec {
                Codec::Pcm => (bytes.iter().map(|&b| b as f64 - 128.0).collect(), 128.0),
                Codec::MuLaw => (bytes.iter().map(|&b| mulaw_to_linear(b) as f64).collect(), 32768.0),
                Codec::ALaw => (bytes.iter().map(|&b| alaw_to_linear(b) as f64).collect(), 32768.0),
            };
            let bias = if favoured == Some(codec) { HISTOGRAM_BIAS } else { 1.0 };
            for channels in CHANNEL_CANDIDATES {
                let Some((score, activity)) = discontinuity(&samples, channels) else {
                    continue;
                };
                out.push(Candidate {
                    codec,
                    width: 1,
                    order: ByteOrder::Little,
                    channels,
                    score: score * bias,
                    activity: activity / full_scale,
                });
            }
        }

        out
    }

    /// How clearly the chosen candidate beats other formats and other
    /// channel counts
    fn margins(&self, best: &Candidate, candidates: &[Candidate]) -> (f64, f64) {
        let margin = |other: f64| {
            if other.is_finite() && other > 0.0 {
                (1.0 - best.score / other).clamp(0.0, 1.0)
            } else {
                1.0
            }
        };

        let other_format = candidates
            .iter()
            .filter(|c| !c.same_format(best))
            .map(|c| c.score)
            .fold(f64::INFINITY, f64::min);
        let other_channels = candidates
            .iter()
            .filter(|c| c.same_format(best) && c.channels != best.channels)
            .map(|c| c.score)
            .fold(f64::INFINITY, f64::min);

        let mut channel_margin = margin(other_channels);
        if best.channels >= 2 {
            if let Some(corr) = self.channel_correlation(best) {
                if corr > DUPLICATE_CORRELATION {
                    debug!(
                        "Channels 0 and 1 correlate at {:.3}, content may be duplicated mono",
                        corr
                    );
                    channel_margin *= 0.5;
                }
            }
        }
        (margin(other_format), channel_margin)
    }

    fn channel_correlation(&self, best: &Candidate) -> Option<f64> {
        let props = StreamProperties {
            codec: best.codec,
            bit_depth: (best.width * 8) as u8,
            channels: best.channels,
            byte_order: best.order,
            sample_rate: 48000,
        };
        let frame = props.frame_bytes();
        let width = best.width;
        let (a, b): (Vec<f64>, Vec<f64>) = self
            .buffer
            .chunks_exact(frame)
            .map(|f| (props.read_sample(&f[..width]) as f64, props.read_sample(&f[width..2 * width]) as f64))
            .unzip();
        pearson(&a, &b)
    }

    /// Byte rate over arrival time, converted to a standard sample rate
    ///
    /// Returns the rate and how well the raw estimate fits it (0.0-1.0).
    fn estimate_rate(&self, frame_bytes: usize) -> (u32, f64) {
        let (Some((first_at, first_len)), Some(last)) = (self.first_chunk, self.last_arrival) else {
            return (48000, 0.0);
        };
        let elapsed = last.saturating_duration_since(first_at);
        if elapsed < Duration::from_millis(self.config.min_rate_window_ms) || frame_bytes == 0 {
            debug!("Probe arrival window {:?} too short for a rate estimate", elapsed);
            return (48000, 0.0);
        }

        let bytes = self.total_bytes.saturating_sub(first_len as u64) as f64;
        let raw = bytes / elapsed.as_secs_f64() / frame_bytes as f64;
        let snapped = STANDARD_RATES
            .iter()
            .copied()
            .min_by(|a, b| {
                let da = (raw - *a as f64).abs() / *a as f64;
                let db = (raw - *b as f64).abs() / *b as f64;
                da.total_cmp(&db)
            })
            .unwrap_or(48000);
        let rel_err = (raw - snapped as f64).abs() / snapped as f64;
        debug!("Estimated rate {:.0} Hz, snapped to {} Hz", raw, snapped);
        (snapped, (1.0 - rel_err * 20.0).clamp(0.0, 1.0))
    }
}

/// Mean per-channel discontinuity score and mean absolute deviation
///
/// Channels without any variation are skipped; `None` when every channel is
/// constant or there are too few frames.
fn discontinuity(samples: &[f64], channels: usize) -> Option<(f64, f64)> {
    let frames = samples.len() / channels;
    if frames < 16 {
        return None;
    }

    let mut score_sum = 0.0;
    let mut activity_sum = 0.0;
    let mut scored = 0usize;
    for ch in 0..channels {
        let channel = || samples.iter().skip(ch).step_by(channels).take(frames);
        let mean = channel().sum::<f64>() / frames as f64;
        let deviation = channel().map(|x| (x - mean).abs()).sum::<f64>() / frames as f64;
        activity_sum += deviation;
        if deviation <= f64::EPSILON {
            continue;
        }
        let mut prev: Option<f64> = None;
        let mut diff_sum = 0.0;
        for &x in channel() {
            if let Some(p) = prev {
                diff_sum += (x - p).abs();
            }
            prev = Some(x);
        }
        score_sum += diff_sum / (frames - 1) as f64 / deviation;
        scored += 1;
    }

    if scored == 0 {
        return None;
    }
    Some((score_sum / scored as f64, activity_sum / channels as f64))
}

/// 8-bit codec suggested by the byte histogram, if any
///
/// Near-silence sits at 0x80 for unsigned linear, at the top of each half
/// (0xFF / 0x7F) for μ-law and around 0xD5 / 0x55 for A-law.
fn histogram_cue(bytes: &[u8]) -> Option<Codec> {
    if bytes.is_empty() {
        return None;
    }
    let mut hist = [0usize; 256];
    for &b in bytes {
        hist[b as usize] += 1;
    }
    let frac = |lo: usize, hi: usize| hist[lo..=hi].iter().sum::<usize>() as f64 / bytes.len() as f64;

    let linear = frac(0x78, 0x87);
    let mulaw = frac(0xF0, 0xFF) + frac(0x70, 0x77);
    let alaw = frac(0xD0, 0xDF) + frac(0x50, 0x5F);

    let (codec, weight) = [(Codec::Pcm, linear), (Codec::MuLaw, mulaw), (Codec::ALaw, alaw)]
        .into_iter()
        .max_by(|a, b| a.1.total_cmp(&b.1))?;
    (weight > 0.1).then_some(codec)
}

fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 2 {
        return None;
    }
    let ma = a[..n].iter().sum::<f64>() / n as f64;
    let mb = b[..n].iter().sum::<f64>() / n as f64;
    let (mut cov, mut va, mut vb) = (0.0, 0.0, 0.0);
    for i in 0..n {
        let (da, db) = (a[i] - ma, b[i] - mb);
        cov += da * db;
        va += da * da;
        vb += db * db;
    }
    if va <= f64::EPSILON || vb <= f64::EPSILON {
        return None;
    }
    Some(cov / (va.sqrt() * vb.sqrt()))
}
