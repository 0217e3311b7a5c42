//! Per-stream audio processor
//!
//! `AudioProcessor` is owned by the ingest thread of one source and turns
//! raw payload chunks into interleaved i32 blocks at the sink's channel
//! count and rate. Live controls (volume, EQ, playback rate, speaker
//! layouts) go through [`ProcessorControls`], a cloneable handle that other
//! threads may use while processing runs. Scalar controls are atomics; the
//! mix state sits behind an `RwLock` the hot path only reads.

use crate::audio::format::f32_to_i32;
use crate::audio::StreamProperties;
use crate::config::ProcessorConfig;
use crate::dsp::equalizer::{Equalizer, EQ_BANDS};
use crate::dsp::mix::{explicit_matrix, select_matrix, ChannelMixer, MixMatrix, MixTaps, SpeakerLayoutTable};
use crate::dsp::resample::{ResampleQuality, StreamResampler};
use crate::dsp::scale::scale_to_f32;
use crate::dsp::volume::VolumeStage;
use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const MIN_PLAYBACK_RATE: f64 = 0.9;
pub const MAX_PLAYBACK_RATE: f64 = 1.1;
pub const MAX_VOLUME: f32 = 2.0;

/// Headroom the resampler is built with beyond the playback-rate range
const MAX_RELATIVE_RATIO: f64 = 1.12;
/// Frames rubato adds to every output bound
const RESAMPLER_MARGIN: usize = 10;

/// Active channel mix
#[derive(Debug)]
struct MixState {
    layouts: SpeakerLayoutTable,
    input_channels: usize,
    output_channels: usize,
    matrix: MixMatrix,
    taps: MixTaps,
}

impl MixState {
    fn new(layouts: SpeakerLayoutTable, input_channels: usize, output_channels: usize) -> Self {
        let matrix = select_matrix(&layouts, input_channels, output_channels);
        let taps = MixTaps::from_matrix(&matrix, input_channels, output_channels);
        Self {
            layouts,
            input_channels,
            output_channels,
            matrix,
            taps,
        }
    }

    fn rebind(&mut self, input_channels: usize) {
        self.input_channels = input_channels;
        let matrix = select_matrix(&self.layouts, input_channels, self.output_channels);
        self.install(matrix);
    }

    fn install(&mut self, matrix: MixMatrix) {
        self.taps = MixTaps::from_matrix(&matrix, self.input_channels, self.output_channels);
        self.matrix = matrix;
    }
}

#[derive(Debug)]
struct EqSettings {
    gains: [f32; EQ_BANDS],
    normalize: bool,
}

#[derive(Debug)]
struct Shared {
    /// f32 bits
    volume: AtomicU32,
    /// f64 bits
    playback_rate: AtomicU64,
    volume_normalization: AtomicBool,
    eq: Mutex<EqSettings>,
    /// Bumped on every EQ change so the hot path can skip the lock
    eq_generation: AtomicU64,
    mix: RwLock<MixState>,
}

/// Thread-safe handle to a processor's live controls
#[derive(Debug, Clone)]
pub struct ProcessorControls {
    shared: Arc<Shared>,
}

impl ProcessorControls {
    /// Target volume, clamped to `[0, MAX_VOLUME]`; non-finite values are ignored
    pub fn set_volume(&self, volume: f32) {
        if !volume.is_finite() {
            warn!("Ignoring non-finite volume {}", volume);
            return;
        }
        let v = volume.clamp(0.0, MAX_VOLUME);
        self.shared.volume.store(v.to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.shared.volume.load(Ordering::Relaxed))
    }

    /// Replace all band gains (linear). Non-finite entries keep their old value.
    pub fn set_equalizer(&self, gains: &[f32; EQ_BANDS]) {
        let mut eq = self.shared.eq.lock();
        for (dst, &g) in eq.gains.iter_mut().zip(gains) {
            if g.is_finite() {
                *dst = g;
            }
        }
        drop(eq);
        self.shared.eq_generation.fetch_add(1, Ordering::Release);
    }

    pub fn equalizer(&self) -> [f32; EQ_BANDS] {
        self.shared.eq.lock().gains
    }

    pub fn set_volume_normalization(&self, enabled: bool) {
        self.shared.volume_normalization.store(enabled, Ordering::Relaxed);
    }

    pub fn volume_normalization(&self) -> bool {
        self.shared.volume_normalization.load(Ordering::Relaxed)
    }

    pub fn set_eq_normalization(&self, enabled: bool) {
        self.shared.eq.lock().normalize = enabled;
        self.shared.eq_generation.fetch_add(1, Ordering::Release);
    }

    /// Playback-rate multiplier, clamped to `[MIN_PLAYBACK_RATE, MAX_PLAYBACK_RATE]`
    ///
    /// Values above 1.0 produce more output frames per input frame.
    pub fn set_playback_rate(&self, rate: f64) {
        if !rate.is_finite() {
            warn!("Ignoring non-finite playback rate {}", rate);
            return;
        }
        let r = rate.clamp(MIN_PLAYBACK_RATE, MAX_PLAYBACK_RATE);
        self.shared.playback_rate.store(r.to_bits(), Ordering::Relaxed);
    }

    pub fn playback_rate(&self) -> f64 {
        f64::from_bits(self.shared.playback_rate.load(Ordering::Relaxed))
    }

    /// Swap the whole layout table and re-derive the active mix
    pub fn update_speaker_layouts_config(&self, layouts: SpeakerLayoutTable) {
        let mut mix = self.shared.mix.write();
        let matrix = select_matrix(&layouts, mix.input_channels, mix.output_channels);
        mix.layouts = layouts;
        mix.install(matrix);
        debug!(
            "Speaker layouts updated: {} -> {} channels, identity {}",
            mix.input_channels,
            mix.output_channels,
            mix.taps.is_identity()
        );
    }

    /// Install an explicit matrix (`rows[input][output]`), or re-derive from
    /// the layout table when `None`
    ///
    /// A matrix that does not fit the active layout is rejected and the
    /// automatic mix is installed instead; the validation error is returned.
    pub fn apply_speaker_mix(&self, rows: Option<Vec<Vec<f32>>>) -> Result<()> {
        let mut mix = self.shared.mix.write();
        let (inputs, outputs) = (mix.input_channels, mix.output_channels);
        match rows {
            None => {
                let matrix = select_matrix(&mix.layouts, inputs, outputs);
                mix.install(matrix);
                Ok(())
            }
            Some(rows) => match explicit_matrix(&rows, inputs, outputs) {
                Ok(matrix) => {
                    mix.install(matrix);
                    Ok(())
                }
                Err(e) => {
                    warn!("Explicit speaker mix rejected ({}), using automatic mix", e);
                    mix.install(crate::dsp::mix::auto_matrix(inputs, outputs));
                    Err(e)
                }
            },
        }
    }

    /// Copy of the active `[input][output]` matrix
    pub fn mix_matrix(&self) -> MixMatrix {
        self.shared.mix.read().matrix
    }
}

/// Counters for one processor
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessorStats {
    pub chunks_processed: u64,
    pub chunks_dropped: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    /// Frames discarded because the caller's output block was too small
    pub frames_truncated: u64,
    pub playback_rate: f64,
    pub volume: f32,
    pub resampler_active: bool,
}

/// Grow a scratch buffer without aborting on allocation failure
fn reserve<T>(buf: &mut Vec<T>, needed: usize) -> Result<()> {
    buf.clear();
    buf.try_reserve(needed)?;
    Ok(())
}

fn reserve_planar(bufs: &mut [Vec<f32>], needed: usize) -> Result<()> {
    for b in bufs {
        reserve(b, needed)?;
    }
    Ok(())
}

/// Per-stream DSP pipeline
pub struct AudioProcessor {
    input: StreamProperties,
    output_channels: usize,
    output_rate: u32,
    oversampling: u32,
    internal_rate: u32,
    quality: ResampleQuality,

    controls: ProcessorControls,
    volume: VolumeStage,
    resampler: Option<StreamResampler>,
    /// True while the resampler is skipped at unity ratio
    bypassing: bool,
    downsampler: Option<StreamResampler>,
    equalizer: Equalizer,
    eq_generation: u64,

    interleaved: Vec<f32>,
    planar_in: Vec<Vec<f32>>,
    planar_rs: Vec<Vec<f32>>,
    planar_mix: Vec<Vec<f32>>,
    planar_out: Vec<Vec<f32>>,

    stats: ProcessorStats,
}

impl AudioProcessor {
    pub fn new(config: &ProcessorConfig) -> Result<Self> {
        config.validate()?;
        let input = config.input;
        let internal_rate = config
            .output_sample_rate
            .checked_mul(config.oversampling)
            .ok_or_else(|| Error::InvalidConfig("output rate x oversampling overflows".into()))?;

        let shared = Shared {
            volume: AtomicU32::new(config.volume.clamp(0.0, MAX_VOLUME).to_bits()),
            playback_rate: AtomicU64::new(1.0f64.to_bits()),
            volume_normalization: AtomicBool::new(config.volume_normalization),
            eq: Mutex::new(EqSettings {
                gains: [1.0; EQ_BANDS],
                normalize: config.eq_normalization,
            }),
            eq_generation: AtomicU64::new(1),
            mix: RwLock::new(MixState::new(
                config.layout_table(),
                input.channels,
                config.output_channels,
            )),
        };

        info!(
            "Creating AudioProcessor: {:?} {}-bit {} ch @ {} Hz -> {} ch @ {} Hz (oversampling x{})",
            input.codec,
            input.bit_depth,
            input.channels,
            input.sample_rate,
            config.output_channels,
            config.output_sample_rate,
            config.oversampling
        );

        Ok(Self {
            input,
            output_channels: config.output_channels,
            output_rate: config.output_sample_rate,
            oversampling: config.oversampling,
            internal_rate,
            quality: config.resample_quality,
            controls: ProcessorControls {
                shared: Arc::new(shared),
            },
            volume: VolumeStage::new(
                config.volume.clamp(0.0, MAX_VOLUME),
                config.volume_smoothing,
                config.normalization_target_rms,
                config.normalization_attack,
                config.normalization_decay,
                config.normalization_max_gain,
            ),
            resampler: None,
            bypassing: true,
            downsampler: None,
            equalizer: Equalizer::new(internal_rate, config.output_channels),
            eq_generation: 0,
            interleaved: Vec::new(),
            planar_in: vec![Vec::new(); input.channels],
            planar_rs: vec![Vec::new(); input.channels],
            planar_mix: vec![Vec::new(); config.output_channels],
            planar_out: vec![Vec::new(); config.output_channels],
            stats: ProcessorStats::default(),
        })
    }

    pub fn controls(&self) -> ProcessorControls {
        self.controls.clone()
    }

    /// Switch to a new input format, keeping live controls and the equalizer
    ///
    /// Stream history (resampler state, EQ filter memory) is dropped; volume,
    /// EQ gains, playback rate and the layout table carry over, so handles
    /// from [`controls`](Self::controls) stay valid. The mix is re-derived
    /// for the new channel count.
    pub fn reconfigure(&mut self, input: StreamProperties) -> Result<()> {
        input.validate()?;
        info!(
            "Reconfiguring AudioProcessor: {:?} {}-bit {} ch @ {} Hz -> {:?} {}-bit {} ch @ {} Hz",
            self.input.codec,
            self.input.bit_depth,
            self.input.channels,
            self.input.sample_rate,
            input.codec,
            input.bit_depth,
            input.channels,
            input.sample_rate
        );

        self.controls.shared.mix.write().rebind(input.channels);
        self.resampler = None;
        self.bypassing = true;
        if let Some(ds) = self.downsampler.as_mut() {
            ds.reset();
        }
        self.equalizer.reset();
        self.planar_in = vec![Vec::new(); input.channels];
        self.planar_rs = vec![Vec::new(); input.channels];
        self.input = input;
        Ok(())
    }

    /// Upper bound on the samples one `process_audio` call can write for
    /// `in_frames` input frames, in output frames
    pub fn max_output_frames(&self, in_frames: usize) -> usize {
        let step = self.internal_rate as f64 / self.input.sample_rate as f64;
        let internal = match &self.resampler {
            Some(rs) => rs.max_output_frames(in_frames),
            None => (in_frames as f64 * step * MAX_RELATIVE_RATIO) as usize + RESAMPLER_MARGIN,
        }
        .max(in_frames);

        if self.oversampling == 1 {
            return internal;
        }
        match &self.downsampler {
            Some(ds) => ds.max_output_frames(internal),
            None => (internal as f64 / self.oversampling as f64 * MAX_RELATIVE_RATIO) as usize + RESAMPLER_MARGIN,
        }
    }

    pub fn input_properties(&self) -> &StreamProperties {
        &self.input
    }

    pub fn output_channels(&self) -> usize {
        self.output_channels
    }

    pub fn output_sample_rate(&self) -> u32 {
        self.output_rate
    }

    pub fn set_volume(&self, volume: f32) {
        self.controls.set_volume(volume);
    }

    pub fn set_equalizer(&self, gains: &[f32; EQ_BANDS]) {
        self.controls.set_equalizer(gains);
    }

    pub fn set_volume_normalization(&self, enabled: bool) {
        self.controls.set_volume_normalization(enabled);
    }

    pub fn set_eq_normalization(&self, enabled: bool) {
        self.controls.set_eq_normalization(enabled);
    }

    pub fn set_playback_rate(&self, rate: f64) {
        self.controls.set_playback_rate(rate);
    }

    pub fn update_speaker_layouts_config(&self, layouts: SpeakerLayoutTable) {
        self.controls.update_speaker_layouts_config(layouts);
    }

    pub fn apply_speaker_mix(&self, rows: Option<Vec<Vec<f32>>>) -> Result<()> {
        self.controls.apply_speaker_mix(rows)
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            playback_rate: self.controls.playback_rate(),
            volume: self.volume.current_gain(),
            resampler_active: !self.bypassing,
            ..self.stats.clone()
        }
    }

    /// Process one chunk of raw payload into interleaved i32 samples
    ///
    /// Returns the number of samples written to `output` (frames x output
    /// channels). Output that does not fit is discarded. Resource failures
    /// drop the chunk and return 0.
    pub fn process_audio(&mut self, input: &[u8], output: &mut [i32]) -> usize {
        match self.run_stages(input, output) {
            Ok(written) => {
                self.stats.chunks_processed += 1;
                written
            }
            Err(e) => {
                self.stats.chunks_dropped += 1;
                error!("Dropping audio chunk: {}", e);
                0
            }
        }
    }

    fn run_stages(&mut self, input: &[u8], output: &mut [i32]) -> Result<usize> {
        let in_ch = self.input.channels;
        let frame_bytes = self.input.frame_bytes();
        if frame_bytes == 0 || input.len() < frame_bytes {
            return Ok(0);
        }
        let frames = input.len() / frame_bytes;

        // 1. scale
        reserve(&mut self.interleaved, frames * in_ch)?;
        scale_to_f32(input, &self.input, &mut self.interleaved);

        // 2. volume
        let target = self.controls.volume();
        let normalize = self.controls.volume_normalization();
        self.volume.process(&mut self.interleaved, in_ch, target, normalize);

        reserve_planar(&mut self.planar_in, frames)?;
        for frame in self.interleaved.chunks_exact(in_ch) {
            for (dst, &s) in self.planar_in.iter_mut().zip(frame) {
                dst.push(s);
            }
        }

        // 3. resample
        let rs_frames = self.resample_stage(frames)?;
        if rs_frames == 0 {
            self.stats.frames_in += frames as u64;
            return Ok(0);
        }

        // 4. mix
        reserve_planar(&mut self.planar_mix, rs_frames)?;
        {
            let mix = self.controls.shared.mix.read();
            if mix.taps.is_identity() && in_ch == self.output_channels {
                std::mem::swap(&mut self.planar_mix, &mut self.planar_rs);
            } else {
                ChannelMixer::apply(&mix.taps, &self.planar_rs, rs_frames, &mut self.planar_mix);
            }
        }

        // 5. equalize
        self.sync_equalizer();
        self.equalizer.process(&mut self.planar_mix, rs_frames);

        // 6. downsample and convert
        let out_frames = self.downsample_stage(rs_frames)?;
        let out_ch = self.output_channels;
        let writable = out_frames.min(output.len() / out_ch);
        if writable < out_frames {
            self.stats.frames_truncated += (out_frames - writable) as u64;
            warn!(
                "Output block too small: {} frames produced, {} fit",
                out_frames, writable
            );
        }
        for (f, frame) in output.chunks_exact_mut(out_ch).take(writable).enumerate() {
            for (dst, ch) in frame.iter_mut().zip(&self.planar_out) {
                *dst = f32_to_i32(ch[f]);
            }
        }

        self.stats.frames_in += frames as u64;
        self.stats.frames_out += writable as u64;
        Ok(writable * out_ch)
    }

    /// Leaves `frames` of resampled audio in `planar_rs`; returns the frame count
    fn resample_stage(&mut self, frames: usize) -> Result<usize> {
        let rate = self.controls.playback_rate();
        let unity = self.input.sample_rate == self.internal_rate && (rate - 1.0).abs() < 1e-9;

        if unity {
            if self.bypassing {
                std::mem::swap(&mut self.planar_rs, &mut self.planar_in);
                return Ok(frames);
            }
            self.bypassing = true;
            let Some(rs) = self.resampler.as_mut() else {
                std::mem::swap(&mut self.planar_rs, &mut self.planar_in);
                return Ok(frames);
            };

            // Run this chunk through at 1.0, then hand over what the filter
            // still holds so the bypassed stream continues without a gap
            rs.set_relative_ratio(1.0)?;
            reserve_planar(&mut self.planar_rs, rs.max_output_frames(frames))?;
            let produced = rs.process(&self.planar_in, frames, &mut self.planar_rs)?;
            let drained = rs.drain_into(&mut self.planar_rs);
            debug!("Resampler bypassed at unity ratio, {} frames handed over", drained);
            return Ok(produced + drained);
        }

        if self.resampler.is_none() {
            self.resampler = Some(StreamResampler::new(
                self.input.sample_rate,
                self.internal_rate,
                self.input.channels,
                frames,
                self.quality,
                MAX_RELATIVE_RATIO,
            )?);
        }
        if self.bypassing {
            debug!("Resampler engaged at rate {:.5}", rate);
            self.bypassing = false;
        }

        let Some(rs) = self.resampler.as_mut() else {
            return Ok(0);
        };
        rs.set_relative_ratio(rate)?;
        reserve_planar(&mut self.planar_rs, rs.max_output_frames(frames))?;
        rs.process(&self.planar_in, frames, &mut self.planar_rs)
    }

    /// Leaves `planar_out` at the nominal output rate; returns the frame count
    fn downsample_stage(&mut self, frames: usize) -> Result<usize> {
        if self.oversampling == 1 {
            std::mem::swap(&mut self.planar_out, &mut self.planar_mix);
            return Ok(frames);
        }

        if self.downsampler.is_none() {
            self.downsampler = Some(StreamResampler::new(
                self.internal_rate,
                self.output_rate,
                self.output_channels,
                frames,
                self.quality,
                MAX_RELATIVE_RATIO,
            )?);
        }
        let Some(ds) = self.downsampler.as_mut() else {
            return Ok(0);
        };
        reserve_planar(&mut self.planar_out, ds.max_output_frames(frames))?;
        ds.process(&self.planar_mix, frames, &mut self.planar_out)
    }

    fn sync_equalizer(&mut self) {
        let generation = self.controls.shared.eq_generation.load(Ordering::Acquire);
        if generation == self.eq_generation {
            return;
        }
        let (gains, normalize) = {
            let eq = self.controls.shared.eq.lock();
            (eq.gains, eq.normalize)
        };
        self.equalizer.set_gains(&gains);
        self.equalizer.set_normalization(normalize);
        self.eq_generation = generation;
    }
}

impl std::fmt::Debug for AudioProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioProcessor")
            .field("input", &self.input)
            .field("output_channels", &self.output_channels)
            .field("output_rate", &self.output_rate)
            .field("oversampling", &self.oversampling)
            .field("bypassing", &self.bypassing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::write_pcm;
    use crate::audio::ByteOrder;
    use crate::dsp::mix::SpeakerLayout;
    use std::f32::consts::PI;

    fn config(channels: usize, rate: u32, out_channels: usize) -> ProcessorConfig {
        ProcessorConfig {
            input: StreamProperties {
                channels,
                sample_rate: rate,
                ..Default::default()
            },
            output_channels: out_channels,
            volume_smoothing: 1.0,
            ..Default::default()
        }
    }

    /// 16-bit LE interleaved payload; every channel carries the same sine
    fn sine_chunk(frames: usize, channels: usize, offset: usize, amp: f32) -> Vec<u8> {
        let mut bytes = vec![0u8; frames * channels * 2];
        for f in 0..frames {
            let v = ((2.0 * PI * 440.0 * (f + offset) as f32 / 48000.0).sin() * amp * 32767.0) as i32;
            for c in 0..channels {
                let at = (f * channels + c) * 2;
                write_pcm(v, 16, ByteOrder::Little, &mut bytes[at..at + 2]);
            }
        }
        bytes
    }

    #[test]
    fn test_passthrough_preserves_samples() {
        let mut p = AudioProcessor::new(&config(2, 48000, 2)).unwrap();
        let input = sine_chunk(480, 2, 0, 0.5);
        let mut out = vec![0i32; 960];

        assert_eq!(p.process_audio(&input, &mut out), 960);
        for (i, chunk) in input.chunks_exact(2).enumerate() {
            let expected = i16::from_le_bytes([chunk[0], chunk[1]]) as i64 * 65536;
            assert!((out[i] as i64 - expected).abs() <= 65536, "sample {i}");
        }
        assert!(!p.stats().resampler_active);
    }

    #[test]
    fn test_volume_is_applied() {
        let mut p = AudioProcessor::new(&config(1, 48000, 1)).unwrap();
        p.set_volume(0.5);
        let input = sine_chunk(480, 1, 0, 0.8);
        let mut out = vec![0i32; 480];
        p.process_audio(&input, &mut out);

        let peak_in = input
            .chunks_exact(2)
            .map(|c| (i16::from_le_bytes([c[0], c[1]]) as i64).abs())
            .max()
            .unwrap() as f64
            / 32768.0;
        let peak_out = out.iter().map(|s| (*s as i64).abs()).max().unwrap() as f64 / 2_147_483_647.0;
        assert!((peak_out - peak_in * 0.5).abs() < 0.01, "{peak_out} vs {peak_in}");
    }

    #[test]
    fn test_controls_clamp_and_ignore_non_finite() {
        let p = AudioProcessor::new(&config(2, 48000, 2)).unwrap();
        let controls = p.controls();

        controls.set_volume(5.0);
        assert_eq!(controls.volume(), MAX_VOLUME);
        controls.set_volume(f32::NAN);
        assert_eq!(controls.volume(), MAX_VOLUME);

        controls.set_playback_rate(3.0);
        assert_eq!(controls.playback_rate(), MAX_PLAYBACK_RATE);
        controls.set_playback_rate(0.1);
        assert_eq!(controls.playback_rate(), MIN_PLAYBACK_RATE);
        controls.set_playback_rate(f64::INFINITY);
        assert_eq!(controls.playback_rate(), MIN_PLAYBACK_RATE);
    }

    #[test]
    fn test_mono_to_stereo_upmix() {
        let mut p = AudioProcessor::new(&config(1, 48000, 2)).unwrap();
        let input = sine_chunk(240, 1, 0, 0.5);
        let mut out = vec![0i32; 480];
        assert_eq!(p.process_audio(&input, &mut out), 480);
        for frame in out.chunks_exact(2) {
            assert_eq!(frame[0], frame[1]);
        }
    }

    #[test]
    fn test_playback_rate_changes_output_length() {
        let mut p = AudioProcessor::new(&config(2, 48000, 2)).unwrap();
        p.set_playback_rate(1.05);
        let mut out = vec![0i32; 4096];
        let mut total = 0;
        for i in 0..100 {
            let input = sine_chunk(480, 2, i * 480, 0.3);
            total += p.process_audio(&input, &mut out) / 2;
        }
        let ratio = total as f64 / 48000.0;
        assert!((ratio - 1.05).abs() < 0.02, "ratio {ratio}");
        assert!(p.stats().resampler_active);
    }

    #[test]
    fn test_resample_44k1_to_48k() {
        let mut p = AudioProcessor::new(&config(2, 44100, 2)).unwrap();
        let mut out = vec![0i32; 4096];
        let mut total = 0;
        for i in 0..100 {
            let input = sine_chunk(441, 2, i * 441, 0.3);
            total += p.process_audio(&input, &mut out) / 2;
        }
        assert!((total as i64 - 48000).abs() < 800, "total {total}");
    }

    #[test]
    fn test_speaker_mix_update_and_fallback() {
        let p = AudioProcessor::new(&config(2, 48000, 2)).unwrap();
        let controls = p.controls();
        assert_eq!(controls.mix_matrix()[0][0], 1.0);

        controls
            .apply_speaker_mix(Some(vec![vec![0.0, 1.0], vec![1.0, 0.0]]))
            .unwrap();
        assert_eq!(controls.mix_matrix()[0][1], 1.0);

        let err = controls.apply_speaker_mix(Some(vec![vec![1.0]]));
        assert!(matches!(err, Err(Error::InvalidMixMatrix { .. })));
        assert_eq!(controls.mix_matrix()[0][0], 1.0);

        let mut layouts = SpeakerLayoutTable::new();
        layouts.insert(
            2,
            SpeakerLayout {
                auto_mode: false,
                matrix: vec![vec![0.5, 0.5], vec![0.5, 0.5]],
            },
        );
        controls.update_speaker_layouts_config(layouts);
        assert_eq!(controls.mix_matrix()[1][0], 0.5);
    }

    #[test]
    fn test_equalizer_update_is_picked_up() {
        let mut p = AudioProcessor::new(&config(1, 48000, 1)).unwrap();
        let mut gains = [1.0; EQ_BANDS];
        gains[6] = 3.0;
        p.set_equalizer(&gains);

        let mut out = vec![0i32; 480];
        p.process_audio(&sine_chunk(480, 1, 0, 0.1), &mut out);
        assert_eq!(p.controls().equalizer()[6], 3.0);
        assert!(!p.equalizer.is_flat());
    }

    #[test]
    fn test_return_to_unity_keeps_stream_continuous() {
        let mut p = AudioProcessor::new(&config(1, 48000, 1)).unwrap();
        p.set_playback_rate(1.05);
        let mut out = vec![0i32; 4096];
        let mut stream = Vec::new();

        // 100 Hz so one output step is far below a skipped filter delay
        let chunk = |i: usize| {
            let mut bytes = vec![0u8; 480 * 2];
            for f in 0..480 {
                let v = ((2.0 * PI * 100.0 * (i * 480 + f) as f32 / 48000.0).sin() * 0.5 * 32767.0) as i32;
                write_pcm(v, 16, ByteOrder::Little, &mut bytes[f * 2..f * 2 + 2]);
            }
            bytes
        };
        for i in 0..10 {
            let n = p.process_audio(&chunk(i), &mut out);
            stream.extend_from_slice(&out[..n]);
        }
        assert!(p.stats().resampler_active);

        p.set_playback_rate(1.0);
        for i in 10..14 {
            let n = p.process_audio(&chunk(i), &mut out);
            stream.extend_from_slice(&out[..n]);
        }
        assert!(!p.stats().resampler_active);

        let full = 2_147_483_647.0f64;
        let worst = stream
            .windows(2)
            .skip(480)
            .map(|w| (w[1] as f64 - w[0] as f64).abs() / full)
            .fold(0.0, f64::max);
        assert!(worst < 0.03, "largest step {worst}");
    }

    #[test]
    fn test_max_output_frames_covers_fifo_flush() {
        let mut p = AudioProcessor::new(&config(2, 48000, 2)).unwrap();
        p.set_playback_rate(1.1);
        let mut out = vec![0i32; 1 << 16];
        // The first chunk fixes the resampler's chunk size
        p.process_audio(&sine_chunk(4000, 2, 0, 0.3), &mut out);
        let mut largest = 0;
        for i in 0..40 {
            let bound = p.max_output_frames(120);
            let written = p.process_audio(&sine_chunk(120, 2, 4000 + i * 120, 0.3), &mut out) / 2;
            assert!(written <= bound, "chunk {i}: {written} > {bound}");
            largest = largest.max(written);
        }
        assert!(largest > 4096, "largest {largest}");
    }

    #[test]
    fn test_reconfigure_keeps_controls_and_equalizer() {
        let mut p = AudioProcessor::new(&config(2, 48000, 2)).unwrap();
        let controls = p.controls();
        let mut gains = [1.0; EQ_BANDS];
        gains[4] = 2.0;
        controls.set_equalizer(&gains);
        controls.set_volume(0.7);
        let mut out = vec![0i32; 4096];
        p.process_audio(&sine_chunk(480, 2, 0, 0.3), &mut out);

        p.reconfigure(StreamProperties {
            channels: 1,
            sample_rate: 44100,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(p.input_properties().channels, 1);
        assert_eq!(controls.volume(), 0.7);
        assert_eq!(p.controls().equalizer()[4], 2.0);
        assert!(!p.equalizer.is_flat());
        // Mono now upmixes to both outputs
        assert_eq!(controls.mix_matrix()[0][1], controls.mix_matrix()[0][0]);

        let mut total = 0;
        for i in 0..10 {
            total += p.process_audio(&sine_chunk(441, 1, i * 441, 0.3), &mut out) / 2;
        }
        assert!((total as i64 - 4800).abs() < 200, "total {total}");

        let bad = StreamProperties {
            channels: 0,
            ..Default::default()
        };
        assert!(p.reconfigure(bad).is_err());
        assert_eq!(p.input_properties().channels, 1);
    }

    #[test]
    fn test_short_output_truncates() {
        let mut p = AudioProcessor::new(&config(2, 48000, 2)).unwrap();
        let mut out = vec![0i32; 100];
        assert_eq!(p.process_audio(&sine_chunk(480, 2, 0, 0.5), &mut out), 100);
        assert_eq!(p.stats().frames_truncated, 430);
    }

    #[test]
    fn test_oversampled_pipeline_returns_nominal_rate() {
        let mut cfg = config(2, 48000, 2);
        cfg.oversampling = 2;
        let mut p = AudioProcessor::new(&cfg).unwrap();
        let mut out = vec![0i32; 4096];
        let mut total = 0;
        for i in 0..50 {
            total += p.process_audio(&sine_chunk(480, 2, i * 480, 0.3), &mut out) / 2;
        }
        assert!((total as i64 - 24000).abs() < 800, "total {total}");
    }
}
