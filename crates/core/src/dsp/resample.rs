//! Stage 3: streaming sample-rate conversion with a live rate multiplier
//!
//! Wraps rubato's `SincFixedIn`: input is buffered per channel until a full
//! chunk is available, so calls with arbitrary frame counts are fine. The
//! relative ratio can move at any time (ramped inside the next chunk) which
//! is what playback-rate control needs.

use crate::error::{Error, Result};
use rubato::{
    Resampler as RubatoResampler, SincFixedIn, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Quality settings for sample-rate conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResampleQuality {
    Low,
    #[default]
    Medium,
    High,
}

impl ResampleQuality {
    fn sinc_len(&self) -> usize {
        match self {
            ResampleQuality::Low => 64,
            ResampleQuality::Medium => 128,
            ResampleQuality::High => 256,
        }
    }

    fn oversampling_factor(&self) -> usize {
        match self {
            ResampleQuality::Low => 64,
            ResampleQuality::Medium => 128,
            ResampleQuality::High => 256,
        }
    }
}

/// Planar streaming resampler
pub struct StreamResampler {
    resampler: SincFixedIn<f32>,
    input_rate: u32,
    output_rate: u32,
    /// Frames waiting for a full chunk, per channel
    fifo: Vec<Vec<f32>>,
    /// Most recent consumed input still inside the filter window, per channel
    tail: Vec<Vec<f32>>,
    tail_len: usize,
    scratch: Vec<Vec<f32>>,
    relative_ratio: f64,
}

impl StreamResampler {
    /// Build a resampler for `channels` planar channels
    ///
    /// `max_relative` bounds how far [`set_relative_ratio`](Self::set_relative_ratio)
    /// may move the ratio away from `output_rate / input_rate`.
    pub fn new(
        input_rate: u32,
        output_rate: u32,
        channels: usize,
        chunk_frames: usize,
        quality: ResampleQuality,
        max_relative: f64,
    ) -> Result<Self> {
        if input_rate == 0 || output_rate == 0 || channels == 0 || chunk_frames == 0 {
            return Err(Error::Resampler(format!(
                "invalid geometry: {input_rate} Hz -> {output_rate} Hz, {channels} ch, chunk {chunk_frames}"
            )));
        }

        let ratio = output_rate as f64 / input_rate as f64;
        let parameters = SincInterpolationParameters {
            sinc_len: quality.sinc_len(),
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: quality.oversampling_factor(),
            window: WindowFunction::BlackmanHarris2,
        };

        let resampler = SincFixedIn::<f32>::new(ratio, max_relative, parameters, chunk_frames, channels)
            .map_err(|e| Error::Resampler(format!("failed to create resampler: {e}")))?;

        info!(
            "Creating StreamResampler: {} Hz -> {} Hz, ratio {:.4}, quality {:?}, {} ch, chunk {}",
            input_rate, output_rate, ratio, quality, channels, chunk_frames
        );

        let max_out = resampler.output_frames_max();
        // Half the sinc window plus the guard frames held back at each chunk end
        let tail_len = resampler.output_delay() + 2;
        Ok(Self {
            resampler,
            input_rate,
            output_rate,
            fifo: vec![Vec::with_capacity(chunk_frames * 2); channels],
            tail: vec![Vec::with_capacity(tail_len * 2); channels],
            tail_len,
            scratch: vec![vec![0.0; max_out]; channels],
            relative_ratio: 1.0,
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    pub fn channels(&self) -> usize {
        self.fifo.len()
    }

    /// Frames buffered waiting for the next full chunk
    pub fn pending_frames(&self) -> usize {
        self.fifo.first().map_or(0, Vec::len)
    }

    /// Upper bound on the frames `process` followed by `drain_into` can
    /// append for `frames` more input
    pub fn max_output_frames(&self, frames: usize) -> usize {
        let chunk = self.resampler.input_frames_next();
        let chunks = (self.pending_frames() + frames) / chunk.max(1);
        chunks * self.resampler.output_frames_max() + chunk + self.tail_len
    }

    pub fn relative_ratio(&self) -> f64 {
        self.relative_ratio
    }

    /// Scale the output rate by `rel` (1.0 = nominal)
    pub fn set_relative_ratio(&mut self, rel: f64) -> Result<()> {
        if (rel - self.relative_ratio).abs() < f64::EPSILON {
            return Ok(());
        }
        self.resampler
            .set_resample_ratio_relative(rel, true)
            .map_err(|e| Error::Resampler(format!("rejected relative ratio {rel}: {e}")))?;
        debug!("Resample ratio relative {:.5} -> {:.5}", self.relative_ratio, rel);
        self.relative_ratio = rel;
        Ok(())
    }

    /// Feed `frames` frames of planar input; resampled frames are appended to `out`
    ///
    /// Returns the number of frames appended to each output channel.
    pub fn process(&mut self, input: &[Vec<f32>], frames: usize, out: &mut [Vec<f32>]) -> Result<usize> {
        let channels = self.fifo.len();
        if input.len() < channels || out.len() < channels {
            return Err(Error::Resampler(format!(
                "expected {channels} channels, got {} in / {} out",
                input.len(),
                out.len()
            )));
        }

        for (fifo, src) in self.fifo.iter_mut().zip(input) {
            fifo.extend_from_slice(&src[..frames.min(src.len())]);
        }

        let mut produced_total = 0;
        while self.pending_frames() >= self.resampler.input_frames_next() {
            let max_out = self.resampler.output_frames_max();
            for ch in &mut self.scratch {
                if ch.len() < max_out {
                    ch.resize(max_out, 0.0);
                }
            }

            let (used, produced) = self
                .resampler
                .process_into_buffer(&self.fifo, &mut self.scratch, None)
                .map_err(|e| Error::Resampler(format!("resampling failed: {e}")))?;

            for (((fifo, tail), scratch), dst) in self
                .fifo
                .iter_mut()
                .zip(self.tail.iter_mut())
                .zip(&self.scratch)
                .zip(out.iter_mut())
            {
                tail.extend_from_slice(&fifo[used.saturating_sub(self.tail_len)..used]);
                let excess = tail.len().saturating_sub(self.tail_len);
                tail.drain(..excess);
                fifo.drain(..used);
                dst.extend_from_slice(&scratch[..produced]);
            }
            produced_total += produced;
        }
        Ok(produced_total)
    }

    /// Append everything fed but not yet emitted, unfiltered, then reset
    ///
    /// At a relative ratio of 1.0 between equal rates the filter output is a
    /// delayed copy of its input, so the appended frames continue it without
    /// a gap. Returns the number of frames appended to each channel.
    pub fn drain_into(&mut self, out: &mut [Vec<f32>]) -> usize {
        let frames = self.tail.first().map_or(0, Vec::len) + self.pending_frames();
        for ((tail, fifo), dst) in self.tail.iter().zip(&self.fifo).zip(out.iter_mut()) {
            dst.extend_from_slice(tail);
            dst.extend_from_slice(fifo);
        }
        self.reset();
        frames
    }

    /// Clear buffered input and filter history
    pub fn reset(&mut self) {
        self.resampler.reset();
        for ch in self.fifo.iter_mut().chain(self.tail.iter_mut()) {
            ch.clear();
        }
        self.relative_ratio = 1.0;
    }
}

impl std::fmt::Debug for StreamResampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamResampler")
            .field("input_rate", &self.input_rate)
            .field("output_rate", &self.output_rate)
            .field("channels", &self.fifo.len())
            .field("relative_ratio", &self.relative_ratio)
            .finish()
    }
}
