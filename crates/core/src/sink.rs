//! Sink accumulation buffer
//!
//! Each source feeding a sink queues processed blocks here; the dispatch
//! thread pulls fixed-size output blocks, mixing every source with
//! saturating addition. Queue depths feed the sink's rate controller.

use crate::dsp::mix_saturating;
use crate::ingest::ProcessedBlock;
use crate::sync::{BufferMetricsSource, InputBufferMetrics, SourceBufferMetrics};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

/// Counters for one sink mixer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkMixerStats {
    pub blocks_mixed: u64,
    /// Output blocks where some active source ran dry
    pub underruns: u64,
    /// Queued blocks discarded because a source ran too far ahead
    pub blocks_dropped: u64,
}

/// Result of pulling one output block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixOutcome {
    /// Sources that contributed at least one frame
    pub sources: usize,
    /// Some source with queued audio could not fill the whole block
    pub underrun: bool,
}

#[derive(Debug, Default)]
struct SourceQueue {
    blocks: VecDeque<Vec<i32>>,
    /// Samples already consumed from the front block
    offset: usize,
    queued_samples: usize,
}

impl SourceQueue {
    /// Saturating-add up to `out.len()` queued samples into `out`
    fn drain_into(&mut self, out: &mut [i32]) -> usize {
        let mut filled = 0;
        while filled < out.len() {
            let Some(front) = self.blocks.front() else {
                break;
            };
            let available = &front[self.offset..];
            let n = available.len().min(out.len() - filled);
            mix_saturating(&mut out[filled..filled + n], &available[..n]);
            filled += n;
            self.offset += n;
            if self.offset >= front.len() {
                self.blocks.pop_front();
                self.offset = 0;
            }
        }
        self.queued_samples -= filled;
        filled
    }
}

struct Inner {
    sources: HashMap<String, SourceQueue>,
    stats: SinkMixerStats,
}

/// Per-sink queues of processed audio, mixed on demand
pub struct SinkMixer {
    sink_id: String,
    channels: usize,
    sample_rate: u32,
    block_frames: usize,
    max_buffered_frames: usize,
    inner: Mutex<Inner>,
}

impl SinkMixer {
    /// `max_buffered_ms` bounds each source's queue; older audio is dropped
    pub fn new(
        sink_id: impl Into<String>,
        channels: usize,
        sample_rate: u32,
        block_frames: usize,
        max_buffered_ms: f64,
    ) -> Self {
        let sink_id = sink_id.into();
        let max_buffered_frames = (max_buffered_ms.max(0.0) / 1000.0 * sample_rate as f64) as usize;
        info!(
            "Creating sink mixer {}: {} ch @ {} Hz, {} frames per block",
            sink_id, channels, sample_rate, block_frames
        );
        Self {
            sink_id,
            channels: channels.max(1),
            sample_rate: sample_rate.max(1),
            block_frames: block_frames.max(1),
            max_buffered_frames: max_buffered_frames.max(block_frames),
            inner: Mutex::new(Inner {
                sources: HashMap::new(),
                stats: SinkMixerStats::default(),
            }),
        }
    }

    pub fn sink_id(&self) -> &str {
        &self.sink_id
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn block_frames(&self) -> usize {
        self.block_frames
    }

    /// Duration of one output block
    pub fn block_duration_ms(&self) -> f64 {
        self.block_frames as f64 * 1000.0 / self.sample_rate as f64
    }

    /// Start accepting blocks from a source
    pub fn add_source(&self, source_id: &str) {
        let mut inner = self.inner.lock();
        if !inner.sources.contains_key(source_id) {
            inner.sources.insert(source_id.to_string(), SourceQueue::default());
            info!("Sink {}: added source {}", self.sink_id, source_id);
        }
    }

    /// Stop mixing a source and discard its queue
    pub fn remove_source(&self, source_id: &str) -> bool {
        let removed = self.inner.lock().sources.remove(source_id).is_some();
        if removed {
            info!("Sink {}: removed source {}", self.sink_id, source_id);
        }
        removed
    }

    /// Queue one processed block from `source_id`
    ///
    /// Blocks whose channel count does not match the sink are rejected.
    pub fn push_block(&self, source_id: &str, block: ProcessedBlock) -> bool {
        if block.samples.len() != block.frames * self.channels {
            warn!(
                "Sink {}: block from {} has {} samples for {} frames, expected {} ch",
                self.sink_id,
                source_id,
                block.samples.len(),
                block.frames,
                self.channels
            );
            return false;
        }
        if block.samples.is_empty() {
            return true;
        }

        let max_samples = self.max_buffered_frames * self.channels;
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let queue = inner.sources.entry(source_id.to_string()).or_default();
        queue.queued_samples += block.samples.len();
        queue.blocks.push_back(block.samples);

        while queue.queued_samples > max_samples && queue.blocks.len() > 1 {
            if let Some(old) = queue.blocks.pop_front() {
                queue.queued_samples -= old.len() - queue.offset;
                queue.offset = 0;
                inner.stats.blocks_dropped += 1;
                debug!("Sink {}: source {} over capacity, dropped a block", self.sink_id, source_id);
            }
        }
        true
    }

    /// Mix the next output block into `out`, which is resized to one block
    ///
    /// Sources with nothing queued are skipped; a source that runs dry part
    /// way through leaves the rest of its share silent.
    pub fn mix_next_block(&self, out: &mut Vec<i32>) -> MixOutcome {
        let block_samples = self.block_frames * self.channels;
        out.clear();
        out.resize(block_samples, 0);

        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let mut outcome = MixOutcome {
            sources: 0,
            underrun: false,
        };
        for queue in inner.sources.values_mut() {
            if queue.queued_samples == 0 {
                continue;
            }
            let filled = queue.drain_into(out);
            outcome.sources += 1;
            if filled < block_samples {
                outcome.underrun = true;
            }
        }

        inner.stats.blocks_mixed += 1;
        if outcome.underrun {
            inner.stats.underruns += 1;
        }
        outcome
    }

    /// Snapshot of queued audio per source
    pub fn metrics(&self) -> InputBufferMetrics {
        let frame_ms = 1000.0 / self.sample_rate as f64;
        let inner = self.inner.lock();
        let per_source: HashMap<String, SourceBufferMetrics> = inner
            .sources
            .iter()
            .map(|(id, q)| {
                (
                    id.clone(),
                    SourceBufferMetrics {
                        buffered_ms: (q.queued_samples / self.channels) as f64 * frame_ms,
                        blocks: q.blocks.len(),
                    },
                )
            })
            .collect();
        InputBufferMetrics {
            total_buffered_ms: per_source.values().map(|m| m.buffered_ms).sum(),
            active_sources: per_source.len(),
            per_source,
            block_duration_ms: self.block_duration_ms(),
        }
    }

    pub fn stats(&self) -> SinkMixerStats {
        self.inner.lock().stats
    }
}

impl BufferMetricsSource for SinkMixer {
    fn buffer_metrics(&self) -> Option<InputBufferMetrics> {
        Some(self.metrics())
    }
}

impl std::fmt::Debug for SinkMixer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkMixer")
            .field("sink_id", &self.sink_id)
            .field("channels", &self.channels)
            .field("sample_rate", &self.sample_rate)
            .field("block_frames", &self.block_frames)
            .finish()
    }
}
