//! Per-source ingest pipeline
//!
//! Owns everything one source needs between the transport and a sink:
//! format detection until it locks, reordering and gap repair, clock
//! tracking and the DSP chain. One ingest thread drives one pipeline.

use crate::audio::{RtpPacketData, StreamProperties};
use crate::config::{CoreConfig, ProcessorConfig};
use crate::dsp::{AudioProcessor, ProcessorControls, ProcessorStats};
use crate::error::Result;
use crate::probe::AudioFormatProbe;
use crate::sync::{ClockEstimate, ReorderStats, RtpReorderingBuffer, StreamClockMap};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Audio ready for a sink, in the processor's output format
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedBlock {
    /// Stream timestamp of the packet the block came from
    pub timestamp: u32,
    /// Interleaved i32 samples
    pub samples: Vec<i32>,
    pub frames: usize,
    /// Produced from synthesized gap payload
    pub interpolated: bool,
}

/// Counters for one source
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub packets_received: u64,
    /// Packets dropped while the format was still unknown
    pub packets_discarded: u64,
    pub blocks_produced: u64,
    pub probe_confidence: f64,
    pub reorder: ReorderStats,
    pub processor: Option<ProcessorStats>,
    pub clock: Option<ClockEstimate>,
}

/// Probe, reorder, clock and process one source
pub struct SourcePipeline {
    source_id: String,
    probe: AudioFormatProbe,
    reorder: RtpReorderingBuffer,
    clocks: Arc<StreamClockMap>,
    processor_template: ProcessorConfig,
    /// Survives a reset so control handles stay valid across format changes
    processor: Option<AudioProcessor>,
    /// Set while the format is locked
    properties: Option<StreamProperties>,
    /// Packets held back until the format locks
    pending: VecDeque<RtpPacketData>,
    max_pending: usize,
    output: Vec<i32>,
    stats: PipelineStats,
}

impl SourcePipeline {
    /// Pipeline that detects its input format from the first packets
    pub fn new(source_id: impl Into<String>, config: &CoreConfig, clocks: Arc<StreamClockMap>) -> Self {
        let source_id = source_id.into();
        info!("Creating source pipeline {}", source_id);
        Self {
            source_id,
            probe: AudioFormatProbe::new(config.probe.clone()),
            reorder: RtpReorderingBuffer::new(&config.reorder),
            clocks,
            processor_template: config.processor.clone(),
            processor: None,
            properties: None,
            pending: VecDeque::new(),
            max_pending: config.reorder.max_packets,
            output: Vec::new(),
            stats: PipelineStats::default(),
        }
    }

    /// Pipeline for a source whose format is already known
    pub fn with_properties(
        source_id: impl Into<String>,
        config: &CoreConfig,
        clocks: Arc<StreamClockMap>,
        properties: StreamProperties,
    ) -> Result<Self> {
        let mut pipeline = Self::new(source_id, config, clocks);
        pipeline.lock_format(properties)?;
        Ok(pipeline)
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Input format, once detected or supplied
    pub fn properties(&self) -> Option<&StreamProperties> {
        self.properties.as_ref()
    }

    pub fn is_format_locked(&self) -> bool {
        self.properties.is_some()
    }

    /// Live controls of the processor, available from the first format lock
    pub fn controls(&self) -> Option<ProcessorControls> {
        self.processor.as_ref().map(AudioProcessor::controls)
    }

    /// Forward a rate command from a sink controller
    ///
    /// Returns false while the format is not locked.
    pub fn set_playback_rate(&self, rate: f64) -> bool {
        match self.processor.as_ref().filter(|_| self.properties.is_some()) {
            Some(p) => {
                p.set_playback_rate(rate);
                true
            }
            None => {
                debug!("Source {}: rate command before format lock ignored", self.source_id);
                false
            }
        }
    }

    /// Accept one packet and return whatever became ready
    pub fn push_packet(&mut self, packet: RtpPacketData) -> Vec<ProcessedBlock> {
        self.stats.packets_received += 1;
        let now = packet.received_at;

        if self.properties.is_none() {
            self.probe.add_data(&packet.payload, packet.received_at);
            self.pending.push_back(packet);
            if self.pending.len() > self.max_pending {
                self.pending.pop_front();
                self.stats.packets_discarded += 1;
            }
            if !self.try_lock_from_probe() {
                return Vec::new();
            }
            let held: Vec<RtpPacketData> = self.pending.drain(..).collect();
            for p in held {
                self.reorder.add_packet(p);
            }
        } else {
            self.reorder.add_packet(packet);
        }

        self.drain_ready(now)
    }

    /// Flush packets whose reordering deadline has passed
    pub fn poll(&mut self, now: Instant) -> Vec<ProcessedBlock> {
        if self.properties.is_none() {
            return Vec::new();
        }
        self.drain_ready(now)
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            probe_confidence: self.probe.confidence(),
            reorder: self.reorder.stats(),
            processor: self.processor.as_ref().map(AudioProcessor::stats),
            clock: self.clocks.estimate(&self.source_id),
            ..self.stats.clone()
        }
    }

    /// Stats snapshot for the control plane
    pub fn stats_json(&self) -> serde_json::Value {
        serde_json::to_value(self.stats()).unwrap_or(serde_json::Value::Null)
    }

    /// Forget the detected format and all buffered state
    ///
    /// The processor is kept; the next lock reconfigures it for the new
    /// format with its volume, EQ and layout settings intact.
    pub fn reset(&mut self) {
        info!("Resetting source pipeline {}", self.source_id);
        self.probe.reset();
        self.reorder.reset();
        self.clocks.remove(&self.source_id);
        self.properties = None;
        self.pending.clear();
    }

    fn try_lock_from_probe(&mut self) -> bool {
        if !self.probe.has_sufficient_data() || !self.probe.finalize_detection() {
            return false;
        }
        let Some(props) = self.probe.detected_properties() else {
            return false;
        };
        match self.lock_format(props) {
            Ok(()) => true,
            Err(e) => {
                warn!("Source {}: detected format unusable ({}), probing again", self.source_id, e);
                self.probe.reset();
                false
            }
        }
    }

    fn lock_format(&mut self, properties: StreamProperties) -> Result<()> {
        match self.processor.as_mut() {
            Some(processor) => processor.reconfigure(properties)?,
            None => {
                let config = ProcessorConfig {
                    input: properties,
                    ..self.processor_template.clone()
                };
                self.processor = Some(AudioProcessor::new(&config)?);
            }
        }
        info!(
            "Source {}: format locked to {:?} {}-bit {} ch @ {} Hz",
            self.source_id, properties.codec, properties.bit_depth, properties.channels, properties.sample_rate
        );
        self.reorder.set_properties(properties);
        self.properties = Some(properties);
        Ok(())
    }

    fn drain_ready(&mut self, now: Instant) -> Vec<ProcessedBlock> {
        let ready = self.reorder.get_ready_packets_at(now);
        let mut blocks = Vec::with_capacity(ready.len());
        for packet in ready {
            if let Some(block) = self.process_packet(&packet) {
                blocks.push(block);
            }
        }
        blocks
    }

    fn process_packet(&mut self, packet: &RtpPacketData) -> Option<ProcessedBlock> {
        let props = self.properties?;
        let processor = self.processor.as_mut()?;

        // Synthesized packets carry a local timestamp, not a real arrival
        if !packet.interpolated {
            self.clocks
                .update(&self.source_id, props.sample_rate, packet.timestamp, packet.received_at);
        }

        let frame_bytes = props.frame_bytes();
        let in_frames = packet.payload.len() / frame_bytes.max(1);
        let out_channels = processor.output_channels();
        let capacity = processor.max_output_frames(in_frames) * out_channels;
        if self.output.len() < capacity {
            if let Err(e) = self.output.try_reserve(capacity - self.output.len()) {
                error!("Source {}: output buffer growth failed: {}", self.source_id, e);
                return None;
            }
            self.output.resize(capacity, 0);
        }

        let written = processor.process_audio(&packet.payload, &mut self.output);
        if written == 0 {
            return None;
        }
        self.stats.blocks_produced += 1;
        Some(ProcessedBlock {
            timestamp: packet.timestamp,
            samples: self.output[..written].to_vec(),
            frames: written / out_channels,
            interpolated: packet.interpolated,
        })
    }
}

impl std::fmt::Debug for SourcePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourcePipeline")
            .field("source_id", &self.source_id)
            .field("properties", &self.properties)
            .field("pending", &self.pending.len())
            .finish()
    }
}
