//! Configuration for the router core
//!
//! Every section deserializes with per-field defaults, so an embedding
//! control plane only has to supply what it changes. The core never reads
//! files itself; `CoreConfig::from_toml_str` is a convenience for callers
//! that keep settings in TOML.

use crate::audio::StreamProperties;
use crate::dsp::mix::{SpeakerLayout, SpeakerLayoutTable};
use crate::error::{Error, Result};
use crate::dsp::resample::ResampleQuality;
use serde::{Deserialize, Serialize};

/// Top-level configuration, one section per subsystem
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub probe: ProbeConfig,
    pub reorder: ReorderConfig,
    pub clock: ClockConfig,
    pub processor: ProcessorConfig,
    pub rate_control: RateControlConfig,
    pub sync: SyncConfig,
}

impl CoreConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.probe.validate()?;
        self.reorder.validate()?;
        self.clock.validate()?;
        self.processor.validate()?;
        self.rate_control.validate()?;
        self.sync.validate()?;
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidConfig(msg.into())
}

// ---------------------------------------------------------------------------
// Format probe
// ---------------------------------------------------------------------------

/// Format auto-detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Bytes required before detection may run
    pub min_probe_bytes: usize,
    /// Bytes retained for analysis (older bytes are discarded)
    pub max_probe_bytes: usize,
    /// Detection fails below this confidence (0.0-1.0)
    pub min_confidence: f64,
    /// Arrival span needed for a trustworthy rate estimate
    pub min_rate_window_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            min_probe_bytes: 8192,
            max_probe_bytes: 65536,
            min_confidence: 0.4,
            min_rate_window_ms: 50,
        }
    }
}

impl ProbeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_probe_bytes < 64 {
            return Err(invalid("probe.min_probe_bytes must be at least 64"));
        }
        if self.max_probe_bytes < self.min_probe_bytes {
            return Err(invalid("probe.max_probe_bytes must be >= min_probe_bytes"));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(invalid("probe.min_confidence must be within 0.0-1.0"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reordering buffer
// ---------------------------------------------------------------------------

/// Reordering buffer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReorderConfig {
    /// Maximum packets held before the oldest is dropped
    pub max_packets: usize,
    /// How long the oldest packet may wait for a missing predecessor
    pub reorder_deadline_ms: u64,
    /// Largest gap filled with synthesized packets; wider gaps are skipped
    pub max_interpolated_packets: usize,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        Self {
            max_packets: 256,
            reorder_deadline_ms: 20,
            max_interpolated_packets: 4,
        }
    }
}

impl ReorderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_packets == 0 {
            return Err(invalid("reorder.max_packets must be > 0"));
        }
        if self.reorder_deadline_ms > 1000 {
            return Err(invalid("reorder.reorder_deadline_ms must be <= 1000"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Stream clock
// ---------------------------------------------------------------------------

/// Clock-recovery filter tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Expected arrival jitter (one standard deviation)
    pub measurement_noise_ms: f64,
    /// Offset random walk, seconds² per second of stream time
    pub offset_process_noise: f64,
    /// Drift random walk, (s/s)² per second of stream time
    pub drift_process_noise: f64,
    /// Prior uncertainty of the drift estimate
    pub initial_drift_uncertainty_ppm: f64,
    /// Innovations larger than this re-anchor the clock
    pub resync_threshold_ms: f64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            measurement_noise_ms: 2.0,
            offset_process_noise: 1e-9,
            drift_process_noise: 1e-12,
            initial_drift_uncertainty_ppm: 1000.0,
            resync_threshold_ms: 500.0,
        }
    }
}

impl ClockConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            self.measurement_noise_ms,
            self.initial_drift_uncertainty_ppm,
            self.resync_threshold_ms,
        ];
        if positive.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            return Err(invalid("clock noise and threshold values must be positive"));
        }
        if !(self.offset_process_noise >= 0.0 && self.drift_process_noise >= 0.0) {
            return Err(invalid("clock process noise must be non-negative"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Audio processor
// ---------------------------------------------------------------------------

/// One explicit or automatic speaker layout for an input channel count
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerLayoutConfig {
    pub input_channels: usize,
    #[serde(default = "default_true")]
    pub auto_mode: bool,
    /// `matrix[input][output]` gains; ignored in auto mode
    #[serde(default)]
    pub matrix: Vec<Vec<f32>>,
}

fn default_true() -> bool {
    true
}

/// Per-stream DSP pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Format of the incoming stream
    pub input: StreamProperties,
    pub output_channels: usize,
    pub output_sample_rate: u32,
    /// Internal processing rate multiplier (1 = no oversampling)
    pub oversampling: u32,
    pub resample_quality: ResampleQuality,
    /// Initial target volume (linear)
    pub volume: f32,
    /// Per-sample smoothing coefficient of the volume ramp
    pub volume_smoothing: f32,
    pub volume_normalization: bool,
    /// RMS level normalization aims for
    pub normalization_target_rms: f32,
    /// Gain smoothing when the gain must drop
    pub normalization_attack: f32,
    /// Gain smoothing when the gain may rise
    pub normalization_decay: f32,
    pub normalization_max_gain: f32,
    pub eq_normalization: bool,
    pub speaker_layouts: Vec<SpeakerLayoutConfig>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            input: StreamProperties::default(),
            output_channels: 2,
            output_sample_rate: 48000,
            oversampling: 1,
            resample_quality: ResampleQuality::Medium,
            volume: 1.0,
            volume_smoothing: 0.005,
            volume_normalization: false,
            normalization_target_rms: 0.1,
            normalization_attack: 0.2,
            normalization_decay: 0.02,
            normalization_max_gain: 4.0,
            eq_normalization: false,
            speaker_layouts: Vec::new(),
        }
    }
}

impl ProcessorConfig {
    pub fn validate(&self) -> Result<()> {
        self.input.validate()?;
        if self.output_channels == 0 || self.output_channels > crate::audio::MAX_CHANNELS {
            return Err(invalid("processor.output_channels must be within 1..=8"));
        }
        if self.output_sample_rate == 0 {
            return Err(invalid("processor.output_sample_rate must be > 0"));
        }
        if !matches!(self.oversampling, 1 | 2 | 4) {
            return Err(invalid("processor.oversampling must be 1, 2 or 4"));
        }
        let unit = [
            self.volume_smoothing,
            self.normalization_attack,
            self.normalization_decay,
        ];
        if unit.iter().any(|v| !(*v > 0.0 && *v <= 1.0)) {
            return Err(invalid("processor smoothing coefficients must be within (0, 1]"));
        }
        if !(self.normalization_target_rms > 0.0 && self.normalization_max_gain >= 1.0) {
            return Err(invalid("processor normalization target/max gain out of range"));
        }
        Ok(())
    }

    /// Build the runtime layout table from the configured entries
    pub fn layout_table(&self) -> SpeakerLayoutTable {
        self.speaker_layouts
            .iter()
            .map(|entry| {
                (
                    entry.input_channels,
                    SpeakerLayout {
                        auto_mode: entry.auto_mode,
                        matrix: entry.matrix.clone(),
                    },
                )
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Sink rate controller
// ---------------------------------------------------------------------------

/// Per-sink buffer-depth controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateControlConfig {
    /// Buffered audio the controller steers towards
    pub target_buffer_ms: f64,
    /// Deviation tolerated without issuing commands
    pub tolerance_ms: f64,
    /// EMA coefficient for buffer-level smoothing
    pub smoothing: f64,
    /// Rate change per millisecond of error
    pub gain_per_ms: f64,
    /// Largest deviation of a rate command from 1.0
    pub max_rate_adjustment: f64,
    /// Consecutive out-of-tolerance updates before acting
    pub sustain_updates: u32,
    /// Smallest change worth sending to a source
    pub min_command_delta: f64,
    /// Worker polling period
    pub poll_interval_ms: u64,
}

impl Default for RateControlConfig {
    fn default() -> Self {
        Self {
            target_buffer_ms: 40.0,
            tolerance_ms: 8.0,
            smoothing: 0.2,
            gain_per_ms: 0.0005,
            max_rate_adjustment: 0.02,
            sustain_updates: 3,
            min_command_delta: 0.0005,
            poll_interval_ms: 20,
        }
    }
}

impl RateControlConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.target_buffer_ms > 0.0 && self.tolerance_ms >= 0.0) {
            return Err(invalid("rate_control target/tolerance out of range"));
        }
        if !(self.smoothing > 0.0 && self.smoothing <= 1.0) {
            return Err(invalid("rate_control.smoothing must be within (0, 1]"));
        }
        if !(self.max_rate_adjustment > 0.0 && self.max_rate_adjustment < 0.1) {
            return Err(invalid("rate_control.max_rate_adjustment must be within (0, 0.1)"));
        }
        if self.poll_interval_ms == 0 {
            return Err(invalid("rate_control.poll_interval_ms must be > 0"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Global synchronization
// ---------------------------------------------------------------------------

/// Cross-sink synchronization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    /// Largest deviation of a sink rate adjustment from 1.0
    pub max_rate_adjustment: f64,
    /// Rate change per millisecond of lag behind the wall clock
    pub lag_gain_per_ms: f64,
    /// Rate change per unit deviation from `target_fill`
    pub fill_gain: f64,
    /// Buffer fill fraction sinks steer towards
    pub target_fill: f64,
    /// Lag ignored as measurement noise
    pub deadband_ms: f64,
    /// EMA coefficient applied to successive adjustments
    pub smoothing: f64,
    /// Default dispatch barrier timeout
    pub barrier_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_rate_adjustment: 0.005,
            lag_gain_per_ms: 0.0002,
            fill_gain: 0.002,
            target_fill: 0.5,
            deadband_ms: 1.0,
            smoothing: 0.3,
            barrier_timeout_ms: 20,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.max_rate_adjustment > 0.0 && self.max_rate_adjustment < 0.1) {
            return Err(invalid("sync.max_rate_adjustment must be within (0, 0.1)"));
        }
        if !(0.0..=1.0).contains(&self.target_fill) {
            return Err(invalid("sync.target_fill must be within 0.0-1.0"));
        }
        if !(self.smoothing > 0.0 && self.smoothing <= 1.0) {
            return Err(invalid("sync.smoothing must be within (0, 1]"));
        }
        Ok(())
    }
}
