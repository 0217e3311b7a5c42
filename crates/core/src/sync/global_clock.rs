//! Cross-sink synchronization
//!
//! One authoritative playback timestamp (a global sample counter) is shared
//! by every sink. Sinks report their progress after each dispatch; the clock
//! tells each one how much faster or slower to play, and a bounded-wait
//! barrier lets all sinks release a block together.

use crate::config::SyncConfig;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One sink's progress after a dispatch cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SinkTimingReport {
    /// Samples (per channel) the sink has output since it started
    pub samples_output: u64,
    /// Playback timestamp of the block just dispatched
    pub stream_timestamp: u64,
    pub dispatch_time: Instant,
    pub underrun: bool,
    /// Sink buffer fill, 0.0 (empty) to 1.0 (full)
    pub buffer_fill: f64,
}

/// Aggregate synchronization counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub active_sinks: usize,
    pub current_timestamp: u64,
    pub total_barrier_timeouts: u64,
    pub cycles_completed: u64,
    pub underruns: u64,
}

#[derive(Debug, Clone, Copy)]
struct Reference {
    timestamp: u64,
    at: Instant,
}

#[derive(Debug, Clone, Default)]
struct SinkState {
    /// Subtracted from `samples_output` to place the sink on the global timeline
    sample_base: Option<i128>,
    position: Option<u64>,
    last_report: Option<SinkTimingReport>,
    adjustment: f64,
}

#[derive(Debug, Default)]
struct State {
    sinks: HashMap<String, SinkState>,
    playback_timestamp: u64,
    reference: Option<Reference>,
    generation: u64,
    arrived: HashSet<String>,
    cycles_completed: u64,
    underruns: u64,
}

impl State {
    fn all_arrived(&self) -> bool {
        !self.sinks.is_empty() && self.sinks.keys().all(|id| self.arrived.contains(id))
    }

    fn complete_cycle(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.arrived.clear();
        self.cycles_completed += 1;
    }
}

/// Shared playback clock and dispatch barrier for all sinks
#[derive(Debug)]
pub struct GlobalSynchronizationClock {
    sample_rate: u32,
    config: SyncConfig,
    enabled: AtomicBool,
    state: Mutex<State>,
    barrier: Condvar,
    barrier_timeouts: AtomicU64,
}

impl GlobalSynchronizationClock {
    pub fn new(sample_rate: u32, config: SyncConfig) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            enabled: AtomicBool::new(config.enabled),
            config,
            state: Mutex::new(State::default()),
            barrier: Condvar::new(),
            barrier_timeouts: AtomicU64::new(0),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Enabling starts a fresh reference from the next report. Disabling
    /// releases any sink waiting at the barrier.
    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::SeqCst);
        if was == enabled {
            return;
        }
        let mut state = self.state.lock();
        if enabled {
            state.reference = None;
            for sink in state.sinks.values_mut() {
                sink.sample_base = None;
                sink.adjustment = 0.0;
            }
        } else if !state.arrived.is_empty() {
            state.complete_cycle();
            self.barrier.notify_all();
        }
        info!("Global synchronization {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn register_sink(&self, sink_id: &str) {
        let mut state = self.state.lock();
        if state.sinks.contains_key(sink_id) {
            return;
        }
        state.sinks.insert(sink_id.to_string(), SinkState::default());
        info!("Sink {} registered ({} active)", sink_id, state.sinks.len());
    }

    /// Remove a sink; a barrier cycle it was holding up completes
    pub fn unregister_sink(&self, sink_id: &str) {
        let mut state = self.state.lock();
        if state.sinks.remove(sink_id).is_none() {
            return;
        }
        state.arrived.remove(sink_id);
        info!("Sink {} unregistered ({} active)", sink_id, state.sinks.len());
        if !state.arrived.is_empty() && state.all_arrived() {
            state.complete_cycle();
            self.barrier.notify_all();
        }
    }

    /// Pin the global timeline: `timestamp` plays at `at`
    pub fn initialize_reference(&self, timestamp: u64, at: Instant) {
        let mut state = self.state.lock();
        state.reference = Some(Reference { timestamp, at });
        state.playback_timestamp = state.playback_timestamp.max(timestamp);
        for sink in state.sinks.values_mut() {
            sink.sample_base = None;
        }
        debug!("Playback reference set to {}", timestamp);
    }

    /// Record one sink's progress and advance the playback timestamp
    pub fn report_sink_timing(&self, sink_id: &str, report: SinkTimingReport) {
        if !self.is_enabled() {
            return;
        }
        let mut state = self.state.lock();
        if !state.sinks.contains_key(sink_id) {
            debug!("Timing report from unregistered sink {}", sink_id);
            return;
        }

        let reference = match state.reference {
            Some(r) => r,
            None => {
                let r = Reference {
                    timestamp: report.stream_timestamp,
                    at: report.dispatch_time,
                };
                info!("Playback reference initialized from sink {} at {}", sink_id, r.timestamp);
                state.reference = Some(r);
                state.playback_timestamp = state.playback_timestamp.max(r.timestamp);
                r
            }
        };

        if report.underrun {
            state.underruns += 1;
        }
        let current = state.playback_timestamp;
        let Some(sink) = state.sinks.get_mut(sink_id) else {
            return;
        };
        // A sink joining mid-stream starts at the current playback position
        let base = *sink.sample_base.get_or_insert_with(|| {
            report.samples_output as i128 - (current as i128 - reference.timestamp as i128)
        });
        let position = (reference.timestamp as i128 + report.samples_output as i128 - base).max(0) as u64;
        sink.position = Some(position);
        sink.last_report = Some(report);

        state.playback_timestamp = state.playback_timestamp.max(position);
    }

    pub fn get_current_playback_timestamp(&self) -> u64 {
        self.state.lock().playback_timestamp
    }

    /// Multiplicative rate correction for a sink (1.0 = nominal)
    pub fn calculate_rate_adjustment(&self, sink_id: &str) -> f64 {
        if !self.is_enabled() {
            return 1.0;
        }
        let cfg = &self.config;
        let mut state = self.state.lock();
        let Some(reference) = state.reference else {
            return 1.0;
        };
        let Some(sink) = state.sinks.get_mut(sink_id) else {
            return 1.0;
        };
        let (Some(report), Some(position)) = (sink.last_report, sink.position) else {
            return 1.0;
        };

        let elapsed = report
            .dispatch_time
            .checked_duration_since(reference.at)
            .unwrap_or_default()
            .as_secs_f64();
        let expected = reference.timestamp as f64 + elapsed * self.sample_rate as f64;
        let lag_ms = (expected - position as f64) / self.sample_rate as f64 * 1000.0;

        let lag_term = if lag_ms.abs() <= cfg.deadband_ms {
            0.0
        } else {
            (lag_ms - cfg.deadband_ms.copysign(lag_ms)) * cfg.lag_gain_per_ms
        };
        let fill = if report.underrun {
            0.0
        } else {
            report.buffer_fill.clamp(0.0, 1.0)
        };
        let fill_term = (fill - cfg.target_fill) * cfg.fill_gain;

        let raw = (lag_term + fill_term).clamp(-cfg.max_rate_adjustment, cfg.max_rate_adjustment);
        sink.adjustment += (raw - sink.adjustment) * cfg.smoothing;
        sink.adjustment = sink.adjustment.clamp(-cfg.max_rate_adjustment, cfg.max_rate_adjustment);
        1.0 + sink.adjustment
    }

    /// Block until every registered sink reached the barrier this cycle
    ///
    /// Returns true immediately when synchronization is disabled or fewer
    /// than two sinks are registered. On timeout the caller leaves the
    /// cycle, the timeout is counted and false is returned.
    pub fn wait_for_dispatch_barrier(&self, sink_id: &str, timeout_ms: u64) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let mut state = self.state.lock();
        if state.sinks.len() <= 1 || !state.sinks.contains_key(sink_id) {
            return true;
        }

        let generation = state.generation;
        state.arrived.insert(sink_id.to_string());
        if state.all_arrived() {
            state.complete_cycle();
            self.barrier.notify_all();
            return true;
        }

        let result = self.barrier.wait_while_for(
            &mut state,
            |s| s.generation == generation,
            Duration::from_millis(timeout_ms),
        );
        if result.timed_out() && state.generation == generation {
            state.arrived.remove(sink_id);
            let total = self.barrier_timeouts.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                "Sink {} timed out at dispatch barrier after {} ms ({} total)",
                sink_id, timeout_ms, total
            );
            return false;
        }
        true
    }

    /// Barrier wait with the configured default timeout
    pub fn wait_for_dispatch_barrier_default(&self, sink_id: &str) -> bool {
        self.wait_for_dispatch_barrier(sink_id, self.config.barrier_timeout_ms)
    }

    pub fn get_stats(&self) -> SyncStats {
        let state = self.state.lock();
        SyncStats {
            active_sinks: state.sinks.len(),
            current_timestamp: state.playback_timestamp,
            total_barrier_timeouts: self.barrier_timeouts.load(Ordering::Relaxed),
            cycles_completed: state.cycles_completed,
            underruns: state.underruns,
        }
    }
}
