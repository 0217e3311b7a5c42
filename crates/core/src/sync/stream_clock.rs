//! Stream clock recovery
//!
//! Maps a source's sample counter onto the local monotonic clock. Every
//! delivered packet gives one observation of its *lateness*: how far the
//! arrival lags behind where the nominal sample rate says it should be. A
//! two-state Kalman filter tracks that lateness (offset) and its slope
//! (drift) against stream time.
//!
//! A source whose clock runs fast produces positions faster than real time,
//! so its lateness falls steadily; that shows up as positive drift ppm.

use crate::config::ClockConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Snapshot of one clock's estimate
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ClockEstimate {
    /// Current lateness of arrivals relative to the anchor
    pub offset_seconds: f64,
    /// Clock-rate error, positive when the source runs fast
    pub drift_ppm: f64,
    pub last_innovation_seconds: f64,
    pub initialized: bool,
    pub updates: u64,
}

#[derive(Debug, Clone, Copy)]
struct Anchor {
    arrival: Instant,
    /// Unwrapped position at the anchor
    position: i64,
}

/// Drift-compensated mapping from stream position to local time
#[derive(Debug, Clone)]
pub struct StreamClock {
    sample_rate: u32,
    config: ClockConfig,
    anchor: Option<Anchor>,
    /// Raw and unwrapped position of the last update
    last_raw: u32,
    last_position: i64,
    /// Stream time (s since anchor) of the last update
    last_stream_time: f64,
    /// [offset (s), slope (s/s)]
    x: [f64; 2],
    p: [[f64; 2]; 2],
    last_innovation: f64,
    updates: u64,
}

impl StreamClock {
    pub fn new(sample_rate: u32) -> Self {
        Self::with_config(sample_rate, ClockConfig::default())
    }

    pub fn with_config(sample_rate: u32, config: ClockConfig) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            config,
            anchor: None,
            last_raw: 0,
            last_position: 0,
            last_stream_time: 0.0,
            x: [0.0; 2],
            p: [[0.0; 2]; 2],
            last_innovation: 0.0,
            updates: 0,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn measurement_variance(&self) -> f64 {
        let sigma = self.config.measurement_noise_ms / 1000.0;
        sigma * sigma
    }

    fn anchor_at(&mut self, position: u32, arrival: Instant, keep_drift: bool) {
        self.anchor = Some(Anchor {
            arrival,
            position: 0,
        });
        self.last_raw = position;
        self.last_position = 0;
        self.last_stream_time = 0.0;
        let drift_sigma = self.config.initial_drift_uncertainty_ppm * 1e-6;
        self.x = [0.0, if keep_drift { self.x[1] } else { 0.0 }];
        self.p = [
            [self.measurement_variance(), 0.0],
            [0.0, if keep_drift { self.p[1][1] } else { drift_sigma * drift_sigma }],
        ];
    }

    /// Feed one observation: the stream `position` (sample counter) of a
    /// packet and when it arrived
    pub fn update(&mut self, position: u32, arrival: Instant) {
        self.updates += 1;
        let Some(anchor) = self.anchor else {
            self.anchor_at(position, arrival, false);
            self.last_innovation = 0.0;
            debug!("Stream clock anchored at position {}", position);
            return;
        };

        let ext = self.last_position + position.wrapping_sub(self.last_raw) as i32 as i64;
        let t = (ext - anchor.position) as f64 / self.sample_rate as f64;
        let elapsed = signed_seconds(arrival, anchor.arrival);
        let z = elapsed - t;

        // Predict
        let dt = t - self.last_stream_time;
        let adt = dt.abs();
        let x0 = self.x[0] + self.x[1] * dt;
        let x1 = self.x[1];
        let [[p00, p01], [p10, p11]] = self.p;
        let mut n00 = p00 + dt * (p10 + p01) + dt * dt * p11 + self.config.offset_process_noise * adt;
        let n01 = p01 + dt * p11;
        let n10 = p10 + dt * p11;
        let n11 = p11 + self.config.drift_process_noise * adt;

        // Correct
        let innovation = z - x0;
        self.last_innovation = innovation;
        if innovation.abs() * 1000.0 > self.config.resync_threshold_ms {
            warn!(
                "Stream clock innovation {:.1} ms exceeds {:.1} ms, re-anchoring",
                innovation * 1000.0,
                self.config.resync_threshold_ms
            );
            self.anchor_at(position, arrival, true);
            return;
        }

        n00 = n00.max(0.0);
        let s = n00 + self.measurement_variance();
        let k0 = n00 / s;
        let k1 = n10 / s;
        self.x = [x0 + k0 * innovation, x1 + k1 * innovation];
        self.p = [
            [(1.0 - k0) * n00, (1.0 - k0) * n01],
            [n10 - k1 * n00, n11 - k1 * n01],
        ];

        self.last_raw = position;
        self.last_position = ext;
        self.last_stream_time = t;
    }

    /// Clock-rate error in ppm, positive when the source runs fast
    pub fn get_drift_ppm(&self) -> f64 {
        -self.x[1] * 1e6
    }

    /// Current arrival lateness relative to the anchor packet
    pub fn get_offset_seconds(&self) -> f64 {
        self.x[0]
    }

    pub fn get_last_innovation_seconds(&self) -> f64 {
        self.last_innovation
    }

    pub fn is_initialized(&self) -> bool {
        self.anchor.is_some()
    }

    /// Local time at which `position` is expected to arrive
    ///
    /// `None` before the first update, or when the projection falls before
    /// the earliest representable `Instant`.
    pub fn get_expected_arrival_time(&self, position: u32) -> Option<Instant> {
        let anchor = self.anchor?;
        let ext = self.last_position + position.wrapping_sub(self.last_raw) as i32 as i64;
        let t = (ext - anchor.position) as f64 / self.sample_rate as f64;
        let lateness = self.x[0] + self.x[1] * (t - self.last_stream_time);
        let secs = t + lateness;
        if !secs.is_finite() {
            return None;
        }
        if secs >= 0.0 {
            anchor.arrival.checked_add(Duration::from_secs_f64(secs))
        } else {
            anchor.arrival.checked_sub(Duration::from_secs_f64(-secs))
        }
    }

    pub fn estimate(&self) -> ClockEstimate {
        ClockEstimate {
            offset_seconds: self.get_offset_seconds(),
            drift_ppm: self.get_drift_ppm(),
            last_innovation_seconds: self.last_innovation,
            initialized: self.is_initialized(),
            updates: self.updates,
        }
    }

    /// Forget everything; the next update re-anchors
    pub fn reset(&mut self) {
        *self = Self::with_config(self.sample_rate, self.config.clone());
    }
}

/// `a - b` in seconds, negative when `a` is earlier
fn signed_seconds(a: Instant, b: Instant) -> f64 {
    match a.checked_duration_since(b) {
        Some(d) => d.as_secs_f64(),
        None => -b.duration_since(a).as_secs_f64(),
    }
}

/// Per-source clocks behind one lock
#[derive(Debug, Default)]
pub struct StreamClockMap {
    config: ClockConfig,
    clocks: Mutex<HashMap<String, StreamClock>>,
}

impl StreamClockMap {
    pub fn new(config: ClockConfig) -> Self {
        Self {
            config,
            clocks: Mutex::new(HashMap::new()),
        }
    }

    /// Update (creating on first use) the clock of `source`
    ///
    /// A change of sample rate starts a fresh clock.
    pub fn update(&self, source: &str, sample_rate: u32, position: u32, arrival: Instant) -> ClockEstimate {
        let mut clocks = self.clocks.lock();
        let clock = clocks
            .entry(source.to_string())
            .or_insert_with(|| {
                info!("Tracking clock for source {} at {} Hz", source, sample_rate);
                StreamClock::with_config(sample_rate, self.config.clone())
            });
        if clock.sample_rate() != sample_rate {
            info!(
                "Source {} changed rate {} -> {} Hz, restarting clock",
                source,
                clock.sample_rate(),
                sample_rate
            );
            *clock = StreamClock::with_config(sample_rate, self.config.clone());
        }
        clock.update(position, arrival);
        clock.estimate()
    }

    pub fn drift_ppm(&self, source: &str) -> Option<f64> {
        self.clocks.lock().get(source).map(StreamClock::get_drift_ppm)
    }

    pub fn estimate(&self, source: &str) -> Option<ClockEstimate> {
        self.clocks.lock().get(source).map(StreamClock::estimate)
    }

    pub fn remove(&self, source: &str) -> bool {
        self.clocks.lock().remove(source).is_some()
    }

    /// Return the source's clock to the unanchored state
    pub fn reset(&self, source: &str) {
        if let Some(clock) = self.clocks.lock().get_mut(source) {
            clock.reset();
        }
    }

    /// Estimates of every tracked source
    pub fn snapshot(&self) -> HashMap<String, ClockEstimate> {
        self.clocks
            .lock()
            .iter()
            .map(|(id, clock)| (id.clone(), clock.estimate()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clocks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.lock().is_empty()
    }
}
