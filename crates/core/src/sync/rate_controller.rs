//! Per-sink playback-rate controller
//!
//! Watches how much audio a sink has queued and nudges the sources feeding
//! it: a starving buffer asks sources to produce faster (ratio > 1), a
//! flooding one asks them to slow down. Commands go out through a callback
//! so the controller never needs to know how sources are reached.

use crate::config::RateControlConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Queue depth of one source inside a sink
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SourceBufferMetrics {
    pub buffered_ms: f64,
    pub blocks: usize,
}

/// Snapshot of a sink's pending audio
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InputBufferMetrics {
    pub total_buffered_ms: f64,
    pub per_source: HashMap<String, SourceBufferMetrics>,
    pub active_sources: usize,
    pub block_duration_ms: f64,
}

/// Anything that can report a sink's buffer metrics
///
/// `None` means the metrics are unavailable right now; the controller
/// skips that tick.
pub trait BufferMetricsSource: Send + Sync {
    fn buffer_metrics(&self) -> Option<InputBufferMetrics>;
}

impl<F> BufferMetricsSource for F
where
    F: Fn() -> Option<InputBufferMetrics> + Send + Sync,
{
    fn buffer_metrics(&self) -> Option<InputBufferMetrics> {
        self()
    }
}

/// Receives `(source_id, ratio)` commands
pub type RateCommandCallback = Box<dyn Fn(&str, f64) + Send + Sync>;

#[derive(Debug, Clone, Default)]
struct SourceState {
    smoothed_ms: Option<f64>,
    /// Ratio last sent; 1.0 until a command goes out
    last_ratio: f64,
    out_of_tolerance: u32,
}

struct Inner {
    smoothed_total: Option<f64>,
    sources: HashMap<String, SourceState>,
    callback: Option<Arc<dyn Fn(&str, f64) + Send + Sync>>,
}

/// Feedback controller for one sink
pub struct SinkRateController {
    sink_id: String,
    config: RateControlConfig,
    inner: Mutex<Inner>,
}

impl SinkRateController {
    pub fn new(sink_id: impl Into<String>, config: RateControlConfig) -> Self {
        Self {
            sink_id: sink_id.into(),
            config,
            inner: Mutex::new(Inner {
                smoothed_total: None,
                sources: HashMap::new(),
                callback: None,
            }),
        }
    }

    pub fn sink_id(&self) -> &str {
        &self.sink_id
    }

    pub fn config(&self) -> &RateControlConfig {
        &self.config
    }

    pub fn set_rate_command_callback(&self, callback: RateCommandCallback) {
        self.inner.lock().callback = Some(Arc::from(callback));
    }

    /// Pull metrics from `source` and update
    pub fn poll(&self, source: &dyn BufferMetricsSource) {
        self.update(source.buffer_metrics());
    }

    /// Run one control step
    pub fn update(&self, metrics: Option<InputBufferMetrics>) {
        let Some(metrics) = metrics else {
            debug!("Sink {}: buffer metrics unavailable, skipping tick", self.sink_id);
            return;
        };
        if !metrics.total_buffered_ms.is_finite() || metrics.total_buffered_ms < 0.0 {
            warn!(
                "Sink {}: invalid total buffer level {}, skipping tick",
                self.sink_id, metrics.total_buffered_ms
            );
            return;
        }

        let cfg = &self.config;
        let mut commands = Vec::new();
        let callback = {
            let mut inner = self.inner.lock();
            inner.smoothed_total = Some(match inner.smoothed_total {
                Some(prev) => prev + (metrics.total_buffered_ms - prev) * cfg.smoothing,
                None => metrics.total_buffered_ms,
            });

            let share = if metrics.active_sources > 0 {
                metrics.total_buffered_ms / metrics.active_sources as f64
            } else {
                metrics.total_buffered_ms
            };

            for (id, m) in &metrics.per_source {
                let level = if m.buffered_ms.is_finite() && m.buffered_ms >= 0.0 {
                    m.buffered_ms
                } else {
                    debug!(
                        "Sink {}: invalid level {} for source {}, using share {:.1} ms",
                        self.sink_id, m.buffered_ms, id, share
                    );
                    share
                };

                let state = inner.sources.entry(id.clone()).or_insert_with(|| SourceState {
                    last_ratio: 1.0,
                    ..Default::default()
                });
                let smoothed = match state.smoothed_ms {
                    Some(prev) => prev + (level - prev) * cfg.smoothing,
                    None => level,
                };
                state.smoothed_ms = Some(smoothed);

                let error = smoothed - cfg.target_buffer_ms;
                if error.abs() <= cfg.tolerance_ms {
                    state.out_of_tolerance = 0;
                    if state.last_ratio != 1.0 {
                        state.last_ratio = 1.0;
                        commands.push((id.clone(), 1.0));
                    }
                    continue;
                }

                state.out_of_tolerance = state.out_of_tolerance.saturating_add(1);
                if state.out_of_tolerance < cfg.sustain_updates {
                    continue;
                }

                let adjust = (-cfg.gain_per_ms * error).clamp(-cfg.max_rate_adjustment, cfg.max_rate_adjustment);
                let ratio = 1.0 + adjust;
                if (ratio - state.last_ratio).abs() >= cfg.min_command_delta {
                    state.last_ratio = ratio;
                    commands.push((id.clone(), ratio));
                }
            }

            // Sources the sink no longer reports start from scratch if they return
            let before = inner.sources.len();
            inner.sources.retain(|id, _| metrics.per_source.contains_key(id));
            if inner.sources.len() < before {
                debug!(
                    "Sink {}: dropped state for {} departed sources",
                    self.sink_id,
                    before - inner.sources.len()
                );
            }
            inner.callback.clone()
        };

        if commands.is_empty() {
            return;
        }
        match callback {
            Some(cb) => {
                for (id, ratio) in commands {
                    debug!("Sink {}: source {} rate -> {:.5}", self.sink_id, id, ratio);
                    cb(&id, ratio);
                }
            }
            None => debug!(
                "Sink {}: {} rate commands dropped, no callback registered",
                self.sink_id,
                commands.len()
            ),
        }
    }

    /// Stop tracking a source; returns whether it was tracked
    pub fn remove_source(&self, source_id: &str) -> bool {
        let removed = self.inner.lock().sources.remove(source_id).is_some();
        if removed {
            info!("Sink {}: stopped tracking source {}", self.sink_id, source_id);
        }
        removed
    }

    pub fn smoothed_buffer_ms(&self) -> Option<f64> {
        self.inner.lock().smoothed_total
    }

    /// Ratio most recently commanded for a source
    pub fn source_rate(&self, source_id: &str) -> Option<f64> {
        self.inner.lock().sources.get(source_id).map(|s| s.last_ratio)
    }

    pub fn tracked_sources(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().sources.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for SinkRateController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkRateController")
            .field("sink_id", &self.sink_id)
            .field("config", &self.config)
            .finish()
    }
}

/// Background thread polling one controller at a fixed interval
pub struct RateControlWorker {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RateControlWorker {
    pub fn spawn(
        controller: Arc<SinkRateController>,
        metrics: Arc<dyn BufferMetricsSource>,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let name = format!("rate-control-{}", controller.sink_id());

        let handle = std::thread::Builder::new().name(name).spawn(move || {
            info!("Rate control worker started for sink {}", controller.sink_id());
            while flag.load(Ordering::Relaxed) {
                controller.poll(metrics.as_ref());
                park_for(&flag, interval);
            }
            info!("Rate control worker stopped for sink {}", controller.sink_id());
        })?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Signal the thread and join it; later calls do nothing
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                warn!("Rate control worker panicked");
            }
        }
    }
}

impl Drop for RateControlWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sleep up to `interval`, returning early once `flag` clears
fn park_for(flag: &AtomicBool, interval: Duration) {
    let deadline = std::time::Instant::now() + interval;
    while flag.load(Ordering::Relaxed) {
        let now = std::time::Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::park_timeout(deadline - now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn config() -> RateControlConfig {
        RateControlConfig {
            target_buffer_ms: 40.0,
            tolerance_ms: 5.0,
            smoothing: 1.0,
            gain_per_ms: 0.001,
            max_rate_adjustment: 0.02,
            sustain_updates: 2,
            min_command_delta: 0.0005,
            poll_interval_ms: 5,
        }
    }

    fn metrics(levels: &[(&str, f64)]) -> InputBufferMetrics {
        InputBufferMetrics {
            total_buffered_ms: levels.iter().map(|(_, ms)| ms.max(0.0)).sum(),
            per_source: levels
                .iter()
                .map(|(id, ms)| (id.to_string(), SourceBufferMetrics { buffered_ms: *ms, blocks: 1 }))
                .collect(),
            active_sources: levels.len(),
            block_duration_ms: 10.0,
        }
    }

    fn recording(controller: &SinkRateController) -> Arc<Mutex<Vec<(String, f64)>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        controller.set_rate_command_callback(Box::new(move |id: &str, ratio: f64| {
            sink.lock().push((id.to_string(), ratio));
        }));
        log
    }

    #[test]
    fn test_starving_speeds_up_after_sustain() {
        let c = SinkRateController::new("kitchen", config());
        let log = recording(&c);

        c.update(Some(metrics(&[("a", 10.0)])));
        assert!(log.lock().is_empty());
        c.update(Some(metrics(&[("a", 10.0)])));

        let cmds = log.lock().clone();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].0, "a");
        assert!((cmds[0].1 - 1.02).abs() < 1e-9);
    }

    #[test]
    fn test_flooding_slows_down() {
        let c = SinkRateController::new("kitchen", config());
        let log = recording(&c);
        for _ in 0..3 {
            c.update(Some(metrics(&[("a", 50.0)])));
        }
        let ratio = c.source_rate("a").unwrap();
        assert!(ratio < 1.0 && ratio > 0.98, "{ratio}");
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn test_return_to_target_sends_unity_once() {
        let c = SinkRateController::new("kitchen", config());
        let log = recording(&c);
        c.update(Some(metrics(&[("a", 0.0)])));
        c.update(Some(metrics(&[("a", 0.0)])));
        c.update(Some(metrics(&[("a", 40.0)])));
        c.update(Some(metrics(&[("a", 41.0)])));

        let cmds = log.lock().clone();
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[1].1, 1.0);
    }

    #[test]
    fn test_invalid_source_metrics_use_share() {
        let c = SinkRateController::new("kitchen", config());
        let log = recording(&c);
        let mut m = metrics(&[("a", f64::NAN), ("b", 40.0)]);
        m.total_buffered_ms = 20.0;
        c.update(Some(m.clone()));
        c.update(Some(m));
        // "a" falls back to 20 / 2 = 10 ms, well below target
        let cmds = log.lock().clone();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].0, "a");
        assert!(cmds[0].1 > 1.0);
    }

    #[test]
    fn test_none_metrics_are_skipped() {
        let c = SinkRateController::new("kitchen", config());
        c.update(None);
        assert!(c.smoothed_buffer_ms().is_none());
        c.update(Some(metrics(&[("a", 30.0)])));
        assert_eq!(c.smoothed_buffer_ms(), Some(30.0));
    }

    #[test]
    fn test_remove_source_keeps_others() {
        let c = SinkRateController::new("kitchen", config());
        c.update(Some(metrics(&[("a", 40.0), ("b", 40.0)])));
        assert_eq!(c.tracked_sources(), vec!["a".to_string(), "b".to_string()]);
        assert!(c.remove_source("a"));
        assert!(!c.remove_source("a"));
        c.update(Some(metrics(&[("b", 40.0)])));
        assert_eq!(c.tracked_sources(), vec!["b".to_string()]);
    }

    #[test]
    fn test_departed_sources_are_pruned() {
        let c = SinkRateController::new("kitchen", config());
        let log = recording(&c);
        c.update(Some(metrics(&[("a", 10.0), ("b", 40.0)])));
        c.update(Some(metrics(&[("a", 10.0), ("b", 40.0)])));
        assert!(c.source_rate("a").unwrap() > 1.0);

        c.update(Some(metrics(&[("b", 40.0)])));
        assert_eq!(c.tracked_sources(), vec!["b".to_string()]);
        assert!(c.source_rate("a").is_none());

        // A returning source needs a fresh sustain run before any command
        log.lock().clear();
        c.update(Some(metrics(&[("a", 10.0), ("b", 40.0)])));
        assert!(log.lock().is_empty());
        assert_eq!(c.source_rate("a"), Some(1.0));
    }

    #[test]
    fn test_worker_polls_and_stops() {
        let c = Arc::new(SinkRateController::new("kitchen", config()));
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = polls.clone();
        let source: Arc<dyn BufferMetricsSource> = Arc::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
            Some(metrics(&[("a", 40.0)]))
        });

        let mut worker = RateControlWorker::spawn(c.clone(), source, Duration::from_millis(2)).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        worker.stop();
        worker.stop();
        assert!(!worker.is_running());

        let seen = polls.load(Ordering::Relaxed);
        assert!(seen >= 2, "polled {seen} times");
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(polls.load(Ordering::Relaxed), seen);
    }
}
