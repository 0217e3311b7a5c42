//! Sink side: mixer queues steering source rates, and several dispatch
//! threads held together by the global clock's barrier

use multiroom_core::config::{CoreConfig, RateControlConfig, SyncConfig};
use multiroom_core::ingest::ProcessedBlock;
use multiroom_core::sync::{
    BufferMetricsSource, GlobalSynchronizationClock, RateControlWorker, SinkRateController, SinkTimingReport,
    StreamClockMap,
};
use multiroom_core::{ProcessorControls, SinkMixer, SourcePipeline, StreamProperties};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const BLOCK_FRAMES: usize = 480;

fn silent_block(frames: usize) -> ProcessedBlock {
    ProcessedBlock {
        timestamp: 0,
        samples: vec![0; frames * 2],
        frames,
        interpolated: false,
    }
}

fn source_controls() -> ProcessorControls {
    let pipeline = SourcePipeline::with_properties(
        "src",
        &CoreConfig::default(),
        Arc::new(StreamClockMap::default()),
        StreamProperties::default(),
    )
    .unwrap();
    pipeline.controls().unwrap()
}

fn controller_driving(controls: &ProcessorControls) -> SinkRateController {
    let controller = SinkRateController::new("sink", RateControlConfig::default());
    let controls = controls.clone();
    controller.set_rate_command_callback(Box::new(move |id: &str, ratio: f64| {
        if id == "src" {
            controls.set_playback_rate(ratio);
        }
    }));
    controller
}

#[test]
fn test_starving_sink_speeds_source_up() {
    let controls = source_controls();
    let controller = controller_driving(&controls);
    let mixer = SinkMixer::new("sink", 2, 48000, BLOCK_FRAMES, 1000.0);
    mixer.push_block("src", silent_block(288));

    for _ in 0..5 {
        controller.poll(&mixer);
    }
    assert!(controls.playback_rate() > 1.0, "rate {}", controls.playback_rate());
}

#[test]
fn test_flooded_sink_slows_source_down() {
    let controls = source_controls();
    let controller = controller_driving(&controls);
    let mixer = SinkMixer::new("sink", 2, 48000, BLOCK_FRAMES, 1000.0);
    for _ in 0..20 {
        mixer.push_block("src", silent_block(BLOCK_FRAMES));
    }

    for _ in 0..5 {
        controller.poll(&mixer);
    }
    assert!(controls.playback_rate() < 1.0, "rate {}", controls.playback_rate());

    // Draining back to the target returns the source to nominal speed
    let mut out = Vec::new();
    for _ in 0..16 {
        mixer.mix_next_block(&mut out);
    }
    for _ in 0..40 {
        controller.poll(&mixer);
    }
    assert_eq!(controls.playback_rate(), 1.0);
}

#[test]
fn test_worker_polls_mixer_until_stopped() {
    let controls = source_controls();
    let controller = Arc::new(controller_driving(&controls));
    let mixer = Arc::new(SinkMixer::new("sink", 2, 48000, BLOCK_FRAMES, 1000.0));
    mixer.push_block("src", silent_block(288));

    let metrics: Arc<dyn BufferMetricsSource> = mixer.clone();
    let mut worker = RateControlWorker::spawn(controller.clone(), metrics, Duration::from_millis(5)).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while controls.playback_rate() <= 1.0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    worker.stop();
    assert!(!worker.is_running());
    assert!(controls.playback_rate() > 1.0);
    assert_eq!(controller.tracked_sources(), vec!["src".to_string()]);
}

#[test]
fn test_dispatch_threads_advance_together() {
    let config = SyncConfig {
        barrier_timeout_ms: 2000,
        ..SyncConfig::default()
    };
    let clock = Arc::new(GlobalSynchronizationClock::new(48000, config));
    let cycles = 50u64;
    let sinks = ["kitchen", "office"];
    for id in sinks {
        clock.register_sink(id);
    }

    let handles: Vec<_> = sinks
        .iter()
        .map(|&id| {
            let clock = clock.clone();
            thread::spawn(move || {
                let mixer = SinkMixer::new(id, 2, 48000, BLOCK_FRAMES, 1000.0);
                let mut out = Vec::new();
                let mut timeouts = 0;
                for cycle in 0..cycles {
                    mixer.push_block("src", silent_block(BLOCK_FRAMES));
                    let outcome = mixer.mix_next_block(&mut out);
                    if !clock.wait_for_dispatch_barrier_default(id) {
                        timeouts += 1;
                    }
                    clock.report_sink_timing(
                        id,
                        SinkTimingReport {
                            samples_output: (cycle + 1) * BLOCK_FRAMES as u64,
                            stream_timestamp: cycle * BLOCK_FRAMES as u64,
                            dispatch_time: Instant::now(),
                            underrun: outcome.underrun,
                            buffer_fill: 0.5,
                        },
                    );
                }
                timeouts
            })
        })
        .collect();

    for h in handles {
        assert_eq!(h.join().unwrap(), 0);
    }

    let stats = clock.get_stats();
    assert_eq!(stats.active_sinks, 2);
    assert_eq!(stats.cycles_completed, cycles);
    assert_eq!(stats.total_barrier_timeouts, 0);
    assert_eq!(stats.underruns, 0);

    let ts = clock.get_current_playback_timestamp();
    let block = BLOCK_FRAMES as u64;
    assert!(ts >= (cycles - 1) * block && ts <= cycles * block, "timestamp {}", ts);

    for id in sinks {
        let rate = clock.calculate_rate_adjustment(id);
        assert!((rate - 1.0).abs() <= SyncConfig::default().max_rate_adjustment + 1e-12);
    }
}

#[test]
fn test_stalled_sink_costs_one_timeout() {
    let clock = GlobalSynchronizationClock::new(48000, SyncConfig::default());
    clock.register_sink("a");
    clock.register_sink("b");

    let started = Instant::now();
    assert!(!clock.wait_for_dispatch_barrier("a", 30));
    assert!(started.elapsed() >= Duration::from_millis(25));
    assert_eq!(clock.get_stats().total_barrier_timeouts, 1);
    assert_eq!(clock.get_stats().cycles_completed, 0);

    // With the stalled sink gone a lone sink never waits
    clock.unregister_sink("b");
    assert!(clock.wait_for_dispatch_barrier("a", 30));

    clock.set_enabled(false);
    assert!(clock.wait_for_dispatch_barrier("a", 30));
    assert_eq!(clock.calculate_rate_adjustment("a"), 1.0);
}
