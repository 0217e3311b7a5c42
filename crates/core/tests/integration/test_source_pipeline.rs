//! Source pipeline end to end: detection, reordering, clock tracking and
//! processing driven only by arriving packets

use multiroom_core::audio::{ByteOrder, Codec, RtpPacketData, StreamProperties};
use multiroom_core::config::CoreConfig;
use multiroom_core::sync::StreamClockMap;
use multiroom_core::SourcePipeline;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};

const FRAMES_PER_PACKET: usize = 288;
const PACKET_INTERVAL: Duration = Duration::from_millis(6);

/// 16-bit LE stereo packet: 440 Hz left, 660 Hz right
fn stereo_packet(seq: u16, at: Instant) -> RtpPacketData {
    let mut payload = Vec::with_capacity(FRAMES_PER_PACKET * 4);
    for n in 0..FRAMES_PER_PACKET {
        let t = (seq as usize * FRAMES_PER_PACKET + n) as f64 / 48000.0;
        let l = ((2.0 * std::f64::consts::PI * 440.0 * t).sin() * 16000.0) as i16;
        let r = ((2.0 * std::f64::consts::PI * 660.0 * t).sin() * 16000.0) as i16;
        payload.extend_from_slice(&l.to_le_bytes());
        payload.extend_from_slice(&r.to_le_bytes());
    }
    RtpPacketData::new(seq, seq as u32 * FRAMES_PER_PACKET as u32, at, payload)
}

#[test]
fn test_pipeline_locks_format_then_delivers() {
    let clocks = Arc::new(StreamClockMap::default());
    let mut pipeline = SourcePipeline::new("living-room", &CoreConfig::default(), clocks.clone());
    let t0 = Instant::now();

    let mut delivered = Vec::new();
    let mut locked_at = None;
    for seq in 0..40u16 {
        let blocks = pipeline.push_packet(stereo_packet(seq, t0 + PACKET_INTERVAL * seq as u32));
        if locked_at.is_none() && pipeline.is_format_locked() {
            locked_at = Some(seq);
        }
        delivered.extend(blocks);
    }

    let locked_at = locked_at.expect("format never locked");
    // 8 packets of 1152 bytes are the least the probe accepts
    assert!(locked_at >= 7, "locked before enough data: {}", locked_at);

    let props = pipeline.properties().copied().unwrap();
    assert_eq!(props.codec, Codec::Pcm);
    assert_eq!(props.bit_depth, 16);
    assert_eq!(props.channels, 2);
    assert_eq!(props.byte_order, ByteOrder::Little);
    assert_eq!(props.sample_rate, 48000);

    // Packets held during probing are released in order once locked
    assert_eq!(delivered.len(), 40);
    for pair in delivered.windows(2) {
        assert_eq!(pair[1].timestamp - pair[0].timestamp, FRAMES_PER_PACKET as u32);
    }
    assert!(delivered.iter().all(|b| b.frames == FRAMES_PER_PACKET));

    let stats = pipeline.stats();
    assert_eq!(stats.packets_received, 40);
    assert_eq!(stats.blocks_produced, 40);
    assert!(stats.probe_confidence >= 0.4);
    assert!(clocks.estimate("living-room").unwrap().initialized);
}

#[test]
fn test_shuffled_arrivals_come_out_in_order() {
    let props = StreamProperties::default();
    let mut pipeline = SourcePipeline::with_properties(
        "kitchen",
        &CoreConfig::default(),
        Arc::new(StreamClockMap::default()),
        props,
    )
    .unwrap();

    let t0 = Instant::now();
    let mut rng = StdRng::seed_from_u64(7);
    let mut order: Vec<u16> = (0..60).collect();
    // Swap neighbours so nothing is displaced by more than one slot. The
    // first packet always goes out on arrival, so the first pair stays put.
    let mut i = 3;
    while i < order.len() {
        if rng.gen_bool(0.5) {
            order.swap(i - 1, i);
        }
        i += 2;
    }

    let mut timestamps = Vec::new();
    for (k, seq) in order.into_iter().enumerate() {
        let at = t0 + PACKET_INTERVAL * k as u32;
        for block in pipeline.push_packet(stereo_packet(seq, at)) {
            timestamps.push(block.timestamp);
        }
    }
    for block in pipeline.poll(t0 + Duration::from_secs(2)) {
        timestamps.push(block.timestamp);
    }

    let expected: Vec<u32> = (0..60u32).map(|s| s * FRAMES_PER_PACKET as u32).collect();
    assert_eq!(timestamps, expected);
    let reorder = pipeline.stats().reorder;
    assert_eq!(reorder.interpolated, 0);
    assert_eq!(reorder.lost, 0);
}

#[test]
fn test_rate_command_changes_output_length() {
    let mut pipeline = SourcePipeline::with_properties(
        "porch",
        &CoreConfig::default(),
        Arc::new(StreamClockMap::default()),
        StreamProperties::default(),
    )
    .unwrap();
    assert!(pipeline.set_playback_rate(1.05));

    let t0 = Instant::now();
    let mut frames_out = 0usize;
    let packets = 400u16;
    for seq in 0..packets {
        for block in pipeline.push_packet(stereo_packet(seq, t0 + PACKET_INTERVAL * seq as u32)) {
            frames_out += block.frames;
        }
    }

    let frames_in = packets as f64 * FRAMES_PER_PACKET as f64;
    let ratio = frames_out as f64 / frames_in;
    assert!((ratio - 1.05).abs() < 0.02, "output ratio {}", ratio);
    assert!(pipeline.stats().processor.unwrap().resampler_active);
}

#[test]
fn test_config_from_toml_drives_pipeline() {
    let config = CoreConfig::from_toml_str(
        r#"
        [processor]
        output_channels = 1

        [reorder]
        max_interpolated_packets = 0
        "#,
    )
    .unwrap();

    let mut pipeline = SourcePipeline::with_properties(
        "garage",
        &config,
        Arc::new(StreamClockMap::default()),
        StreamProperties::default(),
    )
    .unwrap();

    let t0 = Instant::now();
    let first = pipeline.push_packet(stereo_packet(0, t0));
    assert_eq!(first[0].samples.len(), FRAMES_PER_PACKET);

    pipeline.push_packet(stereo_packet(2, t0 + PACKET_INTERVAL));
    let flushed = pipeline.poll(t0 + Duration::from_secs(1));
    assert_eq!(flushed.len(), 1);
    assert_eq!(pipeline.stats().reorder.lost, 1);
}
