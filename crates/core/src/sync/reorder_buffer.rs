//! Reordering buffer with gap interpolation
//!
//! Packets are held in a `BTreeMap` keyed by their unwrapped sequence
//! number. The next expected packet is released as soon as it arrives.
//! Once the oldest packet in the backlog has waited past the reordering
//! deadline the buffer gives up on the missing packets, fills short gaps
//! with linearly interpolated payload and moves on.

use crate::audio::{RtpPacketData, StreamProperties};
use crate::config::ReorderConfig;
use crate::sync::sequence::{ts_lerp, SequenceUnwrapper};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Counters for one reordering buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReorderStats {
    /// Packets handed out, interpolated ones included
    pub delivered: u64,
    pub interpolated: u64,
    pub duplicates: u64,
    /// Packets at or before the last delivered sequence
    pub late: u64,
    /// Packets dropped because the buffer was full
    pub overflow: u64,
    /// Missing packets skipped without interpolation
    pub lost: u64,
}

/// What the buffer remembers about the last delivered packet
#[derive(Debug, Clone)]
struct Delivered {
    ext_seq: i64,
    timestamp: u32,
    /// Final frame of the payload, used as the left interpolation anchor
    last_frame: Vec<u8>,
}

/// Sequence-ordered holding buffer for one stream
#[derive(Debug)]
pub struct RtpReorderingBuffer {
    packets: BTreeMap<i64, RtpPacketData>,
    unwrapper: SequenceUnwrapper,
    properties: Option<StreamProperties>,
    last: Option<Delivered>,
    max_packets: usize,
    deadline: Duration,
    max_interpolated: usize,
    stats: ReorderStats,
}

impl RtpReorderingBuffer {
    pub fn new(config: &ReorderConfig) -> Self {
        Self {
            packets: BTreeMap::new(),
            unwrapper: SequenceUnwrapper::new(),
            properties: None,
            last: None,
            max_packets: config.max_packets.max(1),
            deadline: Duration::from_millis(config.reorder_deadline_ms),
            max_interpolated: config.max_interpolated_packets,
            stats: ReorderStats::default(),
        }
    }

    /// Stream format; required before gaps can be interpolated
    pub fn set_properties(&mut self, properties: StreamProperties) {
        self.properties = Some(properties);
    }

    pub fn properties(&self) -> Option<&StreamProperties> {
        self.properties.as_ref()
    }

    /// Queue a packet. Returns false for duplicates and packets that arrive
    /// after their slot was already delivered or skipped.
    pub fn add_packet(&mut self, packet: RtpPacketData) -> bool {
        let ext = self.unwrapper.unwrap(packet.sequence);

        if let Some(last) = &self.last {
            if ext <= last.ext_seq {
                self.stats.late += 1;
                debug!(
                    "Late packet seq {} (last delivered {})",
                    packet.sequence, last.ext_seq as u16
                );
                return false;
            }
        }
        if self.packets.contains_key(&ext) {
            self.stats.duplicates += 1;
            return false;
        }

        if self.packets.len() >= self.max_packets {
            if let Some((oldest, _)) = self.packets.pop_first() {
                self.stats.overflow += 1;
                warn!(
                    "Reordering buffer full ({} packets), dropped seq {}",
                    self.max_packets, oldest as u16
                );
            }
        }

        self.packets.insert(ext, packet);
        true
    }

    /// Release packets that are ready now
    pub fn get_ready_packets(&mut self) -> Vec<RtpPacketData> {
        self.get_ready_packets_at(Instant::now())
    }

    /// Release packets that are ready at `now`, in sequence order
    pub fn get_ready_packets_at(&mut self, now: Instant) -> Vec<RtpPacketData> {
        let mut ready = Vec::new();

        while let Some(&ext) = self.packets.keys().next() {
            let expected = self.last.as_ref().map(|l| l.ext_seq + 1);

            let contiguous = expected.map_or(true, |e| ext == e);
            if !contiguous {
                // Deadline runs from the oldest arrival in the backlog
                let Some(oldest) = self.oldest_arrival() else {
                    break;
                };
                if now.saturating_duration_since(oldest) < self.deadline {
                    break;
                }
            }

            let Some(packet) = self.packets.remove(&ext) else {
                break;
            };
            if let Some(expected) = expected {
                let gap = (ext - expected) as usize;
                if gap > 0 {
                    self.fill_gap(gap, &packet, &mut ready);
                }
            }
            self.deliver(ext, packet, &mut ready);
        }

        ready
    }

    fn oldest_arrival(&self) -> Option<Instant> {
        self.packets.values().map(|p| p.received_at).min()
    }

    fn deliver(&mut self, ext: i64, packet: RtpPacketData, ready: &mut Vec<RtpPacketData>) {
        let frame_bytes = self.frame_bytes();
        let last_frame = match frame_bytes {
            Some(fb) if packet.payload.len() >= fb => packet.payload[packet.payload.len() - fb..].to_vec(),
            _ => Vec::new(),
        };
        self.last = Some(Delivered {
            ext_seq: ext,
            timestamp: packet.timestamp,
            last_frame,
        });
        self.stats.delivered += 1;
        ready.push(packet);
    }

    fn frame_bytes(&self) -> Option<usize> {
        self.properties
            .as_ref()
            .map(StreamProperties::frame_bytes)
            .filter(|&fb| fb > 0)
    }

    /// Emit `gap` synthesized packets ahead of `next`, or count them lost
    fn fill_gap(&mut self, gap: usize, next: &RtpPacketData, ready: &mut Vec<RtpPacketData>) {
        let (Some(props), Some(last)) = (self.properties, self.last.clone()) else {
            self.stats.lost += gap as u64;
            return;
        };
        let fb = props.frame_bytes();
        let can_interpolate = gap <= self.max_interpolated
            && fb > 0
            && last.last_frame.len() == fb
            && next.payload.len() >= fb;
        if !can_interpolate {
            self.stats.lost += gap as u64;
            debug!(
                "Skipping {} missing packets after seq {}",
                gap, last.ext_seq as u16
            );
            return;
        }

        let frames = next.payload.len() / fb;
        let bps = props.bytes_per_sample();
        let next_first = &next.payload[..fb];
        let den = gap as i64 + 1;

        for i in 0..gap {
            let num = i as i64 + 1;
            let mut frame = vec![0u8; fb];
            for ch in 0..props.channels {
                let at = ch * bps;
                let a = props.read_sample(&last.last_frame[at..at + bps]) as i64;
                let b = props.read_sample(&next_first[at..at + bps]) as i64;
                let v = a + (b - a) * num / den;
                props.write_sample(v as i32, &mut frame[at..at + bps]);
            }

            let mut payload = Vec::with_capacity(frames * fb);
            for _ in 0..frames {
                payload.extend_from_slice(&frame);
            }

            let ext = last.ext_seq + num;
            let mut synthesized = RtpPacketData::new(
                ext as u16,
                ts_lerp(last.timestamp, next.timestamp, num, den),
                next.received_at,
                payload,
            );
            synthesized.interpolated = true;
            self.stats.interpolated += 1;
            self.deliver(ext, synthesized, ready);
        }
    }

    pub fn stats(&self) -> ReorderStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Drop all packets and forget the delivery position; stats are kept
    pub fn reset(&mut self) {
        self.packets.clear();
        self.unwrapper.reset();
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::{read_pcm, write_pcm};
    use crate::audio::ByteOrder;

    fn props(channels: usize) -> StreamProperties {
        StreamProperties {
            channels,
            ..Default::default()
        }
    }

    /// 16-bit LE payload where every frame repeats `values`
    fn payload(values: &[i32], frames: usize) -> Vec<u8> {
        let mut out = vec![0u8; values.len() * 2 * frames];
        for f in 0..frames {
            for (c, &v) in values.iter().enumerate() {
                let at = (f * values.len() + c) * 2;
                write_pcm(v, 16, ByteOrder::Little, &mut out[at..at + 2]);
            }
        }
        out
    }

    fn sample(p: &[u8], index: usize) -> i32 {
        read_pcm(&p[index * 2..], 16, ByteOrder::Little)
    }

    fn packet(seq: u16, ts: u32, at: Instant, values: &[i32]) -> RtpPacketData {
        RtpPacketData::new(seq, ts, at, payload(values, 4))
    }

    fn buffer() -> RtpReorderingBuffer {
        RtpReorderingBuffer::new(&ReorderConfig {
            max_packets: 16,
            reorder_deadline_ms: 20,
            max_interpolated_packets: 4,
        })
    }

    #[test]
    fn test_contiguous_packets_released_immediately() {
        let mut buf = buffer();
        let t0 = Instant::now();
        for seq in 0..3 {
            assert!(buf.add_packet(packet(seq, seq as u32 * 480, t0, &[0])));
        }
        let out = buf.get_ready_packets_at(t0);
        assert_eq!(out.iter().map(|p| p.sequence).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_out_of_order_is_restored() {
        let mut buf = buffer();
        let t0 = Instant::now();
        buf.add_packet(packet(10, 0, t0, &[0]));
        assert_eq!(buf.get_ready_packets_at(t0).len(), 1);

        buf.add_packet(packet(12, 960, t0, &[0]));
        buf.add_packet(packet(11, 480, t0, &[0]));
        let out = buf.get_ready_packets_at(t0);
        assert_eq!(out.iter().map(|p| p.sequence).collect::<Vec<_>>(), vec![11, 12]);
        assert!(out.iter().all(|p| !p.interpolated));
    }

    #[test]
    fn test_single_gap_interpolates_midpoint() {
        let mut buf = buffer();
        buf.set_properties(props(2));
        let t0 = Instant::now();

        buf.add_packet(packet(100, 48000, t0, &[1000, 2000]));
        assert_eq!(buf.get_ready_packets_at(t0).len(), 1);

        buf.add_packet(packet(102, 48960, t0, &[3000, 4000]));
        assert!(buf.get_ready_packets_at(t0 + Duration::from_millis(5)).is_empty());

        let out = buf.get_ready_packets_at(t0 + Duration::from_millis(25));
        assert_eq!(out.len(), 2);
        let fill = &out[0];
        assert!(fill.interpolated);
        assert_eq!(fill.sequence, 101);
        assert_eq!(fill.timestamp, 48480);
        assert_eq!(fill.payload.len(), 16);
        for frame in 0..4 {
            assert_eq!(sample(&fill.payload, frame * 2), 2000);
            assert_eq!(sample(&fill.payload, frame * 2 + 1), 3000);
        }
        assert_eq!(out[1].sequence, 102);
        assert_eq!(buf.stats().interpolated, 1);
    }

    #[test]
    fn test_deadline_runs_from_oldest_buffered_arrival() {
        let mut buf = buffer();
        buf.set_properties(props(1));
        let t0 = Instant::now();
        buf.add_packet(packet(0, 0, t0, &[0]));
        assert_eq!(buf.get_ready_packets_at(t0).len(), 1);

        // seq 1 never arrives; seq 3 is buffered before seq 2
        buf.add_packet(packet(3, 1440, t0, &[300]));
        buf.add_packet(packet(2, 960, t0 + Duration::from_millis(15), &[200]));
        assert!(buf.get_ready_packets_at(t0 + Duration::from_millis(19)).is_empty());

        let out = buf.get_ready_packets_at(t0 + Duration::from_millis(21));
        assert_eq!(out.iter().map(|p| p.sequence).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(out[0].interpolated);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_multi_gap_interpolates_linearly() {
        let mut buf = buffer();
        buf.set_properties(props(1));
        let t0 = Instant::now();
        buf.add_packet(packet(0, 0, t0, &[0]));
        buf.get_ready_packets_at(t0);

        buf.add_packet(packet(4, 1920, t0, &[4000]));
        let out = buf.get_ready_packets_at(t0 + Duration::from_millis(30));
        let values: Vec<i32> = out.iter().map(|p| sample(&p.payload, 0)).collect();
        assert_eq!(values, vec![1000, 2000, 3000, 4000]);
        assert_eq!(out[1].timestamp, 960);
    }

    #[test]
    fn test_large_gap_skipped_and_counted() {
        let mut buf = buffer();
        buf.set_properties(props(1));
        let t0 = Instant::now();
        buf.add_packet(packet(0, 0, t0, &[0]));
        buf.get_ready_packets_at(t0);

        buf.add_packet(packet(10, 4800, t0, &[100]));
        let out = buf.get_ready_packets_at(t0 + Duration::from_millis(30));
        assert_eq!(out.len(), 1);
        assert_eq!(buf.stats().lost, 9);
    }

    #[test]
    fn test_gap_without_properties_not_interpolated() {
        let mut buf = buffer();
        let t0 = Instant::now();
        buf.add_packet(packet(0, 0, t0, &[0]));
        buf.get_ready_packets_at(t0);
        buf.add_packet(packet(2, 960, t0, &[0]));
        let out = buf.get_ready_packets_at(t0 + Duration::from_millis(30));
        assert_eq!(out.len(), 1);
        assert_eq!(buf.stats().lost, 1);
    }

    #[test]
    fn test_duplicates_and_late_rejected() {
        let mut buf = buffer();
        let t0 = Instant::now();
        assert!(buf.add_packet(packet(5, 0, t0, &[0])));
        assert!(!buf.add_packet(packet(5, 0, t0, &[0])));
        buf.get_ready_packets_at(t0);
        assert!(!buf.add_packet(packet(5, 0, t0, &[0])));
        assert!(!buf.add_packet(packet(3, 0, t0, &[0])));

        let stats = buf.stats();
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.late, 2);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut buf = RtpReorderingBuffer::new(&ReorderConfig {
            max_packets: 3,
            reorder_deadline_ms: 1000,
            max_interpolated_packets: 0,
        });
        let t0 = Instant::now();
        buf.add_packet(packet(0, 0, t0, &[0]));
        buf.get_ready_packets_at(t0);
        for seq in [2, 3, 4, 5] {
            buf.add_packet(packet(seq, 0, t0, &[0]));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.stats().overflow, 1);
    }

    #[test]
    fn test_sequence_wrap_is_contiguous() {
        let mut buf = buffer();
        buf.set_properties(props(1));
        let t0 = Instant::now();
        let start = u32::MAX - 959;
        for (i, seq) in [65534u16, 65535, 0, 1].into_iter().enumerate() {
            buf.add_packet(packet(seq, start.wrapping_add(i as u32 * 480), t0, &[0]));
        }
        let out = buf.get_ready_packets_at(t0);
        assert_eq!(out.iter().map(|p| p.sequence).collect::<Vec<_>>(), vec![65534, 65535, 0, 1]);
        assert_eq!(buf.stats().interpolated, 0);
        assert_eq!(buf.stats().lost, 0);
    }

    #[test]
    fn test_gap_across_wrap_interpolates_timestamp() {
        let mut buf = buffer();
        buf.set_properties(props(1));
        let t0 = Instant::now();
        buf.add_packet(packet(65535, u32::MAX - 479, t0, &[1000]));
        buf.get_ready_packets_at(t0);
        buf.add_packet(packet(1, 480, t0, &[3000]));
        let out = buf.get_ready_packets_at(t0 + Duration::from_millis(25));
        assert_eq!(out[0].sequence, 0);
        assert_eq!(out[0].timestamp, 0);
        assert_eq!(sample(&out[0].payload, 0), 2000);
    }
}
