//! Packet type shared by the ingest stages

use std::time::Instant;

/// One arrived (or synthesized) audio packet
///
/// The transport layer has already extracted sequence, timestamp and
/// payload; the core never parses wire framing.
#[derive(Debug, Clone, PartialEq)]
pub struct RtpPacketData {
    /// RTP sequence number (wraps at 16 bits)
    pub sequence: u16,
    /// Stream sample timestamp (wraps at 32 bits)
    pub timestamp: u32,
    /// Local time the packet was received (or synthesized)
    pub received_at: Instant,
    /// Raw payload bytes in the stream's format
    pub payload: Vec<u8>,
    /// Set when the payload was synthesized to fill a gap
    pub interpolated: bool,
}

impl RtpPacketData {
    pub fn new(sequence: u16, timestamp: u32, received_at: Instant, payload: Vec<u8>) -> Self {
        Self {
            sequence,
            timestamp,
            received_at,
            payload,
            interpolated: false,
        }
    }
}
