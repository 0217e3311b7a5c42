//! Stream repair, clock recovery and cross-sink synchronization

pub mod global_clock;
pub mod rate_controller;
pub mod reorder_buffer;
pub mod sequence;
pub mod stream_clock;

pub use global_clock::{GlobalSynchronizationClock, SinkTimingReport, SyncStats};
pub use rate_controller::{
    BufferMetricsSource, InputBufferMetrics, RateCommandCallback, RateControlWorker,
    SinkRateController, SourceBufferMetrics,
};
pub use reorder_buffer::{ReorderStats, RtpReorderingBuffer};
pub use stream_clock::{ClockEstimate, StreamClock, StreamClockMap};
