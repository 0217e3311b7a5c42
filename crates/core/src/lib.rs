//! Multiroom Core - real-time engine of a multi-room audio router
//!
//! Takes audio from independently clocked network sources and keeps many
//! output sinks playing it in sample-accurate sync:
//! - Stream format auto-detection (`probe`)
//! - Packet reordering with gap interpolation, per-stream clock recovery,
//!   per-sink rate control and the cross-sink dispatch barrier (`sync`)
//! - Per-stream DSP: scale, volume, resample, channel mix, equalizer (`dsp`)
//! - Per-source pipelines (`ingest`) feeding per-sink mixers (`sink`)
//!
//! The transport, control plane and output devices live outside this crate.

#![warn(clippy::all)]

pub mod audio;
pub mod config;
pub mod dsp;
pub mod ingest;
pub mod probe;
pub mod sink;
pub mod sync;

mod error;
pub use error::{Error, Result};

pub use audio::{ByteOrder, Codec, RtpPacketData, StreamProperties, MAX_CHANNELS};
pub use config::CoreConfig;
pub use dsp::{AudioProcessor, ProcessorControls};
pub use ingest::{ProcessedBlock, SourcePipeline};
pub use probe::AudioFormatProbe;
pub use sink::SinkMixer;
pub use sync::{
    GlobalSynchronizationClock, RateControlWorker, RtpReorderingBuffer, SinkRateController, StreamClock,
    StreamClockMap,
};

/// Initialize logging for the router core
///
/// Installs a `tracing` fmt subscriber filtered by `RUST_LOG` (default
/// `info`). Does nothing if a global subscriber is already set.
pub fn init() -> Result<()> {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("Multiroom core initialized");
    }
    Ok(())
}
