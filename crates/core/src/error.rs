//! Error types for the router core
//!
//! Hot-path stages never surface these to the caller: they log and degrade
//! (drop the chunk, fall back to the automatic mix, use a safe default).
//! Constructors and configuration loading return them.

use thiserror::Error;

/// Result type alias for router core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the router core
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration value out of range or inconsistent
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    /// TOML configuration could not be parsed
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Explicit mix matrix does not cover the active channel layout
    #[error("Invalid mix matrix: need at least {expected_rows}x{expected_cols}, got {rows}x{cols}")]
    InvalidMixMatrix {
        /// Input channels the matrix must cover
        expected_rows: usize,
        /// Output channels the matrix must cover
        expected_cols: usize,
        /// Rows supplied
        rows: usize,
        /// Shortest row supplied
        cols: usize,
    },

    /// Stream format the pipeline cannot decode
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Sample-rate converter construction or processing failure
    #[error("Resampler error: {0}")]
    Resampler(String),

    /// Scratch buffer growth failed
    #[error("Allocation failed: {0}")]
    Allocation(#[from] std::collections::TryReserveError),
}
