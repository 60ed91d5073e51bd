//! Error types for the Fluxgate engine.

use thiserror::Error;

/// Main error type for Fluxgate operations.
#[derive(Error, Debug)]
pub enum FluxgateError {
    /// Configuration errors (bad policy expression, non-positive numeric
    /// parameter). Rejected before taking effect; prior state is untouched.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Snapshot format errors (unrecognized magic or version marker).
    #[error("Snapshot format error: {0}")]
    Format(String),

    /// Snapshot corruption errors (payload does not decode, or declared
    /// structure does not match the engine it is restored into).
    #[error("Snapshot corrupted: {0}")]
    Corruption(String),

    /// Should-never-happen state corruption, surfaced rather than masked.
    #[error("Internal invariant violated: {0}")]
    Internal(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Fluxgate operations.
pub type Result<T> = std::result::Result<T, FluxgateError>;
