//! Error types for tierkv
//!
//! Provides a unified error type for all operations. A missing key is not an
//! error: lookups return `Option`.

use thiserror::Error;

use crate::config::CrashPoint;

/// Result type alias using TierError
pub type Result<T> = std::result::Result<T, TierError>;

/// Unified error type for tierkv operations
#[derive(Debug, Error)]
pub enum TierError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Durable Layout Errors
    // -------------------------------------------------------------------------
    #[error("Durable state corruption detected: {0}")]
    Corruption(String),

    #[error("Layout mismatch: {0}")]
    LayoutMismatch(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // -------------------------------------------------------------------------
    // Input Errors
    // -------------------------------------------------------------------------
    #[error("Key too long: {len} bytes (max {max})")]
    KeyTooLong { len: usize, max: usize },

    #[error("Value too long: {len} bytes (max {max})")]
    ValueTooLong { len: usize, max: usize },

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Capacity Errors (fatal: the engine stops accepting writes)
    // -------------------------------------------------------------------------
    #[error("Capacity exhausted: {resource}")]
    CapacityExhausted { resource: &'static str },

    #[error("Too many threads joined (max {max})")]
    TooManyThreads { max: usize },

    // -------------------------------------------------------------------------
    // Engine State Errors
    // -------------------------------------------------------------------------
    #[error("Simulated crash at {0:?}")]
    SimulatedCrash(CrashPoint),

    #[error("Engine has failed and no longer accepts writes")]
    EngineFailed,

    #[error("Checkpoint worker panicked: {0}")]
    WorkerPanicked(String),
}

impl TierError {
    /// Whether this error leaves the engine unusable for further writes
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TierError::CapacityExhausted { .. }
                | TierError::SimulatedCrash(_)
                | TierError::Corruption(_)
                | TierError::WorkerPanicked(_)
                | TierError::Io(_)
        )
    }
}
