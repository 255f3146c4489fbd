//! Error types.

use thiserror::Error;

/// Error type for engine operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Pool exhausted: {0}")]
    PoolExhausted(&'static str),

    #[error("Invalid id: stale or never issued")]
    InvalidId,

    #[error("No region found for key {key} velocity {velocity}")]
    RegionNotFound { key: u8, velocity: u8 },

    #[error("No disk stream slot available")]
    StreamUnavailable,

    #[error("Audio device mismatch: {0}")]
    AudioDeviceMismatch(String),

    #[error("Script runtime error: {0}")]
    ScriptRuntime(String),

    #[error("Key group conflict in group {0}")]
    KeyGroupConflict(u32),

    #[error("Engine is busy: {0}")]
    EngineBusy(&'static str),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
