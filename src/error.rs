//! Error types for the settings core

use thiserror::Error;

use crate::types::FieldValue;

/// Settings subsystem errors.
///
/// `UnknownKey` and `DuplicateBinding` are wiring bugs and abort startup;
/// `OutOfBounds` is a per-call rejection that leaves the durable value
/// intact; `StoreUnavailable` is fatal at startup only.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("unknown setting key: {0}")]
    UnknownKey(String),

    #[error("setting key already bound: {0}")]
    DuplicateBinding(String),

    #[error("value {value} out of bounds [{min}, {max}] for {key}")]
    OutOfBounds {
        key: String,
        value: FieldValue,
        min: f64,
        max: f64,
    },

    #[error("settings store unavailable: {0}")]
    StoreUnavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type SettingsResult<T> = Result<T, SettingsError>;
