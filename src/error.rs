//! Custom error types for the instrument layer.
//!
//! This module defines the primary error type, `InstrumentError`, for the
//! entire crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different failure modes of laboratory
//! hardware control.
//!
//! ## Error classes
//!
//! The variants fall in two classes with different propagation policies:
//!
//! - **Communication errors** (`Io`, `NotConnected`, `ParseReply`,
//!   `ReadbackMismatch`, `LockTimeout`): a message was lost, garbled or
//!   never answered. These are the errors the retry layer intercepts: it
//!   reopens the connection and resends the command a bounded number of
//!   times before giving up. [`InstrumentError::is_comm_error`] identifies
//!   this class.
//! - **Semantic errors** (everything else): invalid values handed to a
//!   setter, unsupported operations, configuration problems, digitizer
//!   return codes. Retrying cannot fix these, so they propagate directly to
//!   the caller which reports them and stops or skips the run.

use thiserror::Error;

/// Convenience alias for results using the instrument error type.
pub type InstrResult<T> = std::result::Result<T, InstrumentError>;

#[derive(Error, Debug)]
pub enum InstrumentError {
    #[error("Communication error: {0}")]
    Io(String),

    #[error("Instrument is not connected")]
    NotConnected,

    #[error("Could not interpret reply {reply:?} to command {command:?}")]
    ParseReply { command: String, reply: String },

    #[error(
        "Instrument did not set {property} correctly: requested {requested}, reports {reported}"
    )]
    ReadbackMismatch {
        property: String,
        requested: String,
        reported: String,
    },

    #[error("Timed out trying to acquire the shared connection lock")]
    LockTimeout,

    #[error("Invalid value for {property}: {reason}")]
    InvalidValue { property: String, reason: String },

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Feature '{0}' is not enabled. Rebuild with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Digitizer call {call} failed with code {code}: {text}")]
    Board { call: String, code: u32, text: String },

    #[error("I/O error: {0}")]
    StdIo(#[from] std::io::Error),
}

impl InstrumentError {
    /// Whether this error belongs to the communication class intercepted by
    /// the retry layer (reopen the connection and resend).
    pub fn is_comm_error(&self) -> bool {
        matches!(
            self,
            InstrumentError::Io(_)
                | InstrumentError::NotConnected
                | InstrumentError::ParseReply { .. }
                | InstrumentError::ReadbackMismatch { .. }
                | InstrumentError::LockTimeout
                | InstrumentError::StdIo(_)
        )
    }
}
