//! Hardware transports and the retry policy.
//!
//! A [`Transport`] is the capability interface every driver depends on:
//! open/close/reopen the connection, write a command, query a reply, push a
//! binary block. Concrete implementations live in submodules
//! ([`visa::VisaTransport`], [`mock::MockTransport`]); drivers receive an
//! `Arc<dyn Transport>` and never know which one they talk to.

pub mod mock;
pub mod retry;
pub mod visa;

use async_trait::async_trait;

use crate::error::{InstrResult, InstrumentError};

pub use mock::MockTransport;
pub use retry::RetryPolicy;
pub use visa::VisaTransport;

/// Capability interface for a command/response instrument connection.
///
/// All methods take `&self`: implementations own their session behind
/// interior mutability so that one transport can be shared by a driver and
/// its channel sub-objects.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection to the instrument.
    async fn open(&self) -> InstrResult<()>;

    /// Close the connection established previously using `open`.
    async fn close(&self) -> InstrResult<()>;

    /// Reopen a connection whose state is suspect (for example the last
    /// message sent did not go through), keeping the same parameters.
    async fn reopen(&self) -> InstrResult<()>;

    /// Whether commands can currently be sent to the instrument.
    async fn is_connected(&self) -> bool;

    /// Send a command, no reply expected.
    async fn write(&self, command: &str) -> InstrResult<()>;

    /// Send a command and read back one line, trimmed of terminators.
    async fn query(&self, command: &str) -> InstrResult<String>;

    /// Send a command header immediately followed by a raw binary block.
    async fn write_binary(&self, _header: &str, _data: &[u8]) -> InstrResult<()> {
        Err(InstrumentError::Unsupported(
            "binary transfers are not supported by this transport".to_string(),
        ))
    }

    /// Resource identifier, for log messages.
    fn resource(&self) -> &str;
}
