//! Stanford Research SR830 lock-in amplifier.

use std::sync::Arc;

use crate::error::{InstrResult, InstrumentError};
use crate::instrument::cache::PropertyCache;
use crate::instrument::session::{parse_f64, InstrumentSession};
use crate::transport::Transport;

/// Interface the lock-in listens on for its reply routing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sr830Bus {
    Gpib,
    Rs232,
}

/// Lock-in amplifier driver.
///
/// All readings are direct, without settling: querying faster than the
/// integration time returns correlated values.
#[derive(Clone)]
pub struct LockInSr830 {
    session: Arc<InstrumentSession>,
}

impl LockInSr830 {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            session: Arc::new(InstrumentSession::new(transport, PropertyCache::disabled())),
        }
    }

    pub fn session(&self) -> &InstrumentSession {
        &self.session
    }

    /// Open the connection and route replies to the caller's bus.
    pub async fn open(&self, bus: Sr830Bus) -> InstrResult<()> {
        self.session.open().await?;
        let cmd = match bus {
            Sr830Bus::Gpib => "OUTX1",
            Sr830Bus::Rs232 => "OUTX0",
        };
        self.session.write(cmd).await
    }

    pub async fn close(&self) -> InstrResult<()> {
        self.session.close().await
    }

    /// X quadrature in volts.
    pub async fn read_x(&self) -> InstrResult<f64> {
        self.session.query_f64("OUTP?1").await
    }

    /// Y quadrature in volts.
    pub async fn read_y(&self) -> InstrResult<f64> {
        self.session.query_f64("OUTP?2").await
    }

    /// Both quadratures from a single snapshot, so they belong to the same
    /// sampling instant.
    pub async fn read_xy(&self) -> InstrResult<(f64, f64)> {
        self.snap("SNAP?1,2").await
    }

    /// Signal amplitude R in volts.
    pub async fn read_amplitude(&self) -> InstrResult<f64> {
        self.session.query_f64("OUTP?3").await
    }

    /// Signal phase in degrees.
    pub async fn read_phase(&self) -> InstrResult<f64> {
        self.session.query_f64("OUTP?4").await
    }

    /// Amplitude and phase from a single snapshot.
    pub async fn read_amp_and_phase(&self) -> InstrResult<(f64, f64)> {
        self.snap("SNAP?3,4").await
    }

    async fn snap(&self, command: &str) -> InstrResult<(f64, f64)> {
        let reply = self.session.query(command).await?;
        let mut parts = reply.trim().split(',');
        match (parts.next(), parts.next()) {
            (Some(first), Some(second)) => {
                Ok((parse_f64(command, first)?, parse_f64(command, second)?))
            }
            _ => Err(InstrumentError::ParseReply {
                command: command.to_string(),
                reply,
            }),
        }
    }
}
