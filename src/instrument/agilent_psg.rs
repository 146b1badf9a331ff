//! Agilent/Keysight PSG signal generator.

use std::sync::Arc;

use crate::error::{InstrResult, InstrumentError};
use crate::instrument::cache::PropertyCache;
use crate::instrument::session::{parse_f64, InstrumentSession};
use crate::transport::Transport;

/// Unit used when programming the output frequency.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrequencyUnit {
    Ghz,
    Mhz,
    Khz,
    Hz,
}

impl FrequencyUnit {
    pub fn suffix(self) -> &'static str {
        match self {
            FrequencyUnit::Ghz => "GHz",
            FrequencyUnit::Mhz => "MHz",
            FrequencyUnit::Khz => "KHz",
            FrequencyUnit::Hz => "Hz",
        }
    }

    /// Factor converting a value in this unit to Hz.
    pub fn to_hz(self) -> f64 {
        match self {
            FrequencyUnit::Ghz => 1e9,
            FrequencyUnit::Mhz => 1e6,
            FrequencyUnit::Khz => 1e3,
            FrequencyUnit::Hz => 1.0,
        }
    }
}

/// CW signal generator driver.
#[derive(Clone)]
pub struct AgilentPsg {
    session: Arc<InstrumentSession>,
}

impl AgilentPsg {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            session: Arc::new(InstrumentSession::new(transport, PropertyCache::disabled())),
        }
    }

    pub fn session(&self) -> &InstrumentSession {
        &self.session
    }

    pub async fn open(&self) -> InstrResult<()> {
        self.session.open().await
    }

    pub async fn close(&self) -> InstrResult<()> {
        self.session.close().await
    }

    /// Fixed output frequency in Hz.
    pub async fn frequency(&self) -> InstrResult<f64> {
        self.session.query_f64(":FREQuency:FIXed?").await
    }

    /// Program the fixed frequency in the given unit. The instrument always
    /// reports back in Hz, so the readback is scaled before comparison.
    pub async fn set_frequency(&self, value: f64, unit: FrequencyUnit) -> InstrResult<()> {
        let transport = Arc::clone(self.session.transport());
        self.session
            .secured(move || {
                let transport = Arc::clone(&transport);
                async move {
                    transport
                        .write(&format!(":FREQuency:FIXed {}{}", value, unit.suffix()))
                        .await?;
                    let reply = transport.query(":FREQuency:FIXed?").await?;
                    let reported = parse_f64(":FREQuency:FIXed?", &reply)? / unit.to_hz();
                    if (reported - value).abs() > 1e-12 {
                        return Err(InstrumentError::ReadbackMismatch {
                            property: "frequency".to_string(),
                            requested: format!("{}{}", value, unit.suffix()),
                            reported: reply.trim().to_string(),
                        });
                    }
                    Ok(())
                }
            })
            .await
    }

    /// Fixed output power in dBm.
    pub async fn power(&self) -> InstrResult<f64> {
        self.session.query_f64(":POWER?").await
    }

    pub async fn set_power(&self, value: f64) -> InstrResult<()> {
        self.session
            .set_and_confirm_f64(
                "power",
                &format!(":POWER {value}DBM"),
                "POWER?",
                value,
                1e-12,
            )
            .await
    }

    pub async fn output(&self) -> InstrResult<bool> {
        let reply = self.session.query(":OUTPUT?").await?;
        match reply.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(InstrumentError::ParseReply {
                command: ":OUTPUT?".to_string(),
                reply: other.to_string(),
            }),
        }
    }

    pub async fn set_output(&self, on: bool) -> InstrResult<()> {
        let (cmd, expected) = if on {
            (":OUTPUT ON", "1")
        } else {
            (":OUTPUT OFF", "0")
        };
        self.session
            .set_and_confirm_str("output", cmd, ":OUTPUT?", expected)
            .await
    }
}
