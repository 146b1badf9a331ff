//! Keithley DMM6500 digital multimeter.
//!
//! The `MEAS?` reply is a comma separated record of reading, timestamp,
//! reading count and channel, and the reading carries a unit suffix such as
//! `NVDC` or `NOHM4W` that must be stripped before parsing.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{InstrResult, InstrumentError};
use crate::instrument::cache::{PropertyCache, PropertyValue};
use crate::instrument::session::InstrumentSession;
use crate::transport::Transport;

static READING_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"[A-Za-z][A-Za-z0-9]*$").unwrap()
});

/// Measurement function selectable on the front end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeterFunction {
    VoltageDc,
    VoltageAc,
    CurrentDc,
    CurrentAc,
    TwoWireResistance,
    FourWireResistance,
}

impl MeterFunction {
    fn sense_code(self) -> &'static str {
        match self {
            MeterFunction::VoltageDc => "VOLT:DC",
            MeterFunction::VoltageAc => "VOLT:AC",
            MeterFunction::CurrentDc => "CURR:DC",
            MeterFunction::CurrentAc => "CURR:AC",
            MeterFunction::TwoWireResistance => "RES",
            MeterFunction::FourWireResistance => "FRES",
        }
    }
}

/// Digital multimeter driver.
#[derive(Clone)]
pub struct KeithleyDmm6500 {
    session: Arc<InstrumentSession>,
}

impl KeithleyDmm6500 {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let cache = PropertyCache::new(["function"]);
        Self {
            session: Arc::new(InstrumentSession::new(transport, cache)),
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

    /// Active measurement function, served from the cache when possible.
    /// The instrument quotes the function name in its reply.
    pub async fn function(&self) -> InstrResult<String> {
        let session = Arc::clone(&self.session);
        let value = self
            .session
            .cached_get("function", move || async move {
                let reply = session.query("FUNCtion?").await?;
                Ok(PropertyValue::Text(
                    reply.trim().trim_matches('"').to_string(),
                ))
            })
            .await?;
        Ok(value.as_text()?.to_string())
    }

    /// Select the measurement function, confirmed by readback (ignoring the
    /// quotes and the case of the reply).
    pub async fn set_function(&self, function: &str) -> InstrResult<()> {
        let session = Arc::clone(&self.session);
        let requested = function.to_string();
        self.session
            .cached_set(
                "function",
                PropertyValue::Text(function.to_uppercase()),
                move || async move {
                    let transport = Arc::clone(session.transport());
                    let requested = requested.clone();
                    session
                        .secured(move || {
                            let transport = Arc::clone(&transport);
                            let requested = requested.clone();
                            async move {
                                transport
                                    .write(&format!("FUNCtion \"{requested}\""))
                                    .await?;
                                let reply = transport.query("FUNCtion?").await?;
                                let reported = reply.trim().trim_matches('"');
                                if !reported.eq_ignore_ascii_case(&requested) {
                                    return Err(InstrumentError::ReadbackMismatch {
                                        property: "function".to_string(),
                                        requested,
                                        reported: reported.to_string(),
                                    });
                                }
                                Ok(())
                            }
                        })
                        .await
                },
            )
            .await
    }

    pub async fn read_voltage_dc(&self) -> InstrResult<f64> {
        self.measure(MeterFunction::VoltageDc).await
    }

    pub async fn read_voltage_ac(&self) -> InstrResult<f64> {
        self.measure(MeterFunction::VoltageAc).await
    }

    pub async fn read_current_dc(&self) -> InstrResult<f64> {
        self.measure(MeterFunction::CurrentDc).await
    }

    pub async fn read_current_ac(&self) -> InstrResult<f64> {
        self.measure(MeterFunction::CurrentAc).await
    }

    pub async fn read_two_wire_resistance(&self) -> InstrResult<f64> {
        self.measure(MeterFunction::TwoWireResistance).await
    }

    pub async fn read_four_wire_resistance(&self) -> InstrResult<f64> {
        self.measure(MeterFunction::FourWireResistance).await
    }

    /// Select the sense function and take an immediate reading.
    async fn measure(&self, function: MeterFunction) -> InstrResult<f64> {
        let transport = Arc::clone(self.session.transport());
        let sense = function.sense_code();
        self.session
            .secured(move || {
                let transport = Arc::clone(&transport);
                async move {
                    transport
                        .write(&format!("SENS:FUNC \"{sense}\""))
                        .await?;
                    let reply = transport.query("MEAS?").await?;
                    parse_reading(&reply)
                }
            })
            .await
    }
}

/// Extract the numeric value from a `MEAS?` record.
fn parse_reading(reply: &str) -> InstrResult<f64> {
    let raw = reply.split(',').next().unwrap_or("").trim();
    let stripped = READING_SUFFIX.replace(raw, "");
    stripped
        .parse()
        .map_err(|_| InstrumentError::ParseReply {
            command: "MEAS?".to_string(),
            reply: reply.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[test]
    fn reading_suffix_is_stripped() {
        assert_eq!(
            parse_reading("-1.042e-3NVDC,+86400.5,+1,+1").unwrap(),
            -1.042e-3
        );
        assert_eq!(parse_reading("+4.7e+3NOHM4W,+1.0,+1,+1").unwrap(), 4.7e3);
        assert_eq!(parse_reading("2.5e-6NAAC").unwrap(), 2.5e-6);
        assert!(parse_reading("").is_err());
        assert!(parse_reading("garbage").is_err());
    }

    #[tokio::test]
    async fn measure_selects_the_sense_function_first() {
        let mock = Arc::new(MockTransport::new().with_reply("MEAS?", "+1.5e0NVDC,+1.0,+1,+1"));
        let meter = KeithleyDmm6500::new(mock.clone());

        assert_eq!(meter.read_voltage_dc().await.unwrap(), 1.5);
        assert_eq!(mock.log(), vec!["SENS:FUNC \"VOLT:DC\"", "MEAS?"]);
    }

    #[tokio::test]
    async fn resistance_readings_use_their_own_functions() {
        let mock = Arc::new(MockTransport::new().with_reply("MEAS?", "+100.0NOHM,+1.0,+1,+1"));
        let meter = KeithleyDmm6500::new(mock.clone());

        assert_eq!(meter.read_two_wire_resistance().await.unwrap(), 100.0);
        assert_eq!(mock.count_sent("SENS:FUNC \"RES\""), 1);
    }

    #[tokio::test]
    async fn function_readback_ignores_quoting_and_case() {
        let mock = Arc::new(MockTransport::new().with_reply("FUNCtion?", "\"VOLT:DC\""));
        let meter = KeithleyDmm6500::new(mock.clone());

        meter.set_function("volt:dc").await.unwrap();
        assert_eq!(mock.count_sent("FUNCtion \"volt:dc\""), 1);
        assert_eq!(meter.function().await.unwrap(), "VOLT:DC");
        // Served from the cache after the confirmed set.
        assert_eq!(mock.count_sent("FUNCtion?"), 1);
    }
}
