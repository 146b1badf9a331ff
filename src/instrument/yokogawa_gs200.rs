//! Yokogawa GS200 DC source.

use std::sync::Arc;

use crate::error::{InstrResult, InstrumentError};
use crate::instrument::cache::{PropertyCache, PropertyValue};
use crate::instrument::session::InstrumentSession;
use crate::transport::Transport;

/// Output range of the GS200 in voltage mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoltageRange {
    Mv10,
    Mv100,
    V1,
    V10,
    V30,
}

impl VoltageRange {
    fn code(self) -> &'static str {
        match self {
            VoltageRange::Mv10 => "10E-3",
            VoltageRange::Mv100 => "100E-3",
            VoltageRange::V1 => "1E+0",
            VoltageRange::V10 => "10E+0",
            VoltageRange::V30 => "30E+0",
        }
    }

    fn from_code(code: &str) -> InstrResult<Self> {
        match code {
            "10E-3" => Ok(VoltageRange::Mv10),
            "100E-3" => Ok(VoltageRange::Mv100),
            "1E+0" => Ok(VoltageRange::V1),
            "10E+0" => Ok(VoltageRange::V10),
            "30E+0" => Ok(VoltageRange::V30),
            other => Err(InstrumentError::ParseReply {
                command: ":SOURce:RANGe?".to_string(),
                reply: other.to_string(),
            }),
        }
    }
}

/// Source function, voltage or current.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceFunction {
    Voltage,
    Current,
}

impl SourceFunction {
    fn code(self) -> &'static str {
        match self {
            SourceFunction::Voltage => "VOLT",
            SourceFunction::Current => "CURR",
        }
    }
}

/// DC voltage/current source driver.
#[derive(Clone)]
pub struct YokogawaGs200 {
    session: Arc<InstrumentSession>,
}

impl YokogawaGs200 {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let cache = PropertyCache::new(["function"]);
        Self {
            session: Arc::new(InstrumentSession::new(transport, cache)),
        }
    }

    pub fn session(&self) -> &InstrumentSession {
        &self.session
    }

    /// Open the connection and clear the status registers.
    pub async fn open(&self) -> InstrResult<()> {
        self.session.open().await?;
        self.session.write("*CLS").await
    }

    pub async fn close(&self) -> InstrResult<()> {
        self.session.close().await
    }

    /// Output level in volts. Does not check the active function.
    pub async fn voltage(&self) -> InstrResult<f64> {
        self.session.query_f64("SOURce:LEVel?").await
    }

    /// Set the output level, confirmed by readback. The tolerance absorbs
    /// the floating point rounding of the instrument's reply.
    pub async fn set_voltage(&self, set_point: f64) -> InstrResult<()> {
        self.session
            .set_and_confirm_f64(
                "voltage",
                &format!(":SOURce:LEVel {set_point}"),
                "SOURce:LEVel?",
                set_point,
                1e-9,
            )
            .await
    }

    /// Voltage reading guarded by the active function.
    pub async fn read_voltage_dc(&self) -> InstrResult<f64> {
        if self.function().await? != SourceFunction::Voltage {
            return Err(InstrumentError::InvalidValue {
                property: "voltage".to_string(),
                reason: "cannot read the voltage while in current mode".to_string(),
            });
        }
        self.voltage().await
    }

    pub async fn voltage_range(&self) -> InstrResult<VoltageRange> {
        let reply = self.session.query(":SOURce:RANGe?").await?;
        VoltageRange::from_code(reply.trim())
    }

    pub async fn set_voltage_range(&self, range: VoltageRange) -> InstrResult<()> {
        self.session
            .set_and_confirm_str(
                "voltage_range",
                &format!(":SOURce:RANGe {}", range.code()),
                ":SOURce:RANGe?",
                range.code(),
            )
            .await
    }

    /// Current source level in amps. Shares the level command with voltage
    /// mode, the instrument interprets it per the active function.
    pub async fn current(&self) -> InstrResult<f64> {
        self.session.query_f64("SOURce:LEVel?").await
    }

    pub async fn set_current(&self, set_point: f64) -> InstrResult<()> {
        self.session
            .set_and_confirm_f64(
                "current",
                &format!(":SOURce:LEVel {set_point}"),
                "SOURce:LEVel?",
                set_point,
                1e-9,
            )
            .await
    }

    /// Active source function, served from the cache when possible.
    pub async fn function(&self) -> InstrResult<SourceFunction> {
        let session = Arc::clone(&self.session);
        let value = self
            .session
            .cached_get("function", move || async move {
                let reply = session.query("SOURce:FUNCtion?").await?;
                Ok(PropertyValue::Text(reply.trim().to_string()))
            })
            .await?;
        match value.as_text()? {
            "VOLT" => Ok(SourceFunction::Voltage),
            "CURR" => Ok(SourceFunction::Current),
            other => Err(InstrumentError::ParseReply {
                command: "SOURce:FUNCtion?".to_string(),
                reply: other.to_string(),
            }),
        }
    }

    /// Switch the source function. Only allowed with the output off and the
    /// level at zero, matching the front panel interlock.
    pub async fn set_function(&self, function: SourceFunction) -> InstrResult<()> {
        if self.voltage().await? != 0.0 || self.output().await? {
            return Err(InstrumentError::InvalidValue {
                property: "function".to_string(),
                reason: "function can only change with the output off and the level at zero"
                    .to_string(),
            });
        }
        let session = Arc::clone(&self.session);
        let code = function.code();
        self.session
            .cached_set("function", PropertyValue::Text(code.to_string()), move || {
                async move {
                    session
                        .set_and_confirm_str(
                            "function",
                            &format!(":SOURce:FUNCtion {code}"),
                            "SOURce:FUNCtion?",
                            code,
                        )
                        .await
                }
            })
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[tokio::test]
    async fn open_clears_status() {
        let mock = Arc::new(MockTransport::new());
        let source = YokogawaGs200::new(mock.clone());
        source.open().await.unwrap();
        assert_eq!(mock.log(), vec!["*CLS"]);
    }

    #[tokio::test]
    async fn level_reads_and_readback_confirms_share_one_query() {
        let mock = Arc::new(MockTransport::new().with_reply("SOURce:LEVel?", "0.25"));
        let source = YokogawaGs200::new(mock.clone());

        assert_eq!(source.voltage().await.unwrap(), 0.25);
        source.set_voltage(0.25).await.unwrap();
        assert_eq!(source.current().await.unwrap(), 0.25);

        assert_eq!(mock.count_sent("SOURce:LEVel?"), 3);
    }

    #[tokio::test]
    async fn set_voltage_tolerates_readback_rounding() {
        let mock = Arc::new(MockTransport::new().with_reply("SOURce:LEVel?", "0.1000000005"));
        let source = YokogawaGs200::new(mock.clone());
        source.set_voltage(0.1).await.unwrap();
        assert_eq!(mock.count_sent(":SOURce:LEVel 0.1"), 1);
    }

    #[tokio::test]
    async fn set_voltage_rejects_bad_readback() {
        let mock = Arc::new(MockTransport::new().with_reply("SOURce:LEVel?", "0.2"));
        let source = YokogawaGs200::new(mock);
        let err = source.set_voltage(0.1).await.unwrap_err();
        assert!(matches!(err, InstrumentError::ReadbackMismatch { .. }));
    }

    #[tokio::test]
    async fn voltage_range_round_trips_codes() {
        let mock = Arc::new(MockTransport::new().with_reply(":SOURce:RANGe?", "10E-3"));
        let source = YokogawaGs200::new(mock.clone());
        assert_eq!(source.voltage_range().await.unwrap(), VoltageRange::Mv10);

        source.set_voltage_range(VoltageRange::Mv10).await.unwrap();
        assert_eq!(mock.count_sent(":SOURce:RANGe 10E-3"), 1);
    }

    #[tokio::test]
    async fn function_is_cached() {
        let mock = Arc::new(MockTransport::new().with_reply("SOURce:FUNCtion?", "VOLT"));
        let source = YokogawaGs200::new(mock.clone());
        assert_eq!(
            source.function().await.unwrap(),
            SourceFunction::Voltage
        );
        assert_eq!(
            source.function().await.unwrap(),
            SourceFunction::Voltage
        );
        assert_eq!(mock.count_sent("SOURce:FUNCtion?"), 1);
    }

    #[tokio::test]
    async fn read_voltage_dc_requires_voltage_mode() {
        let mock = Arc::new(
            MockTransport::new()
                .with_reply("SOURce:FUNCtion?", "CURR")
                .with_reply("SOURce:LEVel?", "0.0"),
        );
        let source = YokogawaGs200::new(mock);
        assert!(matches!(
            source.read_voltage_dc().await,
            Err(InstrumentError::InvalidValue { .. })
        ));
    }

    #[tokio::test]
    async fn function_change_requires_idle_output() {
        let mock = Arc::new(
            MockTransport::new()
                .with_reply("SOURce:LEVel?", "0.5")
                .with_reply(":OUTPUT?", "0"),
        );
        let source = YokogawaGs200::new(mock);
        assert!(source
            .set_function(SourceFunction::Current)
            .await
            .is_err());
    }
}
