//! Cryomagnetics CS4 superconducting magnet power supply.
//!
//! All field values are in tesla, rates in T/min. The supply itself works
//! in amps, so a field-to-current ratio for the attached magnet must be
//! configured before the driver can convert rates.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::time::sleep;

use crate::config::InstrumentSettings;
use crate::error::{InstrResult, InstrumentError};
use crate::instrument::cache::{PropertyCache, PropertyValue};
use crate::instrument::job::InstrJob;
use crate::instrument::session::{parse_f64, InstrumentSession};
use crate::transport::Transport;

/// Typical output fluctuations of the supply, in tesla.
pub const OUTPUT_FLUCTUATIONS: f64 = 2e-4;

/// Switch heater state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaterState {
    On,
    Off,
}

/// Power supply activity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activity {
    ToSetPoint,
    Hold,
}

/// Magnet power supply driver.
#[derive(Clone)]
pub struct CryomagneticsCs4 {
    session: Arc<InstrumentSession>,
    field_current_ratio: f64,
    output_fluctuations: f64,
}

impl CryomagneticsCs4 {
    /// Build the driver from the instrument settings.
    ///
    /// Fails when the settings carry no field-to-current ratio for the
    /// attached magnet; without it the sweep rates cannot be converted and
    /// the switch heater current cannot be trusted.
    pub fn from_settings(
        transport: Arc<dyn Transport>,
        settings: &InstrumentSettings,
    ) -> InstrResult<Self> {
        let ratio = settings.require_magnet_conversion()?;
        Ok(Self::new(
            transport,
            ratio,
            settings.output_fluctuations.unwrap_or(OUTPUT_FLUCTUATIONS),
        ))
    }

    pub fn new(
        transport: Arc<dyn Transport>,
        field_current_ratio: f64,
        output_fluctuations: f64,
    ) -> Self {
        let cache = PropertyCache::new(["heater_state", "target_field", "sweep_rate_field"]);
        Self {
            session: Arc::new(InstrumentSession::new(transport, cache)),
            field_current_ratio,
            output_fluctuations,
        }
    }

    pub fn session(&self) -> &InstrumentSession {
        &self.session
    }

    /// Band within which the output field counts as on target, in T.
    pub fn output_fluctuations(&self) -> f64 {
        self.output_fluctuations
    }

    /// Open the connection and set up units, range and lower limit.
    pub async fn open(&self) -> InstrResult<()> {
        self.session.open().await?;
        self.session.write("UNITS T").await?;
        // This supply requires the trailing ; on RANGE.
        self.session.write("RANGE 0 100;").await?;
        // Sweeps only ever go to the upper limit, but the upper limit may
        // not sit below the lower one. Park the lower limit at the bottom.
        self.session.write("LLIM -7").await
    }

    pub async fn close(&self) -> InstrResult<()> {
        self.session.close().await
    }

    /// Current value of the output field in T.
    pub async fn read_output_field(&self) -> InstrResult<f64> {
        let reply = self.session.query("IOUT?").await?;
        parse_field("IOUT?", &reply)
    }

    /// Current value of the persistent field in T.
    pub async fn read_persistent_field(&self) -> InstrResult<f64> {
        let reply = self.session.query("IMAG?").await?;
        parse_field("IMAG?", &reply)
    }

    /// Whether the output field sits within the fluctuation band of the
    /// target.
    pub async fn is_target_reached(&self) -> InstrResult<bool> {
        let output = self.read_output_field().await?;
        let target = self.target_field().await?;
        Ok((output - target).abs() < self.output_fluctuations)
    }

    /// Switch heater state, cached.
    pub async fn heater_state(&self) -> InstrResult<HeaterState> {
        let session = Arc::clone(&self.session);
        let value = self
            .session
            .cached_get("heater_state", move || async move {
                let reply = session.query("PSHTR?").await?;
                Ok(PropertyValue::Text(reply.trim().to_string()))
            })
            .await?;
        match value.as_text()? {
            "1" => Ok(HeaterState::On),
            "0" => Ok(HeaterState::Off),
            other => Err(InstrumentError::ParseReply {
                command: "PSHTR?".to_string(),
                reply: other.to_string(),
            }),
        }
    }

    /// Switch the heater and wait for the switch to react.
    pub async fn set_heater_state(&self, state: HeaterState) -> InstrResult<()> {
        let session = Arc::clone(&self.session);
        let (word, cached) = match state {
            HeaterState::On => ("On", "1"),
            HeaterState::Off => ("Off", "0"),
        };
        self.session
            .cached_set(
                "heater_state",
                PropertyValue::Text(cached.to_string()),
                move || async move {
                    session.write(&format!("PSHTR {word}")).await?;
                    sleep(Duration::from_secs(1)).await;
                    Ok(())
                },
            )
            .await
    }

    /// Rate at which the field ramps with the heater on, in T/min.
    pub async fn field_sweep_rate(&self) -> InstrResult<f64> {
        // The supply reports A/s.
        let rate = self.session.query_f64("RATE? 0").await?;
        Ok(rate * 60.0 * self.field_current_ratio)
    }

    pub async fn set_field_sweep_rate(&self, rate: f64) -> InstrResult<()> {
        let amps_per_sec = rate / (60.0 * self.field_current_ratio);
        self.session
            .write(&format!("RATE 0 {amps_per_sec}"))
            .await
    }

    /// Rate used when the switch heater is off, in T/min.
    pub async fn fast_sweep_rate(&self) -> InstrResult<f64> {
        let rate = self.session.query_f64("RATE? 3").await?;
        Ok(rate * 60.0 * self.field_current_ratio)
    }

    pub async fn set_fast_sweep_rate(&self, rate: f64) -> InstrResult<()> {
        let amps_per_sec = rate / (60.0 * self.field_current_ratio);
        self.session
            .write(&format!("RATE 3 {amps_per_sec}"))
            .await
    }

    /// Field the supply will sweep to, in T.
    pub async fn target_field(&self) -> InstrResult<f64> {
        let reply = self.session.query("ULIM?").await?;
        parse_field("ULIM?", &reply)
    }

    pub async fn set_target_field(&self, target: f64) -> InstrResult<()> {
        let session = Arc::clone(&self.session);
        self.session
            .cached_set(
                "target_field",
                PropertyValue::Float(target),
                move || async move { session.write(&format!("ULIM {target}")).await },
            )
            .await
    }

    /// Current activity of the supply.
    pub async fn activity(&self) -> InstrResult<String> {
        let reply = self.session.query("SWEEP?").await?;
        Ok(reply.trim().to_string())
    }

    /// Start or pause the sweep. Sweeping with the heater off uses the fast
    /// rate table.
    pub async fn set_activity(&self, activity: Activity) -> InstrResult<()> {
        let command = match activity {
            Activity::Hold => "SWEEP PAUSE".to_string(),
            Activity::ToSetPoint => {
                if self.heater_state().await? == HeaterState::Off {
                    "SWEEP UP FAST".to_string()
                } else {
                    "SWEEP UP SLOW".to_string()
                }
            }
        };
        self.session.write(&command).await
    }

    /// Ramp the output field to the persistent field, after which the
    /// switch heater can safely be turned on.
    pub async fn sweep_to_persistent_field(&self) -> InstrResult<InstrJob> {
        let persistent = self.read_persistent_field().await?;
        self.sweep_to_field(persistent, None).await
    }

    /// Ramp the output field to `value`, optionally setting the sweep rate
    /// first. Returns a job whose expected duration is derived from the
    /// field span and the applicable rate.
    pub async fn sweep_to_field(&self, value: f64, rate: Option<f64>) -> InstrResult<InstrJob> {
        if let Some(rate) = rate {
            self.set_field_sweep_rate(rate).await?;
        }
        let rate = if self.heater_state().await? == HeaterState::On {
            self.field_sweep_rate().await?
        } else {
            self.fast_sweep_rate().await?
        };

        self.set_target_field(value).await?;
        self.set_activity(Activity::ToSetPoint).await?;

        let span = (self.read_output_field().await? - value).abs();
        let wait = Duration::from_secs_f64(60.0 * span / rate);
        debug!("sweeping to {value} T, expected duration {wait:?}");

        let checker = self.clone();
        let canceller = self.clone();
        Ok(InstrJob::new(
            Box::new(move || {
                let driver = checker.clone();
                Box::pin(async move { driver.is_target_reached().await })
            }),
            wait,
        )
        .with_cancel(Box::new(move || {
            Box::pin(async move { canceller.stop_sweep().await })
        })))
    }

    /// Stop the field sweep at the current value.
    pub async fn stop_sweep(&self) -> InstrResult<()> {
        self.set_activity(Activity::Hold).await
    }
}

/// Parse a field reply of the form `1.234 T`.
fn parse_field(command: &str, reply: &str) -> InstrResult<f64> {
    parse_f64(command, reply.trim().trim_end_matches(" T"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn driver(mock: &Arc<MockTransport>) -> CryomagneticsCs4 {
        CryomagneticsCs4::new(mock.clone(), 0.1, OUTPUT_FLUCTUATIONS)
    }

    #[tokio::test]
    async fn open_programs_units_range_and_lower_limit() {
        let mock = Arc::new(MockTransport::new());
        driver(&mock).open().await.unwrap();
        assert_eq!(mock.log(), vec!["UNITS T", "RANGE 0 100;", "LLIM -7"]);
    }

    #[tokio::test]
    async fn field_readings_strip_the_unit_suffix() {
        let mock = Arc::new(
            MockTransport::new()
                .with_reply("IOUT?", "1.2534 T")
                .with_reply("IMAG?", "-0.75 T"),
        );
        let supply = driver(&mock);
        assert_eq!(supply.read_output_field().await.unwrap(), 1.2534);
        assert_eq!(supply.read_persistent_field().await.unwrap(), -0.75);
    }

    #[tokio::test]
    async fn sweep_rates_convert_between_amps_and_tesla() {
        let mock = Arc::new(MockTransport::new().with_reply("RATE? 0", "0.01"));
        let supply = driver(&mock);

        // 0.01 A/s * 60 s/min * 0.1 T/A.
        assert_eq!(supply.field_sweep_rate().await.unwrap(), 0.06);

        supply.set_field_sweep_rate(0.06).await.unwrap();
        assert_eq!(mock.count_sent("RATE 0 0.01"), 1);
    }

    #[tokio::test]
    async fn sweep_direction_depends_on_heater_state() {
        let mock = Arc::new(MockTransport::new().with_reply("PSHTR?", "0"));
        let supply = driver(&mock);
        supply.set_activity(Activity::ToSetPoint).await.unwrap();
        assert_eq!(mock.count_sent("SWEEP UP FAST"), 1);

        supply.session().cache().invalidate(None);
        mock.set_reply("PSHTR?", "1");
        supply.set_activity(Activity::ToSetPoint).await.unwrap();
        assert_eq!(mock.count_sent("SWEEP UP SLOW"), 1);

        supply.set_activity(Activity::Hold).await.unwrap();
        assert_eq!(mock.count_sent("SWEEP PAUSE"), 1);
    }

    #[tokio::test]
    async fn target_field_writes_are_short_circuited() {
        let mock = Arc::new(MockTransport::new());
        let supply = driver(&mock);
        supply.set_target_field(2.0).await.unwrap();
        supply.set_target_field(2.0).await.unwrap();
        assert_eq!(mock.count_sent("ULIM 2"), 1);
    }

    #[tokio::test]
    async fn sweep_to_field_builds_a_cancellable_job() {
        let mock = Arc::new(
            MockTransport::new()
                .with_reply("PSHTR?", "1")
                .with_reply("RATE? 0", "0.01")
                .with_reply("IOUT?", "0.0 T")
                .with_reply("ULIM?", "0.6 T"),
        );
        let supply = driver(&mock);

        let job = supply.sweep_to_field(0.6, None).await.unwrap();
        // span 0.6 T at 0.06 T/min is a ten minute ramp.
        assert_eq!(job.expected_waiting_time(), Duration::from_secs(600));
        assert!(job.is_cancellable());
        assert_eq!(mock.count_sent("ULIM 0.6"), 1);
        assert_eq!(mock.count_sent("SWEEP UP SLOW"), 1);

        job.cancel().await.unwrap();
        assert_eq!(mock.count_sent("SWEEP PAUSE"), 1);
    }

    #[tokio::test]
    async fn completed_sweep_reports_target_reached() {
        let mock = Arc::new(
            MockTransport::new()
                .with_reply("IOUT?", "0.59995 T")
                .with_reply("ULIM?", "0.6 T"),
        );
        let supply = driver(&mock);
        assert!(supply.is_target_reached().await.unwrap());
    }

    #[tokio::test]
    async fn missing_magnet_conversion_is_a_configuration_error() {
        let settings = InstrumentSettings {
            resource: "GPIB0::4::INSTR".to_string(),
            ..InstrumentSettings::default()
        };
        let mock: Arc<MockTransport> = Arc::new(MockTransport::new());
        assert!(matches!(
            CryomagneticsCs4::from_settings(mock, &settings),
            Err(InstrumentError::Configuration(_))
        ));
    }
}
