//! Temperature controller tasks.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::time::sleep;
use tracing::debug;

use super::{DynValue, Task, TaskContext};
use crate::instrument::{ControlLoop, LakeshoreTc340, SensorInput};

/// Program a heater setpoint and range on a temperature controller.
pub struct SetTemperatureTask {
    pub name: String,
    pub driver: LakeshoreTc340,
    /// Target temperature in the loop's setpoint units.
    pub setpoint: DynValue,
    pub control_loop: ControlLoop,
    /// Heater range to select, 0 meaning off.
    pub heater_range: u8,
}

#[async_trait]
impl Task for SetTemperatureTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn perform(&mut self, ctx: &TaskContext) -> Result<()> {
        let setpoint = self.setpoint.resolve(&ctx.database).await?;
        self.driver
            .set_setpoint(self.control_loop, setpoint)
            .await
            .context("programming the setpoint")?;
        self.driver
            .set_heater_range(self.heater_range)
            .await
            .context("selecting the heater range")?;
        debug!(task = %self.name, setpoint, range = self.heater_range, "setpoint programmed");

        ctx.database
            .write_entry(&self.name, "setpoint", setpoint)
            .await;
        Ok(())
    }
}

/// Read the temperature of a sensor input.
pub struct MeasTemperatureTask {
    pub name: String,
    pub driver: LakeshoreTc340,
    pub input: SensorInput,
    /// Settling time before the measurement.
    pub wait_time: Duration,
}

#[async_trait]
impl Task for MeasTemperatureTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn perform(&mut self, ctx: &TaskContext) -> Result<()> {
        sleep(self.wait_time).await;
        let value = self
            .driver
            .measure_temperature(self.input)
            .await
            .context("reading the temperature")?;
        ctx.database
            .write_entry(&self.name, "temperature", value)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use std::sync::Arc;

    #[tokio::test]
    async fn setpoint_and_range_are_programmed() {
        let mock = Arc::new(MockTransport::new());
        let ctx = TaskContext::new();

        let mut task = SetTemperatureTask {
            name: "cryostat".into(),
            driver: LakeshoreTc340::new(mock.clone()),
            setpoint: DynValue::Literal(4.2),
            control_loop: ControlLoop::One,
            heater_range: 3,
        };
        task.perform(&ctx).await.unwrap();

        assert_eq!(mock.log(), vec!["SETP 1,4.2", "RANGE 3"]);
        assert_eq!(ctx.database.read_f64("cryostat/setpoint").await.unwrap(), 4.2);
    }

    #[tokio::test]
    async fn temperature_reading_lands_in_the_database() {
        let mock = Arc::new(
            MockTransport::new()
                .with_reply("RDGST? B", "0")
                .with_reply("KRDG? B", "+77.36"),
        );
        let ctx = TaskContext::new();

        let mut task = MeasTemperatureTask {
            name: "cryostat".into(),
            driver: LakeshoreTc340::new(mock.clone()),
            input: SensorInput::B,
            wait_time: Duration::ZERO,
        };
        task.perform(&ctx).await.unwrap();

        assert_eq!(
            ctx.database.read_f64("cryostat/temperature").await.unwrap(),
            77.36
        );
    }

    #[tokio::test]
    async fn sensor_fault_surfaces_as_an_error() {
        let mock = Arc::new(MockTransport::new().with_reply("RDGST? A", "16"));
        let ctx = TaskContext::new();

        let mut task = MeasTemperatureTask {
            name: "cryostat".into(),
            driver: LakeshoreTc340::new(mock.clone()),
            input: SensorInput::A,
            wait_time: Duration::ZERO,
        };
        let err = task.perform(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("reading the temperature"));
        assert!(ctx.database.read("cryostat/temperature").await.is_none());
    }
}
