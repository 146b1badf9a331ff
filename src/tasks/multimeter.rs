//! Multimeter measurement tasks.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::time::sleep;

use super::{Task, TaskContext};
use crate::instrument::KeithleyDmm6500;

/// Measure a DC voltage.
pub struct MeasDcVoltageTask {
    pub name: String,
    pub driver: KeithleyDmm6500,
    /// Settling time before the measurement.
    pub wait_time: Duration,
}

#[async_trait]
impl Task for MeasDcVoltageTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn perform(&mut self, ctx: &TaskContext) -> Result<()> {
        sleep(self.wait_time).await;
        let value = self
            .driver
            .read_voltage_dc()
            .await
            .context("measuring the DC voltage")?;
        ctx.database.write_entry(&self.name, "voltage", value).await;
        Ok(())
    }
}

/// Measure a resistance, two or four wire.
pub struct MeasResistanceTask {
    pub name: String,
    pub driver: KeithleyDmm6500,
    pub four_wire: bool,
    pub wait_time: Duration,
}

#[async_trait]
impl Task for MeasResistanceTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn perform(&mut self, ctx: &TaskContext) -> Result<()> {
        sleep(self.wait_time).await;
        let value = if self.four_wire {
            self.driver
                .read_four_wire_resistance()
                .await
                .context("measuring the four wire resistance")?
        } else {
            self.driver
                .read_two_wire_resistance()
                .await
                .context("measuring the two wire resistance")?
        };
        ctx.database
            .write_entry(&self.name, "resistance", value)
            .await;
        Ok(())
    }
}
