//! Tasks driving a microwave signal generator.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use super::{DynValue, Task, TaskContext};
use crate::instrument::{AgilentPsg, FrequencyUnit};

/// Set the frequency of the signal delivered by an RF source.
pub struct SetRfFrequencyTask {
    pub name: String,
    pub driver: AgilentPsg,
    /// Target frequency, expressed in `unit`.
    pub frequency: DynValue,
    pub unit: FrequencyUnit,
    /// Switch the output on before programming the frequency.
    pub auto_start: bool,
}

impl SetRfFrequencyTask {
    /// Express a frequency given in this task's unit in `unit`.
    pub fn convert(&self, frequency: f64, unit: FrequencyUnit) -> f64 {
        frequency * self.unit.to_hz() / unit.to_hz()
    }
}

#[async_trait]
impl Task for SetRfFrequencyTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, ctx: &TaskContext) -> Result<()> {
        ctx.database
            .write_entry(&self.name, "unit", self.unit.suffix())
            .await;
        Ok(())
    }

    async fn perform(&mut self, ctx: &TaskContext) -> Result<()> {
        if self.auto_start {
            self.driver
                .set_output(true)
                .await
                .context("starting the RF output")?;
        }

        let frequency = self.frequency.resolve(&ctx.database).await?;
        self.driver
            .set_frequency(frequency, self.unit)
            .await
            .with_context(|| format!("setting the frequency of {}", self.name))?;
        debug!(task = %self.name, frequency, unit = self.unit.suffix(), "frequency set");

        ctx.database
            .write_entry(&self.name, "frequency", frequency)
            .await;
        ctx.database
            .write_entry(&self.name, "unit", self.unit.suffix())
            .await;
        Ok(())
    }
}

/// Set the power of the signal delivered by an RF source.
pub struct SetRfPowerTask {
    pub name: String,
    pub driver: AgilentPsg,
    /// Target power in dBm.
    pub power: DynValue,
    pub auto_start: bool,
}

#[async_trait]
impl Task for SetRfPowerTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn perform(&mut self, ctx: &TaskContext) -> Result<()> {
        if self.auto_start {
            self.driver
                .set_output(true)
                .await
                .context("starting the RF output")?;
        }

        let power = self.power.resolve(&ctx.database).await?;
        self.driver
            .set_power(power)
            .await
            .with_context(|| format!("setting the power of {}", self.name))?;

        ctx.database.write_entry(&self.name, "power", power).await;
        Ok(())
    }
}

/// Switch the output of an RF source on or off.
pub struct SetRfOnOffTask {
    pub name: String,
    pub driver: AgilentPsg,
    pub switch: bool,
}

#[async_trait]
impl Task for SetRfOnOffTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn perform(&mut self, ctx: &TaskContext) -> Result<()> {
        self.driver
            .set_output(self.switch)
            .await
            .with_context(|| format!("switching the output of {}", self.name))?;
        ctx.database
            .write_entry(&self.name, "output", u8::from(self.switch))
            .await;
        Ok(())
    }
}
