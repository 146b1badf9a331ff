//! Tasks driving a DC source.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::time::sleep;
use tracing::debug;

use super::{DynValue, Task, TaskContext};
use crate::instrument::{SourceFunction, YokogawaGs200};

/// Set a DC voltage, optionally ramping to it in bounded steps.
///
/// A zero `back_step` programs the target directly. A non-zero one limits
/// every output change to that step, waiting `delay` between steps, so the
/// device under test never sees a large jump.
pub struct SetDcVoltageTask {
    pub name: String,
    pub driver: YokogawaGs200,
    pub target_value: DynValue,
    /// Largest allowed step when changing the output. Zero disables ramping.
    pub back_step: f64,
    /// Largest allowed output value. Zero disables the check.
    pub safe_max: f64,
    /// Largest allowed distance from the current output. Zero disables the
    /// check.
    pub safe_delta: f64,
    /// Wait between ramp steps.
    pub delay: Duration,
}

#[async_trait]
impl Task for SetDcVoltageTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn perform(&mut self, ctx: &TaskContext) -> Result<()> {
        if self.driver.function().await? != SourceFunction::Voltage {
            bail!(
                "instrument assigned to task {} is not configured to output a voltage",
                self.name
            );
        }

        let current = self
            .driver
            .voltage()
            .await
            .context("reading the current output voltage")?;
        let target = self.target_value.resolve(&ctx.database).await?;

        if self.safe_delta > 0.0 && (current - target).abs() > self.safe_delta {
            bail!(
                "requested voltage {target} is too far from the current voltage {current}"
            );
        }
        if self.safe_max > 0.0 && target.abs() > self.safe_max {
            bail!("requested voltage {target} exceeds the safe max {}", self.safe_max);
        }

        if (current - target).abs() < 1e-12 {
            ctx.database.write_entry(&self.name, "voltage", target).await;
            return Ok(());
        }

        if self.back_step == 0.0 {
            self.driver.set_voltage(target).await?;
        } else {
            let step = self.back_step.copysign(target - current);
            let mut last = current;
            while (target - last).abs() > self.back_step {
                last += step;
                self.driver.set_voltage(last).await?;
                sleep(self.delay).await;
            }
            if (target - last).abs() > 1e-12 {
                self.driver.set_voltage(target).await?;
            }
            debug!(task = %self.name, from = current, to = target, "voltage ramp done");
        }

        ctx.database.write_entry(&self.name, "voltage", target).await;
        Ok(())
    }
}
