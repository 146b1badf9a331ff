//! Lock-in amplifier measurement task.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::time::sleep;

use super::{Task, TaskContext};
use crate::instrument::LockInSr830;

/// Which demodulated quantity to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockInMode {
    X,
    Y,
    XAndY,
    Amplitude,
    Phase,
    AmplitudeAndPhase,
}

/// Read the demodulated output of a lock-in amplifier.
///
/// The paired modes use a single snapshot query so both values come from
/// the same instant.
pub struct LockInMeasureTask {
    pub name: String,
    pub driver: LockInSr830,
    pub mode: LockInMode,
    /// Settling time before the measurement.
    pub waiting_time: Duration,
}

#[async_trait]
impl Task for LockInMeasureTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn perform(&mut self, ctx: &TaskContext) -> Result<()> {
        sleep(self.waiting_time).await;

        let db = &ctx.database;
        match self.mode {
            LockInMode::X => {
                let x = self.driver.read_x().await.context("reading X")?;
                db.write_entry(&self.name, "x", x).await;
            }
            LockInMode::Y => {
                let y = self.driver.read_y().await.context("reading Y")?;
                db.write_entry(&self.name, "y", y).await;
            }
            LockInMode::XAndY => {
                let (x, y) = self.driver.read_xy().await.context("reading X and Y")?;
                db.write_entry(&self.name, "x", x).await;
                db.write_entry(&self.name, "y", y).await;
            }
            LockInMode::Amplitude => {
                let r = self
                    .driver
                    .read_amplitude()
                    .await
                    .context("reading the amplitude")?;
                db.write_entry(&self.name, "amplitude", r).await;
            }
            LockInMode::Phase => {
                let theta = self.driver.read_phase().await.context("reading the phase")?;
                db.write_entry(&self.name, "phase", theta).await;
            }
            LockInMode::AmplitudeAndPhase => {
                let (r, theta) = self
                    .driver
                    .read_amp_and_phase()
                    .await
                    .context("reading amplitude and phase")?;
                db.write_entry(&self.name, "amplitude", r).await;
                db.write_entry(&self.name, "phase", theta).await;
            }
        }
        Ok(())
    }
}
