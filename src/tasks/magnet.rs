//! Superconducting magnet field task.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{info, warn};

use super::{DynValue, Task, TaskContext};
use crate::instrument::{CryomagneticsCs4, HeaterState, JobOutcome};

/// Bring a superconducting magnet to a target field.
///
/// The supply output is first ramped to the persistent field so the switch
/// heater can be opened, then to the target. With `auto_stop_heater` the
/// heater is closed afterwards and the leads are ramped back to zero,
/// leaving the magnet in persistent mode. An interrupted ramp is cancelled,
/// the heater closed, and the field actually reached recorded.
pub struct ApplyMagFieldTask {
    pub name: String,
    pub driver: CryomagneticsCs4,
    /// Target field in T.
    pub field: DynValue,
    /// Sweep rate towards the target, in T/min.
    pub rate: f64,
    /// Close the switch heater once the target is reached.
    pub auto_stop_heater: bool,
    /// Time the switch needs to open or close after toggling the heater.
    pub post_switch_wait: Duration,
}

#[async_trait]
impl Task for ApplyMagFieldTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn perform(&mut self, ctx: &TaskContext) -> Result<()> {
        let target = self.field.resolve(&ctx.database).await?;
        let driver = &self.driver;

        let persistent = driver
            .read_persistent_field()
            .await
            .context("reading the persistent field")?;

        if (persistent - target).abs() > driver.output_fluctuations() {
            // Bring the leads to the trapped field before opening the
            // switch, otherwise opening it would quench the stored current.
            let mut job = driver.sweep_to_persistent_field().await?;
            let stop = Arc::clone(&ctx.should_stop);
            let outcome = job
                .wait_for_completion(
                    move || stop.load(Ordering::Relaxed),
                    Duration::from_secs(60),
                )
                .await?;
            if outcome != JobOutcome::Completed {
                bail!("ramp to the persistent field did not complete ({outcome:?})");
            }

            driver.set_heater_state(HeaterState::On).await?;
            sleep(self.post_switch_wait).await;

            let mut job = driver
                .sweep_to_field(target, Some(self.rate))
                .await?
                .with_refresh(Duration::from_secs(10));
            let stop = Arc::clone(&ctx.should_stop);
            let outcome = job
                .wait_for_completion(
                    move || stop.load(Ordering::Relaxed),
                    Duration::from_secs(60),
                )
                .await?;

            if outcome != JobOutcome::Completed {
                // Leave the magnet in a safe state: stop the ramp and trap
                // whatever field was reached.
                job.cancel().await?;
                driver.set_heater_state(HeaterState::Off).await?;
                sleep(self.post_switch_wait).await;
                let reached = driver.read_persistent_field().await?;
                ctx.database.write_entry(&self.name, "field", reached).await;
                warn!(task = %self.name, reached, "field ramp interrupted");
                bail!("field ramp interrupted, magnet left at {reached} T");
            }
        }

        if self.auto_stop_heater {
            driver.set_heater_state(HeaterState::Off).await?;
            sleep(self.post_switch_wait).await;

            let mut job = driver.sweep_to_field(0.0, None).await?;
            let stop = Arc::clone(&ctx.should_stop);
            job.wait_for_completion(
                move || stop.load(Ordering::Relaxed),
                Duration::from_secs(60),
            )
            .await?;
        }

        info!(task = %self.name, field = target, "field set");
        ctx.database.write_entry(&self.name, "field", target).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn task(mock: &Arc<MockTransport>, target: f64) -> ApplyMagFieldTask {
        ApplyMagFieldTask {
            name: "magnet".into(),
            driver: CryomagneticsCs4::new(mock.clone(), 0.1, 2e-4),
            field: DynValue::Literal(target),
            rate: 0.06,
            auto_stop_heater: false,
            post_switch_wait: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn field_already_on_target_skips_the_ramp() {
        let mock = Arc::new(MockTransport::new().with_reply("IMAG?", "1.0 T"));
        let ctx = TaskContext::new();

        task(&mock, 1.0).perform(&ctx).await.unwrap();

        assert_eq!(ctx.database.read_f64("magnet/field").await.unwrap(), 1.0);
        assert_eq!(mock.count_sent("PSHTR On"), 0);
        assert_eq!(mock.count_sent("PSHTR Off"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_request_aborts_before_the_heater_opens() {
        let mock = Arc::new(
            MockTransport::new()
                .with_reply("IMAG?", "1.0 T")
                .with_reply("IOUT?", "0.0 T")
                .with_reply("PSHTR?", "0")
                .with_reply("RATE? 3", "0.01"),
        );
        let ctx = TaskContext::new();
        ctx.should_stop.store(true, Ordering::Relaxed);

        let err = task(&mock, 2.0).perform(&ctx).await.unwrap_err();

        assert!(err.to_string().contains("did not complete"));
        assert_eq!(mock.count_sent("PSHTR On"), 0);
    }

    #[tracing_test::traced_test]
    #[tokio::test(start_paused = true)]
    async fn full_persistent_mode_cycle() {
        let mock = Arc::new(
            MockTransport::new()
                .with_reply("IMAG?", "0.0 T")
                .with_replies(
                    "IOUT?",
                    ["0.0 T", "0.0 T", "0.0 T", "1.0 T", "1.0 T", "0.0 T"],
                )
                .with_replies("ULIM?", ["0.0 T", "1.0 T", "0.0 T"])
                .with_reply("PSHTR?", "0")
                .with_reply("RATE? 0", "0.01")
                .with_reply("RATE? 3", "0.01"),
        );
        let ctx = TaskContext::new();

        let mut t = task(&mock, 1.0);
        t.auto_stop_heater = true;
        t.perform(&ctx).await.unwrap();

        let log = mock.log();
        let heater_on = log.iter().position(|c| c == "PSHTR On").unwrap();
        let ramp_up = log.iter().position(|c| c == "ULIM 1").unwrap();
        let heater_off = log.iter().position(|c| c == "PSHTR Off").unwrap();
        assert!(heater_on < ramp_up && ramp_up < heater_off);
        assert_eq!(mock.count_sent("SWEEP UP SLOW"), 1);
        assert_eq!(mock.count_sent("SWEEP UP FAST"), 2);
        assert_eq!(ctx.database.read_f64("magnet/field").await.unwrap(), 1.0);
        assert!(logs_contain("field set"));
    }
}
