//! Arbitrary waveform generator sequence task.

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::info;

use super::{Task, TaskContext};
use crate::instrument::Awg5014;
use crate::pulses::{Awg5014Context, Pulse};

/// Compile a pulse sequence and load it on an AWG.
///
/// Without a driver this is a dry run: the sequence is compiled and
/// validated but nothing is sent to the instrument, which lets a runner
/// reject a bad sequence before the measurement starts.
pub struct RunAwgSequenceTask {
    pub name: String,
    pub context: Awg5014Context,
    pub pulses: Vec<Pulse>,
    /// Total sequence duration in the context's time unit. `None` ends the
    /// sequence with the last pulse.
    pub duration: Option<f64>,
    pub driver: Option<Awg5014>,
}

#[async_trait]
impl Task for RunAwgSequenceTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, _ctx: &TaskContext) -> Result<()> {
        let report = self
            .context
            .compile_and_transfer(&self.pulses, self.duration, None)
            .await?;
        if !report.success {
            bail!("sequence does not compile: {}", format_errors(&report.errors));
        }
        Ok(())
    }

    async fn perform(&mut self, ctx: &TaskContext) -> Result<()> {
        let report = self
            .context
            .compile_and_transfer(&self.pulses, self.duration, self.driver.as_ref())
            .await?;

        if !report.success {
            bail!("sequence compilation failed: {}", format_errors(&report.errors));
        }

        let db = &ctx.database;
        if let Some(infos) = &report.infos {
            db.write_entry(&self.name, "sampling_frequency", infos.sampling_frequency)
                .await;
            let names: serde_json::Map<String, serde_json::Value> = infos
                .sequence_names
                .iter()
                .map(|(ch, name)| (ch.to_string(), name.clone().into()))
                .collect();
            db.write_entry(&self.name, "sequence_names", names).await;
        }
        let running = self.driver.is_some() && self.context.run_after_transfer;
        db.write_entry(&self.name, "output", u8::from(running)).await;
        info!(task = %self.name, running, "sequence loaded");
        Ok(())
    }
}

fn format_errors(errors: &std::collections::BTreeMap<String, String>) -> String {
    errors
        .iter()
        .map(|(key, message)| format!("{key}: {message}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pulses::{TimeUnit, Waveform};

    fn square_pulse(channel: &str) -> Pulse {
        Pulse {
            index: 0,
            channel: channel.to_string(),
            start: 0.0,
            duration: 0.01,
            waveform: Waveform::Analog(vec![0.5; 10]),
        }
    }

    fn context() -> Awg5014Context {
        Awg5014Context {
            sequence_name: "seq".to_string(),
            time_unit: TimeUnit::Mus,
            ..Awg5014Context::default()
        }
    }

    #[tokio::test]
    async fn dry_run_writes_the_sequence_infos() {
        let mut task = RunAwgSequenceTask {
            name: "awg".into(),
            context: context(),
            pulses: vec![square_pulse("Ch1_A")],
            duration: None,
            driver: None,
        };
        let ctx = TaskContext::new();

        task.perform(&ctx).await.unwrap();

        assert_eq!(
            ctx.database
                .read_f64("awg/sampling_frequency")
                .await
                .unwrap(),
            1e9
        );
        assert_eq!(
            ctx.database.read("awg/sequence_names").await.unwrap(),
            serde_json::json!({"1": "seq_Ch1"})
        );
        // Nothing ran, there is no driver.
        assert_eq!(ctx.database.read_f64("awg/output").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn compile_errors_fail_the_task() {
        let mut task = RunAwgSequenceTask {
            name: "awg".into(),
            context: context(),
            pulses: vec![square_pulse("Ch9_A")],
            duration: None,
            driver: None,
        };
        let ctx = TaskContext::new();

        let err = task.perform(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("Channel issue"));
        assert!(ctx.database.read("awg/sequence_names").await.is_none());
    }
}
