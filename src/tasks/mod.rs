//! Measurement tasks built on top of the instrument drivers.
//!
//! A task is one step of a measurement sequence: set a source value, wait
//! for a condition, read something back. Tasks communicate through a shared
//! [`Database`] keyed `task_name/entry`, so a later task can consume the
//! value an earlier one produced. The [`TaskContext`] carries the database
//! and the stop flag a runner flips to interrupt long operations.
//!
//! Drivers return the typed [`crate::error::InstrumentError`]; at this
//! layer errors are wrapped in `anyhow` with enough context to tell which
//! task failed and why.

pub mod awg;
pub mod dc;
pub mod lock_in;
pub mod magnet;
pub mod multimeter;
pub mod rf;
pub mod temperature;

pub use awg::RunAwgSequenceTask;
pub use dc::SetDcVoltageTask;
pub use lock_in::{LockInMeasureTask, LockInMode};
pub use magnet::ApplyMagFieldTask;
pub use multimeter::{MeasDcVoltageTask, MeasResistanceTask};
pub use rf::{SetRfFrequencyTask, SetRfOnOffTask, SetRfPowerTask};
pub use temperature::{MeasTemperatureTask, SetTemperatureTask};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

/// Shared key/value store the tasks of a run read from and write to.
///
/// Keys are namespaced `task_name/entry` so two tasks of the same kind can
/// coexist in a sequence.
#[derive(Clone, Default)]
pub struct Database {
    inner: Arc<RwLock<HashMap<String, serde_json::Value>>>,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `task_name/entry`.
    pub async fn write_entry(
        &self,
        task: &str,
        entry: &str,
        value: impl Into<serde_json::Value>,
    ) {
        let mut map = self.inner.write().await;
        map.insert(format!("{task}/{entry}"), value.into());
    }

    /// Read a raw value by its full `task_name/entry` key.
    pub async fn read(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.read().await.get(key).cloned()
    }

    /// Read a numeric value by its full key.
    pub async fn read_f64(&self, key: &str) -> Result<f64> {
        self.read(key)
            .await
            .ok_or_else(|| anyhow!("no database entry named {key:?}"))?
            .as_f64()
            .ok_or_else(|| anyhow!("database entry {key:?} is not a number"))
    }
}

/// A numeric task input: either a literal or a reference to a database
/// entry written by an earlier task, resolved when the task runs.
#[derive(Debug, Clone)]
pub enum DynValue {
    Literal(f64),
    Entry(String),
}

impl DynValue {
    pub async fn resolve(&self, database: &Database) -> Result<f64> {
        match self {
            DynValue::Literal(value) => Ok(*value),
            DynValue::Entry(key) => database.read_f64(key).await,
        }
    }
}

impl From<f64> for DynValue {
    fn from(value: f64) -> Self {
        DynValue::Literal(value)
    }
}

/// Everything a task needs beyond its own parameters.
#[derive(Clone)]
pub struct TaskContext {
    pub database: Database,
    pub should_stop: Arc<AtomicBool>,
}

impl TaskContext {
    pub fn new() -> Self {
        Self {
            database: Database::new(),
            should_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether the runner asked for the sequence to stop.
    pub fn stop_requested(&self) -> bool {
        self.should_stop.load(Ordering::Relaxed)
    }
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::new()
    }
}

/// One step of a measurement sequence.
#[async_trait]
pub trait Task: Send {
    /// Name under which this task writes its database entries.
    fn name(&self) -> &str;

    /// Static validation run before the sequence starts. Writes the default
    /// database entries so later tasks can resolve their references.
    async fn check(&self, _ctx: &TaskContext) -> Result<()> {
        Ok(())
    }

    /// Execute the task.
    async fn perform(&mut self, ctx: &TaskContext) -> Result<()>;
}
