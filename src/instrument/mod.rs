//! Instrument drivers and the shared session/cache/job layer.
//!
//! Drivers are thin: each method formats an ASCII command, sends it through
//! the shared [`session::InstrumentSession`] and parses the reply. Setters
//! read the value back and fail on mismatch. Everything transport-level
//! (retries, reconnection, caching) lives in the session.

pub mod cache;
pub mod job;
pub mod session;

pub mod agilent_psg;
pub mod cryomagnetics_cs4;
pub mod keithley_dmm6500;
pub mod lakeshore_tc340;
pub mod lock_in_sr830;
pub mod tektro_awg;
pub mod yokogawa_gs200;

pub use cache::{PropertyCache, PropertyValue};
pub use job::{InstrJob, JobOutcome};
pub use session::InstrumentSession;

pub use agilent_psg::{AgilentPsg, FrequencyUnit};
pub use cryomagnetics_cs4::{Activity, CryomagneticsCs4, HeaterState};
pub use keithley_dmm6500::KeithleyDmm6500;
pub use lakeshore_tc340::{ControlLoop, LakeshoreTc340, PidSettings, SensorInput};
pub use lock_in_sr830::{LockInSr830, Sr830Bus};
pub use tektro_awg::{Awg5014, AwgChannel, RunState};
pub use yokogawa_gs200::{SourceFunction, VoltageRange, YokogawaGs200};
