//! Lakeshore 340 temperature controller.

use std::sync::Arc;

use crate::error::{InstrResult, InstrumentError};
use crate::instrument::cache::PropertyCache;
use crate::instrument::session::InstrumentSession;
use crate::transport::Transport;

/// Sensor input of the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SensorInput {
    A,
    B,
}

impl SensorInput {
    fn letter(self) -> char {
        match self {
            SensorInput::A => 'A',
            SensorInput::B => 'B',
        }
    }
}

/// Heater control loop, 1 or 2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlLoop {
    One,
    Two,
}

impl ControlLoop {
    fn number(self) -> u8 {
        match self {
            ControlLoop::One => 1,
            ControlLoop::Two => 2,
        }
    }
}

/// PID settings for manual control.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PidSettings {
    pub p: f64,
    pub i: f64,
    pub d: f64,
}

/// Temperature controller driver.
#[derive(Clone)]
pub struct LakeshoreTc340 {
    session: Arc<InstrumentSession>,
}

impl LakeshoreTc340 {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            session: Arc::new(InstrumentSession::new(transport, PropertyCache::disabled())),
        }
    }

    pub fn session(&self) -> &InstrumentSession {
        &self.session
    }

    pub async fn open(&self) -> InstrResult<()> {
        self.session.open().await
    }

    pub async fn close(&self) -> InstrResult<()> {
        self.session.close().await
    }

    /// Temperature of the selected input in kelvin.
    ///
    /// The reading status is checked first so that sensor faults surface as
    /// the same condition the front panel displays instead of a garbage
    /// kelvin value.
    pub async fn measure_temperature(&self, input: SensorInput) -> InstrResult<f64> {
        let status = self
            .session
            .query_f64(&format!("RDGST? {}", input.letter()))
            .await? as u32;
        if let Some(fault) = reading_fault(status) {
            return Err(InstrumentError::InvalidValue {
                property: format!("temperature input {}", input.letter()),
                reason: fault.to_string(),
            });
        }
        self.session
            .query_f64(&format!("KRDG? {}", input.letter()))
            .await
    }

    /// Program the heater setpoint of a loop, in the loop's setpoint units.
    pub async fn set_setpoint(&self, loop_id: ControlLoop, value: f64) -> InstrResult<()> {
        self.session
            .write(&format!("SETP {},{}", loop_id.number(), value))
            .await
    }

    /// Select the heater range, 0 meaning off.
    pub async fn set_heater_range(&self, range: u8) -> InstrResult<()> {
        if range > 5 {
            return Err(InstrumentError::InvalidValue {
                property: "heater_range".to_string(),
                reason: format!("range {range} is out of 0..=5"),
            });
        }
        self.session.write(&format!("RANGE {range}")).await
    }

    /// Switch a loop to automatic PID tuning, or to manual PID with the
    /// given coefficients.
    pub async fn set_pid(&self, pid: Option<PidSettings>) -> InstrResult<()> {
        match pid {
            None => self.session.write("CMODE 4").await,
            Some(PidSettings { p, i, d }) => {
                self.session.write("CMODE 1").await?;
                self.session.write(&format!("PID {p},{i},{d}")).await
            }
        }
    }

    /// Manual heater output percentage.
    pub async fn set_manual_output(&self, percent: f64) -> InstrResult<()> {
        self.session.write(&format!("MOUT {percent}")).await
    }

    /// Configure the control loop parameters: control channel, setpoint
    /// units, on/off, on/off on startup.
    pub async fn configure_control(&self, parameters: &str) -> InstrResult<()> {
        self.session.write(&format!("CSET {parameters}")).await
    }

    /// Configure the input: diode type, units, coefficient, excitation,
    /// range.
    pub async fn configure_input(&self, settings: &str) -> InstrResult<()> {
        self.session.write(&format!("INTYPE {settings}")).await
    }

    /// Select the diode curve for an input.
    pub async fn set_input_curve(&self, input: SensorInput, curve: u8) -> InstrResult<()> {
        self.session
            .write(&format!("INCRV {},{}", input.letter(), curve))
            .await
    }

    /// Whether the control loop is on.
    pub async fn is_loop_on(&self, loop_id: ControlLoop) -> InstrResult<bool> {
        let reply = self
            .session
            .query(&format!("CSET? {}", loop_id.number()))
            .await?;
        let fields: Vec<&str> = reply.trim().split(',').collect();
        match fields.get(2) {
            Some(&"1") => Ok(true),
            Some(&"0") => Ok(false),
            _ => Err(InstrumentError::ParseReply {
                command: format!("CSET? {}", loop_id.number()),
                reply,
            }),
        }
    }
}

/// Decode the RDGST? status bits into the fault the front panel shows.
fn reading_fault(status: u32) -> Option<&'static str> {
    if status == 0 {
        None
    } else if status & 128 != 0 {
        Some("S-OVER")
    } else if status & 64 != 0 {
        Some("S-ZERO")
    } else if status & 32 != 0 {
        Some("T-OVER")
    } else if status & 16 != 0 {
        Some("T-UNDER")
    } else if status & 1 != 0 {
        Some("invalid reading")
    } else {
        Some("old reading")
    }
}
