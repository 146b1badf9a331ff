//! Configuration loading for instrument connections.
//!
//! Instruments are declared in a TOML file, one table per instrument id:
//!
//! ```toml
//! [instruments.magnet]
//! resource = "GPIB0::4::INSTR"
//! timeout = "3s"
//! magnet_conversion = 0.044
//!
//! [instruments.rf_source]
//! resource = "TCPIP0::192.168.1.20::INSTR"
//! ```
//!
//! Values can be overridden from the environment with the `LAB_INSTR`
//! prefix (e.g. `LAB_INSTR__INSTRUMENTS__MAGNET__RESOURCE`).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{InstrResult, InstrumentError};

/// Top-level settings: one [`InstrumentSettings`] entry per instrument id.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub instruments: HashMap<String, InstrumentSettings>,
}

/// Connection parameters for a single instrument.
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentSettings {
    /// VISA resource string (e.g. "GPIB0::1::INSTR", "TCPIP0::10.0.0.5::INSTR").
    pub resource: String,

    /// Read/write timeout.
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,

    /// Line terminator appended to outgoing commands.
    #[serde(default = "default_terminator")]
    pub write_termination: String,

    /// Line terminator expected on replies.
    #[serde(default = "default_terminator")]
    pub read_termination: String,

    /// Whether property caching is allowed for this instrument.
    #[serde(default = "default_true")]
    pub caching: bool,

    /// Field/current conversion ratio for magnet power supplies (T/A).
    #[serde(default)]
    pub magnet_conversion: Option<f64>,

    /// Typical output fluctuations of a magnet supply, used to decide when a
    /// field target has been reached (T).
    #[serde(default)]
    pub output_fluctuations: Option<f64>,
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_terminator() -> String {
    "\n".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        Self {
            resource: String::new(),
            timeout: default_timeout(),
            write_termination: default_terminator(),
            read_termination: default_terminator(),
            caching: true,
            magnet_conversion: None,
            output_fluctuations: None,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, with environment overrides.
    pub fn load(path: &Path) -> InstrResult<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("LAB_INSTR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    /// Fetch the settings for one instrument id.
    pub fn instrument(&self, id: &str) -> InstrResult<&InstrumentSettings> {
        self.instruments.get(id).ok_or_else(|| {
            InstrumentError::Configuration(format!("no instrument named '{id}' in settings"))
        })
    }
}

impl InstrumentSettings {
    /// The magnet field/current conversion ratio, required by magnet drivers.
    pub fn require_magnet_conversion(&self) -> InstrResult<f64> {
        self.magnet_conversion.ok_or_else(|| {
            InstrumentError::Configuration(
                "the field to current ratio of the magnet must be specified in the \
                 instrument settings (magnet_conversion)"
                    .to_string(),
            )
        })
    }
}
