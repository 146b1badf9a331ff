//! Pulse sequence description and compilation.

pub mod awg_context;

pub use awg_context::{Awg5014Context, CompileReport, SequenceInfos};

/// Time unit used by pulse start/duration values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeUnit {
    S,
    Ms,
    Mus,
    Ns,
}

impl TimeUnit {
    /// Factor converting a value in this unit to seconds.
    pub fn to_seconds(self) -> f64 {
        match self {
            TimeUnit::S => 1.0,
            TimeUnit::Ms => 1e-3,
            TimeUnit::Mus => 1e-6,
            TimeUnit::Ns => 1e-9,
        }
    }
}

/// Sampled content of a single pulse.
#[derive(Clone, Debug, PartialEq)]
pub enum Waveform {
    /// Normalized analog samples in [-1, 1].
    Analog(Vec<f64>),
    /// Marker samples, 0 or 1.
    Logic(Vec<u8>),
}

impl Waveform {
    pub fn len(&self) -> usize {
        match self {
            Waveform::Analog(samples) => samples.len(),
            Waveform::Logic(samples) => samples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Waveform::Analog(_) => "Analogical",
            Waveform::Logic(_) => "Logical",
        }
    }
}

/// One timed pulse routed to a named channel.
///
/// Channel names are `Ch<n>_A` for the analog output and `Ch<n>_M1` /
/// `Ch<n>_M2` for the marker outputs of channel `n`.
#[derive(Clone, Debug)]
pub struct Pulse {
    /// Position of the pulse in the sequence, used in error reports.
    pub index: usize,
    /// Target channel name.
    pub channel: String,
    /// Start time, in the context's time unit.
    pub start: f64,
    /// Duration, in the context's time unit.
    pub duration: f64,
    /// Sampled waveform. Its length sets the pulse's sample span.
    pub waveform: Waveform,
}
