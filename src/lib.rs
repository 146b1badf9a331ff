//! Instrument drivers and measurement tasks for laboratory automation.
//!
//! The crate is layered bottom up: [`transport`] carries ASCII commands and
//! binary blocks to the hardware and owns the retry policy, [`instrument`]
//! holds one driver per supported device plus the shared session, cache and
//! job machinery, [`pulses`] compiles pulse sequences into AWG sample
//! buffers, [`digitizer`] wraps the Alazar acquisition board, and [`tasks`]
//! composes drivers into the steps of a measurement sequence.

pub mod config;
pub mod digitizer;
pub mod error;
pub mod instrument;
pub mod pulses;
pub mod tasks;
pub mod transport;
