//! Digitizer boards driven through a native library.

pub mod alazar935x;
pub mod api;
pub mod board;
pub mod mock;

pub use alazar935x::Alazar935x;
pub use api::{AlazarApi, API_SUCCESS};
pub use board::BoardHandle;
pub use mock::MockAlazarApi;
