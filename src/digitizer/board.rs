//! Shared handle around the native digitizer library.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::sleep;
use std::time::Duration;

use crate::digitizer::api::{AlazarApi, API_SUCCESS};
use crate::error::{InstrResult, InstrumentError};

const LOCK_ATTEMPTS: u32 = 50;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One digitizer board, serializing access to the underlying library.
///
/// The library keeps per-board state (record size, pending DMA buffers), so
/// every call sequence belonging to one acquisition must hold the lock.
pub struct BoardHandle {
    api: Arc<dyn AlazarApi>,
    lock: Mutex<()>,
    retry_delay: Duration,
}

impl BoardHandle {
    pub fn new(api: Arc<dyn AlazarApi>) -> Self {
        Self {
            api,
            lock: Mutex::new(()),
            retry_delay: LOCK_RETRY_DELAY,
        }
    }

    /// Override the lock polling interval.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn api(&self) -> &dyn AlazarApi {
        self.api.as_ref()
    }

    /// Acquire the board lock by bounded polling.
    pub fn secure(&self) -> InstrResult<MutexGuard<'_, ()>> {
        for _ in 0..LOCK_ATTEMPTS {
            match self.lock.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(std::sync::TryLockError::Poisoned(poisoned)) => {
                    return Ok(poisoned.into_inner())
                }
                Err(std::sync::TryLockError::WouldBlock) => sleep(self.retry_delay),
            }
        }
        Err(InstrumentError::LockTimeout)
    }

    /// Turn an API status code into a result, translating failures through
    /// the library's error text call.
    pub fn check(&self, call: &'static str, code: u32) -> InstrResult<()> {
        if code == API_SUCCESS {
            Ok(())
        } else {
            Err(InstrumentError::Board {
                call: call.to_string(),
                code,
                text: self.api.error_text(code),
            })
        }
    }
}
