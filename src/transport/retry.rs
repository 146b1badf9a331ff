//! Bounded reopen-and-retry for communication errors.
//!
//! A communication error cannot simply be resolved by sending the message
//! again on a connection whose state is suspect. [`RetryPolicy::run`] wraps
//! an operation so that each communication failure first reopens the
//! connection, then resends, up to a fixed number of retries. This is a
//! local, synchronous retry: no backoff, no jitter.

use std::future::Future;

use log::{info, warn};

use crate::error::InstrResult;

/// Retry policy for instrument communication.
///
/// `max_retries` is the number of *additional* attempts after the first one,
/// so the default of 2 yields at most 3 attempts in total.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 2 }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Run `op`, reopening the connection via `reopen` and retrying when it
    /// fails with a communication error.
    ///
    /// Only errors for which [`InstrumentError::is_comm_error`] holds are
    /// retried; semantic errors propagate immediately. Once the retry budget
    /// is exhausted the last error is returned. A failure of `reopen` itself
    /// aborts the cycle.
    pub async fn run<T, Op, OpFut, Re, ReFut>(&self, mut op: Op, mut reopen: Re) -> InstrResult<T>
    where
        Op: FnMut() -> OpFut,
        OpFut: Future<Output = InstrResult<T>>,
        Re: FnMut() -> ReFut,
        ReFut: Future<Output = InstrResult<()>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_comm_error() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "communication attempt {attempt}/{} failed: {err}; reopening connection",
                        self.max_retries
                    );
                    reopen().await?;
                    info!("connection reopened, resending");
                }
                Err(err) => return Err(err),
            }
        }
    }
}
