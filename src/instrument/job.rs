//! Handle for long-running instrument operations.
//!
//! Sweeping a magnet or settling a temperature controller takes minutes.
//! Drivers return an [`InstrJob`] instead of blocking: the caller decides
//! when and how long to wait, can interleave a stop check, and can cancel
//! the operation when the hardware supports it.

use std::time::Duration;

use futures::future::BoxFuture;
use log::debug;
use tokio::time::{sleep, Instant};

use crate::error::{InstrResult, InstrumentError};

/// Async predicate polled while waiting, true meaning "done".
pub type ConditionFn = Box<dyn FnMut() -> BoxFuture<'static, InstrResult<bool>> + Send>;

/// Callback interrupting the underlying operation on the instrument.
pub type CancelFn = Box<dyn FnOnce() -> BoxFuture<'static, InstrResult<()>> + Send>;

/// Outcome of [`InstrJob::wait_for_completion`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// The completion condition reported done.
    Completed,
    /// A break condition asked to stop waiting before completion.
    Interrupted,
    /// The condition never reported done within the allotted time.
    TimedOut,
}

/// A started instrument operation with an expected duration.
pub struct InstrJob {
    condition: ConditionFn,
    expected_waiting_time: Duration,
    refresh: Duration,
    cancel: Option<CancelFn>,
    started: Instant,
}

impl InstrJob {
    /// Job polling `condition` for completion, expected to take roughly
    /// `expected_waiting_time`.
    pub fn new(condition: ConditionFn, expected_waiting_time: Duration) -> Self {
        Self {
            condition,
            expected_waiting_time,
            refresh: Duration::from_secs(1),
            cancel: None,
            started: Instant::now(),
        }
    }

    /// Override the coarse-wait refresh interval (default 1 s).
    pub fn with_refresh(mut self, refresh: Duration) -> Self {
        self.refresh = refresh;
        self
    }

    /// Attach a cancellation callback.
    pub fn with_cancel(mut self, cancel: CancelFn) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// A job over an operation that is already done.
    pub fn completed() -> Self {
        Self::new(
            Box::new(|| Box::pin(async { Ok(true) })),
            Duration::ZERO,
        )
    }

    pub fn expected_waiting_time(&self) -> Duration {
        self.expected_waiting_time
    }

    /// Whether the job can be cancelled.
    pub fn is_cancellable(&self) -> bool {
        self.cancel.is_some()
    }

    /// Wait until the operation completes.
    ///
    /// First sleeps in `refresh` increments up to the expected waiting time
    /// (minus what already elapsed), calling `break_condition` between
    /// increments, then checks the completion condition. If the operation is
    /// still running, keeps polling it every 10 ms for up to
    /// `additional_timeout` more.
    pub async fn wait_for_completion<B>(
        &mut self,
        mut break_condition: B,
        additional_timeout: Duration,
    ) -> InstrResult<JobOutcome>
    where
        B: FnMut() -> bool,
    {
        while self.started.elapsed() < self.expected_waiting_time {
            if break_condition() {
                debug!("job wait interrupted before expected completion");
                return Ok(JobOutcome::Interrupted);
            }
            let remaining = self.expected_waiting_time - self.started.elapsed();
            sleep(remaining.min(self.refresh)).await;
        }

        if (self.condition)().await? {
            return Ok(JobOutcome::Completed);
        }

        let deadline = Instant::now() + additional_timeout;
        while Instant::now() < deadline {
            if break_condition() {
                return Ok(JobOutcome::Interrupted);
            }
            sleep(Duration::from_millis(10)).await;
            if (self.condition)().await? {
                return Ok(JobOutcome::Completed);
            }
        }
        debug!(
            "job did not complete within {:?} past the expected waiting time",
            additional_timeout
        );
        Ok(JobOutcome::TimedOut)
    }

    /// Interrupt the operation on the instrument.
    ///
    /// Consumes the job: after cancellation the handle is meaningless.
    pub async fn cancel(mut self) -> InstrResult<()> {
        match self.cancel.take() {
            Some(cancel) => cancel().await,
            None => Err(InstrumentError::Unsupported(
                "this operation cannot be cancelled".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    fn counting_condition(done_after: u32, calls: Arc<AtomicU32>) -> ConditionFn {
        Box::new(move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move { Ok(n >= done_after) })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn completes_immediately_when_condition_holds() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut job = InstrJob::new(
            counting_condition(1, calls.clone()),
            Duration::from_secs(2),
        );

        let outcome = job
            .wait_for_completion(|| false, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_during_additional_timeout() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut job = InstrJob::new(
            counting_condition(4, calls.clone()),
            Duration::from_secs(1),
        );

        let outcome = job
            .wait_for_completion(|| false, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_condition_never_holds() {
        let mut job = InstrJob::new(
            Box::new(|| Box::pin(async { Ok(false) })),
            Duration::from_secs(1),
        );

        let outcome = job
            .wait_for_completion(|| false, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn break_condition_interrupts_the_coarse_wait() {
        let stop = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicU32::new(0));
        let mut job = InstrJob::new(
            counting_condition(u32::MAX, calls.clone()),
            Duration::from_secs(3600),
        );

        stop.store(true, Ordering::SeqCst);
        let stop_in = stop.clone();
        let outcome = job
            .wait_for_completion(move || stop_in.load(Ordering::SeqCst), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Interrupted);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_runs_the_callback_once() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let job = InstrJob::new(
            Box::new(|| Box::pin(async { Ok(false) })),
            Duration::from_secs(10),
        )
        .with_cancel(Box::new(move || {
            Box::pin(async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
        }));

        assert!(job.is_cancellable());
        job.cancel().await.unwrap();
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_without_callback_is_unsupported() {
        let job = InstrJob::completed();
        assert!(!job.is_cancellable());
        assert!(matches!(
            job.cancel().await,
            Err(InstrumentError::Unsupported(_))
        ));
    }
}
