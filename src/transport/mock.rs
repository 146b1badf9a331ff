//! Scriptable mock transport.
//!
//! Used by unit tests and dry-runs: replies are scripted per command, and
//! communication failures can be injected to exercise the retry layer. The
//! mock records every command sent and every binary block transferred so
//! tests can assert on the exact traffic.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use rand::Rng;

use crate::error::{InstrResult, InstrumentError};
use crate::transport::Transport;

enum ReplyScript {
    /// Same reply for every query.
    Fixed(String),
    /// One reply per query, in order; empty string once exhausted.
    Sequence(VecDeque<String>),
    /// A jittered numeric reading, fresh on every query.
    Noisy { base: f64, jitter: f64 },
}

#[derive(Default)]
struct Inner {
    replies: HashMap<String, ReplyScript>,
    log: Vec<String>,
    binary: Vec<(String, Vec<u8>)>,
    fail_remaining: u32,
    connected: bool,
    open_count: u32,
    reopen_count: u32,
}

/// Mock command/response transport.
pub struct MockTransport {
    resource: String,
    inner: Mutex<Inner>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// A connected mock with no scripted replies (all queries answer "").
    pub fn new() -> Self {
        Self {
            resource: "MOCK0::INSTR".to_string(),
            inner: Mutex::new(Inner {
                connected: true,
                ..Inner::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Script a fixed reply for a query command.
    pub fn with_reply(self, command: impl Into<String>, reply: impl Into<String>) -> Self {
        self.lock()
            .replies
            .insert(command.into(), ReplyScript::Fixed(reply.into()));
        self
    }

    /// Script a sequence of replies for a query command, served in order.
    pub fn with_replies<I, S>(self, command: impl Into<String>, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queue = replies.into_iter().map(Into::into).collect();
        self.lock()
            .replies
            .insert(command.into(), ReplyScript::Sequence(queue));
        self
    }

    /// Script a jittered numeric reading for a query command.
    pub fn with_noisy_reply(self, command: impl Into<String>, base: f64, jitter: f64) -> Self {
        self.lock()
            .replies
            .insert(command.into(), ReplyScript::Noisy { base, jitter });
        self
    }

    /// Replace the scripted reply for a command at runtime.
    pub fn set_reply(&self, command: impl Into<String>, reply: impl Into<String>) {
        self.lock()
            .replies
            .insert(command.into(), ReplyScript::Fixed(reply.into()));
    }

    /// Inject `n` communication failures: the next `n` writes/queries fail.
    pub fn fail_times(&self, n: u32) {
        self.lock().fail_remaining = n;
    }

    /// Every command sent so far, in order.
    pub fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    /// Number of times `query`/`write` saw a given command.
    pub fn count_sent(&self, command: &str) -> usize {
        self.lock().log.iter().filter(|c| *c == command).count()
    }

    /// Binary blocks transferred so far, as (header, payload) pairs.
    pub fn binary_transfers(&self) -> Vec<(String, Vec<u8>)> {
        self.lock().binary.clone()
    }

    pub fn open_count(&self) -> u32 {
        self.lock().open_count
    }

    pub fn reopen_count(&self) -> u32 {
        self.lock().reopen_count
    }

    fn check_failure(&self, inner: &mut Inner, command: &str) -> InstrResult<()> {
        if inner.fail_remaining > 0 {
            inner.fail_remaining -= 1;
            return Err(InstrumentError::Io(format!(
                "injected failure for {command}"
            )));
        }
        if !inner.connected {
            return Err(InstrumentError::NotConnected);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self) -> InstrResult<()> {
        let mut inner = self.lock();
        inner.connected = true;
        inner.open_count += 1;
        Ok(())
    }

    async fn close(&self) -> InstrResult<()> {
        self.lock().connected = false;
        Ok(())
    }

    async fn reopen(&self) -> InstrResult<()> {
        let mut inner = self.lock();
        inner.connected = true;
        inner.reopen_count += 1;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.lock().connected
    }

    async fn write(&self, command: &str) -> InstrResult<()> {
        let mut inner = self.lock();
        self.check_failure(&mut inner, command)?;
        inner.log.push(command.to_string());
        Ok(())
    }

    async fn query(&self, command: &str) -> InstrResult<String> {
        let mut inner = self.lock();
        self.check_failure(&mut inner, command)?;
        inner.log.push(command.to_string());
        let reply = match inner.replies.get_mut(command) {
            Some(ReplyScript::Fixed(reply)) => reply.clone(),
            Some(ReplyScript::Sequence(queue)) => queue.pop_front().unwrap_or_default(),
            Some(ReplyScript::Noisy { base, jitter }) => {
                let value = if *jitter > 0.0 {
                    *base + rand::thread_rng().gen_range(-*jitter..=*jitter)
                } else {
                    *base
                };
                format!("{value:.6e}")
            }
            None => String::new(),
        };
        Ok(reply)
    }

    async fn write_binary(&self, header: &str, data: &[u8]) -> InstrResult<()> {
        let mut inner = self.lock();
        self.check_failure(&mut inner, header)?;
        inner.binary.push((header.to_string(), data.to_vec()));
        Ok(())
    }

    fn resource(&self) -> &str {
        &self.resource
    }
}
