//! Instrument session: transport + retry policy + property cache.
//!
//! Every driver owns an [`InstrumentSession`]. It provides the shared
//! plumbing the per-model drivers build on:
//!
//! - retry-wrapped `write`/`query` (communication errors reopen the
//!   connection and resend, see [`RetryPolicy`]),
//! - `cached_get`/`cached_set` implementing the property-cache contract,
//! - write-then-readback confirmation helpers for setters.

use std::future::Future;
use std::sync::Arc;

use crate::error::{InstrResult, InstrumentError};
use crate::instrument::cache::{PropertyCache, PropertyValue};
use crate::transport::{RetryPolicy, Transport};

/// Shared per-driver communication state.
pub struct InstrumentSession {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    cache: PropertyCache,
}

impl InstrumentSession {
    /// Session with the default retry policy.
    pub fn new(transport: Arc<dyn Transport>, cache: PropertyCache) -> Self {
        Self {
            transport,
            policy: RetryPolicy::default(),
            cache,
        }
    }

    /// Override the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn cache(&self) -> &PropertyCache {
        &self.cache
    }

    pub async fn open(&self) -> InstrResult<()> {
        self.transport.open().await
    }

    pub async fn close(&self) -> InstrResult<()> {
        // A stale cache must not survive the connection.
        self.cache.invalidate(None);
        self.transport.close().await
    }

    pub async fn reopen(&self) -> InstrResult<()> {
        self.transport.reopen().await
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.is_connected().await
    }

    /// Run an operation under the retry policy, reopening this session's
    /// transport between attempts.
    ///
    /// This is the secure-communication entry point for driver methods that
    /// bundle several transport calls into one atomic exchange (e.g. a write
    /// immediately confirmed by a readback).
    pub async fn secured<T, Op, OpFut>(&self, op: Op) -> InstrResult<T>
    where
        Op: FnMut() -> OpFut,
        OpFut: Future<Output = InstrResult<T>>,
    {
        let transport = Arc::clone(&self.transport);
        let reopen = move || {
            let transport = Arc::clone(&transport);
            async move { transport.reopen().await }
        };
        self.policy.run(op, reopen).await
    }

    /// Retry-wrapped command write.
    pub async fn write(&self, command: &str) -> InstrResult<()> {
        let transport = Arc::clone(&self.transport);
        let command = command.to_string();
        self.secured(move || {
            let transport = Arc::clone(&transport);
            let command = command.clone();
            async move { transport.write(&command).await }
        })
        .await
    }

    /// Retry-wrapped query.
    pub async fn query(&self, command: &str) -> InstrResult<String> {
        let transport = Arc::clone(&self.transport);
        let command = command.to_string();
        self.secured(move || {
            let transport = Arc::clone(&transport);
            let command = command.clone();
            async move { transport.query(&command).await }
        })
        .await
    }

    /// Retry-wrapped query parsed as `f64`. An empty or malformed reply is a
    /// communication error.
    pub async fn query_f64(&self, command: &str) -> InstrResult<f64> {
        let reply = self.query(command).await?;
        parse_f64(command, &reply)
    }

    /// Retry-wrapped binary block transfer.
    pub async fn write_binary(&self, header: &str, data: &[u8]) -> InstrResult<()> {
        let transport = Arc::clone(&self.transport);
        let header = header.to_string();
        let data = data.to_vec();
        self.secured(move || {
            let transport = Arc::clone(&transport);
            let header = header.clone();
            let data = data.clone();
            async move { transport.write_binary(&header, &data).await }
        })
        .await
    }

    /// Write a setter command and confirm it by reading the value back.
    ///
    /// The whole write-query-compare exchange runs under the retry policy,
    /// so a mismatched readback triggers the reopen-and-resend cycle before
    /// the error propagates.
    pub async fn set_and_confirm_f64(
        &self,
        property: &str,
        write_cmd: &str,
        query_cmd: &str,
        requested: f64,
        tolerance: f64,
    ) -> InstrResult<()> {
        let transport = Arc::clone(&self.transport);
        let property = property.to_string();
        let write_cmd = write_cmd.to_string();
        let query_cmd = query_cmd.to_string();
        self.secured(move || {
            let transport = Arc::clone(&transport);
            let property = property.clone();
            let write_cmd = write_cmd.clone();
            let query_cmd = query_cmd.clone();
            async move {
                transport.write(&write_cmd).await?;
                let reply = transport.query(&query_cmd).await?;
                let reported = parse_f64(&query_cmd, &reply)?;
                if (reported - requested).abs() > tolerance {
                    return Err(InstrumentError::ReadbackMismatch {
                        property,
                        requested: requested.to_string(),
                        reported: reply.trim().to_string(),
                    });
                }
                Ok(())
            }
        })
        .await
    }

    /// Write a setter command and confirm the readback matches `expected`
    /// exactly (after trimming).
    pub async fn set_and_confirm_str(
        &self,
        property: &str,
        write_cmd: &str,
        query_cmd: &str,
        expected: &str,
    ) -> InstrResult<()> {
        let transport = Arc::clone(&self.transport);
        let property = property.to_string();
        let write_cmd = write_cmd.to_string();
        let query_cmd = query_cmd.to_string();
        let expected = expected.to_string();
        self.secured(move || {
            let transport = Arc::clone(&transport);
            let property = property.clone();
            let write_cmd = write_cmd.clone();
            let query_cmd = query_cmd.clone();
            let expected = expected.clone();
            async move {
                transport.write(&write_cmd).await?;
                let reply = transport.query(&query_cmd).await?;
                if reply.trim() != expected {
                    return Err(InstrumentError::ReadbackMismatch {
                        property,
                        requested: expected,
                        reported: reply.trim().to_string(),
                    });
                }
                Ok(())
            }
        })
        .await
    }

    /// Property read through the cache.
    ///
    /// When caching is permitted for `name` and a value is cached, `fetch`
    /// is not invoked; the first read after an invalidation fetches once and
    /// stores the result. Names without permission are plain passthroughs.
    pub async fn cached_get<F, Fut>(&self, name: &str, fetch: F) -> InstrResult<PropertyValue>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = InstrResult<PropertyValue>>,
    {
        if !self.cache.permits(name) {
            return fetch().await;
        }
        if let Some(value) = self.cache.lookup(name) {
            return Ok(value);
        }
        let value = fetch().await?;
        self.cache.store(name, value.clone());
        Ok(value)
    }

    /// Property write through the cache.
    ///
    /// When caching is permitted for `name` and the cached value equals
    /// `value`, `apply` is skipped entirely (no-op short-circuit).
    pub async fn cached_set<F, Fut>(
        &self,
        name: &str,
        value: PropertyValue,
        apply: F,
    ) -> InstrResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = InstrResult<()>>,
    {
        if !self.cache.permits(name) {
            return apply().await;
        }
        if self.cache.lookup(name).as_ref() == Some(&value) {
            return Ok(());
        }
        apply().await?;
        self.cache.store(name, value);
        Ok(())
    }
}

/// Parse an instrument reply as `f64`, classifying failures as
/// communication errors (missing or garbled reply).
pub(crate) fn parse_f64(command: &str, reply: &str) -> InstrResult<f64> {
    reply
        .trim()
        .parse()
        .map_err(|_| InstrumentError::ParseReply {
            command: command.to_string(),
            reply: reply.to_string(),
        })
}
