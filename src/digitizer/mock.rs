//! Scriptable mock of the digitizer library.
//!
//! Completed buffers are filled with a configurable constant sample so
//! acquisition bookkeeping (buffer rotation, record trimming, averaging)
//! can be tested without hardware. Individual calls can be scripted to
//! fail with a chosen status code.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::digitizer::api::{AlazarApi, API_SUCCESS};

const MID_SCALE: u16 = 1 << 15;

#[derive(Default)]
struct Inner {
    fail: HashMap<&'static str, u32>,
    calls: Vec<String>,
    posted: Vec<usize>,
    completed: u32,
}

/// In-memory digitizer library.
pub struct MockAlazarApi {
    sample: u16,
    inner: Mutex<Inner>,
}

impl Default for MockAlazarApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAlazarApi {
    pub fn new() -> Self {
        Self {
            sample: MID_SCALE,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Fill completed buffers with this raw code instead of mid-scale.
    pub fn with_sample(mut self, sample: u16) -> Self {
        self.sample = sample;
        self
    }

    /// Make the named call fail with `code`.
    pub fn fail_call(&self, call: &'static str, code: u32) {
        self.lock().fail.insert(call, code);
    }

    /// Names of the API calls made so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, name: &str) -> usize {
        self.lock().calls.iter().filter(|c| *c == name).count()
    }

    /// Buffer indices posted to the board, in order.
    pub fn posted_buffers(&self) -> Vec<usize> {
        self.lock().posted.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(&self, name: &'static str) -> u32 {
        let mut inner = self.lock();
        inner.calls.push(name.to_string());
        inner.fail.get(name).copied().unwrap_or(API_SUCCESS)
    }
}

impl AlazarApi for MockAlazarApi {
    fn set_capture_clock(&self, _source: u32, _rate: u32, _edge: u32, _decimation: u32) -> u32 {
        self.record("AlazarSetCaptureClock")
    }

    fn input_control(
        &self,
        _channel: u32,
        _coupling: u32,
        _input_range: u32,
        _impedance: u32,
    ) -> u32 {
        self.record("AlazarInputControl")
    }

    fn set_bw_limit(&self, _channel: u32, _enable: u32) -> u32 {
        self.record("AlazarSetBWLimit")
    }

    fn set_trigger_operation(
        &self,
        _operation: u32,
        _engine1: u32,
        _source1: u32,
        _slope1: u32,
        _level1: u32,
        _engine2: u32,
        _source2: u32,
        _slope2: u32,
        _level2: u32,
    ) -> u32 {
        self.record("AlazarSetTriggerOperation")
    }

    fn set_external_trigger(&self, _coupling: u32, _range: u32) -> u32 {
        self.record("AlazarSetExternalTrigger")
    }

    fn set_trigger_delay(&self, _samples: u32) -> u32 {
        self.record("AlazarSetTriggerDelay")
    }

    fn set_trigger_timeout(&self, _ticks: u32) -> u32 {
        self.record("AlazarSetTriggerTimeOut")
    }

    fn configure_aux_io(&self, _mode: u32, _parameter: u32) -> u32 {
        self.record("AlazarConfigureAuxIO")
    }

    fn channel_info(&self, memory_size: &mut u64, bits_per_sample: &mut u8) -> u32 {
        *memory_size = 1 << 28;
        *bits_per_sample = 12;
        self.record("AlazarGetChannelInfo")
    }

    fn set_record_size(&self, _pre_trigger: u32, _post_trigger: u32) -> u32 {
        self.record("AlazarSetRecordSize")
    }

    fn before_async_read(
        &self,
        _channels: u32,
        _transfer_offset: i64,
        _samples_per_record: u32,
        _records_per_buffer: u32,
        _records_per_acquisition: u32,
        _flags: u32,
    ) -> u32 {
        self.record("AlazarBeforeAsyncRead")
    }

    fn post_async_buffer(&self, buffer_index: usize, _size_bytes: usize) -> u32 {
        self.lock().posted.push(buffer_index);
        self.record("AlazarPostAsyncBuffer")
    }

    fn start_capture(&self) -> u32 {
        self.record("AlazarStartCapture")
    }

    fn wait_async_buffer_complete(
        &self,
        _buffer_index: usize,
        buffer: &mut [u16],
        _timeout_ms: u32,
    ) -> u32 {
        let code = self.record("AlazarWaitAsyncBufferComplete");
        if code == API_SUCCESS {
            buffer.fill(self.sample);
            self.lock().completed += 1;
        }
        code
    }

    fn abort_async_read(&self) -> u32 {
        self.record("AlazarAbortAsyncRead")
    }

    fn error_text(&self, code: u32) -> String {
        match code {
            API_SUCCESS => "ApiSuccess".to_string(),
            513 => "ApiFailed".to_string(),
            579 => "ApiWaitTimeout".to_string(),
            other => format!("ApiError {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_calls_and_injects_failures() {
        let api = MockAlazarApi::new();
        assert_eq!(api.start_capture(), API_SUCCESS);

        api.fail_call("AlazarStartCapture", 513);
        assert_eq!(api.start_capture(), 513);
        assert_eq!(api.count_calls("AlazarStartCapture"), 2);
    }

    #[test]
    fn completed_buffers_are_filled_with_the_sample() {
        let api = MockAlazarApi::new().with_sample(40_000);
        let mut buffer = vec![0u16; 8];
        assert_eq!(api.wait_async_buffer_complete(0, &mut buffer, 100), API_SUCCESS);
        assert!(buffer.iter().all(|&s| s == 40_000));
    }
}
