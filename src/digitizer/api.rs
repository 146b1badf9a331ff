//! Native digitizer library interface.
//!
//! The board is driven through a C calling convention where every call
//! returns a `u32` status code, success being [`API_SUCCESS`], and a single
//! translation call maps a code to human readable text. [`AlazarApi`]
//! abstracts those entry points so acquisitions can run against the real
//! library or the in-crate mock.

/// Status code every successful API call returns.
pub const API_SUCCESS: u32 = 512;

pub const EXTERNAL_CLOCK_10MHZ_REF: u32 = 0x7;
pub const CLOCK_EDGE_RISING: u32 = 0;

pub const CHANNEL_A: u32 = 0x1;
pub const CHANNEL_B: u32 = 0x2;

pub const AC_COUPLING: u32 = 1;
pub const DC_COUPLING: u32 = 2;

pub const INPUT_RANGE_PM_100_MV: u32 = 0x5;
pub const INPUT_RANGE_PM_200_MV: u32 = 0x6;

pub const IMPEDANCE_50_OHM: u32 = 2;

pub const TRIG_ENGINE_OP_J: u32 = 0;
pub const TRIG_ENGINE_J: u32 = 0;
pub const TRIG_ENGINE_K: u32 = 1;
pub const TRIG_EXTERNAL: u32 = 2;
pub const TRIG_DISABLE: u32 = 3;
pub const TRIGGER_SLOPE_POSITIVE: u32 = 1;

pub const ETR_5V: u32 = 0;

pub const AUX_OUT_TRIGGER: u32 = 0;

pub const ADMA_EXTERNAL_STARTCAPTURE: u32 = 0x1;
pub const ADMA_NPT: u32 = 0x200;

/// Entry points of the digitizer library used by the 935x driver.
///
/// Buffers are identified by their index in the driver's DMA buffer ring;
/// `wait_async_buffer_complete` fills the caller's slice with the completed
/// buffer's samples.
pub trait AlazarApi: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn set_capture_clock(&self, source: u32, rate: u32, edge: u32, decimation: u32) -> u32;

    fn input_control(&self, channel: u32, coupling: u32, input_range: u32, impedance: u32)
        -> u32;

    fn set_bw_limit(&self, channel: u32, enable: u32) -> u32;

    #[allow(clippy::too_many_arguments)]
    fn set_trigger_operation(
        &self,
        operation: u32,
        engine1: u32,
        source1: u32,
        slope1: u32,
        level1: u32,
        engine2: u32,
        source2: u32,
        slope2: u32,
        level2: u32,
    ) -> u32;

    fn set_external_trigger(&self, coupling: u32, range: u32) -> u32;

    fn set_trigger_delay(&self, samples: u32) -> u32;

    fn set_trigger_timeout(&self, ticks: u32) -> u32;

    fn configure_aux_io(&self, mode: u32, parameter: u32) -> u32;

    /// Board memory size in samples and sample width in bits.
    fn channel_info(&self, memory_size: &mut u64, bits_per_sample: &mut u8) -> u32;

    fn set_record_size(&self, pre_trigger: u32, post_trigger: u32) -> u32;

    #[allow(clippy::too_many_arguments)]
    fn before_async_read(
        &self,
        channels: u32,
        transfer_offset: i64,
        samples_per_record: u32,
        records_per_buffer: u32,
        records_per_acquisition: u32,
        flags: u32,
    ) -> u32;

    fn post_async_buffer(&self, buffer_index: usize, size_bytes: usize) -> u32;

    fn start_capture(&self) -> u32;

    fn wait_async_buffer_complete(
        &self,
        buffer_index: usize,
        buffer: &mut [u16],
        timeout_ms: u32,
    ) -> u32;

    fn abort_async_read(&self) -> u32;

    /// Translate a status code to the library's error text.
    fn error_text(&self, code: u32) -> String;
}
