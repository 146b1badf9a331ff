//! Alazar 935x series digitizer driver.
//!
//! Acquisitions run in NPT AutoDMA mode: the board streams post-trigger
//! records into a ring of four DMA buffers that the driver drains and
//! reposts until the requested record count is reached. All calls block;
//! async callers drive the driver through `spawn_blocking`.

use std::sync::Arc;

use log::debug;

use crate::digitizer::api;
use crate::digitizer::board::BoardHandle;
use crate::error::{InstrResult, InstrumentError};

const DMA_BUFFER_COUNT: usize = 4;
const MAX_BYTES_PER_BUFFER: f64 = 1e6;
const WAIT_BUFFER_TIMEOUT_MS: u32 = 15_000;

/// Raw ADC codes above this mean the input stage clipped.
const SATURATION_HIGH: u16 = u16::MAX - 100;
/// Raw ADC codes below this mean the input stage clipped.
const SATURATION_LOW: u16 = 100;

/// Digitizer driver for the 935x series.
pub struct Alazar935x {
    board: Arc<BoardHandle>,
    samples_per_sec: f64,
}

impl Alazar935x {
    pub fn new(board: Arc<BoardHandle>) -> Self {
        Self {
            board,
            samples_per_sec: 500e6,
        }
    }

    pub fn board(&self) -> &BoardHandle {
        &self.board
    }

    pub fn samples_per_sec(&self) -> f64 {
        self.samples_per_sec
    }

    /// Program the standard clocking, input, trigger and aux configuration.
    pub fn configure_board(&self) -> InstrResult<()> {
        let _guard = self.board.secure()?;
        let api = self.board.api();

        self.board.check(
            "AlazarSetCaptureClock",
            api.set_capture_clock(
                api::EXTERNAL_CLOCK_10MHZ_REF,
                self.samples_per_sec as u32,
                api::CLOCK_EDGE_RISING,
                1,
            ),
        )?;

        self.board.check(
            "AlazarInputControl",
            api.input_control(
                api::CHANNEL_A,
                api::AC_COUPLING,
                api::INPUT_RANGE_PM_200_MV,
                api::IMPEDANCE_50_OHM,
            ),
        )?;
        self.board
            .check("AlazarSetBWLimit", api.set_bw_limit(api::CHANNEL_A, 0))?;

        self.board.check(
            "AlazarInputControl",
            api.input_control(
                api::CHANNEL_B,
                api::AC_COUPLING,
                api::INPUT_RANGE_PM_100_MV,
                api::IMPEDANCE_50_OHM,
            ),
        )?;
        self.board
            .check("AlazarSetBWLimit", api.set_bw_limit(api::CHANNEL_B, 0))?;

        self.board.check(
            "AlazarSetTriggerOperation",
            api.set_trigger_operation(
                api::TRIG_ENGINE_OP_J,
                api::TRIG_ENGINE_J,
                api::TRIG_EXTERNAL,
                api::TRIGGER_SLOPE_POSITIVE,
                150,
                api::TRIG_ENGINE_K,
                api::TRIG_DISABLE,
                api::TRIGGER_SLOPE_POSITIVE,
                128,
            ),
        )?;
        self.board.check(
            "AlazarSetExternalTrigger",
            api.set_external_trigger(api::DC_COUPLING, api::ETR_5V),
        )?;
        self.board
            .check("AlazarSetTriggerDelay", api.set_trigger_delay(0))?;
        self.board
            .check("AlazarSetTriggerTimeOut", api.set_trigger_timeout(0))?;
        self.board.check(
            "AlazarConfigureAuxIO",
            api.configure_aux_io(api::AUX_OUT_TRIGGER, 0),
        )
    }

    /// Acquire `records_per_capture` records on the active channels.
    ///
    /// `duration` and `delay` are in seconds. Returns the raw ADC codes per
    /// active channel; with `average` set, a single averaged trace per
    /// channel. Acquisitions whose raw codes touch the converter rails are
    /// rejected so a clipped measurement cannot pass for data.
    pub fn get_traces(
        &self,
        channels: (bool, bool),
        duration: f64,
        delay: f64,
        records_per_capture: usize,
        average: bool,
    ) -> InstrResult<Vec<Vec<f64>>> {
        if !channels.0 && !channels.1 {
            return Err(InstrumentError::InvalidValue {
                property: "channels".to_string(),
                reason: "at least one channel must be active".to_string(),
            });
        }
        if records_per_capture == 0 {
            return Err(InstrumentError::InvalidValue {
                property: "records_per_capture".to_string(),
                reason: "at least one record must be acquired".to_string(),
            });
        }

        let _guard = self.board.secure()?;
        let api = self.board.api();

        // Trigger delay, aligned to 4 samples.
        let delay_samples = 4 * ((delay * self.samples_per_sec / 4.0) as u32);
        self.board
            .check("AlazarSetTriggerDelay", api.set_trigger_delay(delay_samples))?;

        let channel_count = usize::from(channels.0) + usize::from(channels.1);
        let channel_mask = if channels.0 { api::CHANNEL_A } else { 0 }
            | if channels.1 { api::CHANNEL_B } else { 0 };

        // Post-trigger sample count, aligned up to 32. NPT mode takes no
        // pre-trigger samples.
        let mut post_trigger_samples = (self.samples_per_sec * duration) as usize;
        if post_trigger_samples % 32 != 0 {
            post_trigger_samples = (post_trigger_samples / 32 + 1) * 32;
        }
        let samples_per_record = post_trigger_samples;

        let mut memory_size = 0u64;
        let mut bits_per_sample = 0u8;
        self.board.check(
            "AlazarGetChannelInfo",
            api.channel_info(&mut memory_size, &mut bits_per_sample),
        )?;
        let bytes_per_sample = usize::from(bits_per_sample + 7) / 8;
        let bytes_per_record = bytes_per_sample * samples_per_record;

        // Cap the buffer size around 1 MB, per the SDK guidance on DMA
        // throughput.
        let max_records =
            (MAX_BYTES_PER_BUFFER / (bytes_per_record * channel_count) as f64) as usize;
        let records_per_buffer = max_records.max(1).min(records_per_capture);
        let buffers_per_acquisition = records_per_capture.div_ceil(records_per_buffer);
        // The board wants an acquisition that is a whole number of buffers;
        // the surplus records of the last buffer are dropped on copy.
        let records_to_ignore =
            buffers_per_acquisition * records_per_buffer - records_per_capture;
        let samples_per_buffer = samples_per_record * records_per_buffer * channel_count;
        debug!(
            "NPT acquisition: {samples_per_record} samples/record, \
             {records_per_buffer} records/buffer, {buffers_per_acquisition} buffer(s), \
             {records_to_ignore} surplus record(s)"
        );

        self.board.check(
            "AlazarSetRecordSize",
            api.set_record_size(0, post_trigger_samples as u32),
        )?;
        self.board.check(
            "AlazarBeforeAsyncRead",
            api.before_async_read(
                channel_mask,
                0,
                samples_per_record as u32,
                records_per_buffer as u32,
                (records_per_buffer * buffers_per_acquisition) as u32,
                api::ADMA_EXTERNAL_STARTCAPTURE | api::ADMA_NPT,
            ),
        )?;

        let mut buffers = vec![vec![0u16; samples_per_buffer]; DMA_BUFFER_COUNT];
        for index in 0..DMA_BUFFER_COUNT {
            self.board.check(
                "AlazarPostAsyncBuffer",
                api.post_async_buffer(index, samples_per_buffer * bytes_per_sample),
            )?;
        }

        self.board
            .check("AlazarStartCapture", api.start_capture())?;

        let mut data = vec![vec![0.0f64; samples_per_record * records_per_capture]; channel_count];
        let mut saturated = false;

        let mut result: InstrResult<()> = Ok(());
        let mut buffers_completed = 0usize;
        while buffers_completed < buffers_per_acquisition {
            let index = buffers_completed % DMA_BUFFER_COUNT;
            let buffer = &mut buffers[index];
            if let Err(err) = self.board.check(
                "AlazarWaitAsyncBufferComplete",
                api.wait_async_buffer_complete(index, buffer, WAIT_BUFFER_TIMEOUT_MS),
            ) {
                result = Err(err);
                break;
            }

            let keep = if buffers_completed == buffers_per_acquisition - 1 {
                records_per_buffer - records_to_ignore
            } else {
                records_per_buffer
            };
            let record_offset = buffers_completed * records_per_buffer;

            // The buffer holds the records of each channel back to back.
            for channel in 0..channel_count {
                for record in 0..keep {
                    let src = (channel * records_per_buffer + record) * samples_per_record;
                    let dst = (record_offset + record) * samples_per_record;
                    for (i, &raw) in buffer[src..src + samples_per_record].iter().enumerate() {
                        if raw > SATURATION_HIGH || raw < SATURATION_LOW {
                            saturated = true;
                        }
                        data[channel][dst + i] = f64::from(raw);
                    }
                }
            }

            buffers_completed += 1;
            if let Err(err) = self.board.check(
                "AlazarPostAsyncBuffer",
                api.post_async_buffer(index, samples_per_buffer * bytes_per_sample),
            ) {
                result = Err(err);
                break;
            }
        }

        // The transfer must be aborted even when a buffer failed.
        self.board
            .check("AlazarAbortAsyncRead", api.abort_async_read())?;
        result?;

        if saturated {
            return Err(InstrumentError::InvalidValue {
                property: "input_range".to_string(),
                reason: "channel A or B is saturated: increase the input range or decrease \
                         the amplification"
                    .to_string(),
            });
        }

        if average {
            let averaged = data
                .into_iter()
                .map(|channel| {
                    let mut mean = vec![0.0f64; samples_per_record];
                    for record in 0..records_per_capture {
                        let start = record * samples_per_record;
                        for (m, &v) in mean
                            .iter_mut()
                            .zip(&channel[start..start + samples_per_record])
                        {
                            *m += v;
                        }
                    }
                    for m in &mut mean {
                        *m /= records_per_capture as f64;
                    }
                    mean
                })
                .collect();
            Ok(averaged)
        } else {
            Ok(data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digitizer::mock::MockAlazarApi;

    fn digitizer(api: Arc<MockAlazarApi>) -> Alazar935x {
        Alazar935x::new(Arc::new(BoardHandle::new(api)))
    }

    #[test]
    fn configure_board_runs_the_standard_setup() {
        let api = Arc::new(MockAlazarApi::new());
        digitizer(api.clone()).configure_board().unwrap();

        assert_eq!(api.count_calls("AlazarSetCaptureClock"), 1);
        assert_eq!(api.count_calls("AlazarInputControl"), 2);
        assert_eq!(api.count_calls("AlazarSetBWLimit"), 2);
        assert_eq!(api.count_calls("AlazarSetTriggerOperation"), 1);
        assert_eq!(api.count_calls("AlazarConfigureAuxIO"), 1);
    }

    #[test]
    fn configuration_failure_is_translated() {
        let api = Arc::new(MockAlazarApi::new());
        api.fail_call("AlazarSetCaptureClock", 513);

        let err = digitizer(api).configure_board().unwrap_err();
        match err {
            InstrumentError::Board { call, code, text } => {
                assert_eq!(call, "AlazarSetCaptureClock");
                assert_eq!(code, 513);
                assert_eq!(text, "ApiFailed");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn traces_have_one_row_per_record() {
        let digitizer = digitizer(Arc::new(MockAlazarApi::new().with_sample(30_000)));

        // 64 ns at 500 MS/s is 32 samples, exactly one alignment block.
        let traces = digitizer
            .get_traces((true, true), 64e-9, 0.0, 3, false)
            .unwrap();

        assert_eq!(traces.len(), 2);
        for channel in &traces {
            assert_eq!(channel.len(), 3 * 32);
            assert!(channel.iter().all(|&v| v == 30_000.0));
        }
    }

    #[test]
    fn averaging_collapses_records_into_one_trace() {
        let digitizer = digitizer(Arc::new(MockAlazarApi::new().with_sample(30_000)));

        let traces = digitizer
            .get_traces((true, false), 64e-9, 0.0, 5, true)
            .unwrap();

        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].len(), 32);
        assert!(traces[0].iter().all(|&v| v == 30_000.0));
    }

    #[test]
    fn saturated_codes_fail_the_acquisition() {
        let digitizer = digitizer(Arc::new(MockAlazarApi::new().with_sample(u16::MAX - 50)));

        let err = digitizer
            .get_traces((true, false), 64e-9, 0.0, 1, false)
            .unwrap_err();
        assert!(err.to_string().contains("saturated"));
    }

    #[test]
    fn wait_failure_aborts_and_reports() {
        let api = Arc::new(MockAlazarApi::new());
        api.fail_call("AlazarWaitAsyncBufferComplete", 579);
        let digitizer = digitizer(api);

        let err = digitizer
            .get_traces((true, false), 64e-9, 0.0, 1, false)
            .unwrap_err();
        match err {
            InstrumentError::Board { call, text, .. } => {
                assert_eq!(call, "AlazarWaitAsyncBufferComplete");
                assert_eq!(text, "ApiWaitTimeout");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn no_active_channel_is_rejected() {
        let digitizer = digitizer(Arc::new(MockAlazarApi::new()));
        assert!(digitizer
            .get_traces((false, false), 64e-9, 0.0, 1, false)
            .is_err());
    }
}
