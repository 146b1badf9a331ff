//! Sequence compilation for the Tektronix AWG5014.
//!
//! Pulses are compiled into one fixed-length sample buffer per used
//! channel. Each sample is a 16-bit code packing 14 bits of analog level
//! with the two marker bits on top, serialized little-endian for the
//! instrument's INTeger waveform format.

use std::collections::BTreeMap;

use bytes::BufMut;
use log::debug;

use crate::error::InstrResult;
use crate::instrument::tektro_awg::Awg5014;
use crate::pulses::{Pulse, TimeUnit, Waveform};

/// Mid-scale code of the 14-bit signed-offset DAC.
const ANALOG_BASELINE: i32 = 1 << 13;
/// Largest value an analog pulse may add to the baseline.
const ANALOG_AMPLITUDE: f64 = 8191.0;
/// Largest representable analog code.
const ANALOG_MAX: i32 = 16383;

/// Metadata describing a compiled sequence.
#[derive(Clone, Debug, PartialEq)]
pub struct SequenceInfos {
    pub sampling_frequency: f64,
    /// Waveform name uploaded for each used channel number.
    pub sequence_names: BTreeMap<u8, String>,
}

/// Outcome of a compile (and optional transfer).
///
/// Compilation failures are reported here rather than as errors: only
/// transport problems during the transfer surface as `Err`.
#[derive(Clone, Debug)]
pub struct CompileReport {
    pub success: bool,
    pub infos: Option<SequenceInfos>,
    /// Per-pulse or per-channel error messages for a failed compile.
    pub errors: BTreeMap<String, String>,
}

impl CompileReport {
    fn failure(errors: BTreeMap<String, String>) -> Self {
        Self {
            success: false,
            infos: None,
            errors,
        }
    }
}

/// Compilation context for the AWG5014.
#[derive(Clone, Debug)]
pub struct Awg5014Context {
    /// Base name for the uploaded waveforms; the channel name is appended.
    pub sequence_name: String,
    /// Sampling frequency in Hz.
    pub sampling_frequency: f64,
    /// Unit of the pulse start/duration values.
    pub time_unit: TimeUnit,
    /// Select the transferred waveforms on their channels.
    pub select_after_transfer: bool,
    /// Clear channels that received no waveform, so an old sequence cannot
    /// keep playing on them.
    pub clear_unused_channels: bool,
    /// Start playback after a successful transfer.
    pub run_after_transfer: bool,
    /// Marker channels whose output must be inverted (e.g. "Ch1_M2").
    pub inverted_log_channels: Vec<String>,
}

impl Default for Awg5014Context {
    fn default() -> Self {
        Self {
            sequence_name: "Seq".to_string(),
            sampling_frequency: 1e9,
            time_unit: TimeUnit::Mus,
            select_after_transfer: true,
            clear_unused_channels: true,
            run_after_transfer: true,
            inverted_log_channels: Vec::new(),
        }
    }
}

struct ChannelArrays {
    analog: Vec<i32>,
    marker1: Vec<i32>,
    marker2: Vec<i32>,
}

impl ChannelArrays {
    fn new(length: usize) -> Self {
        Self {
            analog: vec![ANALOG_BASELINE; length],
            marker1: vec![0; length],
            marker2: vec![0; length],
        }
    }
}

impl Awg5014Context {
    /// Compile `pulses` into per-channel sample buffers and, when a driver
    /// is supplied, transfer them to the instrument.
    ///
    /// Without a driver this is a dry run: the compile result is returned
    /// with no hardware interaction, allowing validation ahead of time.
    /// `duration` is the total sequence length in the context's time unit;
    /// when `None` the sequence ends with the last pulse.
    pub async fn compile_and_transfer(
        &self,
        pulses: &[Pulse],
        duration: Option<f64>,
        driver: Option<&Awg5014>,
    ) -> InstrResult<CompileReport> {
        let (buffers, mut report) = match self.compile(pulses, duration) {
            Ok(compiled) => compiled,
            Err(errors) => return Ok(CompileReport::failure(errors)),
        };

        let Some(driver) = driver else {
            return Ok(report);
        };

        self.transfer(driver, &buffers, &mut report).await?;
        Ok(report)
    }

    /// Pure compile step: build the packed byte buffer of every used
    /// channel, or the per-pulse/per-channel error map.
    #[allow(clippy::type_complexity)]
    fn compile(
        &self,
        pulses: &[Pulse],
        duration: Option<f64>,
    ) -> Result<(BTreeMap<u8, Vec<u8>>, CompileReport), BTreeMap<String, String>> {
        let duration = duration.unwrap_or_else(|| {
            pulses
                .iter()
                .map(|p| p.start + p.duration)
                .fold(0.0, f64::max)
        });

        let time_to_index = self.time_unit.to_seconds() * self.sampling_frequency;
        let sequence_length = (duration * time_to_index).round() as usize;

        let mut channels: BTreeMap<String, ChannelArrays> = BTreeMap::new();
        for pulse in pulses {
            let Some((name, _, _)) = split_channel(&pulse.channel) else {
                let mut errors = BTreeMap::new();
                errors.insert(
                    "Channel issue".to_string(),
                    format!(
                        "Unknown channel {} for pulse {}.",
                        pulse.channel, pulse.index
                    ),
                );
                return Err(errors);
            };
            channels
                .entry(name.to_string())
                .or_insert_with(|| ChannelArrays::new(sequence_length));
        }

        for pulse in pulses.iter().filter(|p| p.duration != 0.0) {
            // Channel names were validated above.
            let Some((name, _, part)) = split_channel(&pulse.channel) else {
                continue;
            };
            let start_index = (pulse.start * time_to_index).round() as usize;
            let stop_index = start_index + pulse.waveform.len();
            if stop_index > sequence_length {
                let mut errors = BTreeMap::new();
                errors.insert(
                    format!("Pulse {}", pulse.index),
                    "Pulse extends past the end of the sequence.".to_string(),
                );
                return Err(errors);
            }

            let Some(arrays) = channels.get_mut(name) else {
                continue;
            };
            match (part, &pulse.waveform) {
                ("A", Waveform::Analog(samples)) => {
                    for (slot, sample) in
                        arrays.analog[start_index..stop_index].iter_mut().zip(samples)
                    {
                        *slot += (ANALOG_AMPLITUDE * sample).round() as i32;
                    }
                }
                ("M1", Waveform::Logic(samples)) => {
                    for (slot, sample) in
                        arrays.marker1[start_index..stop_index].iter_mut().zip(samples)
                    {
                        *slot += i32::from(*sample);
                    }
                }
                ("M2", Waveform::Logic(samples)) => {
                    for (slot, sample) in
                        arrays.marker2[start_index..stop_index].iter_mut().zip(samples)
                    {
                        *slot += i32::from(*sample);
                    }
                }
                _ => {
                    let mut errors = BTreeMap::new();
                    errors.insert(
                        "Kind issue".to_string(),
                        format!(
                            "Selected channel does not match kind for pulse {} ({}, {}).",
                            pulse.index,
                            pulse.waveform.kind_name(),
                            pulse.channel
                        ),
                    );
                    return Err(errors);
                }
            }
        }

        let mut errors = BTreeMap::new();
        for (name, arrays) in &channels {
            if arrays
                .analog
                .iter()
                .any(|&v| !(0..=ANALOG_MAX).contains(&v))
            {
                errors.insert(
                    format!("{name}_A"),
                    "Analogical values out of range.".to_string(),
                );
            } else if arrays.marker1.iter().any(|&v| !(0..=1).contains(&v)) {
                errors.insert(format!("{name}_M1"), "Overflow in marker 1.".to_string());
            } else if arrays.marker2.iter().any(|&v| !(0..=1).contains(&v)) {
                errors.insert(format!("{name}_M2"), "Overflow in marker 2.".to_string());
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        // Inversion happens after validation so an inverted overflow still
        // reports the raw values the user wrote.
        for inverted in &self.inverted_log_channels {
            if let Some((name, _, part)) = split_channel(inverted) {
                if let Some(arrays) = channels.get_mut(name) {
                    let markers = if part == "M1" {
                        &mut arrays.marker1
                    } else {
                        &mut arrays.marker2
                    };
                    for value in markers.iter_mut() {
                        *value = 1 - *value;
                    }
                }
            }
        }

        let mut buffers = BTreeMap::new();
        let mut sequence_names = BTreeMap::new();
        for (name, arrays) in &channels {
            let Some(number) = name.strip_prefix("Ch").and_then(|n| n.parse::<u8>().ok()) else {
                continue;
            };
            let mut buffer = Vec::with_capacity(2 * sequence_length);
            for i in 0..sequence_length {
                let code = (arrays.analog[i]
                    | (arrays.marker1[i] << 14)
                    | (arrays.marker2[i] << 15)) as u16;
                buffer.put_u16_le(code);
            }
            buffers.insert(number, buffer);
            sequence_names.insert(number, format!("{}_{}", self.sequence_name, name));
        }
        debug!(
            "compiled {} channel buffer(s) of {} samples",
            buffers.len(),
            sequence_length
        );

        let report = CompileReport {
            success: true,
            infos: Some(SequenceInfos {
                sampling_frequency: self.sampling_frequency,
                sequence_names,
            }),
            errors: BTreeMap::new(),
        };
        Ok((buffers, report))
    }

    /// Transfer previously compiled buffers to the instrument.
    async fn transfer(
        &self,
        driver: &Awg5014,
        buffers: &BTreeMap<u8, Vec<u8>>,
        report: &mut CompileReport,
    ) -> InstrResult<()> {
        let names = report
            .infos
            .as_ref()
            .map(|infos| infos.sequence_names.clone())
            .unwrap_or_default();

        for number in driver.defined_channels() {
            if let (Some(buffer), Some(name)) = (buffers.get(&number), names.get(&number)) {
                driver.upload_waveform(name, buffer).await?;
            }
        }

        if self.select_after_transfer {
            driver
                .set_sampling_frequency(self.sampling_frequency)
                .await?;
            for number in driver.defined_channels() {
                let Some(channel) = driver.channel(number) else {
                    continue;
                };
                if let Some(name) = names.get(&number) {
                    channel.select_sequence(name).await?;
                } else if self.clear_unused_channels {
                    channel.clear_sequence().await?;
                }
            }
        }

        if self.run_after_transfer {
            for number in buffers.keys() {
                if let Some(channel) = driver.channel(*number) {
                    channel.set_output_state(true).await?;
                }
            }
            driver.set_running(true).await?;
        }
        Ok(())
    }
}

/// Split a channel name like `Ch1_M2` into its channel part, number and
/// output suffix.
fn split_channel(channel: &str) -> Option<(&str, u8, &str)> {
    let (name, part) = channel.split_once('_')?;
    let number: u8 = name.strip_prefix("Ch")?.parse().ok()?;
    if !(1..=4).contains(&number) || !matches!(part, "A" | "M1" | "M2") {
        return None;
    }
    Some((name, number, part))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::transport::MockTransport;

    fn context() -> Awg5014Context {
        Awg5014Context {
            sequence_name: "demo".to_string(),
            ..Awg5014Context::default()
        }
    }

    fn unpack(buffer: &[u8]) -> Vec<u16> {
        buffer
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }

    fn analog_pulse(index: usize, channel: &str, start: f64, samples: Vec<f64>) -> Pulse {
        Pulse {
            index,
            channel: channel.to_string(),
            start,
            duration: samples.len() as f64 * 1e-3,
            waveform: Waveform::Analog(samples),
        }
    }

    #[tokio::test]
    async fn full_scale_pulse_saturates_under_the_14_bit_ceiling() {
        let pulses = vec![analog_pulse(0, "Ch1_A", 0.002, vec![1.0; 4])];
        let report = context()
            .compile_and_transfer(&pulses, Some(0.01), None)
            .await
            .unwrap();

        assert!(report.success);
        let infos = report.infos.unwrap();
        assert_eq!(infos.sequence_names[&1], "demo_Ch1");
        assert_eq!(infos.sampling_frequency, 1e9);

        // Inspect the produced buffer through a second, pure compile.
        let (buffers, _) = context().compile(&pulses, Some(0.01)).unwrap();
        let codes = unpack(&buffers[&1]);
        assert_eq!(codes.len(), 10);
        assert!(codes[2..6].iter().all(|&c| c == 16383));
        assert!(codes[..2].iter().all(|&c| c == 8192));
        assert!(codes[6..].iter().all(|&c| c == 8192));
    }

    #[tokio::test]
    async fn markers_land_in_the_top_bits() {
        let pulses = vec![
            Pulse {
                index: 0,
                channel: "Ch2_M1".to_string(),
                start: 0.0,
                duration: 2e-3,
                waveform: Waveform::Logic(vec![1, 1]),
            },
            Pulse {
                index: 1,
                channel: "Ch2_M2".to_string(),
                start: 0.0,
                duration: 2e-3,
                waveform: Waveform::Logic(vec![0, 1]),
            },
        ];
        let (buffers, _) = context().compile(&pulses, Some(3e-3)).unwrap();
        let codes = unpack(&buffers[&2]);
        assert_eq!(codes, vec![8192 | 1 << 14, 8192 | 1 << 14 | 1 << 15, 8192]);
    }

    #[tokio::test]
    async fn overflow_aborts_with_a_channel_error_and_no_transfer() {
        let mock = Arc::new(MockTransport::new());
        let awg = Awg5014::new(mock.clone());

        // Two overlapping full-scale pulses push the sum past 16383.
        let pulses = vec![
            analog_pulse(0, "Ch1_A", 0.0, vec![1.0; 3]),
            analog_pulse(1, "Ch1_A", 0.0, vec![1.0; 3]),
        ];
        let report = context()
            .compile_and_transfer(&pulses, Some(0.005), Some(&awg))
            .await
            .unwrap();

        assert!(!report.success);
        assert_eq!(
            report.errors["Ch1_A"],
            "Analogical values out of range."
        );
        assert!(mock.log().is_empty());
        assert!(mock.binary_transfers().is_empty());
    }

    #[tokio::test]
    async fn kind_mismatch_names_the_offending_pulse() {
        let pulses = vec![Pulse {
            index: 7,
            channel: "Ch1_M1".to_string(),
            start: 0.0,
            duration: 1e-3,
            waveform: Waveform::Analog(vec![0.5]),
        }];
        let report = context()
            .compile_and_transfer(&pulses, Some(0.002), None)
            .await
            .unwrap();

        assert!(!report.success);
        assert!(report.errors["Kind issue"].contains("pulse 7"));
    }

    #[tokio::test]
    async fn marker_inversion_applies_after_validation() {
        let pulses = vec![Pulse {
            index: 0,
            channel: "Ch1_M2".to_string(),
            start: 0.0,
            duration: 1e-3,
            waveform: Waveform::Logic(vec![1]),
        }];
        let mut ctx = context();
        ctx.inverted_log_channels = vec!["Ch1_M2".to_string()];

        let (buffers, _) = ctx.compile(&pulses, Some(2e-3)).unwrap();
        let codes = unpack(&buffers[&1]);
        // The written one becomes zero, the idle samples become one.
        assert_eq!(codes, vec![8192, 8192 | 1 << 15]);
    }

    #[tokio::test]
    async fn dry_run_is_deterministic() {
        let pulses = vec![analog_pulse(0, "Ch3_A", 0.001, vec![0.25; 2])];
        let ctx = context();
        let first = ctx
            .compile_and_transfer(&pulses, Some(0.004), None)
            .await
            .unwrap();
        let second = ctx
            .compile_and_transfer(&pulses, Some(0.004), None)
            .await
            .unwrap();

        assert!(first.success && second.success);
        assert_eq!(first.infos, second.infos);
        assert!(first.errors.is_empty());
    }

    #[tokio::test]
    async fn transfer_uploads_selects_and_runs() {
        let mock = Arc::new(
            MockTransport::new()
                .with_reply("SOUR:FREQ:CW?", "1000000000")
                .with_reply("OUTP1:STAT?", "1")
                .with_reply("AWGC:RST?", "2"),
        );
        let awg = Awg5014::new(mock.clone());

        let pulses = vec![analog_pulse(0, "Ch1_A", 0.0, vec![0.5; 2])];
        let report = context()
            .compile_and_transfer(&pulses, Some(0.003), Some(&awg))
            .await
            .unwrap();

        assert!(report.success);
        let transfers = mock.binary_transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].0, "WLIS:WAV:DATA 'demo_Ch1',0,3,");

        let log = mock.log();
        assert!(log.contains(&"SOURCE1:WAVEFORM \"demo_Ch1\"".to_string()));
        // The three unused channels are cleared.
        assert!(log.contains(&"SOURCE2:WAVEFORM \"\"".to_string()));
        assert!(log.contains(&"SOURCE4:WAVEFORM \"\"".to_string()));
        assert!(log.contains(&"OUTP1:STAT ON".to_string()));
        assert!(log.contains(&"AWGC:RUN:IMM".to_string()));
    }

    #[test]
    fn channel_names_parse_strictly() {
        assert_eq!(split_channel("Ch1_A"), Some(("Ch1", 1, "A")));
        assert_eq!(split_channel("Ch4_M2"), Some(("Ch4", 4, "M2")));
        assert_eq!(split_channel("Ch5_A"), None);
        assert_eq!(split_channel("Ch1_M3"), None);
        assert_eq!(split_channel("bogus"), None);
    }
}
