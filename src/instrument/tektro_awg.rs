//! Tektronix AWG5014 arbitrary waveform generator.
//!
//! One physical connection is shared by the main driver and the per-channel
//! handles derived from it. Command sequences that must stay atomic (write
//! then immediate readback) take the driver lock first; the lock is
//! acquired by bounded polling so a wedged holder surfaces as a
//! communication error instead of a deadlock.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::sleep;

use crate::error::{InstrResult, InstrumentError};
use crate::instrument::cache::PropertyCache;
use crate::instrument::session::InstrumentSession;
use crate::transport::Transport;

const LOCK_ATTEMPTS: u32 = 50;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Run state reported by `AWGC:RST?`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    WaitingForTrigger,
    Running,
}

/// AWG5014 driver.
#[derive(Clone)]
pub struct Awg5014 {
    session: Arc<InstrumentSession>,
    lock: Arc<Mutex<()>>,
}

impl Awg5014 {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            session: Arc::new(InstrumentSession::new(transport, PropertyCache::disabled())),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn session(&self) -> &InstrumentSession {
        &self.session
    }

    pub async fn open(&self) -> InstrResult<()> {
        self.session.open().await
    }

    pub async fn close(&self) -> InstrResult<()> {
        self.session.close().await
    }

    /// Acquire the shared connection lock by bounded polling.
    pub(crate) async fn acquire(&self) -> InstrResult<MutexGuard<'_, ()>> {
        for _ in 0..LOCK_ATTEMPTS {
            if let Ok(guard) = self.lock.try_lock() {
                return Ok(guard);
            }
            sleep(LOCK_RETRY_DELAY).await;
        }
        Err(InstrumentError::LockTimeout)
    }

    /// The channels this model exposes.
    pub fn defined_channels(&self) -> [u8; 4] {
        [1, 2, 3, 4]
    }

    /// A handle for one output channel. Returns `None` for a channel number
    /// the model does not have.
    pub fn channel(&self, number: u8) -> Option<AwgChannel> {
        if !self.defined_channels().contains(&number) {
            return None;
        }
        Some(AwgChannel {
            awg: self.clone(),
            number,
        })
    }

    /// Upload a waveform under `name`, replacing any previous waveform of
    /// that name. The payload is the interleaved 16-bit little-endian
    /// sample buffer, two bytes per sample.
    pub async fn upload_waveform(&self, name: &str, waveform: &[u8]) -> InstrResult<()> {
        let sample_count = waveform.len() / 2;
        self.session
            .write(&format!("WLIST:WAVEFORM:DELETE '{name}'"))
            .await?;
        self.session
            .write(&format!(
                "WLIST:WAVEFORM:NEW '{name}' , {sample_count}, INTeger"
            ))
            .await?;
        let header = format!("WLIS:WAV:DATA '{name}',0,{sample_count},");
        self.session.write_binary(&header, waveform).await?;
        self.session.write("*WAI").await
    }

    /// Remove every element of the device sequence.
    pub async fn clear_sequence(&self) -> InstrResult<()> {
        self.session.write("SEQuence:LENGth 0").await
    }

    /// Sampling frequency in Hz.
    pub async fn sampling_frequency(&self) -> InstrResult<f64> {
        self.session.query_f64("SOUR:FREQ:CW?").await
    }

    pub async fn set_sampling_frequency(&self, value: f64) -> InstrResult<()> {
        self.session
            .set_and_confirm_f64(
                "sampling_frequency",
                &format!("SOUR:FREQ:CW {value}"),
                "SOUR:FREQ:CW?",
                value,
                1e-12,
            )
            .await
    }

    pub async fn run_state(&self) -> InstrResult<RunState> {
        let reply = self.session.query("AWGC:RST?").await?;
        match reply.trim() {
            "0" => Ok(RunState::Stopped),
            "1" => Ok(RunState::WaitingForTrigger),
            "2" => Ok(RunState::Running),
            other => Err(InstrumentError::ParseReply {
                command: "AWGC:RST?".to_string(),
                reply: other.to_string(),
            }),
        }
    }

    /// Start or stop playback, confirmed through the run state.
    pub async fn set_running(&self, run: bool) -> InstrResult<()> {
        let transport = Arc::clone(self.session.transport());
        self.session
            .secured(move || {
                let transport = Arc::clone(&transport);
                async move {
                    if run {
                        transport.write("AWGC:RUN:IMM").await?;
                        let reply = transport.query("AWGC:RST?").await?;
                        if !matches!(reply.trim(), "1" | "2") {
                            return Err(InstrumentError::ReadbackMismatch {
                                property: "running".to_string(),
                                requested: "1 or 2".to_string(),
                                reported: reply.trim().to_string(),
                            });
                        }
                    } else {
                        transport.write("AWGC:STOP:IMM").await?;
                        let reply = transport.query("AWGC:RST?").await?;
                        if reply.trim() != "0" {
                            return Err(InstrumentError::ReadbackMismatch {
                                property: "running".to_string(),
                                requested: "0".to_string(),
                                reported: reply.trim().to_string(),
                            });
                        }
                    }
                    Ok(())
                }
            })
            .await
    }

    /// Run mode: CONT, TRIG, GAT or SEQ.
    pub async fn run_mode(&self) -> InstrResult<String> {
        let reply = self.session.query("AWGControl:RMODe?").await?;
        Ok(reply.trim().to_string())
    }

    pub async fn set_run_mode(&self, mode: &str) -> InstrResult<()> {
        let code = match mode.to_uppercase().as_str() {
            "CONT" | "CONTINUOUS" => "CONT",
            "TRIG" | "TRIGGERED" => "TRIG",
            "GAT" | "GATED" => "GAT",
            "SEQ" | "SEQUENCE" => "SEQ",
            other => {
                return Err(InstrumentError::InvalidValue {
                    property: "run_mode".to_string(),
                    reason: format!("unknown run mode '{other}'"),
                })
            }
        };
        self.session
            .set_and_confirm_str(
                "run_mode",
                &format!("AWGControl:RMODe {code}"),
                "AWGControl:RMODe?",
                code,
            )
            .await
    }

    /// Whether the sample clock is slaved to an external reference.
    pub async fn oscillator_reference_external(&self) -> InstrResult<bool> {
        let reply = self.session.query("SOUR:ROSC:SOUR?").await?;
        match reply.trim() {
            "EXT" => Ok(true),
            "INT" => Ok(false),
            other => Err(InstrumentError::ParseReply {
                command: "SOUR:ROSC:SOUR?".to_string(),
                reply: other.to_string(),
            }),
        }
    }

    pub async fn set_oscillator_reference_external(&self, external: bool) -> InstrResult<()> {
        let code = if external { "EXT" } else { "INT" };
        self.session
            .set_and_confirm_str(
                "oscillator_reference",
                &format!("SOUR:ROSC:SOUR {code}"),
                "SOUR:ROSC:SOUR?",
                code,
            )
            .await
    }
}

/// Handle for a single AWG output channel, sharing the parent's connection.
#[derive(Clone)]
pub struct AwgChannel {
    awg: Awg5014,
    number: u8,
}

impl AwgChannel {
    pub fn number(&self) -> u8 {
        self.number
    }

    /// Select the waveform played by this channel.
    pub async fn select_sequence(&self, name: &str) -> InstrResult<()> {
        let _guard = self.awg.acquire().await?;
        self.awg
            .session
            .write(&format!("SOURCE{}:WAVEFORM \"{}\"", self.number, name))
            .await
    }

    /// Clear the waveform played by this channel.
    pub async fn clear_sequence(&self) -> InstrResult<()> {
        let _guard = self.awg.acquire().await?;
        self.awg
            .session
            .write(&format!("SOURCE{}:WAVEFORM \"\"", self.number))
            .await
    }

    pub async fn output_state(&self) -> InstrResult<bool> {
        let _guard = self.awg.acquire().await?;
        let reply = self
            .awg
            .session
            .query(&format!("OUTP{}:STAT?", self.number))
            .await?;
        match reply.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(InstrumentError::ParseReply {
                command: format!("OUTP{}:STAT?", self.number),
                reply: other.to_string(),
            }),
        }
    }

    pub async fn set_output_state(&self, on: bool) -> InstrResult<()> {
        let _guard = self.awg.acquire().await?;
        let (word, expected) = if on { ("ON", "1") } else { ("OFF", "0") };
        self.awg
            .session
            .set_and_confirm_str(
                "output_state",
                &format!("OUTP{}:STAT {}", self.number, word),
                &format!("OUTP{}:STAT?", self.number),
                expected,
            )
            .await
    }

    /// Peak to peak amplitude in volts.
    pub async fn vpp(&self) -> InstrResult<f64> {
        let _guard = self.awg.acquire().await?;
        self.awg
            .session
            .query_f64(&format!("SOURce{}:VOLTage?", self.number))
            .await
    }

    pub async fn set_vpp(&self, value: f64) -> InstrResult<()> {
        let _guard = self.awg.acquire().await?;
        self.awg
            .session
            .set_and_confirm_f64(
                "vpp",
                &format!("SOURce{}:VOLTage {}", self.number, value),
                &format!("SOURce{}:VOLTage?", self.number),
                value,
                1e-12,
            )
            .await
    }

    /// Analog offset in volts.
    pub async fn offset(&self) -> InstrResult<f64> {
        let _guard = self.awg.acquire().await?;
        self.awg
            .session
            .query_f64(&format!(
                "SOURce{}:VOLTage:LEVel:IMMediate:OFFSet?",
                self.number
            ))
            .await
    }

    pub async fn set_offset(&self, value: f64) -> InstrResult<()> {
        let _guard = self.awg.acquire().await?;
        self.awg
            .session
            .set_and_confirm_f64(
                "offset",
                &format!(
                    "SOURce{}:VOLTage:LEVel:IMMediate:OFFSet {}",
                    self.number, value
                ),
                &format!("SOURce{}:VOLTage:LEVel:IMMediate:OFFSet?", self.number),
                value,
                1e-12,
            )
            .await
    }

    /// High level of a marker output in volts.
    pub async fn marker_high_voltage(&self, marker: u8) -> InstrResult<f64> {
        let _guard = self.awg.acquire().await?;
        self.awg
            .session
            .query_f64(&format!(
                "SOURce{}:MARK{}:VOLTage:HIGH?",
                self.number, marker
            ))
            .await
    }

    pub async fn set_marker_high_voltage(&self, marker: u8, value: f64) -> InstrResult<()> {
        let _guard = self.awg.acquire().await?;
        self.awg
            .session
            .set_and_confirm_f64(
                "marker_high_voltage",
                &format!("SOURce{}:MARK{}:VOLTage:HIGH {}", self.number, marker, value),
                &format!("SOURce{}:MARK{}:VOLTage:HIGH?", self.number, marker),
                value,
                1e-12,
            )
            .await
    }

    /// Low level of a marker output in volts.
    pub async fn marker_low_voltage(&self, marker: u8) -> InstrResult<f64> {
        let _guard = self.awg.acquire().await?;
        self.awg
            .session
            .query_f64(&format!(
                "SOURce{}:MARK{}:VOLTage:LOW?",
                self.number, marker
            ))
            .await
    }

    pub async fn set_marker_low_voltage(&self, marker: u8, value: f64) -> InstrResult<()> {
        let _guard = self.awg.acquire().await?;
        self.awg
            .session
            .set_and_confirm_f64(
                "marker_low_voltage",
                &format!("SOURce{}:MARK{}:VOLTage:LOW {}", self.number, marker, value),
                &format!("SOURce{}:MARK{}:VOLTage:LOW?", self.number, marker),
                value,
                1e-12,
            )
            .await
    }

    /// Channel skew in seconds.
    pub async fn delay(&self) -> InstrResult<f64> {
        let _guard = self.awg.acquire().await?;
        self.awg
            .session
            .query_f64(&format!("SOURce{}:DEL:ADJ?", self.number))
            .await
    }

    pub async fn set_delay(&self, value: f64) -> InstrResult<()> {
        let _guard = self.awg.acquire().await?;
        self.awg
            .session
            .set_and_confirm_f64(
                "delay",
                &format!("SOURce{}:DEL:ADJ {}", self.number, value),
                &format!("SOURce{}:DEL:ADJ?", self.number),
                value,
                1e-12,
            )
            .await
    }

    /// Phase adjustment in degrees.
    pub async fn phase(&self) -> InstrResult<f64> {
        let _guard = self.awg.acquire().await?;
        self.awg
            .session
            .query_f64(&format!("SOURce{}:PHAS:ADJ?", self.number))
            .await
    }

    pub async fn set_phase(&self, value: f64) -> InstrResult<()> {
        let _guard = self.awg.acquire().await?;
        self.awg
            .session
            .set_and_confirm_f64(
                "phase",
                &format!("SOURce{}:PHAS:ADJ {}", self.number, value),
                &format!("SOURce{}:PHAS:ADJ?", self.number),
                value,
                1e-12,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[tokio::test]
    async fn upload_deletes_creates_then_transfers() {
        let mock = Arc::new(MockTransport::new());
        let awg = Awg5014::new(mock.clone());
        let payload = vec![0x00u8, 0x20, 0xff, 0x3f];

        awg.upload_waveform("seq_Ch1", &payload).await.unwrap();

        assert_eq!(
            mock.log(),
            vec![
                "WLIST:WAVEFORM:DELETE 'seq_Ch1'",
                "WLIST:WAVEFORM:NEW 'seq_Ch1' , 2, INTeger",
                "*WAI",
            ]
        );
        let transfers = mock.binary_transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].0, "WLIS:WAV:DATA 'seq_Ch1',0,2,");
        assert_eq!(transfers[0].1, payload);
    }

    #[tokio::test]
    async fn channel_handles_exist_for_defined_channels_only() {
        let awg = Awg5014::new(Arc::new(MockTransport::new()));
        assert!(awg.channel(1).is_some());
        assert!(awg.channel(4).is_some());
        assert!(awg.channel(5).is_none());
    }

    #[tokio::test]
    async fn select_sequence_takes_the_shared_lock() {
        let mock = Arc::new(MockTransport::new());
        let awg = Awg5014::new(mock.clone());
        let channel = awg.channel(2).unwrap();

        channel.select_sequence("demo_Ch2").await.unwrap();
        assert_eq!(mock.log(), vec!["SOURCE2:WAVEFORM \"demo_Ch2\""]);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_acquisition_gives_up_after_bounded_polling() {
        let awg = Awg5014::new(Arc::new(MockTransport::new()));
        let guard = awg.acquire().await.unwrap();

        let contender = awg.clone();
        let result = contender.acquire().await;
        assert!(matches!(result, Err(InstrumentError::LockTimeout)));
        drop(guard);
        assert!(awg.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn run_state_decodes_the_three_states() {
        let mock = Arc::new(MockTransport::new().with_reply("AWGC:RST?", "2"));
        let awg = Awg5014::new(mock.clone());
        assert_eq!(awg.run_state().await.unwrap(), RunState::Running);

        awg.set_running(true).await.unwrap();
        assert_eq!(mock.count_sent("AWGC:RUN:IMM"), 1);

        mock.set_reply("AWGC:RST?", "0");
        awg.set_running(false).await.unwrap();
        assert_eq!(mock.count_sent("AWGC:STOP:IMM"), 1);
    }

    #[tokio::test]
    async fn output_state_round_trips() {
        let mock = Arc::new(MockTransport::new().with_reply("OUTP1:STAT?", "1"));
        let awg = Awg5014::new(mock.clone());
        let channel = awg.channel(1).unwrap();

        channel.set_output_state(true).await.unwrap();
        assert!(channel.output_state().await.unwrap());
        assert_eq!(mock.count_sent("OUTP1:STAT ON"), 1);
    }

    #[tokio::test]
    async fn invalid_run_mode_is_rejected_before_any_io() {
        let mock = Arc::new(MockTransport::new());
        let awg = Awg5014::new(mock.clone());
        assert!(awg.set_run_mode("bogus").await.is_err());
        assert!(mock.log().is_empty());
    }
}
