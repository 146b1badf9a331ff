//! VISA transport for GPIB/USB/Ethernet instruments.
//!
//! Wraps the visa-rs crate and provides async I/O by running the blocking
//! VISA calls on Tokio's blocking executor. Supports resource strings like:
//! - "GPIB0::1::INSTR" (GPIB interface)
//! - "USB0::0x1234::0x5678::SERIAL::INSTR" (USB)
//! - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)
//!
//! Compiled without the `instrument_visa` feature every operation returns a
//! feature-disabled error, so code depending on [`VisaTransport`] still
//! builds on machines without a native VISA installation.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::InstrumentSettings;
use crate::error::InstrResult;
use crate::transport::Transport;

#[cfg(feature = "instrument_visa")]
use crate::error::InstrumentError;
#[cfg(feature = "instrument_visa")]
use log::debug;
#[cfg(feature = "instrument_visa")]
use std::sync::Arc;
#[cfg(feature = "instrument_visa")]
use tokio::sync::Mutex;

#[cfg(feature = "instrument_visa")]
use visa_rs::{DefaultRM, Instrument, VISA};

#[cfg(feature = "instrument_visa")]
type Session = Arc<Mutex<Box<dyn Instrument>>>;

/// VISA transport for instrument communication.
pub struct VisaTransport {
    resource_string: String,
    timeout: Duration,
    write_termination: String,
    read_termination: String,
    #[cfg(feature = "instrument_visa")]
    session: Mutex<Option<Session>>,
}

impl VisaTransport {
    /// Create a transport with default settings (5 s timeout, "\n"
    /// terminators). The connection is not opened yet.
    pub fn new(resource_string: impl Into<String>) -> Self {
        Self {
            resource_string: resource_string.into(),
            timeout: Duration::from_secs(5),
            write_termination: "\n".to_string(),
            read_termination: "\n".to_string(),
            #[cfg(feature = "instrument_visa")]
            session: Mutex::new(None),
        }
    }

    /// Create a transport from instrument settings.
    pub fn from_settings(settings: &InstrumentSettings) -> Self {
        let mut transport = Self::new(settings.resource.clone());
        transport.timeout = settings.timeout;
        transport.write_termination = settings.write_termination.clone();
        transport.read_termination = settings.read_termination.clone();
        transport
    }

    /// Set the read/write timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the line terminator appended to outgoing commands.
    pub fn with_write_termination(mut self, terminator: impl Into<String>) -> Self {
        self.write_termination = terminator.into();
        self
    }

    /// Set the line terminator expected on replies.
    pub fn with_read_termination(mut self, terminator: impl Into<String>) -> Self {
        self.read_termination = terminator.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[cfg(feature = "instrument_visa")]
    async fn current_session(&self) -> InstrResult<Session> {
        self.session
            .lock()
            .await
            .as_ref()
            .cloned()
            .ok_or(InstrumentError::NotConnected)
    }

    #[cfg(not(feature = "instrument_visa"))]
    fn feature_disabled<T>() -> InstrResult<T> {
        Err(crate::error::InstrumentError::FeatureNotEnabled(
            "instrument_visa".to_string(),
        ))
    }
}

#[async_trait]
impl Transport for VisaTransport {
    async fn open(&self) -> InstrResult<()> {
        #[cfg(feature = "instrument_visa")]
        {
            let resource_str = self.resource_string.clone();
            let timeout_ms = self.timeout.as_millis() as u32;

            let instrument = tokio::task::spawn_blocking(move || {
                let rm = DefaultRM::new().map_err(|e| {
                    InstrumentError::Io(format!("failed to create VISA resource manager: {e}"))
                })?;
                let instr = rm.open(&resource_str, timeout_ms, 0).map_err(|e| {
                    InstrumentError::Io(format!("failed to open VISA resource {resource_str}: {e}"))
                })?;
                Ok::<Box<dyn Instrument>, InstrumentError>(instr)
            })
            .await
            .map_err(|e| InstrumentError::Io(format!("VISA open task panicked: {e}")))??;

            *self.session.lock().await = Some(Arc::new(Mutex::new(instrument)));
            debug!(
                "VISA resource '{}' opened with {}ms timeout",
                self.resource_string,
                self.timeout.as_millis()
            );
            Ok(())
        }

        #[cfg(not(feature = "instrument_visa"))]
        Self::feature_disabled()
    }

    async fn close(&self) -> InstrResult<()> {
        #[cfg(feature = "instrument_visa")]
        {
            if self.session.lock().await.take().is_some() {
                debug!("VISA resource '{}' closed", self.resource_string);
            }
            Ok(())
        }

        #[cfg(not(feature = "instrument_visa"))]
        Self::feature_disabled()
    }

    async fn reopen(&self) -> InstrResult<()> {
        #[cfg(feature = "instrument_visa")]
        {
            // Same parameters as the previous open; the session object is
            // simply replaced.
            self.session.lock().await.take();
            self.open().await
        }

        #[cfg(not(feature = "instrument_visa"))]
        Self::feature_disabled()
    }

    async fn is_connected(&self) -> bool {
        #[cfg(feature = "instrument_visa")]
        {
            self.session.lock().await.is_some()
        }

        #[cfg(not(feature = "instrument_visa"))]
        false
    }

    async fn write(&self, command: &str) -> InstrResult<()> {
        #[cfg(feature = "instrument_visa")]
        {
            let session = self.current_session().await?;
            let message = format!("{}{}", command, self.write_termination);
            let command_for_log = command.to_string();
            let timeout_ms = self.timeout.as_millis() as u32;

            tokio::task::spawn_blocking(move || {
                let mut instr = session.blocking_lock();
                instr
                    .set_timeout(timeout_ms)
                    .map_err(|e| InstrumentError::Io(format!("failed to set VISA timeout: {e}")))?;
                instr.write(&message).map_err(|e| {
                    InstrumentError::Io(format!("VISA write failed for {command_for_log}: {e}"))
                })?;
                debug!("VISA write sent: {}", command_for_log.trim());
                Ok(())
            })
            .await
            .map_err(|e| InstrumentError::Io(format!("VISA write task panicked: {e}")))?
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = command;
            Self::feature_disabled()
        }
    }

    async fn query(&self, command: &str) -> InstrResult<String> {
        #[cfg(feature = "instrument_visa")]
        {
            let session = self.current_session().await?;
            let message = format!("{}{}", command, self.write_termination);
            let command_for_log = command.to_string();
            let timeout_ms = self.timeout.as_millis() as u32;

            tokio::task::spawn_blocking(move || {
                let mut instr = session.blocking_lock();
                instr
                    .set_timeout(timeout_ms)
                    .map_err(|e| InstrumentError::Io(format!("failed to set VISA timeout: {e}")))?;
                let reply = instr.query(&message).map_err(|e| {
                    InstrumentError::Io(format!("VISA query failed for {command_for_log}: {e}"))
                })?;
                let reply = reply.trim().to_string();
                debug!("VISA query '{}' -> '{}'", command_for_log.trim(), reply);
                Ok(reply)
            })
            .await
            .map_err(|e| InstrumentError::Io(format!("VISA query task panicked: {e}")))?
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = command;
            Self::feature_disabled()
        }
    }

    async fn write_binary(&self, header: &str, data: &[u8]) -> InstrResult<()> {
        #[cfg(feature = "instrument_visa")]
        {
            // IEEE 488.2 definite-length block: header + #<n><len><bytes>.
            let session = self.current_session().await?;
            let len = data.len().to_string();
            let mut message = Vec::with_capacity(header.len() + len.len() + data.len() + 4);
            message.extend_from_slice(header.as_bytes());
            message.push(b'#');
            message.extend_from_slice(len.len().to_string().as_bytes());
            message.extend_from_slice(len.as_bytes());
            message.extend_from_slice(data);
            message.extend_from_slice(self.write_termination.as_bytes());
            let header_for_log = header.to_string();
            let timeout_ms = self.timeout.as_millis() as u32;

            tokio::task::spawn_blocking(move || {
                let mut instr = session.blocking_lock();
                instr
                    .set_timeout(timeout_ms)
                    .map_err(|e| InstrumentError::Io(format!("failed to set VISA timeout: {e}")))?;
                instr.write_raw(&message).map_err(|e| {
                    InstrumentError::Io(format!(
                        "VISA binary write failed for {header_for_log}: {e}"
                    ))
                })?;
                debug!(
                    "VISA binary block sent: {} ({} bytes)",
                    header_for_log,
                    message.len()
                );
                Ok(())
            })
            .await
            .map_err(|e| InstrumentError::Io(format!("VISA binary task panicked: {e}")))?
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = (header, data);
            Self::feature_disabled()
        }
    }

    fn resource(&self) -> &str {
        &self.resource_string
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_settings() {
        let transport = VisaTransport::new("GPIB0::1::INSTR")
            .with_timeout(Duration::from_millis(2000))
            .with_write_termination("\r\n")
            .with_read_termination("\r\n");
        assert_eq!(transport.resource(), "GPIB0::1::INSTR");
        assert_eq!(transport.timeout(), Duration::from_millis(2000));
    }

    #[test]
    fn from_settings_copies_connection_parameters() {
        let settings = InstrumentSettings {
            resource: "TCPIP0::192.168.0.10::INSTR".to_string(),
            timeout: Duration::from_secs(3),
            ..Default::default()
        };
        let transport = VisaTransport::from_settings(&settings);
        assert_eq!(transport.resource(), "TCPIP0::192.168.0.10::INSTR");
        assert_eq!(transport.timeout(), Duration::from_secs(3));
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn disabled_feature_reports_clearly() {
        let transport = VisaTransport::new("GPIB0::5::INSTR");
        assert!(!transport.is_connected().await);
        let err = transport.open().await.unwrap_err();
        assert!(err.to_string().contains("instrument_visa"));
    }
}
