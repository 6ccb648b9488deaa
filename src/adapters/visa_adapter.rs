//! VISA transport for GPIB/USB/Ethernet instruments
//!
//! Wraps the `visa-rs` crate behind the `instrument_visa` feature. VISA calls block,
//! so they run on Tokio's blocking executor. Without the feature every operation
//! fails with a message naming the feature to enable.

use super::{Transport, LINE_TERMINATOR};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_visa")]
use anyhow::Context;
#[cfg(feature = "instrument_visa")]
use log::debug;
#[cfg(feature = "instrument_visa")]
use std::sync::Arc;
#[cfg(feature = "instrument_visa")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_visa")]
use visa_rs::prelude::*;

#[cfg(not(feature = "instrument_visa"))]
const VISA_DISABLED: &str = "VISA support not enabled. Rebuild with --features instrument_visa";

/// Session timeout attribute value for `timeout`, saturating at `u32::MAX` ms.
#[cfg_attr(not(feature = "instrument_visa"), allow(dead_code))]
fn timeout_millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

/// VISA adapter for instrument communication
///
/// Supports resource strings like:
/// - "GPIB0::22::INSTR" (GPIB interface)
/// - "USB0::0x1234::0x5678::SERIAL::INSTR" (USB)
/// - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)
/// - "ASRL3::INSTR" (serial through VISA)
pub struct VisaAdapter {
    /// VISA resource string (e.g., "GPIB0::22::INSTR")
    pub(crate) resource_string: String,

    /// Session I/O timeout, applied when the resource is opened
    pub(crate) timeout: Duration,

    #[cfg(feature = "instrument_visa")]
    instrument: Option<Arc<Mutex<Instrument>>>,
}

impl VisaAdapter {
    /// Create an unopened adapter
    pub fn new(resource_string: impl Into<String>) -> Self {
        Self {
            resource_string: resource_string.into(),
            timeout: Duration::from_secs(10),
            #[cfg(feature = "instrument_visa")]
            instrument: None,
        }
    }

    /// Set read/write timeout (takes effect on the next `open`)
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// True between a successful `open` and `close`
    pub fn is_open(&self) -> bool {
        #[cfg(feature = "instrument_visa")]
        {
            self.instrument.is_some()
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            false
        }
    }

    /// Open the VISA resource
    pub async fn open(&mut self) -> Result<()> {
        #[cfg(feature = "instrument_visa")]
        {
            let resource_str = self.resource_string.clone();
            let timeout_ms = timeout_millis(self.timeout);

            let instrument = tokio::task::spawn_blocking(move || {
                let rm = DefaultRM::new().context("Failed to create VISA resource manager")?;
                let expr = std::ffi::CString::new(resource_str.as_str())
                    .context("VISA resource string contains a NUL byte")?
                    .into();
                let rsc = rm
                    .find_res(&expr)
                    .with_context(|| format!("VISA resource not found: {}", resource_str))?;
                let instr = rm
                    .open(&rsc, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
                    .with_context(|| format!("Failed to open VISA resource: {}", resource_str))?;
                let tmo = visa_rs::enums::attribute::AttrTmoValue::new_checked(timeout_ms)
                    .ok_or_else(|| anyhow!("VISA timeout {}ms out of range", timeout_ms))?;
                instr
                    .set_attr(tmo)
                    .with_context(|| format!("Failed to set VISA timeout to {}ms", timeout_ms))?;
                Ok::<Instrument, anyhow::Error>(instr)
            })
            .await
            .context("VISA open task panicked")??;

            self.instrument = Some(Arc::new(Mutex::new(instrument)));
            debug!(
                "VISA resource '{}' opened ({}ms driver timeout)",
                self.resource_string,
                self.timeout.as_millis()
            );
            Ok(())
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            Err(anyhow!(VISA_DISABLED))
        }
    }

    #[cfg(feature = "instrument_visa")]
    fn instrument(&self) -> Result<Arc<Mutex<Instrument>>> {
        self.instrument
            .clone()
            .ok_or_else(|| anyhow!("VISA instrument not connected"))
    }
}

#[async_trait]
impl Transport for VisaAdapter {
    async fn write_line(&mut self, command: &str) -> Result<()> {
        #[cfg(feature = "instrument_visa")]
        {
            let instrument = self.instrument()?;
            let line = format!("{}{}", command, LINE_TERMINATOR);
            let command_for_log = command.to_string();

            tokio::task::spawn_blocking(move || {
                use std::io::Write;

                let instr_guard = instrument.blocking_lock();
                (&*instr_guard)
                    .write_all(line.as_bytes())
                    .with_context(|| format!("VISA write failed for: {}", command_for_log))?;

                debug!("VISA command sent: {}", command_for_log);
                Ok(())
            })
            .await
            .context("VISA write task panicked")?
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = (command, LINE_TERMINATOR);
            Err(anyhow!(VISA_DISABLED))
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        #[cfg(feature = "instrument_visa")]
        {
            let instrument = self.instrument()?;

            tokio::task::spawn_blocking(move || -> Result<String> {
                use std::io::BufRead;

                let instr_guard = instrument.blocking_lock();
                let mut reader = std::io::BufReader::new(&*instr_guard);
                let mut line = String::new();
                reader
                    .read_line(&mut line)
                    .context("VISA read failed")?;

                let response = line.trim().to_string();
                debug!("VISA response: {}", response);
                Ok(response)
            })
            .await
            .context("VISA read task panicked")?
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            Err(anyhow!(VISA_DISABLED))
        }
    }

    async fn read_raw(&mut self) -> Result<Vec<u8>> {
        #[cfg(feature = "instrument_visa")]
        {
            let instrument = self.instrument()?;

            tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
                use std::io::Read;

                let instr_guard = instrument.blocking_lock();
                let mut buffer = [0u8; 256];
                let n = (&*instr_guard)
                    .read(&mut buffer)
                    .context("VISA raw read failed")?;

                debug!("VISA raw read returned {} bytes", n);
                Ok(buffer[..n].to_vec())
            })
            .await
            .context("VISA read task panicked")?
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            Err(anyhow!(VISA_DISABLED))
        }
    }

    async fn close(&mut self) -> Result<()> {
        #[cfg(feature = "instrument_visa")]
        {
            if self.instrument.take().is_some() {
                debug!("VISA resource '{}' closed", self.resource_string);
            }
        }
        Ok(())
    }

    fn info(&self) -> String {
        format!(
            "VisaAdapter({} @ {}ms timeout)",
            self.resource_string,
            self.timeout.as_millis()
        )
    }
}
