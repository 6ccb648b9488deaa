//! Serial transport for RS-232 connected instruments
//!
//! Wraps the `serialport` crate. All port I/O is blocking, so every call runs on
//! Tokio's blocking executor.

use super::{Transport, LINE_TERMINATOR};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use anyhow::Context;
#[cfg(feature = "instrument_serial")]
use log::debug;
#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;

/// Port-level read timeout. Reads retry on it until the adapter's own deadline.
#[cfg_attr(not(feature = "instrument_serial"), allow(dead_code))]
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Read whatever arrives next, polling until `deadline` has elapsed.
///
/// Port polls time out after [`POLL_TIMEOUT`]; those are retried so a slow reply
/// (long integration times) still arrives in one call. Returns an empty chunk only
/// once the deadline passes with nothing received.
#[cfg_attr(not(feature = "instrument_serial"), allow(dead_code))]
fn read_chunk<R: std::io::Read + ?Sized>(
    reader: &mut R,
    deadline: Duration,
) -> std::io::Result<Vec<u8>> {
    let mut buffer = [0u8; 256];
    let start = std::time::Instant::now();

    loop {
        match reader.read(&mut buffer) {
            Ok(n) => return Ok(buffer[..n].to_vec()),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                if start.elapsed() >= deadline {
                    return Ok(Vec::new());
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Serial adapter for RS-232 communication
///
/// Supports device paths such as `/dev/ttyUSB0` and `COM3`.
pub struct SerialAdapter {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// Baud rate (e.g., 9600, 115200)
    baud_rate: u32,

    /// Overall deadline for one line or raw read
    timeout: Duration,

    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialAdapter {
    /// Create an unopened adapter
    ///
    /// # Arguments
    /// * `port_name` - Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    /// * `baud_rate` - Communication speed (e.g., 9600, 115200)
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: Duration::from_secs(10),
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    /// Set the read deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Device path or COM name
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Configured line speed
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// True between a successful `open` and `close`
    pub fn is_open(&self) -> bool {
        #[cfg(feature = "instrument_serial")]
        {
            self.port.is_some()
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            false
        }
    }

    /// Open the port
    pub async fn open(&mut self) -> Result<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port_name = self.port_name.clone();
            let baud_rate = self.baud_rate;

            let port = tokio::task::spawn_blocking(move || {
                serialport::new(&port_name, baud_rate)
                    .timeout(POLL_TIMEOUT)
                    .open()
                    .with_context(|| {
                        format!(
                            "Failed to open serial port '{}' at {} baud",
                            port_name, baud_rate
                        )
                    })
            })
            .await
            .context("Serial open task panicked")??;

            self.port = Some(Arc::new(Mutex::new(port)));
            debug!(
                "Serial port '{}' opened at {} baud",
                self.port_name, self.baud_rate
            );
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(anyhow!(
                "Serial support not enabled. Rebuild with --features instrument_serial"
            ))
        }
    }

    #[cfg(feature = "instrument_serial")]
    fn port(&self) -> Result<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port
            .clone()
            .ok_or_else(|| anyhow!("Serial port '{}' not open", self.port_name))
    }
}

#[async_trait]
impl Transport for SerialAdapter {
    async fn write_line(&mut self, command: &str) -> Result<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port()?;
            let line = format!("{}{}", command, LINE_TERMINATOR);
            let command_for_log = command.to_string();

            tokio::task::spawn_blocking(move || {
                use std::io::Write;

                let mut port_guard = port.blocking_lock();
                port_guard
                    .write_all(line.as_bytes())
                    .context("Failed to write to serial port")?;
                port_guard.flush().context("Failed to flush serial port")?;

                debug!("Sent serial command: {}", command_for_log);
                Ok(())
            })
            .await
            .context("Serial I/O task panicked")?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = (command, LINE_TERMINATOR);
            Err(anyhow!(
                "Serial support not enabled. Rebuild with --features instrument_serial"
            ))
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port()?;
            let timeout = self.timeout;
            let delimiter = LINE_TERMINATOR.as_bytes()[0];

            tokio::task::spawn_blocking(move || -> Result<String> {
                use std::io::Read;

                let mut port_guard = port.blocking_lock();
                let mut response = Vec::new();
                let mut byte = [0u8; 1];
                let start = std::time::Instant::now();

                loop {
                    if start.elapsed() > timeout {
                        return Err(anyhow!("Serial read timeout after {:?}", timeout));
                    }

                    match port_guard.read(&mut byte) {
                        Ok(0) => return Err(anyhow!("Unexpected EOF on serial port")),
                        Ok(_) if byte[0] == delimiter => break,
                        Ok(_) => response.push(byte[0]),
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                        Err(e) => return Err(anyhow!("Serial read error: {}", e)),
                    }
                }

                let response = String::from_utf8_lossy(&response).trim().to_string();
                debug!("Received serial response: {}", response);
                Ok(response)
            })
            .await
            .context("Serial I/O task panicked")?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(anyhow!(
                "Serial support not enabled. Rebuild with --features instrument_serial"
            ))
        }
    }

    async fn read_raw(&mut self) -> Result<Vec<u8>> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port()?;
            let timeout = self.timeout;

            tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {

                let mut port_guard = port.blocking_lock();
                let chunk = read_chunk(&mut *port_guard, timeout)
                    .map_err(|e| anyhow!("Serial read error: {}", e))?;
                debug!("Received {} raw bytes from serial port", chunk.len());
                Ok(chunk)
            })
            .await
            .context("Serial I/O task panicked")?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(anyhow!(
                "Serial support not enabled. Rebuild with --features instrument_serial"
            ))
        }
    }

    async fn close(&mut self) -> Result<()> {
        #[cfg(feature = "instrument_serial")]
        {
            if self.port.take().is_some() {
                debug!("Serial port '{}' closed", self.port_name);
            }
        }
        Ok(())
    }

    fn info(&self) -> String {
        format!("SerialAdapter({} @ {} baud)", self.port_name, self.baud_rate)
    }
}
