//! Transport adapters
//!
//! This module contains implementations of the [`Transport`] trait, the byte-stream
//! capability the driver needs from the environment: line-terminated text writes and
//! reads plus raw binary reads.

pub mod mock_adapter;
pub mod serial_adapter;
pub mod visa_adapter;

pub use mock_adapter::MockAdapter;
pub use serial_adapter::SerialAdapter;
pub use visa_adapter::VisaAdapter;

use anyhow::Result;
use async_trait::async_trait;

/// Line terminator used for SCPI text framing in both directions.
pub const LINE_TERMINATOR: &str = "\n";

/// Bidirectional connection to one instrument.
///
/// Implementations do not need to be internally synchronized: the driver holds its
/// own lock around every call sequence.
#[async_trait]
pub trait Transport: Send {
    /// Write one command followed by the line terminator.
    async fn write_line(&mut self, command: &str) -> Result<()>;

    /// Read one line, without its terminator.
    async fn read_line(&mut self) -> Result<String>;

    /// Read the next raw bytes, waiting up to the adapter's timeout for the first one.
    /// An empty chunk means nothing arrived in that time.
    async fn read_raw(&mut self) -> Result<Vec<u8>>;

    /// Release the underlying resource.
    async fn close(&mut self) -> Result<()>;

    /// Human readable description for logging.
    fn info(&self) -> String;

    /// Write a command and read back one line.
    async fn query(&mut self, command: &str) -> Result<String> {
        self.write_line(command).await?;
        self.read_line().await
    }
}

/// Whether an address names a local serial device rather than a VISA resource.
///
/// VISA serial resources (`ASRL3::INSTR`) go through VISA like any other resource.
pub fn is_serial_address(address: &str) -> bool {
    address.starts_with("/dev/") || address.to_ascii_uppercase().starts_with("COM")
}
