//! Error types for the Keithley 6487 driver.
//!
//! `DriverError` is the single error type returned by every driver, controller and
//! front-end operation. Built with `thiserror`, it keeps the four failure classes
//! the instrument protocol can produce apart so callers can react to each one:
//!
//! - **`InvalidArgument`**: a value outside the instrument's accepted domain. Raised
//!   before any I/O; nothing was sent and no cached state changed. Retry with a
//!   corrected value.
//! - **`Transport`**: the underlying connection failed to open, write or read, or the
//!   operation exceeded the configured timeout. Wraps the adapter's `anyhow::Error`.
//!   Never retried internally; the caller decides whether to reopen.
//! - **`MalformedFrame`**: a `READ?` reply could not be assembled into a full binary
//!   frame within the read attempt cap. Usually a `FORM:ELEM` mismatch.
//! - **`NotConnected`**: the driver was closed, or a Slave role has no Master to borrow.

use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Every failure a driver operation can report.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Value outside the accepted domain; nothing was sent
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Connection failure or timeout reported by the adapter
    #[error("Transport error: {0:#}")]
    Transport(#[source] anyhow::Error),

    /// `READ?` reply too short after the read attempt cap
    #[error("Malformed measurement frame: received {received} bytes, expected at least {expected}")]
    MalformedFrame {
        /// Bytes assembled before giving up
        received: usize,
        /// Frame length required
        expected: usize,
    },

    /// Driver closed, or no Master to borrow from
    #[error("Instrument not connected")]
    NotConnected,
}

impl DriverError {
    /// Shorthand for building an `InvalidArgument` from anything displayable.
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// True for errors raised before the transport was touched.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}
