//! Meta Instrument Traits
//!
//! Abstract device capabilities shared by the front-ends built on top of the
//! Keithley 6487 driver. A front-end implements [`MetaInstrument`] for discovery and
//! one capability trait for its domain:
//! - [`Positioner`] for the voltage source, treated as a one-axis actuator in volts
//! - [`Ammeter`] for the current reader
//!
//! # Example
//!
//! ```rust,no_run
//! use keithley6487::instrument::Controller;
//! use keithley6487::modules::meta_instruments::{Ammeter, Positioner};
//! use keithley6487::modules::{CurrentReader, VoltageSource};
//! use std::time::Duration;
//!
//! # async fn run() -> keithley6487::error::DriverResult<()> {
//! let master = Controller::master("GPIB0::22::INSTR", Duration::from_secs(10)).await?;
//! let mut source = VoltageSource::new(master.clone());
//! let mut reader = CurrentReader::new(Controller::slave(&master));
//!
//! source.move_absolute(2.5).await?;
//! let (current, voltage) = reader.read_current().await?;
//! println!("{current} A at {voltage} V");
//! # Ok(())
//! # }
//! ```

use crate::error::DriverResult;
use async_trait::async_trait;

/// Base meta instrument trait - all front-ends implement this.
pub trait MetaInstrument: Send + Sync {
    /// Identifier of this front-end instance
    fn instrument_id(&self) -> &str;

    /// Type category (e.g., "voltage_source", "ammeter")
    fn instrument_type(&self) -> &str;

    /// Capability names this front-end supports
    fn capabilities(&self) -> Vec<String>;
}

/// One-axis actuator capabilities.
#[async_trait]
pub trait Positioner: MetaInstrument {
    /// Move to an absolute position in axis units.
    ///
    /// Positions outside the axis bounds are clamped. Returns the position actually
    /// commanded.
    async fn move_absolute(&mut self, position: f64) -> DriverResult<f64>;

    /// Move relative to the last commanded position.
    async fn move_relative(&mut self, delta: f64) -> DriverResult<f64>;

    /// Last commanded position. Not read back from hardware.
    async fn get_position(&self) -> DriverResult<f64>;

    /// Return to the axis home position.
    async fn home(&mut self) -> DriverResult<()>;

    /// Stop any pending action.
    async fn stop_motion(&mut self) -> DriverResult<()>;
}

/// Current meter capabilities.
#[async_trait]
pub trait Ammeter: MetaInstrument {
    /// Take one reading: (current in A, source voltage in V).
    async fn read_current(&mut self) -> DriverResult<(f64, f64)>;

    /// Select a current range by token ("20mA" … "2nA").
    async fn set_range(&mut self, token: &str) -> DriverResult<()>;

    /// Enable or disable the input zero-check.
    async fn zero_check(&mut self, on: bool) -> DriverResult<()>;
}
