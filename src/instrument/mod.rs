//! Keithley 6487 instrument support.
//!
//! - [`scpi`]: command encoder
//! - [`frame`]: binary `READ?` reply decoder
//! - [`keithley_6487`]: the driver owning one transport
//! - [`controller`]: Master/Slave sharing of that driver

pub mod controller;
pub mod frame;
pub mod keithley_6487;
pub mod scpi;

pub use controller::{Controller, ControllerStatus};
pub use frame::MeasurementSample;
pub use keithley_6487::{InstrumentState, Keithley6487};
pub use scpi::{CurrentRange, MeasurementMode, SourceRange};
