//! Keithley 6487 picoammeter / voltage source driver.
//!
//! One physical instrument, one transport, two logical front-ends: a voltage
//! actuator ([`modules::VoltageSource`]) and a current reader
//! ([`modules::CurrentReader`]). One of them is the Master and owns the
//! connection; the other borrows it as a Slave (see [`instrument::controller`]).
//!
//! Layering, bottom-up:
//! - [`adapters`]: the [`adapters::Transport`] trait with serial, VISA and mock
//!   implementations
//! - [`instrument`]: SCPI encoder, binary frame decoder, driver and controller
//! - [`modules`]: actuator and reader front-ends
//! - [`config`] and [`logging`]: ambient configuration and tracing setup

pub mod adapters;
pub mod config;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod modules;

pub use error::{DriverError, DriverResult};
