//! Front-ends over the shared driver: the voltage actuator and the current reader.

pub mod current_reader;
pub mod meta_instruments;
pub mod voltage_source;

pub use current_reader::{CurrentReader, ReaderSetting};
pub use voltage_source::VoltageSource;
