//! Configuration for the Keithley 6487 tools using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/keithley6487.toml` by default)
//! 2. environment variables prefixed with `KEITHLEY_`
//!
//! # Environment Variable Overrides
//!
//! Sections and keys are separated by a double underscore, since keys themselves
//! contain single underscores:
//!
//! ```text
//! KEITHLEY_APPLICATION__LOG_LEVEL=debug
//! KEITHLEY_CONNECTION__RESOURCE="GPIB0::22::INSTR"
//! KEITHLEY_CONNECTION__TIMEOUT_MS=5000
//! KEITHLEY_READER__RANGE=2nA
//! ```
//!
//! # Example
//!
//! ```no_run
//! use keithley6487::config::Keithley6487Config;
//!
//! let config = Keithley6487Config::load_from("config/keithley6487.toml")?;
//! println!("Resource: {}", config.connection.resource);
//! # Ok::<(), keithley6487::config::ConfigError>(())
//! ```

use crate::instrument::scpi::{CurrentRange, SourceRange, NPLC_MAX, NPLC_MIN};
use crate::instrument::ControllerStatus;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default configuration file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/keithley6487.toml";

/// Shortest response timeout accepted. Slow NPLC settings need this long for one reading.
pub const MIN_TIMEOUT_MS: u64 = 2000;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File or environment could not be read or deserialized
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values parsed but are inconsistent or out of range
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Keithley6487Config {
    /// `[application]`
    #[serde(default)]
    pub application: ApplicationConfig,
    /// `[connection]`
    #[serde(default)]
    pub connection: ConnectionSettings,
    /// `[reader]`
    #[serde(default)]
    pub reader: ReaderSettings,
    /// `[source]`
    #[serde(default)]
    pub source: SourceSettings,
    /// `[roles]`
    #[serde(default)]
    pub roles: RoleSettings,
}

/// Application-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// One of trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// How to reach the instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// VISA resource string or serial device path
    #[serde(default = "default_resource")]
    pub resource: String,
    /// Response timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Only used for `/dev/…` and `COM…` addresses
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

impl ConnectionSettings {
    /// `timeout_ms` as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            resource: default_resource(),
            timeout_ms: default_timeout_ms(),
            baud_rate: default_baud_rate(),
        }
    }
}

/// Measurement settings applied by the current reader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderSettings {
    /// Current range token, `2nA` to `20mA`
    #[serde(default = "default_range")]
    pub range: CurrentRange,
    /// Integration time in power line cycles
    #[serde(default = "default_nplc")]
    pub nplc: f64,
    /// Zero check on after configuration
    #[serde(default = "default_zerocheck")]
    pub zerocheck: bool,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            range: default_range(),
            nplc: default_nplc(),
            zerocheck: default_zerocheck(),
        }
    }
}

/// Voltage source settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSettings {
    /// 10, 50 or 500 V
    #[serde(default = "default_source_range")]
    pub range: SourceRange,
    /// Output level in volts, within the range
    #[serde(default)]
    pub voltage: f64,
    /// Source output on
    #[serde(default)]
    pub operate: bool,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            range: default_source_range(),
            voltage: 0.0,
            operate: false,
        }
    }
}

/// Which front-end owns the connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleSettings {
    /// Role of the voltage source front-end
    #[serde(default = "default_actuator_role")]
    pub actuator: ControllerStatus,
    /// Role of the current reader front-end
    #[serde(default = "default_reader_role")]
    pub reader: ControllerStatus,
}

impl Default for RoleSettings {
    fn default() -> Self {
        Self {
            actuator: default_actuator_role(),
            reader: default_reader_role(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_resource() -> String {
    "GPIB0::22::INSTR".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_range() -> CurrentRange {
    CurrentRange::Ma20
}

fn default_nplc() -> f64 {
    5.0
}

fn default_zerocheck() -> bool {
    true
}

fn default_source_range() -> SourceRange {
    SourceRange::V10
}

fn default_actuator_role() -> ControllerStatus {
    ControllerStatus::Master
}

fn default_reader_role() -> ControllerStatus {
    ControllerStatus::Slave
}

impl Keithley6487Config {
    /// Load configuration from the default location
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or validation fails.
    /// A missing file is not an error: defaults and environment apply.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path, then validate it
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("KEITHLEY_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Resource is not empty, timeout is at least [`MIN_TIMEOUT_MS`], baud rate is set
    /// - NPLC is within the instrument limits
    /// - Source voltage is within the source range
    /// - Exactly one role is Master
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.connection.resource.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "connection.resource cannot be empty".to_string(),
            ));
        }

        if self.connection.timeout_ms < MIN_TIMEOUT_MS {
            return Err(ConfigError::ValidationError(format!(
                "connection.timeout_ms {} is below the minimum of {} ms",
                self.connection.timeout_ms, MIN_TIMEOUT_MS
            )));
        }

        if self.connection.baud_rate == 0 {
            return Err(ConfigError::ValidationError(
                "connection.baud_rate must be greater than 0".to_string(),
            ));
        }

        let nplc = self.reader.nplc;
        if !nplc.is_finite() || !(NPLC_MIN..=NPLC_MAX).contains(&nplc) {
            return Err(ConfigError::ValidationError(format!(
                "reader.nplc {} must be between {} and {}",
                nplc, NPLC_MIN, NPLC_MAX
            )));
        }

        let limit = f64::from(self.source.range.volts());
        if !self.source.voltage.is_finite() || self.source.voltage.abs() > limit {
            return Err(ConfigError::ValidationError(format!(
                "source.voltage {} outside the {} V source range",
                self.source.voltage, limit
            )));
        }

        let masters = [self.roles.actuator, self.roles.reader]
            .iter()
            .filter(|status| **status == ControllerStatus::Master)
            .count();
        if masters != 1 {
            return Err(ConfigError::ValidationError(format!(
                "exactly one of roles.actuator / roles.reader must be Master (found {})",
                masters
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Keithley6487Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection.resource, "GPIB0::22::INSTR");
        assert_eq!(config.connection.timeout(), Duration::from_secs(10));
        assert_eq!(config.reader.range, CurrentRange::Ma20);
        assert_eq!(config.reader.nplc, 5.0);
        assert!(config.reader.zerocheck);
        assert_eq!(config.source.range, SourceRange::V10);
        assert_eq!(config.roles.actuator, ControllerStatus::Master);
        assert_eq!(config.roles.reader, ControllerStatus::Slave);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = Keithley6487Config::default();
        config.application.log_level = "verbose".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_timeout_minimum() {
        let mut config = Keithley6487Config::default();
        config.connection.timeout_ms = 1999;
        assert!(config.validate().is_err());
        config.connection.timeout_ms = MIN_TIMEOUT_MS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_nplc_bounds() {
        let mut config = Keithley6487Config::default();
        config.reader.nplc = 60.0;
        assert!(config.validate().is_err());
        config.reader.nplc = 0.01;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_source_voltage_within_range() {
        let mut config = Keithley6487Config::default();
        config.source.voltage = 12.0;
        assert!(config.validate().is_err());
        config.source.range = SourceRange::V50;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_exactly_one_master() {
        let mut config = Keithley6487Config::default();
        config.roles.reader = ControllerStatus::Master;
        assert!(config.validate().unwrap_err().to_string().contains("found 2"));
        config.roles.actuator = ControllerStatus::Slave;
        config.roles.reader = ControllerStatus::Slave;
        assert!(config.validate().unwrap_err().to_string().contains("found 0"));
    }
}
