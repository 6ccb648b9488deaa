//! SCPI command encoder for the Keithley 6487.
//!
//! Pure formatting: every function here turns typed or token parameters into the
//! ASCII command string the instrument accepts. Nothing is written to the
//! transport from this module. Validation failures come back as
//! [`DriverError::InvalidArgument`] so the driver can reject a value before any I/O.

use crate::error::{DriverError, DriverResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lower NPLC limit documented by the instrument.
pub const NPLC_MIN: f64 = 0.01;
/// Upper NPLC limit documented by the instrument.
pub const NPLC_MAX: f64 = 50.0;

/// Measurement function selected with `CONF:<mode>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasurementMode {
    /// Current
    #[serde(rename = "CURR")]
    Current,
    /// Voltage
    #[serde(rename = "VOLT")]
    Voltage,
    /// Resistance
    #[serde(rename = "RES")]
    Resistance,
    /// Charge
    #[serde(rename = "CHAR")]
    Charge,
}

impl MeasurementMode {
    /// SCPI mnemonic used on the wire.
    pub fn as_scpi(self) -> &'static str {
        match self {
            Self::Current => "CURR",
            Self::Voltage => "VOLT",
            Self::Resistance => "RES",
            Self::Charge => "CHAR",
        }
    }
}

impl FromStr for MeasurementMode {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CURR" => Ok(Self::Current),
            "VOLT" => Ok(Self::Voltage),
            "RES" => Ok(Self::Resistance),
            "CHAR" => Ok(Self::Charge),
            other => Err(DriverError::invalid(format!(
                "mode '{}' not in [CURR, VOLT, RES, CHAR]",
                other
            ))),
        }
    }
}

impl fmt::Display for MeasurementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_scpi())
    }
}

/// Current measurement range, one decade per step from 20 mA down to 2 nA.
///
/// Each range is sent as its full-scale value `2E-<exp>`, so the token `"20mA"`
/// becomes `2E-2` and `"2nA"` becomes `2E-9`.
/// Current measurement range, one per decade from 2 nA to 20 mA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CurrentRange {
    /// 20 mA
    #[serde(rename = "20mA")]
    Ma20,
    /// 2 mA
    #[serde(rename = "2mA")]
    Ma2,
    /// 200 µA
    #[serde(rename = "200uA")]
    Ua200,
    /// 20 µA
    #[serde(rename = "20uA")]
    Ua20,
    /// 2 µA
    #[serde(rename = "2uA")]
    Ua2,
    /// 200 nA
    #[serde(rename = "200nA")]
    Na200,
    /// 20 nA
    #[serde(rename = "20nA")]
    Na20,
    /// 2 nA
    #[serde(rename = "2nA")]
    Na2,
}

impl CurrentRange {
    /// All ranges, largest first.
    pub const ALL: [CurrentRange; 8] = [
        Self::Ma20,
        Self::Ma2,
        Self::Ua200,
        Self::Ua20,
        Self::Ua2,
        Self::Na200,
        Self::Na20,
        Self::Na2,
    ];

    /// Base-10 exponent of the range's full-scale value.
    pub fn exponent(self) -> i32 {
        match self {
            Self::Ma20 => -2,
            Self::Ma2 => -3,
            Self::Ua200 => -4,
            Self::Ua20 => -5,
            Self::Ua2 => -6,
            Self::Na200 => -7,
            Self::Na20 => -8,
            Self::Na2 => -9,
        }
    }

    /// Token as shown to users ("20mA" … "2nA").
    pub fn token(self) -> &'static str {
        match self {
            Self::Ma20 => "20mA",
            Self::Ma2 => "2mA",
            Self::Ua200 => "200uA",
            Self::Ua20 => "20uA",
            Self::Ua2 => "2uA",
            Self::Na200 => "200nA",
            Self::Na20 => "20nA",
            Self::Na2 => "2nA",
        }
    }

    /// Full-scale current in amperes.
    pub fn full_scale_amps(self) -> f64 {
        2.0 * 10f64.powi(self.exponent())
    }
}

impl FromStr for CurrentRange {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|range| range.token() == s)
            .ok_or_else(|| {
                DriverError::invalid(format!(
                    "current range '{}' not in [20mA, 2mA, 200uA, 20uA, 2uA, 200nA, 20nA, 2nA]",
                    s
                ))
            })
    }
}

impl fmt::Display for CurrentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Voltage source range in volts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum SourceRange {
    /// ±10 V
    V10,
    /// ±50 V
    V50,
    /// ±500 V
    V500,
}

impl SourceRange {
    /// Range limit in volts.
    pub fn volts(self) -> u32 {
        match self {
            Self::V10 => 10,
            Self::V50 => 50,
            Self::V500 => 500,
        }
    }
}

impl TryFrom<u32> for SourceRange {
    type Error = DriverError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            10 => Ok(Self::V10),
            50 => Ok(Self::V50),
            500 => Ok(Self::V500),
            other => Err(DriverError::invalid(format!(
                "source range {} not in [10, 50, 500]",
                other
            ))),
        }
    }
}

impl From<SourceRange> for u32 {
    fn from(range: SourceRange) -> Self {
        range.volts()
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

/// `CONF:<mode>` for one of CURR, VOLT, RES, CHAR.
pub fn encode_mode(mode: &str) -> DriverResult<String> {
    let mode: MeasurementMode = mode.parse()?;
    Ok(format!("CONF:{}", mode.as_scpi()))
}

/// `CURR:RANG 2E-<exp>` for a range token such as `"200nA"`.
pub fn encode_range(token: &str) -> DriverResult<String> {
    let range: CurrentRange = token.parse()?;
    Ok(format!("CURR:RANG 2E-{}", -range.exponent()))
}

/// `CURR: NPLC <value>`.
///
/// The instrument accepts [`NPLC_MIN`]..=[`NPLC_MAX`]; this function does not clamp,
/// the driver rejects out-of-range values before calling it.
pub fn encode_nplc(value: f64) -> String {
    format!("CURR: NPLC {}", value)
}

/// `SOUR:VOLT <volts>`. The usable span is governed by the source range.
pub fn encode_source_voltage(volts: f64) -> String {
    format!("SOUR:VOLT {}", volts)
}

/// `SOUR:VOLT:RANGe <10|50|500>`.
pub fn encode_source_range(range_volts: u32) -> DriverResult<String> {
    let range = SourceRange::try_from(range_volts)?;
    Ok(format!("SOUR:VOLT:RANGe {}", range.volts()))
}

/// `SOURce:VOLT:STATe ON|OFF`.
pub fn encode_operate(on: bool) -> String {
    format!("SOURce:VOLT:STATe {}", on_off(on))
}

/// `SYST:ZCHeck ON|OFF`.
pub fn encode_zerocheck(on: bool) -> String {
    format!("SYST:ZCHeck {}", on_off(on))
}

/// Reset, preset status registers and clear the error queue.
pub fn encode_reset() -> &'static str {
    "*rst; status:preset; *cls;"
}

/// Identity query.
pub fn encode_identity_query() -> &'static str {
    "*IDN?"
}

/// Trigger a measurement and fetch the binary frame.
pub fn encode_read_query() -> &'static str {
    "READ?"
}

/// Abort the trigger model and return to idle.
pub fn encode_abort() -> &'static str {
    "INIT:ABORt"
}

/// Response format negotiation: IEEE-754 binary, all reading elements.
pub fn encode_reading_format() -> [&'static str; 2] {
    ["FORM:DATA REAL", "FORM:ELEM ALL"]
}
