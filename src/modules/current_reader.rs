//! Current reader front-end
//!
//! Takes readings through a [`Controller`]. As a Slave it consumes the sample the
//! voltage source's Master already fetched when one is fresh, and only triggers a
//! new reading otherwise.

use crate::config::{ReaderSettings, SourceSettings};
use crate::error::DriverResult;
use crate::instrument::frame::MeasurementSample;
use crate::instrument::scpi::{CurrentRange, SourceRange};
use crate::instrument::Controller;
use crate::modules::meta_instruments::{Ammeter, MetaInstrument};
use async_trait::async_trait;
use tracing::debug;

/// One instrument setting the reader can change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReaderSetting {
    /// Current range
    Range(CurrentRange),
    /// Integration time in power line cycles
    Nplc(f64),
    /// Zero check on or off
    Zerocheck(bool),
    /// Voltage source range
    SourceRange(SourceRange),
    /// Source level in volts
    SourceVoltage(f64),
    /// Source output on or off
    Operate(bool),
}

/// Current/voltage reader on a shared Keithley 6487 connection.
pub struct CurrentReader {
    controller: Controller,
}

impl CurrentReader {
    /// Reader acting through `controller`
    pub fn new(controller: Controller) -> Self {
        Self { controller }
    }

    /// Controller in use
    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Send one setting to the instrument.
    pub async fn apply_setting(&self, setting: ReaderSetting) -> DriverResult<()> {
        debug!(?setting, "applying reader setting");
        let driver = self.controller.driver();
        match setting {
            ReaderSetting::Range(range) => driver.set_range(range.token()).await,
            ReaderSetting::Nplc(nplc) => driver.set_nplc(nplc).await,
            ReaderSetting::Zerocheck(on) => driver.configure_zerocheck(on).await,
            ReaderSetting::SourceRange(range) => driver.set_source_range(range.volts()).await,
            ReaderSetting::SourceVoltage(volts) => driver.set_source_voltage(volts).await,
            ReaderSetting::Operate(on) => driver.operate_source(on).await,
        }
    }

    /// Send every configured setting, stopping at the first failure.
    pub async fn apply_settings(
        &self,
        reader: &ReaderSettings,
        source: &SourceSettings,
    ) -> DriverResult<()> {
        let settings = [
            ReaderSetting::Range(reader.range),
            ReaderSetting::Nplc(reader.nplc),
            ReaderSetting::Zerocheck(reader.zerocheck),
            ReaderSetting::SourceRange(source.range),
            ReaderSetting::SourceVoltage(source.voltage),
            ReaderSetting::Operate(source.operate),
        ];
        for setting in settings {
            self.apply_setting(setting).await?;
        }
        Ok(())
    }

    /// Full reading, all frame fields.
    pub async fn grab_sample(&self) -> DriverResult<MeasurementSample> {
        self.controller.read_measurement().await
    }

    /// (current in A, source voltage in V).
    pub async fn grab(&self) -> DriverResult<(f64, f64)> {
        let (current, voltage) = self.grab_sample().await?.headline();
        Ok((f64::from(current), f64::from(voltage)))
    }

    /// Abort a pending acquisition.
    pub async fn stop(&self) -> DriverResult<()> {
        self.controller.driver().abort().await
    }

    /// Instrument identity string
    pub async fn identify(&self) -> DriverResult<String> {
        self.controller.driver().identify().await
    }

    /// Close the connection if this front-end's controller owns it.
    pub async fn close(&self) -> DriverResult<()> {
        self.controller.close().await
    }
}

impl MetaInstrument for CurrentReader {
    fn instrument_id(&self) -> &str {
        "Keithley6487"
    }

    fn instrument_type(&self) -> &str {
        "ammeter"
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["ammeter".into(), "voltmeter".into()]
    }
}

#[async_trait]
impl Ammeter for CurrentReader {
    async fn read_current(&mut self) -> DriverResult<(f64, f64)> {
        self.grab().await
    }

    async fn set_range(&mut self, token: &str) -> DriverResult<()> {
        self.controller.driver().set_range(token).await
    }

    async fn zero_check(&mut self, on: bool) -> DriverResult<()> {
        self.apply_setting(ReaderSetting::Zerocheck(on)).await
    }
}
