//! Voltage source front-end
//!
//! Exposes the 6487 source as a one-axis actuator named `Vsource` in volts. The axis
//! bounds follow the source range: ±10, ±50 or ±500 V. Targets outside the bounds
//! are clamped before anything is sent.

use crate::config::SourceSettings;
use crate::error::DriverResult;
use crate::instrument::scpi::SourceRange;
use crate::instrument::Controller;
use crate::modules::meta_instruments::{MetaInstrument, Positioner};
use async_trait::async_trait;
use tracing::debug;

/// Axis name shown to users.
pub const AXIS_NAME: &str = "Vsource";
/// Axis unit.
pub const AXIS_UNIT: &str = "V";

/// Voltage actuator on a shared Keithley 6487 connection.
pub struct VoltageSource {
    controller: Controller,
    range: SourceRange,
    target: f64,
}

impl VoltageSource {
    /// Wrap a controller. Bounds start at the 10 V range and the target at 0 V.
    pub fn new(controller: Controller) -> Self {
        Self {
            controller,
            range: SourceRange::V10,
            target: 0.0,
        }
    }

    /// Controller in use
    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Apply source range, level and output state in that order.
    pub async fn configure(&mut self, settings: &SourceSettings) -> DriverResult<()> {
        self.set_source_range(settings.range.volts()).await?;
        self.move_abs(settings.voltage).await?;
        self.operate(settings.operate).await
    }

    /// (min, max) axis bounds in volts.
    pub fn bounds(&self) -> (f64, f64) {
        let limit = f64::from(self.range.volts());
        (-limit, limit)
    }

    /// Range the bounds are derived from
    pub fn source_range(&self) -> SourceRange {
        self.range
    }

    /// Change the source range and with it the axis bounds.
    ///
    /// The bounds only change once the instrument accepted the command. The current
    /// target is not re-clamped.
    pub async fn set_source_range(&mut self, range_volts: u32) -> DriverResult<()> {
        let range = SourceRange::try_from(range_volts)?;
        self.controller.driver().set_source_range(range_volts).await?;
        self.range = range;
        debug!(range_volts, "Vsource bounds updated");
        Ok(())
    }

    /// Set the output level, clamped to the bounds. Returns the level sent.
    pub async fn move_abs(&mut self, volts: f64) -> DriverResult<f64> {
        let (min, max) = self.bounds();
        // NaN passes through and is rejected by the driver
        let clamped = volts.clamp(min, max);
        if clamped != volts && !volts.is_nan() {
            debug!(requested = volts, clamped, "Vsource target clamped to bounds");
        }
        self.controller.driver().set_source_voltage(clamped).await?;
        self.target = clamped;
        Ok(clamped)
    }

    /// Step the output level from the last target.
    pub async fn move_rel(&mut self, delta: f64) -> DriverResult<f64> {
        self.move_abs(self.target + delta).await
    }

    /// Return the output to 0 V.
    pub async fn move_home(&mut self) -> DriverResult<()> {
        self.move_abs(0.0).await.map(|_| ())
    }

    /// Last level sent. The instrument is not polled.
    pub fn current_value(&self) -> f64 {
        self.target
    }

    /// Switch the source output.
    pub async fn operate(&mut self, on: bool) -> DriverResult<()> {
        self.controller.driver().operate_source(on).await
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

impl MetaInstrument for VoltageSource {
    fn instrument_id(&self) -> &str {
        AXIS_NAME
    }

    fn instrument_type(&self) -> &str {
        "voltage_source"
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["positioner".into(), "voltage_source".into()]
    }
}

#[async_trait]
impl Positioner for VoltageSource {
    async fn move_absolute(&mut self, position: f64) -> DriverResult<f64> {
        self.move_abs(position).await
    }

    async fn move_relative(&mut self, delta: f64) -> DriverResult<f64> {
        self.move_rel(delta).await
    }

    async fn get_position(&self) -> DriverResult<f64> {
        Ok(self.current_value())
    }

    async fn home(&mut self) -> DriverResult<()> {
        self.move_home().await
    }

    async fn stop_motion(&mut self) -> DriverResult<()> {
        self.controller.driver().abort().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;
    use crate::instrument::Keithley6487;
    use std::time::Duration;

    fn source_with(mock: &MockAdapter) -> VoltageSource {
        let driver = Keithley6487::connect(
            Box::new(mock.clone()),
            "GPIB0::22::INSTR",
            Duration::from_secs(2),
        );
        VoltageSource::new(Controller::Master(std::sync::Arc::new(driver)))
    }

    #[tokio::test]
    async fn test_move_abs_clamps_to_bounds() {
        let mock = MockAdapter::new();
        let mut source = source_with(&mock);
        assert_eq!(source.bounds(), (-10.0, 10.0));

        assert_eq!(source.move_abs(25.0).await.unwrap(), 10.0);
        assert_eq!(source.move_abs(-30.0).await.unwrap(), -10.0);
        assert_eq!(source.move_abs(3.5).await.unwrap(), 3.5);
        assert_eq!(
            mock.written_commands(),
            vec!["SOUR:VOLT 10", "SOUR:VOLT -10", "SOUR:VOLT 3.5"]
        );
        assert_eq!(source.current_value(), 3.5);
    }

    #[tokio::test]
    async fn test_source_range_updates_bounds() {
        let mock = MockAdapter::new();
        let mut source = source_with(&mock);

        source.set_source_range(50).await.unwrap();
        assert_eq!(source.bounds(), (-50.0, 50.0));
        assert_eq!(source.move_abs(42.0).await.unwrap(), 42.0);

        assert!(source.set_source_range(7).await.unwrap_err().is_invalid_argument());
        assert_eq!(source.source_range(), SourceRange::V50);
    }

    #[tokio::test]
    async fn test_move_rel_and_home() {
        let mock = MockAdapter::new();
        let mut source = source_with(&mock);

        source.move_abs(2.0).await.unwrap();
        assert_eq!(source.move_rel(1.5).await.unwrap(), 3.5);
        assert_eq!(source.move_rel(100.0).await.unwrap(), 10.0);
        source.move_home().await.unwrap();
        assert_eq!(source.current_value(), 0.0);
        assert_eq!(mock.written_commands().last().unwrap(), "SOUR:VOLT 0");
    }

    #[tokio::test]
    async fn test_nan_target_rejected() {
        let mock = MockAdapter::new();
        let mut source = source_with(&mock);
        source.move_abs(1.0).await.unwrap();

        assert!(source.move_abs(f64::NAN).await.unwrap_err().is_invalid_argument());
        assert_eq!(source.current_value(), 1.0);
    }

    #[tokio::test]
    async fn test_configure_applies_in_order() {
        let mock = MockAdapter::new();
        let mut source = source_with(&mock);
        let settings = SourceSettings {
            range: SourceRange::V500,
            voltage: -120.0,
            operate: true,
        };

        source.configure(&settings).await.unwrap();
        assert_eq!(
            mock.written_commands(),
            vec![
                "SOUR:VOLT:RANGe 500",
                "SOUR:VOLT -120",
                "SOURce:VOLT:STATe ON"
            ]
        );
    }

    #[tokio::test]
    async fn test_positioner_trait() {
        let mock = MockAdapter::new();
        let mut source = source_with(&mock);

        let positioner: &mut dyn Positioner = &mut source;
        positioner.move_absolute(4.0).await.unwrap();
        assert_eq!(positioner.get_position().await.unwrap(), 4.0);
        positioner.stop_motion().await.unwrap();
        assert_eq!(positioner.instrument_id(), "Vsource");
        assert_eq!(mock.written_commands().last().unwrap(), "INIT:ABORt");
    }
}
