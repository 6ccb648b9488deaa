//! Master/Slave sharing of one Keithley 6487 connection
//!
//! The voltage actuator and the current reader both talk to the same physical
//! instrument. Exactly one of them is the Master: it opens the transport,
//! initializes the instrument and eventually closes it. The other is a Slave that
//! borrows the Master's driver and never opens or closes anything.
//!
//! Reads through a Slave prefer the sample the Master already fetched. A Slave only
//! triggers a new `READ?` when that sample has been consumed, and marks the cache
//! consumed after each read, so the pair never reports the same reading twice as
//! fresh.

use crate::config::ConnectionSettings;
use crate::error::{DriverError, DriverResult};
use crate::instrument::frame::MeasurementSample;
use crate::instrument::keithley_6487::Keithley6487;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which side of the shared connection a front-end plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerStatus {
    /// Owns the connection and closes it
    Master,
    /// Borrows the Master's connection
    Slave,
}

impl FromStr for ControllerStatus {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "master" => Ok(Self::Master),
            "slave" => Ok(Self::Slave),
            _ => Err(DriverError::invalid(format!(
                "controller status '{}' not in [Master, Slave]",
                s
            ))),
        }
    }
}

impl fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => f.write_str("Master"),
            Self::Slave => f.write_str("Slave"),
        }
    }
}

/// Handle on the shared driver, tagged with the role it was obtained in.
#[derive(Clone)]
pub enum Controller {
    /// Owns the driver: opened it and is responsible for closing it.
    Master(Arc<Keithley6487>),
    /// Borrows the Master's driver.
    Slave(Arc<Keithley6487>),
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("status", &self.status())
            .field("address", &self.driver().address())
            .finish()
    }
}

impl Controller {
    /// Open the instrument and run its start-up sequence.
    ///
    /// If initialization fails the transport is closed again before returning.
    pub async fn master(address: &str, timeout: Duration) -> DriverResult<Self> {
        let driver = Keithley6487::open(address, timeout).await?;
        Self::initialized(driver).await
    }

    /// Master from connection settings, honouring the configured baud rate.
    pub async fn master_from_settings(settings: &ConnectionSettings) -> DriverResult<Self> {
        let driver = Keithley6487::open_with_baud_rate(
            &settings.resource,
            settings.timeout(),
            settings.baud_rate,
        )
        .await?;
        Self::initialized(driver).await
    }

    /// Take ownership of an already connected driver and initialize it.
    pub async fn initialized(driver: Keithley6487) -> DriverResult<Self> {
        if let Err(err) = driver.initialize().await {
            warn!(address = driver.address(), error = %err, "initialization failed, closing");
            // The initialization error is the one returned
            if let Err(close_err) = driver.close().await {
                warn!(
                    address = driver.address(),
                    error = %close_err,
                    "close after failed initialization also failed"
                );
            }
            return Err(err);
        }
        info!(address = driver.address(), "Master controller ready");
        Ok(Self::Master(Arc::new(driver)))
    }

    /// Borrow the driver of `sibling`.
    pub fn slave(sibling: &Controller) -> Self {
        debug!(address = sibling.driver().address(), "Slave controller attached");
        Self::Slave(Arc::clone(sibling.driver()))
    }

    /// Build a controller in the requested role.
    ///
    /// A Master opens a new connection from `settings`. A Slave needs `sibling`; without
    /// one there is nothing to borrow and the call fails with `NotConnected`.
    pub async fn from_status(
        status: ControllerStatus,
        settings: &ConnectionSettings,
        sibling: Option<&Controller>,
    ) -> DriverResult<Self> {
        match status {
            ControllerStatus::Master => Self::master_from_settings(settings).await,
            ControllerStatus::Slave => sibling.map(Self::slave).ok_or(DriverError::NotConnected),
        }
    }

    /// Role of this controller
    pub fn status(&self) -> ControllerStatus {
        match self {
            Self::Master(_) => ControllerStatus::Master,
            Self::Slave(_) => ControllerStatus::Slave,
        }
    }

    /// True for the connection owner
    pub fn is_master(&self) -> bool {
        matches!(self, Self::Master(_))
    }

    /// The shared driver, whichever role holds it.
    pub fn driver(&self) -> &Arc<Keithley6487> {
        match self {
            Self::Master(driver) | Self::Slave(driver) => driver,
        }
    }

    /// Fetch a reading according to the role.
    ///
    /// A Master always triggers a new reading and leaves it fresh for its Slave. A
    /// Slave returns the fresh cached reading if there is one, otherwise triggers a
    /// reading through the shared driver; either way the cache ends up consumed.
    pub async fn read_measurement(&self) -> DriverResult<MeasurementSample> {
        match self {
            Self::Master(driver) => driver.read_measurement().await,
            Self::Slave(driver) => {
                if let Some(sample) = driver.take_fresh_sample() {
                    debug!(address = driver.address(), "Slave served from cache");
                    return Ok(sample);
                }
                driver.read_measurement_consumed().await
            }
        }
    }

    /// Close the connection if this controller owns it. A no-op for a Slave.
    pub async fn close(&self) -> DriverResult<()> {
        match self {
            Self::Master(driver) => driver.close().await,
            Self::Slave(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock_adapter::{frame_bytes, MockAdapter};
    use tracing_test::traced_test;

    fn sample(current: f32) -> MeasurementSample {
        MeasurementSample {
            current,
            voltage: 1.0,
            unit: 'A',
            timestamp: 0.5,
            status: 0.0,
        }
    }

    async fn master_with(mock: &MockAdapter) -> Controller {
        let driver = Keithley6487::connect(
            Box::new(mock.clone()),
            "GPIB0::22::INSTR",
            Duration::from_secs(2),
        );
        Controller::initialized(driver).await.unwrap()
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("Master".parse::<ControllerStatus>().unwrap(), ControllerStatus::Master);
        assert_eq!("slave".parse::<ControllerStatus>().unwrap(), ControllerStatus::Slave);
        assert!("Owner".parse::<ControllerStatus>().unwrap_err().is_invalid_argument());
        assert_eq!(ControllerStatus::Slave.to_string(), "Slave");
    }

    #[tokio::test]
    async fn test_master_initializes() {
        let mock = MockAdapter::new();
        let master = master_with(&mock).await;
        assert!(master.is_master());
        assert_eq!(mock.written_commands()[0], "*rst; status:preset; *cls;");
        assert_eq!(mock.written_commands().len(), 4);
    }

    #[tokio::test]
    async fn test_failed_initialization_closes() {
        let mock = MockAdapter::new();
        mock.inject_next_failure();
        let driver = Keithley6487::connect(
            Box::new(mock.clone()),
            "GPIB0::22::INSTR",
            Duration::from_secs(2),
        );
        let err = Controller::initialized(driver).await.unwrap_err();
        assert!(matches!(err, DriverError::Transport(_)));
        assert!(mock.is_closed());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_close_failure_after_failed_initialization_is_logged() {
        let mock = MockAdapter::new().with_failing_close();
        mock.inject_next_failure();
        let driver = Keithley6487::connect(
            Box::new(mock.clone()),
            "GPIB0::22::INSTR",
            Duration::from_secs(2),
        );
        let err = Controller::initialized(driver).await.unwrap_err();
        // The initialization error wins over the close error
        assert!(err.to_string().contains("Injected failure"));
        assert_eq!(mock.close_count(), 1);
        assert!(logs_contain("close after failed initialization also failed"));
    }

    #[tokio::test]
    async fn test_slave_read_consumes_its_own_reading() {
        let mock = MockAdapter::new();
        mock.queue_frame(vec![frame_bytes(&sample(7e-9))]);
        let master = master_with(&mock).await;
        let slave = Controller::slave(&master);

        let reading = slave.read_measurement().await.unwrap();
        assert_eq!(reading, sample(7e-9));
        assert!(master.driver().is_stale());
        assert_eq!(master.driver().take_fresh_sample(), None);
    }

    #[tokio::test]
    async fn test_slave_shares_driver() {
        let mock = MockAdapter::new();
        let master = master_with(&mock).await;
        let slave = Controller::slave(&master);
        assert_eq!(slave.status(), ControllerStatus::Slave);
        assert!(Arc::ptr_eq(master.driver(), slave.driver()));
    }

    #[tokio::test]
    async fn test_slave_uses_fresh_cache_without_io() {
        let mock = MockAdapter::new();
        mock.queue_frame(vec![frame_bytes(&sample(1e-6))]);
        let master = master_with(&mock).await;
        let slave = Controller::slave(&master);

        master.read_measurement().await.unwrap();
        mock.clear_log();
        let reads_before = mock.raw_read_count();

        let reading = slave.read_measurement().await.unwrap();
        assert_eq!(reading, sample(1e-6));
        assert!(mock.written_bytes().is_empty());
        assert_eq!(mock.raw_read_count(), reads_before);
        assert!(master.driver().is_stale());
    }

    #[tokio::test]
    async fn test_slave_with_stale_cache_delegates() {
        let mock = MockAdapter::new();
        mock.queue_frame(vec![frame_bytes(&sample(2e-9))]);
        let master = master_with(&mock).await;
        let slave = Controller::slave(&master);
        mock.clear_log();

        assert!(master.driver().is_stale());
        let reading = slave.read_measurement().await.unwrap();
        assert_eq!(reading, sample(2e-9));
        assert_eq!(mock.written_commands(), vec!["READ?"]);
        assert!(master.driver().is_stale());
    }

    #[tokio::test]
    async fn test_slave_without_sibling_is_not_connected() {
        let settings = ConnectionSettings::default();
        let err = Controller::from_status(ControllerStatus::Slave, &settings, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::NotConnected));
    }

    #[tokio::test]
    async fn test_slave_close_is_noop() {
        let mock = MockAdapter::new();
        let master = master_with(&mock).await;
        let slave = Controller::from_status(
            ControllerStatus::Slave,
            &ConnectionSettings::default(),
            Some(&master),
        )
        .await
        .unwrap();

        slave.close().await.unwrap();
        assert!(master.driver().is_connected().await);
        assert_eq!(mock.close_count(), 0);

        master.close().await.unwrap();
        assert!(!master.driver().is_connected().await);
        assert!(matches!(
            slave.read_measurement().await,
            Err(DriverError::NotConnected)
        ));
    }
}
