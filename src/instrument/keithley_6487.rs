//! Keithley 6487 picoammeter / voltage source driver
//!
//! The driver owns the single transport to one instrument and serializes every
//! command sequence through a per-driver lock. It keeps two pieces of local state:
//!
//! - [`InstrumentState`]: the last configuration value successfully *sent* for each
//!   setting. It is never read back from the instrument, so a front-panel change or a
//!   `reset()` is not reflected.
//! - The sample cache: the last decoded [`MeasurementSample`] and a staleness flag.
//!   The cache has its own guard so a borrowing controller can consume it without
//!   waiting for the transport lock.
//!
//! ## Wire format
//!
//! Text commands are `\n` terminated. `READ?` replies with a raw binary frame (see
//! [`frame`](super::frame)) that may arrive split over several raw reads.

use crate::adapters::{self, SerialAdapter, Transport, VisaAdapter};
use crate::error::{DriverError, DriverResult};
use crate::instrument::frame::{decode_frame, MeasurementSample, FRAME_LEN};
use crate::instrument::scpi::{self, CurrentRange, MeasurementMode, SourceRange};
use anyhow::anyhow;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Maximum raw reads, first read included, spent assembling one `READ?` frame.
pub const MAX_READ_ATTEMPTS: usize = 8;

/// Baud rate used for serial addresses when none is given.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Last configuration sent to the instrument. `None` means never commanded by this driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstrumentState {
    /// Measurement function
    pub mode: Option<MeasurementMode>,
    /// Current range
    pub current_range: Option<CurrentRange>,
    /// Integration time in power line cycles
    pub nplc: Option<f64>,
    /// Zero check enabled
    pub zerocheck: Option<bool>,
    /// Voltage source range
    pub source_range: Option<SourceRange>,
    /// Source level in volts
    pub source_voltage: Option<f64>,
    /// Source output on
    pub operating: Option<bool>,
}

struct DriverInner {
    transport: Option<Box<dyn Transport>>,
    state: InstrumentState,
}

struct SampleCache {
    sample: Option<MeasurementSample>,
    stale: bool,
}

/// Driver for one Keithley 6487.
///
/// All methods take `&self`; share the driver with `Arc` between tasks.
pub struct Keithley6487 {
    address: String,
    timeout: Duration,
    inner: Mutex<DriverInner>,
    cache: parking_lot::Mutex<SampleCache>,
}

/// Run one transport call bounded by `timeout`, mapping both failure kinds to `Transport`.
async fn bounded<T>(
    timeout: Duration,
    operation: impl Future<Output = anyhow::Result<T>>,
) -> DriverResult<T> {
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result.map_err(DriverError::Transport),
        Err(_) => Err(DriverError::Transport(anyhow!(
            "instrument did not respond within {:?}",
            timeout
        ))),
    }
}

impl Keithley6487 {
    /// Open the instrument at `address`.
    ///
    /// `/dev/…` and `COM…` addresses open a serial port at [`DEFAULT_BAUD_RATE`];
    /// anything else is treated as a VISA resource string.
    pub async fn open(address: &str, timeout: Duration) -> DriverResult<Self> {
        Self::open_with_baud_rate(address, timeout, DEFAULT_BAUD_RATE).await
    }

    /// Like [`open`](Self::open) with an explicit baud rate for serial addresses.
    pub async fn open_with_baud_rate(
        address: &str,
        timeout: Duration,
        baud_rate: u32,
    ) -> DriverResult<Self> {
        let transport: Box<dyn Transport> = if adapters::is_serial_address(address) {
            let mut adapter = SerialAdapter::new(address, baud_rate).with_timeout(timeout);
            bounded(timeout, adapter.open()).await?;
            Box::new(adapter)
        } else {
            let mut adapter = VisaAdapter::new(address).with_timeout(timeout);
            bounded(timeout, adapter.open()).await?;
            Box::new(adapter)
        };

        info!(address, timeout_ms = timeout.as_millis() as u64, "Keithley 6487 opened");
        Ok(Self::connect(transport, address, timeout))
    }

    /// Wrap an already open transport.
    pub fn connect(transport: Box<dyn Transport>, address: &str, timeout: Duration) -> Self {
        debug!(address, transport = %transport.info(), "attaching transport");
        Self {
            address: address.to_string(),
            timeout,
            inner: Mutex::new(DriverInner {
                transport: Some(transport),
                state: InstrumentState::default(),
            }),
            cache: parking_lot::Mutex::new(SampleCache {
                sample: None,
                stale: true,
            }),
        }
    }

    /// Resource string or port this driver was opened on
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Wall-clock bound applied to every transport call
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// False once [`close`](Self::close) has run.
    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.transport.is_some()
    }

    /// Copy of the last configuration sent.
    pub async fn state(&self) -> InstrumentState {
        self.inner.lock().await.state.clone()
    }

    /// Send a sequence of commands under one lock hold, then apply `update` to the state.
    async fn send_all(
        &self,
        commands: &[&str],
        update: impl FnOnce(&mut InstrumentState),
    ) -> DriverResult<()> {
        let mut inner = self.inner.lock().await;
        let transport = inner.transport.as_mut().ok_or(DriverError::NotConnected)?;
        for command in commands {
            debug!(address = %self.address, command, "sending");
            bounded(self.timeout, transport.write_line(command)).await?;
        }
        update(&mut inner.state);
        Ok(())
    }

    /// `*IDN?`. Returns the identity line as sent by the instrument.
    pub async fn identify(&self) -> DriverResult<String> {
        let mut inner = self.inner.lock().await;
        let transport = inner.transport.as_mut().ok_or(DriverError::NotConnected)?;
        let identity = bounded(
            self.timeout,
            transport.query(scpi::encode_identity_query()),
        )
        .await?;
        debug!(address = %self.address, identity = %identity, "identified");
        Ok(identity)
    }

    /// Reset the instrument, preset status registers and clear the error queue.
    ///
    /// The cached [`InstrumentState`] is left alone even though the instrument
    /// has returned to its defaults.
    pub async fn reset(&self) -> DriverResult<()> {
        self.send_all(&[scpi::encode_reset()], |_| {}).await?;
        info!(address = %self.address, "instrument reset");
        Ok(())
    }

    /// Select binary reading format with all elements.
    pub async fn configure_reading(&self) -> DriverResult<()> {
        self.send_all(&scpi::encode_reading_format(), |_| {}).await
    }

    /// Start-up sequence for the owning controller: reset, current mode, binary readings.
    pub async fn initialize(&self) -> DriverResult<()> {
        self.reset().await?;
        self.configure_mode(MeasurementMode::Current.as_scpi()).await?;
        self.configure_reading().await
    }

    /// `CONF:<mode>` for CURR, VOLT, RES or CHAR.
    pub async fn configure_mode(&self, mode: &str) -> DriverResult<()> {
        let parsed: MeasurementMode = mode.parse()?;
        let command = scpi::encode_mode(mode)?;
        self.send_all(&[command.as_str()], |state| state.mode = Some(parsed))
            .await
    }

    /// `SYST:ZCHeck ON|OFF`.
    pub async fn configure_zerocheck(&self, on: bool) -> DriverResult<()> {
        let command = scpi::encode_zerocheck(on);
        self.send_all(&[command.as_str()], |state| state.zerocheck = Some(on))
            .await
    }

    /// Integration time in power line cycles, 0.01 to 50.
    pub async fn set_nplc(&self, nplc: f64) -> DriverResult<()> {
        if !nplc.is_finite() || !(scpi::NPLC_MIN..=scpi::NPLC_MAX).contains(&nplc) {
            return Err(DriverError::invalid(format!(
                "NPLC {} outside {}..={}",
                nplc,
                scpi::NPLC_MIN,
                scpi::NPLC_MAX
            )));
        }
        let command = scpi::encode_nplc(nplc);
        self.send_all(&[command.as_str()], |state| state.nplc = Some(nplc))
            .await
    }

    /// Current range from its token, "20mA" down to "2nA".
    pub async fn set_range(&self, token: &str) -> DriverResult<()> {
        let range: CurrentRange = token.parse()?;
        let command = scpi::encode_range(token)?;
        self.send_all(&[command.as_str()], |state| state.current_range = Some(range))
            .await
    }

    /// Source output level in volts. Only non-finite values are rejected here.
    pub async fn set_source_voltage(&self, volts: f64) -> DriverResult<()> {
        if !volts.is_finite() {
            return Err(DriverError::invalid(format!(
                "source voltage {} is not a finite number",
                volts
            )));
        }
        let command = scpi::encode_source_voltage(volts);
        self.send_all(&[command.as_str()], |state| state.source_voltage = Some(volts))
            .await
    }

    /// Source range in volts: 10, 50 or 500.
    pub async fn set_source_range(&self, range_volts: u32) -> DriverResult<()> {
        let range = SourceRange::try_from(range_volts)?;
        let command = scpi::encode_source_range(range_volts)?;
        self.send_all(&[command.as_str()], |state| state.source_range = Some(range))
            .await
    }

    /// Enable or disable the voltage source output.
    pub async fn operate_source(&self, on: bool) -> DriverResult<()> {
        let command = scpi::encode_operate(on);
        self.send_all(&[command.as_str()], |state| state.operating = Some(on))
            .await?;
        info!(address = %self.address, on, "source output switched");
        Ok(())
    }

    /// Trigger one reading and decode its binary frame.
    ///
    /// The frame is accumulated over at most [`MAX_READ_ATTEMPTS`] raw reads. The
    /// driver lock is held for the whole exchange, so no other command can land
    /// between `READ?` and the last byte of its reply.
    pub async fn read_measurement(&self) -> DriverResult<MeasurementSample> {
        self.acquire(false).await
    }

    /// Trigger one reading and hand it over already consumed.
    ///
    /// The sample is stored and marked stale under a single cache lock, so a
    /// concurrent fresh reading is never marked consumed without being delivered.
    pub async fn read_measurement_consumed(&self) -> DriverResult<MeasurementSample> {
        self.acquire(true).await
    }

    async fn acquire(&self, consume: bool) -> DriverResult<MeasurementSample> {
        let mut inner = self.inner.lock().await;
        let transport = inner.transport.as_mut().ok_or(DriverError::NotConnected)?;

        debug!(address = %self.address, command = scpi::encode_read_query(), "sending");
        bounded(
            self.timeout,
            transport.write_line(scpi::encode_read_query()),
        )
        .await?;

        let mut frame = Vec::with_capacity(FRAME_LEN);
        let mut attempts = 0;
        while frame.len() < FRAME_LEN {
            if attempts == MAX_READ_ATTEMPTS {
                warn!(
                    address = %self.address,
                    received = frame.len(),
                    attempts,
                    "measurement frame incomplete"
                );
                return Err(DriverError::MalformedFrame {
                    received: frame.len(),
                    expected: FRAME_LEN,
                });
            }
            let chunk = bounded(self.timeout, transport.read_raw()).await?;
            attempts += 1;
            frame.extend_from_slice(&chunk);
        }

        if attempts > 1 {
            debug!(address = %self.address, attempts, "frame assembled from several reads");
        }

        let sample = decode_frame(&frame)?;
        if sample.unit != 'A' || !sample.is_ok() {
            warn!(
                address = %self.address,
                unit = %sample.unit,
                status = sample.status,
                "instrument flagged the reading"
            );
        }

        let mut cache = self.cache.lock();
        cache.sample = Some(sample);
        cache.stale = consume;
        Ok(sample)
    }

    /// `INIT:ABORt`. Waits for any in-flight exchange to finish first.
    pub async fn abort(&self) -> DriverResult<()> {
        self.send_all(&[scpi::encode_abort()], |_| {}).await
    }

    /// Release the transport. Safe to call more than once.
    ///
    /// The handle is dropped even when the transport reports an error while closing.
    pub async fn close(&self) -> DriverResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(mut transport) = inner.transport.take() {
            info!(address = %self.address, "closing Keithley 6487");
            bounded(self.timeout, transport.close()).await?;
        }
        Ok(())
    }

    /// Last decoded sample, whether or not it has been consumed.
    pub fn last_sample(&self) -> Option<MeasurementSample> {
        self.cache.lock().sample
    }

    /// True until the first successful read and after each consumption.
    pub fn is_stale(&self) -> bool {
        self.cache.lock().stale
    }

    /// Mark the cached sample consumed without reading it.
    pub fn mark_stale(&self) {
        self.cache.lock().stale = true;
    }

    /// Hand out the cached sample if it has not been consumed yet, marking it consumed.
    pub fn take_fresh_sample(&self) -> Option<MeasurementSample> {
        let mut cache = self.cache.lock();
        if cache.stale {
            return None;
        }
        cache.stale = true;
        cache.sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock_adapter::{frame_bytes, MockAdapter};
    use tracing_test::traced_test;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn sample() -> MeasurementSample {
        MeasurementSample {
            current: -4.5e-9,
            voltage: 2.5,
            unit: 'A',
            timestamp: 17.25,
            status: 0.0,
        }
    }

    fn driver_with(mock: &MockAdapter) -> Keithley6487 {
        Keithley6487::connect(Box::new(mock.clone()), "GPIB0::22::INSTR", TIMEOUT)
    }

    #[tokio::test]
    async fn test_identify() {
        let mock = MockAdapter::new().with_identity("KEITHLEY INSTRUMENTS INC.,MODEL 6487,1234,B04");
        let driver = driver_with(&mock);
        let identity = driver.identify().await.unwrap();
        assert_eq!(identity, "KEITHLEY INSTRUMENTS INC.,MODEL 6487,1234,B04");
        assert_eq!(mock.written_commands(), vec!["*IDN?"]);
    }

    #[tokio::test]
    async fn test_configuration_updates_state() {
        let mock = MockAdapter::new();
        let driver = driver_with(&mock);

        driver.configure_mode("CURR").await.unwrap();
        driver.set_range("200nA").await.unwrap();
        driver.set_nplc(5.0).await.unwrap();
        driver.configure_zerocheck(false).await.unwrap();
        driver.set_source_range(50).await.unwrap();
        driver.set_source_voltage(-12.5).await.unwrap();
        driver.operate_source(true).await.unwrap();

        assert_eq!(
            mock.written_commands(),
            vec![
                "CONF:CURR",
                "CURR:RANG 2E-7",
                "CURR: NPLC 5",
                "SYST:ZCHeck OFF",
                "SOUR:VOLT:RANGe 50",
                "SOUR:VOLT -12.5",
                "SOURce:VOLT:STATe ON",
            ]
        );

        let state = driver.state().await;
        assert_eq!(state.mode, Some(MeasurementMode::Current));
        assert_eq!(state.current_range, Some(CurrentRange::Na200));
        assert_eq!(state.nplc, Some(5.0));
        assert_eq!(state.zerocheck, Some(false));
        assert_eq!(state.source_range, Some(SourceRange::V50));
        assert_eq!(state.source_voltage, Some(-12.5));
        assert_eq!(state.operating, Some(true));
    }

    #[tokio::test]
    async fn test_operate_off_sends_off() {
        let mock = MockAdapter::new();
        let driver = driver_with(&mock);
        driver.operate_source(false).await.unwrap();
        assert_eq!(mock.written_commands(), vec!["SOURce:VOLT:STATe OFF"]);
        assert_eq!(driver.state().await.operating, Some(false));
    }

    #[tokio::test]
    async fn test_invalid_arguments_touch_nothing() {
        let mock = MockAdapter::new();
        let driver = driver_with(&mock);

        assert!(driver.set_source_range(7).await.unwrap_err().is_invalid_argument());
        assert!(driver.configure_mode("BOGUS").await.unwrap_err().is_invalid_argument());
        assert!(driver.set_range("5mA").await.unwrap_err().is_invalid_argument());
        assert!(driver.set_nplc(0.001).await.unwrap_err().is_invalid_argument());
        assert!(driver.set_nplc(51.0).await.unwrap_err().is_invalid_argument());
        assert!(driver.set_nplc(f64::NAN).await.unwrap_err().is_invalid_argument());
        assert!(driver
            .set_source_voltage(f64::INFINITY)
            .await
            .unwrap_err()
            .is_invalid_argument());

        assert!(mock.written_bytes().is_empty());
        assert_eq!(driver.state().await, InstrumentState::default());
    }

    #[tokio::test]
    async fn test_nplc_limits_are_inclusive() {
        let mock = MockAdapter::new();
        let driver = driver_with(&mock);
        driver.set_nplc(0.01).await.unwrap();
        driver.set_nplc(50.0).await.unwrap();
        assert_eq!(mock.written_commands(), vec!["CURR: NPLC 0.01", "CURR: NPLC 50"]);
    }

    #[tokio::test]
    async fn test_reset_keeps_cached_state() {
        let mock = MockAdapter::new();
        let driver = driver_with(&mock);
        driver.set_range("2mA").await.unwrap();
        driver.reset().await.unwrap();
        assert_eq!(driver.state().await.current_range, Some(CurrentRange::Ma2));
        assert_eq!(mock.written_commands().last().unwrap(), "*rst; status:preset; *cls;");
    }

    #[tokio::test]
    async fn test_initialize_sequence() {
        let mock = MockAdapter::new();
        let driver = driver_with(&mock);
        driver.initialize().await.unwrap();
        assert_eq!(
            mock.written_commands(),
            vec![
                "*rst; status:preset; *cls;",
                "CONF:CURR",
                "FORM:DATA REAL",
                "FORM:ELEM ALL",
            ]
        );
        assert_eq!(driver.state().await.mode, Some(MeasurementMode::Current));
    }

    #[tokio::test]
    async fn test_read_single_chunk() {
        let mock = MockAdapter::new();
        mock.queue_frame(vec![frame_bytes(&sample())]);
        let driver = driver_with(&mock);

        assert!(driver.is_stale());
        assert!(driver.last_sample().is_none());

        let reading = driver.read_measurement().await.unwrap();
        assert_eq!(reading, sample());
        assert_eq!(reading.headline(), (-4.5e-9, 2.5));
        assert_eq!(mock.written_commands(), vec!["READ?"]);
        assert_eq!(mock.raw_read_count(), 1);
        assert!(!driver.is_stale());
        assert_eq!(driver.last_sample(), Some(sample()));
    }

    #[tokio::test]
    async fn test_read_split_frame() {
        let bytes = frame_bytes(&sample());
        let mock = MockAdapter::new();
        mock.queue_frame(vec![bytes[..9].to_vec(), Vec::new(), bytes[9..].to_vec()]);
        let driver = driver_with(&mock);

        let reading = driver.read_measurement().await.unwrap();
        assert_eq!(reading, sample());
        assert_eq!(mock.raw_read_count(), 3);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_read_incomplete_frame_hits_cap() {
        let bytes = frame_bytes(&sample());
        let mock = MockAdapter::new();
        mock.queue_frame(vec![bytes[..5].to_vec(), bytes[5..12].to_vec()]);
        let driver = driver_with(&mock);

        match driver.read_measurement().await {
            Err(DriverError::MalformedFrame { received, expected }) => {
                assert_eq!(received, 12);
                assert_eq!(expected, FRAME_LEN);
            }
            other => panic!("expected MalformedFrame, got {other:?}"),
        }
        assert_eq!(mock.raw_read_count(), MAX_READ_ATTEMPTS);
        assert!(driver.is_stale());
        assert!(driver.last_sample().is_none());
        assert!(logs_contain("measurement frame incomplete"));
    }

    #[tokio::test]
    async fn test_transport_failure_is_reported() {
        let mock = MockAdapter::new();
        let driver = driver_with(&mock);
        mock.inject_next_failure();

        let err = driver.set_range("2uA").await.unwrap_err();
        assert!(matches!(err, DriverError::Transport(_)));
        assert_eq!(driver.state().await.current_range, None);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_transport_error() {
        let mock = MockAdapter::new().with_latency(500);
        let driver =
            Keithley6487::connect(Box::new(mock.clone()), "GPIB0::22::INSTR", Duration::from_millis(20));
        let err = driver.identify().await.unwrap_err();
        assert!(matches!(err, DriverError::Transport(_)));
        assert!(err.to_string().contains("did not respond"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mock = MockAdapter::new();
        let driver = driver_with(&mock);
        assert!(driver.is_connected().await);

        driver.close().await.unwrap();
        driver.close().await.unwrap();

        assert!(!driver.is_connected().await);
        assert_eq!(mock.close_count(), 1);
        assert!(matches!(driver.identify().await, Err(DriverError::NotConnected)));
        assert!(matches!(driver.read_measurement().await, Err(DriverError::NotConnected)));
        assert!(matches!(driver.abort().await, Err(DriverError::NotConnected)));
        assert!(matches!(driver.set_range("2nA").await, Err(DriverError::NotConnected)));
    }

    #[tokio::test]
    async fn test_abort_keeps_state() {
        let mock = MockAdapter::new();
        let driver = driver_with(&mock);
        driver.set_source_voltage(1.0).await.unwrap();
        driver.abort().await.unwrap();
        assert_eq!(mock.written_commands(), vec!["SOUR:VOLT 1", "INIT:ABORt"]);
        assert_eq!(driver.state().await.source_voltage, Some(1.0));
    }

    #[tokio::test]
    async fn test_take_fresh_sample_consumes_once() {
        let mock = MockAdapter::new();
        mock.queue_frame(vec![frame_bytes(&sample())]);
        let driver = driver_with(&mock);

        assert!(driver.take_fresh_sample().is_none());
        driver.read_measurement().await.unwrap();
        assert_eq!(driver.take_fresh_sample(), Some(sample()));
        assert!(driver.take_fresh_sample().is_none());
        assert!(driver.is_stale());
        // The sample itself stays cached
        assert_eq!(driver.last_sample(), Some(sample()));
    }

    #[tokio::test]
    async fn test_consumed_read_leaves_cache_stale() {
        let mock = MockAdapter::new();
        let later = MeasurementSample {
            current: 4e-6,
            ..sample()
        };
        mock.queue_frame(vec![frame_bytes(&sample())]);
        mock.queue_frame(vec![frame_bytes(&later)]);
        let driver = driver_with(&mock);

        driver.read_measurement().await.unwrap();
        assert!(!driver.is_stale());

        // Replaces the fresh reading; nothing is left for a later take
        let consumed = driver.read_measurement_consumed().await.unwrap();
        assert_eq!(consumed, later);
        assert!(driver.is_stale());
        assert_eq!(driver.last_sample(), Some(later));
        assert_eq!(driver.take_fresh_sample(), None);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_commands_are_logged() {
        let mock = MockAdapter::new();
        let driver = driver_with(&mock);
        driver.set_range("20mA").await.unwrap();
        assert!(logs_contain("CURR:RANG 2E-2"));
    }
}
