//! Mock transport for testing
//!
//! Simulates a Keithley 6487 on the other end of the wire without hardware. It provides:
//! - A byte-level log of everything written, for checking command framing
//! - Scripted `READ?` replies, optionally split over several raw reads
//! - An identity reply for `*IDN?`
//! - Controllable failure injection and latency
//!
//! The adapter is a cheap clone over shared state, so a test can hand one clone to
//! the driver and keep another for inspection.

use super::{Transport, LINE_TERMINATOR};
use crate::instrument::frame::MeasurementSample;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Bytes written between two scheduler yields, so unsynchronized writers would splice.
const WRITE_CHUNK: usize = 3;

const DEFAULT_IDENTITY: &str = "KEITHLEY INSTRUMENTS INC.,MODEL 6487,0000000,A01";

#[derive(Default)]
struct MockState {
    written: Vec<u8>,
    identity: String,
    latency_ms: u64,
    fail_next: bool,
    fail_close: bool,
    closed: bool,
    close_calls: usize,
    raw_reads: usize,
    lines: VecDeque<String>,
    raw: VecDeque<Vec<u8>>,
    scripted_frames: VecDeque<Vec<Vec<u8>>>,
    repeating_frame: Option<Vec<Vec<u8>>>,
}

/// Scripted instrument double implementing [`Transport`].
///
/// # Example
///
/// ```
/// use keithley6487::adapters::MockAdapter;
///
/// let adapter = MockAdapter::new().with_identity("KEITHLEY,6487,TEST,1.0");
/// assert!(adapter.written_commands().is_empty());
/// ```
#[derive(Clone)]
pub struct MockAdapter {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    /// Create a mock with the default identity and no latency
    pub fn new() -> Self {
        let state = MockState {
            identity: DEFAULT_IDENTITY.to_string(),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Set the `*IDN?` reply
    pub fn with_identity(self, identity: &str) -> Self {
        self.state.lock().identity = identity.to_string();
        self
    }

    /// Set simulated latency per operation in milliseconds
    pub fn with_latency(self, ms: u64) -> Self {
        self.state.lock().latency_ms = ms;
        self
    }

    /// Reply to every `READ?` that has no scripted frame with these raw chunks
    pub fn with_repeating_frame(self, chunks: Vec<Vec<u8>>) -> Self {
        self.state.lock().repeating_frame = Some(chunks);
        self
    }

    /// Make `close` report an error (the mock still counts as closed)
    pub fn with_failing_close(self) -> Self {
        self.state.lock().fail_close = true;
        self
    }

    /// Script the reply to the next unanswered `READ?` as a sequence of raw chunks
    pub fn queue_frame(&self, chunks: Vec<Vec<u8>>) {
        self.state.lock().scripted_frames.push_back(chunks);
    }

    /// Inject a failure for the next write or read
    pub fn inject_next_failure(&self) {
        self.state.lock().fail_next = true;
    }

    /// Everything written so far, terminators included
    pub fn written_bytes(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    /// Written bytes split into commands on the line terminator
    pub fn written_commands(&self) -> Vec<String> {
        let written = self.written_bytes();
        String::from_utf8_lossy(&written)
            .split_terminator(LINE_TERMINATOR)
            .map(str::to_string)
            .collect()
    }

    /// Forget the write log
    pub fn clear_log(&self) {
        self.state.lock().written.clear();
    }

    /// Number of `read_raw` calls served
    pub fn raw_read_count(&self) -> usize {
        self.state.lock().raw_reads
    }

    /// Number of `close` calls received
    pub fn close_count(&self) -> usize {
        self.state.lock().close_calls
    }

    /// True once `close` has been called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    async fn simulate_latency(&self) {
        let latency = self.state.lock().latency_ms;
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
    }

    fn check_ready(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(anyhow!("Mock transport closed"));
        }
        if std::mem::take(&mut state.fail_next) {
            return Err(anyhow!("Injected failure"));
        }
        Ok(())
    }

    fn respond_to(&self, command: &str) {
        let mut state = self.state.lock();
        match command {
            "*IDN?" => {
                let identity = state.identity.clone();
                state.lines.push_back(identity);
            }
            "READ?" => {
                let chunks = state
                    .scripted_frames
                    .pop_front()
                    .or_else(|| state.repeating_frame.clone())
                    .unwrap_or_default();
                state.raw.extend(chunks);
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Transport for MockAdapter {
    async fn write_line(&mut self, command: &str) -> Result<()> {
        self.simulate_latency().await;
        self.check_ready()?;

        let line = format!("{}{}", command, LINE_TERMINATOR);
        for chunk in line.as_bytes().chunks(WRITE_CHUNK) {
            self.state.lock().written.extend_from_slice(chunk);
            tokio::task::yield_now().await;
        }

        self.respond_to(command);
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        self.simulate_latency().await;
        self.check_ready()?;
        self.state
            .lock()
            .lines
            .pop_front()
            .ok_or_else(|| anyhow!("Mock read timed out: no response pending"))
    }

    async fn read_raw(&mut self) -> Result<Vec<u8>> {
        self.simulate_latency().await;
        self.check_ready()?;
        let mut state = self.state.lock();
        state.raw_reads += 1;
        Ok(state.raw.pop_front().unwrap_or_default())
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.close_calls += 1;
        state.closed = true;
        if state.fail_close {
            return Err(anyhow!("Injected close failure"));
        }
        Ok(())
    }

    fn info(&self) -> String {
        "MockAdapter".to_string()
    }
}

/// Byte image of a `READ?` reply carrying `sample`, as the instrument sends it.
pub fn frame_bytes(sample: &MeasurementSample) -> Vec<u8> {
    let mut frame = Vec::with_capacity(crate::instrument::frame::FRAME_LEN);
    frame.extend_from_slice(b"#0");
    frame.extend_from_slice(&sample.current.to_be_bytes());
    frame.push(sample.unit as u8);
    frame.extend_from_slice(&sample.timestamp.to_be_bytes());
    frame.extend_from_slice(&sample.status.to_be_bytes());
    frame.extend_from_slice(&sample.voltage.to_be_bytes());
    frame.push(b'\n');
    frame
}
