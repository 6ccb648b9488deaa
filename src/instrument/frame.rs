//! Binary measurement frame decoder.
//!
//! With `FORM:DATA REAL` and `FORM:ELEM ALL` the 6487 answers `READ?` with a fixed
//! 20-byte frame of big-endian fields:
//!
//! ```text
//! offset  size  field
//!  0       2    block header (ignored)
//!  2       4    current, f32 (A)
//!  6       1    unit tag, ASCII ('A')
//!  7       4    timestamp, f32 (s, instrument relative)
//! 11       4    status, f32 (0 = no error)
//! 15       4    source voltage, f32 (V)
//! 19       1    terminator
//! ```
//!
//! The decoder only parses. Gathering enough bytes is the driver's job.

use crate::error::{DriverError, DriverResult};
use bytes::Buf;

/// Minimum number of bytes in a `READ?` reply.
pub const FRAME_LEN: usize = 20;

const HEADER_LEN: usize = 2;

/// One decoded reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementSample {
    /// Measured current in amperes
    pub current: f32,
    /// Source voltage in volts
    pub voltage: f32,
    /// Unit tag reported with the reading, expected 'A'
    pub unit: char,
    /// Instrument-relative timestamp in seconds
    pub timestamp: f32,
    /// Status word, 0 when the reading is valid
    pub status: f32,
}

impl MeasurementSample {
    /// The two values callers usually want: (current, source voltage).
    pub fn headline(&self) -> (f32, f32) {
        (self.current, self.voltage)
    }

    /// True when the instrument flagged no error for this reading.
    pub fn is_ok(&self) -> bool {
        self.status == 0.0
    }
}

/// Decode the first [`FRAME_LEN`] bytes of `bytes` into a sample.
///
/// Trailing bytes beyond the frame are ignored.
pub fn decode_frame(bytes: &[u8]) -> DriverResult<MeasurementSample> {
    if bytes.len() < FRAME_LEN {
        return Err(DriverError::MalformedFrame {
            received: bytes.len(),
            expected: FRAME_LEN,
        });
    }

    let mut buf = &bytes[..FRAME_LEN];
    buf.advance(HEADER_LEN);

    // Buf::get_f32 reads big-endian
    let current = buf.get_f32();
    let unit = char::from(buf.get_u8());
    let timestamp = buf.get_f32();
    let status = buf.get_f32();
    let voltage = buf.get_f32();

    Ok(MeasurementSample {
        current,
        voltage,
        unit,
        timestamp,
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(current: f32, unit: u8, timestamp: f32, status: f32, voltage: f32) -> Vec<u8> {
        let mut frame = vec![b'#', b'0'];
        frame.extend_from_slice(&current.to_be_bytes());
        frame.push(unit);
        frame.extend_from_slice(&timestamp.to_be_bytes());
        frame.extend_from_slice(&status.to_be_bytes());
        frame.extend_from_slice(&voltage.to_be_bytes());
        frame.push(b'\n');
        frame
    }

    #[test]
    fn test_decode_known_fields() {
        let bytes = fixture(1.25e-9, b'A', 12.5, 0.0, -3.0);
        assert_eq!(bytes.len(), FRAME_LEN);

        let sample = decode_frame(&bytes).unwrap();
        assert_eq!(sample.current.to_bits(), 1.25e-9f32.to_bits());
        assert_eq!(sample.unit, 'A');
        assert_eq!(sample.timestamp.to_bits(), 12.5f32.to_bits());
        assert_eq!(sample.status.to_bits(), 0.0f32.to_bits());
        assert_eq!(sample.voltage.to_bits(), (-3.0f32).to_bits());
        assert!(sample.is_ok());
        assert_eq!(sample.headline(), (1.25e-9, -3.0));
    }

    #[test]
    fn test_decode_ignores_header_and_trailer() {
        let mut bytes = fixture(2.0e-3, b'A', 0.5, 0.0, 10.0);
        bytes[0] = 0xFF;
        bytes[1] = 0xEE;
        bytes.extend_from_slice(b"extra");
        let sample = decode_frame(&bytes).unwrap();
        assert_eq!(sample.current, 2.0e-3);
        assert_eq!(sample.voltage, 10.0);
    }

    #[test]
    fn test_decode_nonzero_status() {
        let bytes = fixture(0.0, b'A', 1.0, 8.0, 0.0);
        let sample = decode_frame(&bytes).unwrap();
        assert!(!sample.is_ok());
        assert_eq!(sample.status, 8.0);
    }

    #[test]
    fn test_short_frame_is_malformed() {
        let bytes = fixture(1.0, b'A', 1.0, 0.0, 1.0);
        match decode_frame(&bytes[..19]) {
            Err(DriverError::MalformedFrame { received, expected }) => {
                assert_eq!(received, 19);
                assert_eq!(expected, FRAME_LEN);
            }
            other => panic!("expected MalformedFrame, got {other:?}"),
        }
        assert!(decode_frame(&[]).is_err());
    }
}
