//! Raw trace to column value encoding.

use crate::error::EncodeError;
use crate::trace::{EncodedRecord, RawTraceRecord};

/// Encodes raw traces into owned column vectors.
///
/// The encoder keeps growable scratch buffers that are reused across calls so
/// a reader streaming millions of lines does not reallocate per trace. Every
/// returned [`EncodedRecord`] holds its own copies; the scratch contents are
/// overwritten by the next call. An encoder is owned by exactly one reader.
#[derive(Debug, Default)]
pub struct TraceEncoder {
    sizes: Vec<i32>,
    timestamps: Vec<f64>,
    encoded: u64,
}

impl TraceEncoder {
    /// Creates an encoder with empty scratch buffers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes one record, consuming its label strings.
    ///
    /// # Errors
    ///
    /// Returns an [`EncodeError`] if the trace is empty, a size is not
    /// integral, a direction is not `±1`, a signed size overflows `i32`, or a
    /// timestamp is not finite.
    pub fn encode(&mut self, record: RawTraceRecord) -> Result<EncodedRecord, EncodeError> {
        if record.trace.is_empty() {
            return Err(EncodeError::EmptyTrace);
        }

        self.sizes.clear();
        self.timestamps.clear();

        for (index, packet) in record.trace.iter().enumerate() {
            let timestamp = packet.timestamp();
            if !timestamp.is_finite() {
                return Err(EncodeError::NonFiniteTimestamp { index });
            }

            let magnitude = packet.size_magnitude();
            if !magnitude.is_finite() || magnitude.fract() != 0.0 {
                return Err(EncodeError::NonIntegralSize {
                    index,
                    value: magnitude,
                });
            }

            let sign = packet.direction_sign();
            if sign != 1.0 && sign != -1.0 {
                return Err(EncodeError::InvalidDirection { index, value: sign });
            }

            let signed = magnitude * sign;
            if signed < f64::from(i32::MIN) || signed > f64::from(i32::MAX) {
                return Err(EncodeError::SizeOutOfRange {
                    index,
                    value: signed,
                });
            }

            self.sizes.push(signed as i32);
            self.timestamps.push(timestamp);
        }

        self.encoded += 1;

        Ok(EncodedRecord {
            url: record.url,
            protocol: record.protocol,
            region: record.region,
            timestamps: self.timestamps.to_vec(),
            sizes: self.sizes.to_vec(),
        })
    }

    /// Number of records encoded successfully so far.
    pub fn encoded_count(&self) -> u64 {
        self.encoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::TracePacket;

    fn record(packets: &[(f64, f64, f64)]) -> RawTraceRecord {
        RawTraceRecord {
            url: "example.com".to_string(),
            protocol: "quic".to_string(),
            region: "eu".to_string(),
            trace: packets
                .iter()
                .map(|&(t, s, d)| TracePacket(t, s, d))
                .collect(),
        }
    }

    #[test]
    fn test_encode_applies_direction() {
        let mut encoder = TraceEncoder::new();
        let encoded = encoder
            .encode(record(&[(0.0, 1500.0, 1.0), (0.5, 60.0, -1.0), (1.0, 0.0, -1.0)]))
            .unwrap();

        assert_eq!(encoded.sizes, vec![1500, -60, 0]);
        assert_eq!(encoded.timestamps, vec![0.0, 0.5, 1.0]);
        assert_eq!(encoded.url, "example.com");
        assert_eq!(encoded.protocol, "quic");
        assert_eq!(encoded.region, "eu");
        assert_eq!(encoder.encoded_count(), 1);
    }

    #[test]
    fn test_scratch_reuse_does_not_alias_previous_result() {
        let mut encoder = TraceEncoder::new();
        let first = encoder
            .encode(record(&[(1.0, 10.0, 1.0), (2.0, 20.0, 1.0), (3.0, 30.0, -1.0)]))
            .unwrap();
        let second = encoder.encode(record(&[(9.0, 99.0, -1.0)])).unwrap();

        assert_eq!(first.sizes, vec![10, 20, -30]);
        assert_eq!(first.timestamps, vec![1.0, 2.0, 3.0]);
        assert_eq!(second.sizes, vec![-99]);
        assert_eq!(second.timestamps, vec![9.0]);
        assert_eq!(encoder.encoded_count(), 2);
    }

    #[test]
    fn test_empty_trace_rejected() {
        let mut encoder = TraceEncoder::new();
        assert_eq!(encoder.encode(record(&[])), Err(EncodeError::EmptyTrace));
        assert_eq!(encoder.encoded_count(), 0);
    }

    #[test]
    fn test_invalid_direction_rejected() {
        let mut encoder = TraceEncoder::new();
        let err = encoder
            .encode(record(&[(0.0, 10.0, 1.0), (0.1, 10.0, 0.0)]))
            .unwrap_err();
        assert_eq!(err, EncodeError::InvalidDirection { index: 1, value: 0.0 });
    }

    #[test]
    fn test_fractional_size_rejected() {
        let mut encoder = TraceEncoder::new();
        let err = encoder.encode(record(&[(0.0, 10.5, 1.0)])).unwrap_err();
        assert!(matches!(err, EncodeError::NonIntegralSize { index: 0, .. }));
    }

    #[test]
    fn test_size_overflow_rejected() {
        let mut encoder = TraceEncoder::new();
        let err = encoder
            .encode(record(&[(0.0, 3_000_000_000.0, -1.0)]))
            .unwrap_err();
        assert!(matches!(err, EncodeError::SizeOutOfRange { index: 0, .. }));
    }

    #[test]
    fn test_i32_bounds_accepted() {
        let mut encoder = TraceEncoder::new();
        let encoded = encoder
            .encode(record(&[
                (0.0, f64::from(i32::MAX), 1.0),
                (0.0, f64::from(i32::MIN), 1.0),
            ]))
            .unwrap();
        assert_eq!(encoded.sizes, vec![i32::MAX, i32::MIN]);
    }

    #[test]
    fn test_non_finite_timestamp_rejected() {
        let mut encoder = TraceEncoder::new();
        let err = encoder.encode(record(&[(f64::NAN, 1.0, 1.0)])).unwrap_err();
        assert_eq!(err, EncodeError::NonFiniteTimestamp { index: 0 });
    }
}
