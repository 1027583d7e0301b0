//! Compact binary encodings for index data.
//!
//! This module provides variable-length integer encoding (7 bits per byte
//! with a continuation bit, as in protocol buffers) and delta encoding for
//! strictly increasing document-reference sequences. Everything here is a
//! pure transformation over byte slices with no side effects.

use crate::error::{MinidexError, Result};

/// Encode a u64 value using variable-length encoding.
///
/// Uses 7 bits per byte with a continuation bit, allowing efficient
/// encoding of small numbers.
pub fn encode_u64(value: u64) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut val = value;

    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;

        if val != 0 {
            byte |= 0x80; // Set continuation bit
        }

        bytes.push(byte);

        if val == 0 {
            break;
        }
    }

    bytes
}

/// Decode a u64 value from variable-length encoding.
///
/// Returns the decoded value and the number of bytes consumed.
pub fn decode_u64(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut result = 0u64;
    let mut shift = 0;
    let mut bytes_read = 0;

    for &byte in bytes {
        bytes_read += 1;

        if shift >= 64 {
            return Err(MinidexError::corrupt("varint overflow"));
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok((result, bytes_read));
        }

        shift += 7;
    }

    Err(MinidexError::corrupt("incomplete varint"))
}

/// Encode a strictly increasing sequence of document references.
///
/// The layout is a varint element count, the varint first value, then the
/// varint difference to the previous value for each remaining element.
/// Deltas are typically small, which is what makes this compact.
pub fn encode_delta_sequence(values: &[u64]) -> Result<Vec<u8>> {
    let mut out = encode_u64(values.len() as u64);

    let mut prev = 0u64;
    for (i, &value) in values.iter().enumerate() {
        if i == 0 {
            out.extend_from_slice(&encode_u64(value));
        } else {
            if value <= prev {
                return Err(MinidexError::invalid_argument(
                    "delta sequence must be strictly increasing",
                ));
            }
            out.extend_from_slice(&encode_u64(value - prev));
        }
        prev = value;
    }

    Ok(out)
}

/// Decode a full delta-encoded sequence.
///
/// Returns the decoded values and the number of bytes consumed. Fails with
/// `CorruptData` if the block is truncated or the decoded sequence is not
/// strictly increasing.
pub fn decode_delta_sequence(bytes: &[u8]) -> Result<(Vec<u64>, usize)> {
    let mut cursor = DeltaCursor::new(bytes)?;
    let mut values = Vec::new();

    while let Some(value) = cursor.next()? {
        values.push(value);
    }

    Ok((values, cursor.consumed()))
}

/// Incremental decoder over a delta-encoded sequence.
///
/// This is the streaming form of [`decode_delta_sequence`]: postings cursors
/// use it to walk document references one at a time without materializing
/// the whole list.
#[derive(Debug)]
pub struct DeltaCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    remaining: u64,
    prev: u64,
    started: bool,
}

impl<'a> DeltaCursor<'a> {
    /// Start decoding a delta block, reading its element count.
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        let (count, header_len) = decode_u64(bytes)?;
        Ok(DeltaCursor {
            bytes,
            pos: header_len,
            remaining: count,
            prev: 0,
            started: false,
        })
    }

    /// Number of elements not yet decoded.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Number of bytes consumed so far, including the count header.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    /// Decode the next value, or `None` when the sequence is exhausted.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<u64>> {
        if self.remaining == 0 {
            return Ok(None);
        }

        let (raw, len) = decode_u64(&self.bytes[self.pos..])?;
        self.pos += len;

        let value = if self.started {
            if raw == 0 {
                return Err(MinidexError::corrupt(
                    "delta sequence is not strictly increasing",
                ));
            }
            self.prev
                .checked_add(raw)
                .ok_or_else(|| MinidexError::corrupt("delta sequence overflow"))?
        } else {
            self.started = true;
            raw
        };

        self.prev = value;
        self.remaining -= 1;
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_u64() {
        let test_values = [0, 1, 127, 128, 255, 256, 16383, 16384, u64::MAX];

        for &value in &test_values {
            let encoded = encode_u64(value);
            let (decoded, bytes_read) = decode_u64(&encoded).unwrap();

            assert_eq!(value, decoded);
            assert_eq!(encoded.len(), bytes_read);
        }
    }

    #[test]
    fn test_encoding_efficiency() {
        assert_eq!(encode_u64(0).len(), 1);
        assert_eq!(encode_u64(127).len(), 1);
        assert_eq!(encode_u64(128).len(), 2);
        assert_eq!(encode_u64(16383).len(), 2);
        assert_eq!(encode_u64(16384).len(), 3);
        assert!(encode_u64(u64::MAX).len() <= 10);
    }

    #[test]
    fn test_incomplete_varint() {
        // Continuation bit set but no more data.
        let incomplete = vec![0x80];
        assert!(decode_u64(&incomplete).is_err());
    }

    #[test]
    fn test_varint_overflow() {
        let overflow_data = vec![0xFF; 11];
        assert!(decode_u64(&overflow_data).is_err());
    }

    #[test]
    fn test_delta_sequence_round_trip() {
        let sequences: &[&[u64]] = &[
            &[],
            &[0],
            &[42],
            &[1, 2, 3],
            &[0, 1, 128, 16384, u64::MAX],
        ];

        for &values in sequences {
            let encoded = encode_delta_sequence(values).unwrap();
            let (decoded, consumed) = decode_delta_sequence(&encoded).unwrap();

            assert_eq!(values, decoded.as_slice());
            assert_eq!(consumed, encoded.len());
        }
    }

    #[test]
    fn test_delta_sequence_rejects_non_increasing() {
        assert!(encode_delta_sequence(&[3, 3]).is_err());
        assert!(encode_delta_sequence(&[3, 2]).is_err());
    }

    #[test]
    fn test_delta_cursor_incremental() {
        let encoded = encode_delta_sequence(&[5, 9, 100]).unwrap();
        let mut cursor = DeltaCursor::new(&encoded).unwrap();

        assert_eq!(cursor.remaining(), 3);
        assert_eq!(cursor.next().unwrap(), Some(5));
        assert_eq!(cursor.next().unwrap(), Some(9));
        assert_eq!(cursor.next().unwrap(), Some(100));
        assert_eq!(cursor.next().unwrap(), None);
        assert_eq!(cursor.consumed(), encoded.len());
    }

    #[test]
    fn test_delta_cursor_truncated_block() {
        let mut encoded = encode_delta_sequence(&[5, 9, 100]).unwrap();
        encoded.truncate(encoded.len() - 1);

        let mut cursor = DeltaCursor::new(&encoded).unwrap();
        assert_eq!(cursor.next().unwrap(), Some(5));
        assert_eq!(cursor.next().unwrap(), Some(9));
        assert!(cursor.next().is_err());
    }
}
