//! Streaming encoders for leaf block bodies

use super::bitstream::BitWriter;
use crate::types::{Aggregates, Timestamp};

/// Zig-zag map a signed value onto an unsigned one
#[inline]
pub(crate) fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

/// Inverse of [`zigzag`]
#[inline]
pub(crate) fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

/// Worst-case encoded size of one float sample, in bytes.
///
/// Timestamp: flag bit plus a ten-byte varint; value: two control bits,
/// eleven window bits, and a full 64-bit payload.
pub const MAX_FLOAT_SAMPLE_BYTES: usize = 21;

/// Encoder for float series leaf bodies.
///
/// Timestamps are delta-of-delta coded: a zero delta-of-delta costs one bit,
/// anything else is a flag bit followed by a zig-zag LEB128 varint. Values
/// use XOR-with-previous with leading/trailing-zero windows.
pub struct FloatEncoder {
    writer: BitWriter,
    count: u32,

    base_ts: Timestamp,
    prev_ts: Timestamp,
    prev_delta: i64,

    base_value_bits: u64,
    prev_value_bits: u64,
    prev_leading: u32,
    prev_trailing: u32,

    agg: Aggregates,
}

impl FloatEncoder {
    /// Create a new encoder
    pub fn new() -> Self {
        Self {
            writer: BitWriter::with_capacity(512),
            count: 0,
            base_ts: 0,
            prev_ts: 0,
            prev_delta: 0,
            base_value_bits: 0,
            prev_value_bits: 0,
            prev_leading: 0,
            prev_trailing: 0,
            agg: Aggregates::new(),
        }
    }

    /// Number of samples encoded so far
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Current body size in bytes
    pub fn body_len(&self) -> usize {
        self.writer.byte_len()
    }

    /// Encode a timestamp-value pair.
    ///
    /// Timestamps must be fed in strictly increasing order; the caller
    /// enforces that.
    pub fn encode(&mut self, ts: Timestamp, value: f64) {
        if self.count == 0 {
            // First sample lives in the frame header, not the body.
            self.base_ts = ts;
            self.prev_ts = ts;
            self.prev_delta = 0;
            self.base_value_bits = value.to_bits();
            self.prev_value_bits = self.base_value_bits;
        } else {
            self.encode_timestamp(ts);
            self.encode_value(value);
        }
        self.agg.add(ts, value);
        self.count += 1;
    }

    /// Finish and return `(body, count, base_ts, base_value_bits, aggregates)`
    pub fn finish(self) -> (Vec<u8>, u32, Timestamp, u64, Aggregates) {
        (
            self.writer.finish(),
            self.count,
            self.base_ts,
            self.base_value_bits,
            self.agg,
        )
    }

    fn encode_timestamp(&mut self, ts: Timestamp) {
        let delta = ts.wrapping_sub(self.prev_ts) as i64;
        let dod = delta.wrapping_sub(self.prev_delta);

        // Regular series tick with the same interval every time, so the
        // delta-of-delta is almost always zero.
        if dod == 0 {
            self.writer.write_bit(false);
        } else {
            self.writer.write_bit(true);
            let mut v = zigzag(dod);
            loop {
                let group = (v & 0x7F) as u64;
                v >>= 7;
                if v == 0 {
                    self.writer.write_bits(group, 8);
                    break;
                }
                self.writer.write_bits(group | 0x80, 8);
            }
        }

        self.prev_delta = delta;
        self.prev_ts = ts;
    }

    fn encode_value(&mut self, value: f64) {
        let bits = value.to_bits();
        let xor = bits ^ self.prev_value_bits;

        if xor == 0 {
            self.writer.write_bit(false);
        } else {
            self.writer.write_bit(true);

            let leading = xor.leading_zeros();
            let trailing = xor.trailing_zeros();

            if leading >= self.prev_leading && trailing >= self.prev_trailing {
                // Meaningful bits fit the previous window
                self.writer.write_bit(false);
                let meaningful = 64 - self.prev_leading - self.prev_trailing;
                self.writer.write_bits(xor >> self.prev_trailing, meaningful);
            } else {
                self.writer.write_bit(true);

                let leading = leading.min(31);
                let meaningful = 64 - leading - trailing;
                self.writer.write_bits(leading as u64, 5);
                // 64 meaningful bits is stored as 0 in six bits
                self.writer.write_bits(meaningful as u64 & 0x3F, 6);
                self.writer.write_bits(xor >> trailing, meaningful);

                self.prev_leading = leading;
                self.prev_trailing = trailing;
            }
        }

        self.prev_value_bits = bits;
    }
}

impl Default for FloatEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encoder for event series leaf bodies.
///
/// Byte-oriented: each sample is a zig-zag LEB128 timestamp delta followed by
/// a length-prefixed opaque byte string. The body stays byte-aligned so the
/// framing layer can run it through LZ4.
pub struct EventEncoder {
    body: Vec<u8>,
    count: u32,
    base_ts: Timestamp,
    prev_ts: Timestamp,
}

impl EventEncoder {
    /// Create a new encoder
    pub fn new() -> Self {
        Self {
            body: Vec::with_capacity(512),
            count: 0,
            base_ts: 0,
            prev_ts: 0,
        }
    }

    /// Number of samples encoded so far
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Current body size in bytes
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Encode one event
    pub fn encode(&mut self, ts: Timestamp, data: &[u8]) {
        if self.count == 0 {
            self.base_ts = ts;
        } else {
            let delta = ts.wrapping_sub(self.prev_ts) as i64;
            let mut v = zigzag(delta);
            loop {
                let group = (v & 0x7F) as u8;
                v >>= 7;
                if v == 0 {
                    self.body.push(group);
                    break;
                }
                self.body.push(group | 0x80);
            }
        }
        self.prev_ts = ts;
        self.body
            .extend_from_slice(&(data.len() as u32).to_le_bytes());
        self.body.extend_from_slice(data);
        self.count += 1;
    }

    /// Finish and return `(body, count, base_ts)`
    pub fn finish(self) -> (Vec<u8>, u32, Timestamp) {
        (self.body, self.count, self.base_ts)
    }
}

impl Default for EventEncoder {
    fn default() -> Self {
        Self::new()
    }
}
