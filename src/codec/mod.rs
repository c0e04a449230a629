//! Leaf block codec
//!
//! Compresses a stream of `(timestamp, value)` pairs into the payload of one
//! storage block. Timestamps are delta-of-delta coded with zig-zag varints,
//! float values use XOR-with-previous bit packing, event payloads are
//! length-prefixed opaque bytes with optional LZ4 over the whole body.
//!
//! Frame layout for float leaves:
//! - 4 bytes: sample count
//! - 8 bytes: first timestamp
//! - 8 bytes: first value (raw bits)
//! - 1 byte: flags
//! - 4 bytes: body length
//! - body (bit-packed, one timestamp part + one value part per sample)
//! - 64 bytes: aggregate footer (when flagged)
//! - 4 bytes: CRC32 of everything above
//!
//! Event leaves drop the value/footer fields and may LZ4 the body.

mod bitstream;
mod decoder;
mod encoder;

pub use bitstream::{BitReader, BitWriter};
pub use decoder::{EventDecoder, FloatDecoder};
pub use encoder::{EventEncoder, FloatEncoder, MAX_FLOAT_SAMPLE_BYTES};

use bytes::{Buf, BufMut};

use crate::checksum::crc32;
use crate::error::{EmberError, Result};
use crate::types::{Aggregates, Timestamp};

const FLAG_FOOTER: u8 = 1;
const FLAG_LZ4: u8 = 1;

/// Fixed overhead of a framed float leaf (header + footer + checksum)
pub const FLOAT_LEAF_OVERHEAD: usize = 25 + AGGREGATES_SIZE + 4;

/// Fixed overhead of a framed event leaf (header + checksum)
pub const EVENT_LEAF_OVERHEAD: usize = 17 + 4;

/// Serialized size of an aggregate footer
pub const AGGREGATES_SIZE: usize = 64;

pub(crate) fn put_aggregates(buf: &mut Vec<u8>, agg: &Aggregates) {
    buf.put_u64_le(agg.count);
    buf.put_f64_le(agg.sum);
    buf.put_f64_le(agg.min);
    buf.put_u64_le(agg.min_ts);
    buf.put_f64_le(agg.max);
    buf.put_u64_le(agg.max_ts);
    buf.put_f64_le(agg.first);
    buf.put_f64_le(agg.last);
}

pub(crate) fn get_aggregates(mut buf: &[u8]) -> Aggregates {
    Aggregates {
        count: buf.get_u64_le(),
        sum: buf.get_f64_le(),
        min: buf.get_f64_le(),
        min_ts: buf.get_u64_le(),
        max: buf.get_f64_le(),
        max_ts: buf.get_u64_le(),
        first: buf.get_f64_le(),
        last: buf.get_f64_le(),
    }
}

/// Frame a finished float encoder into a leaf payload.
///
/// Returns the payload and the aggregate summary of its samples.
pub fn frame_float_leaf(enc: FloatEncoder) -> (Vec<u8>, Aggregates) {
    let (body, count, base_ts, base_value_bits, agg) = enc.finish();

    let mut buf = Vec::with_capacity(FLOAT_LEAF_OVERHEAD + body.len());
    buf.put_u32_le(count);
    buf.put_u64_le(base_ts);
    buf.put_u64_le(base_value_bits);
    buf.put_u8(FLAG_FOOTER);
    buf.put_u32_le(body.len() as u32);
    buf.extend_from_slice(&body);
    put_aggregates(&mut buf, &agg);

    let checksum = crc32(&buf);
    buf.put_u32_le(checksum);
    (buf, agg)
}

/// Parsed view over a framed float leaf payload
#[derive(Debug)]
pub struct FloatLeafView<'a> {
    count: u32,
    base_ts: Timestamp,
    base_value_bits: u64,
    body: &'a [u8],
    footer: Option<Aggregates>,
}

impl<'a> FloatLeafView<'a> {
    /// Parse and checksum a payload
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        if payload.len() < 29 {
            return Err(EmberError::Corruption("float leaf too short".into()));
        }
        let (framed, mut crc_bytes) = payload.split_at(payload.len() - 4);
        let expected = crc_bytes.get_u32_le();
        let actual = crc32(framed);
        if expected != actual {
            return Err(EmberError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = framed;
        let count = cursor.get_u32_le();
        let base_ts = cursor.get_u64_le();
        let base_value_bits = cursor.get_u64_le();
        let flags = cursor.get_u8();
        let body_len = cursor.get_u32_le() as usize;
        if cursor.remaining() < body_len {
            return Err(EmberError::Corruption("float leaf body truncated".into()));
        }
        let body = &cursor[..body_len];
        cursor.advance(body_len);

        let footer = if flags & FLAG_FOOTER != 0 {
            if cursor.remaining() < AGGREGATES_SIZE {
                return Err(EmberError::Corruption("float leaf footer truncated".into()));
            }
            Some(get_aggregates(&cursor[..AGGREGATES_SIZE]))
        } else {
            None
        };

        Ok(Self {
            count,
            base_ts,
            base_value_bits,
            body,
            footer,
        })
    }

    /// Number of samples in the block
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Precomputed aggregate footer, if present
    pub fn footer(&self) -> Option<Aggregates> {
        self.footer
    }

    /// Streaming decoder over the samples
    pub fn iter(&self) -> FloatDecoder<'a> {
        FloatDecoder::new(self.body, self.count, self.base_ts, self.base_value_bits)
    }
}

/// Frame a finished event encoder into a leaf payload
pub fn frame_event_leaf(enc: EventEncoder, use_lz4: bool) -> Vec<u8> {
    let (body, count, base_ts) = enc.finish();

    let stored;
    let flags;
    if use_lz4 {
        stored = lz4_flex::compress_prepend_size(&body);
        flags = FLAG_LZ4;
    } else {
        stored = body;
        flags = 0;
    }

    let mut buf = Vec::with_capacity(EVENT_LEAF_OVERHEAD + stored.len());
    buf.put_u32_le(count);
    buf.put_u64_le(base_ts);
    buf.put_u8(flags);
    buf.put_u32_le(stored.len() as u32);
    buf.extend_from_slice(&stored);

    let checksum = crc32(&buf);
    buf.put_u32_le(checksum);
    buf
}

/// Parsed event leaf: owns the (possibly decompressed) body
pub struct EventLeaf {
    count: u32,
    base_ts: Timestamp,
    body: Vec<u8>,
}

impl EventLeaf {
    /// Parse, checksum, and decompress a payload
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < EVENT_LEAF_OVERHEAD {
            return Err(EmberError::Corruption("event leaf too short".into()));
        }
        let (framed, mut crc_bytes) = payload.split_at(payload.len() - 4);
        let expected = crc_bytes.get_u32_le();
        let actual = crc32(framed);
        if expected != actual {
            return Err(EmberError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = framed;
        let count = cursor.get_u32_le();
        let base_ts = cursor.get_u64_le();
        let flags = cursor.get_u8();
        let stored_len = cursor.get_u32_le() as usize;
        if cursor.remaining() < stored_len {
            return Err(EmberError::Corruption("event leaf body truncated".into()));
        }
        let stored = &cursor[..stored_len];

        let body = if flags & FLAG_LZ4 != 0 {
            lz4_flex::decompress_size_prepended(stored)
                .map_err(|e| EmberError::Corruption(format!("lz4: {}", e)))?
        } else {
            stored.to_vec()
        };

        Ok(Self {
            count,
            base_ts,
            body,
        })
    }

    /// Number of events in the block
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Streaming decoder over the events
    pub fn iter(&self) -> EventDecoder<'_> {
        EventDecoder::new(&self.body, self.count, self.base_ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_frame_roundtrip() {
        let mut enc = FloatEncoder::new();
        let points: Vec<(u64, f64)> = (0..200)
            .map(|i| (100_000 + i * 1_000, 1000.0 + i as f64 * 10.0))
            .collect();
        for (ts, v) in &points {
            enc.encode(*ts, *v);
        }

        let (payload, agg) = frame_float_leaf(enc);
        assert_eq!(agg.count, 200);

        let view = FloatLeafView::parse(&payload).unwrap();
        assert_eq!(view.count(), 200);
        let footer = view.footer().unwrap();
        assert_eq!(footer.count, 200);
        assert_eq!(footer.min, 1000.0);
        assert_eq!(footer.max, 1000.0 + 199.0 * 10.0);

        let decoded = view.iter().decode_all().unwrap();
        assert_eq!(decoded, points);
    }

    #[test]
    fn test_empty_float_frame() {
        let (payload, agg) = frame_float_leaf(FloatEncoder::new());
        assert_eq!(agg.count, 0);
        let view = FloatLeafView::parse(&payload).unwrap();
        assert_eq!(view.count(), 0);
        assert!(view.iter().decode_all().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_frame_rejected() {
        let mut enc = FloatEncoder::new();
        enc.encode(10, 1.0);
        enc.encode(20, 2.0);
        let (mut payload, _) = frame_float_leaf(enc);
        payload[6] ^= 0xFF;

        let err = FloatLeafView::parse(&payload).unwrap_err();
        assert!(matches!(err, EmberError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_event_frame_roundtrip_lz4() {
        let mut enc = EventEncoder::new();
        let events: Vec<(u64, Vec<u8>)> = (0..50)
            .map(|i| (1_000 + i * 10, format!("event body number {}", i).into_bytes()))
            .collect();
        for (ts, data) in &events {
            enc.encode(*ts, data);
        }

        let payload = frame_event_leaf(enc, true);
        let leaf = EventLeaf::parse(&payload).unwrap();
        assert_eq!(leaf.count(), 50);
        assert_eq!(leaf.iter().decode_all().unwrap(), events);
    }

    #[test]
    fn test_event_frame_roundtrip_raw() {
        let mut enc = EventEncoder::new();
        enc.encode(42, b"one");
        let payload = frame_event_leaf(enc, false);
        let leaf = EventLeaf::parse(&payload).unwrap();
        assert_eq!(leaf.iter().decode_all().unwrap(), vec![(42, b"one".to_vec())]);
    }
}
