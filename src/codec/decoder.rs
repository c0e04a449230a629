//! Streaming decoders for leaf block bodies

use super::bitstream::BitReader;
use super::encoder::unzigzag;
use crate::error::{EmberError, Result};
use crate::types::Timestamp;

fn truncated() -> EmberError {
    EmberError::Corruption("leaf body truncated".into())
}

/// Decoder for float series leaf bodies, mirror of `FloatEncoder`
pub struct FloatDecoder<'a> {
    reader: BitReader<'a>,
    count: u32,
    decoded: u32,

    prev_ts: Timestamp,
    prev_delta: i64,

    base_value_bits: u64,
    prev_value_bits: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl<'a> FloatDecoder<'a> {
    /// Create a decoder over a body with the frame header fields
    pub fn new(body: &'a [u8], count: u32, base_ts: Timestamp, base_value_bits: u64) -> Self {
        Self {
            reader: BitReader::new(body),
            count,
            decoded: 0,
            prev_ts: base_ts,
            prev_delta: 0,
            base_value_bits,
            prev_value_bits: base_value_bits,
            prev_leading: 0,
            prev_trailing: 0,
        }
    }

    /// Decode the next pair, `None` at end of block
    pub fn next_pair(&mut self) -> Result<Option<(Timestamp, f64)>> {
        if self.decoded >= self.count {
            return Ok(None);
        }
        if self.decoded == 0 {
            self.decoded = 1;
            return Ok(Some((self.prev_ts, f64::from_bits(self.base_value_bits))));
        }
        let ts = self.decode_timestamp()?;
        let value = self.decode_value()?;
        self.decoded += 1;
        Ok(Some((ts, value)))
    }

    /// Decode everything remaining
    pub fn decode_all(&mut self) -> Result<Vec<(Timestamp, f64)>> {
        let mut out = Vec::with_capacity(self.count as usize);
        while let Some(pair) = self.next_pair()? {
            out.push(pair);
        }
        Ok(out)
    }

    fn decode_timestamp(&mut self) -> Result<Timestamp> {
        let changed = self.reader.read_bit().ok_or_else(truncated)?;
        let dod = if changed {
            let mut raw = 0u64;
            let mut shift = 0u32;
            loop {
                let group = self.reader.read_bits(8).ok_or_else(truncated)?;
                raw |= (group & 0x7F) << shift;
                if group & 0x80 == 0 {
                    break;
                }
                shift += 7;
                if shift > 63 {
                    return Err(EmberError::Corruption("timestamp varint overflow".into()));
                }
            }
            unzigzag(raw)
        } else {
            0
        };

        let delta = self.prev_delta.wrapping_add(dod);
        let ts = self.prev_ts.wrapping_add(delta as u64);
        self.prev_delta = delta;
        self.prev_ts = ts;
        Ok(ts)
    }

    fn decode_value(&mut self) -> Result<f64> {
        let changed = self.reader.read_bit().ok_or_else(truncated)?;
        if !changed {
            return Ok(f64::from_bits(self.prev_value_bits));
        }

        let new_window = self.reader.read_bit().ok_or_else(truncated)?;
        let meaningful = if new_window {
            let leading = self.reader.read_bits(5).ok_or_else(truncated)? as u32;
            let mut meaningful = self.reader.read_bits(6).ok_or_else(truncated)? as u32;
            if meaningful == 0 {
                meaningful = 64;
            }
            self.prev_leading = leading;
            self.prev_trailing = 64 - leading - meaningful;
            meaningful
        } else {
            64 - self.prev_leading - self.prev_trailing
        };

        let payload = self.reader.read_bits(meaningful).ok_or_else(truncated)?;
        let xor = payload << self.prev_trailing;
        let bits = self.prev_value_bits ^ xor;
        self.prev_value_bits = bits;
        Ok(f64::from_bits(bits))
    }
}

/// Decoder for event series leaf bodies, mirror of `EventEncoder`
pub struct EventDecoder<'a> {
    body: &'a [u8],
    pos: usize,
    count: u32,
    decoded: u32,
    prev_ts: Timestamp,
}

impl<'a> EventDecoder<'a> {
    /// Create a decoder over a (decompressed) body
    pub fn new(body: &'a [u8], count: u32, base_ts: Timestamp) -> Self {
        Self {
            body,
            pos: 0,
            count,
            decoded: 0,
            prev_ts: base_ts,
        }
    }

    /// Decode the next event, `None` at end of block
    pub fn next_event(&mut self) -> Result<Option<(Timestamp, Vec<u8>)>> {
        if self.decoded >= self.count {
            return Ok(None);
        }
        if self.decoded > 0 {
            let delta = self.read_varint()?;
            self.prev_ts = self.prev_ts.wrapping_add(delta as u64);
        }
        let len = self.read_u32()? as usize;
        if self.pos + len > self.body.len() {
            return Err(truncated());
        }
        let data = self.body[self.pos..self.pos + len].to_vec();
        self.pos += len;
        self.decoded += 1;
        Ok(Some((self.prev_ts, data)))
    }

    /// Decode everything remaining
    pub fn decode_all(&mut self) -> Result<Vec<(Timestamp, Vec<u8>)>> {
        let mut out = Vec::with_capacity(self.count as usize);
        while let Some(ev) = self.next_event()? {
            out.push(ev);
        }
        Ok(out)
    }

    fn read_varint(&mut self) -> Result<i64> {
        let mut raw = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = *self.body.get(self.pos).ok_or_else(truncated)?;
            self.pos += 1;
            raw |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift > 63 {
                return Err(EmberError::Corruption("event varint overflow".into()));
            }
        }
        Ok(unzigzag(raw))
    }

    fn read_u32(&mut self) -> Result<u32> {
        if self.pos + 4 > self.body.len() {
            return Err(truncated());
        }
        let mut le = [0u8; 4];
        le.copy_from_slice(&self.body[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(u32::from_le_bytes(le))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encoder::{EventEncoder, FloatEncoder};

    #[test]
    fn test_float_roundtrip() {
        let points: Vec<(u64, f64)> = (0..500)
            .map(|i| {
                (
                    1_000_000_000 + i * 10_000 + (i % 7) * 3,
                    20.0 + (i as f64 * 0.1).sin() * 5.0,
                )
            })
            .collect();

        let mut enc = FloatEncoder::new();
        for (ts, v) in &points {
            enc.encode(*ts, *v);
        }
        let (body, count, base_ts, base_bits, _) = enc.finish();

        let mut dec = FloatDecoder::new(&body, count, base_ts, base_bits);
        let decoded = dec.decode_all().unwrap();
        assert_eq!(decoded, points);
    }

    #[test]
    fn test_float_roundtrip_two_samples() {
        let mut enc = FloatEncoder::new();
        enc.encode(100, 1.5);
        enc.encode(250, -3.25);
        let (body, count, base_ts, base_bits, _) = enc.finish();

        let mut dec = FloatDecoder::new(&body, count, base_ts, base_bits);
        assert_eq!(dec.next_pair().unwrap(), Some((100, 1.5)));
        assert_eq!(dec.next_pair().unwrap(), Some((250, -3.25)));
        assert_eq!(dec.next_pair().unwrap(), None);
    }

    #[test]
    fn test_float_special_values() {
        let points = vec![
            (10u64, 0.0f64),
            (20, -0.0),
            (30, f64::MAX),
            (40, f64::MIN_POSITIVE),
            (50, 1.0 / 3.0),
        ];
        let mut enc = FloatEncoder::new();
        for (ts, v) in &points {
            enc.encode(*ts, *v);
        }
        let (body, count, base_ts, base_bits, _) = enc.finish();
        let decoded = FloatDecoder::new(&body, count, base_ts, base_bits)
            .decode_all()
            .unwrap();
        for ((ts, v), (dts, dv)) in points.iter().zip(decoded.iter()) {
            assert_eq!(ts, dts);
            assert_eq!(v.to_bits(), dv.to_bits());
        }
    }

    #[test]
    fn test_deterministic_encoding() {
        let encode = || {
            let mut enc = FloatEncoder::new();
            for i in 0..100u64 {
                enc.encode(1000 + i * 500, i as f64 * 0.25);
            }
            enc.finish().0
        };
        assert_eq!(encode(), encode());
    }

    #[test]
    fn test_event_roundtrip() {
        let events: Vec<(u64, Vec<u8>)> = vec![
            (100, b"power on".to_vec()),
            (150, vec![]),
            (1_000_000, vec![0xDE, 0xAD, 0xBE, 0xEF]),
        ];
        let mut enc = EventEncoder::new();
        for (ts, data) in &events {
            enc.encode(*ts, data);
        }
        let (body, count, base_ts) = enc.finish();

        let decoded = EventDecoder::new(&body, count, base_ts)
            .decode_all()
            .unwrap();
        assert_eq!(decoded, events);
    }

    #[test]
    fn test_truncated_body_is_corruption() {
        let mut enc = FloatEncoder::new();
        for i in 0..10u64 {
            enc.encode(1000 + i * 17, i as f64 * 1.1);
        }
        let (body, count, base_ts, base_bits) =
            (enc.finish().0, 10, 1000u64, 0.0f64.to_bits());
        let cut = &body[..body.len() / 2];
        let mut dec = FloatDecoder::new(cut, count, base_ts, base_bits);
        let err = dec.decode_all().unwrap_err();
        assert!(err.is_corruption());
    }
}
