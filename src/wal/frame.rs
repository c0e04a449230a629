//! WAL frame encoding
//!
//! Frame layout:
//! - 4 bytes: magic `0x57414C00`
//! - 2 bytes: stream id
//! - 8 bytes: frame sequence number
//! - 4 bytes: sample count
//! - 4 bytes: body length
//! - 4 bytes: CRC32 of the body
//! - body: bincode-encoded samples

use bytes::{Buf, BufMut};

use crate::checksum::crc32;
use crate::error::{EmberError, Result};
use crate::types::Sample;

const FRAME_MAGIC: u32 = 0x57414C00;

/// Frame header size on disk
pub const FRAME_HEADER_SIZE: usize = 26;

/// A decoded WAL frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Owning stream
    pub stream_id: u16,
    /// Position in the stream's seal order
    pub frame_seq: u64,
    /// Batched samples in append order
    pub samples: Vec<Sample>,
}

/// Encode a batch of samples into a frame
pub fn encode_frame(stream_id: u16, frame_seq: u64, samples: &[Sample]) -> Result<Vec<u8>> {
    let body =
        bincode::serialize(samples).map_err(|e| EmberError::BadData(format!("frame body: {}", e)))?;

    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    buf.put_u32_le(FRAME_MAGIC);
    buf.put_u16_le(stream_id);
    buf.put_u64_le(frame_seq);
    buf.put_u32_le(samples.len() as u32);
    buf.put_u32_le(body.len() as u32);
    buf.put_u32_le(crc32(&body));
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decode the frame at the start of `data`.
///
/// Returns the frame and the bytes consumed, or `None` when `data` holds
/// only a truncated tail (a crash mid-write). Damaged frames are errors.
pub fn decode_frame(data: &[u8]) -> Result<Option<(Frame, usize)>> {
    if data.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }
    let mut cursor = data;
    let magic = cursor.get_u32_le();
    if magic != FRAME_MAGIC {
        return Err(EmberError::Corruption(format!(
            "bad frame magic {:#x}",
            magic
        )));
    }
    let stream_id = cursor.get_u16_le();
    let frame_seq = cursor.get_u64_le();
    let n_samples = cursor.get_u32_le();
    let body_len = cursor.get_u32_le() as usize;
    let expected = cursor.get_u32_le();

    if cursor.remaining() < body_len {
        return Ok(None);
    }
    let body = &cursor[..body_len];
    let actual = crc32(body);
    if expected != actual {
        return Err(EmberError::ChecksumMismatch { expected, actual });
    }

    let samples: Vec<Sample> =
        bincode::deserialize(body).map_err(|e| EmberError::Corruption(format!("frame body: {}", e)))?;
    if samples.len() != n_samples as usize {
        return Err(EmberError::Corruption(format!(
            "frame sample count {} does not match header {}",
            samples.len(),
            n_samples
        )));
    }

    Ok(Some((
        Frame {
            stream_id,
            frame_seq,
            samples,
        },
        FRAME_HEADER_SIZE + body_len,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Payload;

    fn samples() -> Vec<Sample> {
        vec![
            Sample::float(1, 100, 1.5),
            Sample::float(2, 110, -2.5),
            Sample {
                series: 3 | (1 << 63),
                timestamp: 120,
                payload: Payload::Event(b"restart".to_vec()),
            },
        ]
    }

    #[test]
    fn test_frame_roundtrip() {
        let encoded = encode_frame(7, 42, &samples()).unwrap();
        let (frame, consumed) = decode_frame(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(frame.stream_id, 7);
        assert_eq!(frame.frame_seq, 42);
        assert_eq!(frame.samples, samples());
    }

    #[test]
    fn test_truncated_tail_is_not_an_error() {
        let encoded = encode_frame(0, 1, &samples()).unwrap();
        assert!(decode_frame(&encoded[..10]).unwrap().is_none());
        assert!(decode_frame(&encoded[..FRAME_HEADER_SIZE + 2]).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_body_is_checksum_error() {
        let mut encoded = encode_frame(0, 1, &samples()).unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        let err = decode_frame(&encoded).unwrap_err();
        assert!(matches!(err, EmberError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut buf = encode_frame(0, 1, &samples()).unwrap();
        buf.extend(encode_frame(0, 2, &samples()[..1]).unwrap());

        let (first, used) = decode_frame(&buf).unwrap().unwrap();
        assert_eq!(first.frame_seq, 1);
        let (second, _) = decode_frame(&buf[used..]).unwrap().unwrap();
        assert_eq!(second.frame_seq, 2);
        assert_eq!(second.samples.len(), 1);
    }
}
