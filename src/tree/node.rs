//! On-block node format for series trees
//!
//! Every sealed node occupies one block. The header carries the node's
//! placement (level, series, sibling chain) and a self summary so parents
//! and recovery can use the node without decoding its payload. Leaf payloads
//! are codec frames; inner payloads are arrays of subtree references.

use bytes::{Buf, BufMut};

use crate::checksum::crc32;
use crate::codec::{get_aggregates, put_aggregates, AGGREGATES_SIZE};
use crate::config::BLOCK_PAYLOAD_SIZE;
use crate::error::{EmberError, Result};
use crate::types::{Aggregates, LogicAddr, SeriesId, Timestamp};

const NODE_MAGIC: u32 = 0x4E425430;

/// Serialized node header size
pub const NODE_HEADER_SIZE: usize = 4 + 1 + 1 + 2 + 8 + 8 + 8 + 8 + AGGREGATES_SIZE + 4 + 4;

/// Payload capacity of one node
pub const NODE_PAYLOAD_CAPACITY: usize = BLOCK_PAYLOAD_SIZE - NODE_HEADER_SIZE;

/// Serialized size of one subtree reference
pub const SUBTREE_REF_SIZE: usize = 8 + 8 + 8 + AGGREGATES_SIZE;

/// Hard cap on entries in an inner node payload
pub const MAX_INNER_ENTRIES: usize = NODE_PAYLOAD_CAPACITY / SUBTREE_REF_SIZE;

/// Node payload kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Compressed float samples
    FloatLeaf,
    /// Length-prefixed event samples
    EventLeaf,
    /// Subtree references
    Inner,
}

impl NodeKind {
    fn to_u8(self) -> u8 {
        match self {
            NodeKind::FloatLeaf => 0,
            NodeKind::EventLeaf => 1,
            NodeKind::Inner => 2,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(NodeKind::FloatLeaf),
            1 => Ok(NodeKind::EventLeaf),
            2 => Ok(NodeKind::Inner),
            other => Err(EmberError::Corruption(format!("bad node kind {}", other))),
        }
    }
}

/// Reference to a sealed subtree, stored in parent nodes and open extents
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubtreeRef {
    /// Address of the sealed node
    pub addr: LogicAddr,
    /// Earliest timestamp covered
    pub begin: Timestamp,
    /// Latest timestamp covered
    pub end: Timestamp,
    /// Aggregate summary of the subtree
    pub agg: Aggregates,
}

/// Node header
#[derive(Debug, Clone)]
pub struct NodeHeader {
    /// Payload kind
    pub kind: NodeKind,
    /// Tree level; leaves are level 0
    pub level: u8,
    /// Samples in a leaf, entries in an inner node
    pub count: u16,
    /// Owning series
    pub series: SeriesId,
    /// Previously sealed node at the same level, or `EMPTY_ADDR`
    pub prev: LogicAddr,
    /// Earliest timestamp covered
    pub begin: Timestamp,
    /// Latest timestamp covered
    pub end: Timestamp,
    /// Self summary: the node used as a subtree of its parent
    pub summary: Aggregates,
}

impl NodeHeader {
    /// The node's own subtree reference given its address
    pub fn self_ref(&self, addr: LogicAddr) -> SubtreeRef {
        SubtreeRef {
            addr,
            begin: self.begin,
            end: self.end,
            agg: self.summary,
        }
    }
}

/// A loaded node: header plus raw payload
#[derive(Debug)]
pub struct Node {
    /// Parsed header
    pub header: NodeHeader,
    /// Payload bytes (codec frame or serialized subtree refs)
    pub payload: Vec<u8>,
}

/// Serialize a node into a block payload
pub fn seal_node(header: &NodeHeader, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > NODE_PAYLOAD_CAPACITY {
        return Err(EmberError::BadArg(format!(
            "node payload of {} bytes exceeds capacity",
            payload.len()
        )));
    }
    let mut buf = Vec::with_capacity(NODE_HEADER_SIZE + payload.len());
    buf.put_u32_le(NODE_MAGIC);
    buf.put_u8(header.kind.to_u8());
    buf.put_u8(header.level);
    buf.put_u16_le(header.count);
    buf.put_u64_le(header.series);
    buf.put_u64_le(header.prev);
    buf.put_u64_le(header.begin);
    buf.put_u64_le(header.end);
    put_aggregates(&mut buf, &header.summary);
    buf.put_u32_le(payload.len() as u32);
    buf.put_u32_le(crc32(payload));
    buf.extend_from_slice(payload);
    Ok(buf)
}

impl Node {
    /// Parse a node from a block payload
    pub fn parse(block: &[u8]) -> Result<Self> {
        if block.len() < NODE_HEADER_SIZE {
            return Err(EmberError::Corruption("node block too short".into()));
        }
        let mut cursor = block;
        let magic = cursor.get_u32_le();
        if magic != NODE_MAGIC {
            return Err(EmberError::Corruption(format!(
                "bad node magic {:#x}",
                magic
            )));
        }
        let kind = NodeKind::from_u8(cursor.get_u8())?;
        let level = cursor.get_u8();
        let count = cursor.get_u16_le();
        let series = cursor.get_u64_le();
        let prev = cursor.get_u64_le();
        let begin = cursor.get_u64_le();
        let end = cursor.get_u64_le();
        let summary = get_aggregates(&cursor[..AGGREGATES_SIZE]);
        cursor.advance(AGGREGATES_SIZE);
        let payload_len = cursor.get_u32_le() as usize;
        let expected = cursor.get_u32_le();
        if cursor.remaining() < payload_len {
            return Err(EmberError::Corruption("node payload truncated".into()));
        }
        let payload = cursor[..payload_len].to_vec();
        let actual = crc32(&payload);
        if expected != actual {
            return Err(EmberError::ChecksumMismatch { expected, actual });
        }
        Ok(Self {
            header: NodeHeader {
                kind,
                level,
                count,
                series,
                prev,
                begin,
                end,
                summary,
            },
            payload,
        })
    }

    /// Decode the subtree references of an inner node
    pub fn subtree_refs(&self) -> Result<Vec<SubtreeRef>> {
        if self.header.kind != NodeKind::Inner {
            return Err(EmberError::BadArg("not an inner node".into()));
        }
        let mut cursor = &self.payload[..];
        let mut refs = Vec::with_capacity(self.header.count as usize);
        for _ in 0..self.header.count {
            if cursor.remaining() < SUBTREE_REF_SIZE {
                return Err(EmberError::Corruption("inner node entry truncated".into()));
            }
            let addr = cursor.get_u64_le();
            let begin = cursor.get_u64_le();
            let end = cursor.get_u64_le();
            let agg = get_aggregates(&cursor[..AGGREGATES_SIZE]);
            cursor.advance(AGGREGATES_SIZE);
            refs.push(SubtreeRef {
                addr,
                begin,
                end,
                agg,
            });
        }
        Ok(refs)
    }
}

/// Serialize subtree references into an inner node payload
pub fn serialize_refs(refs: &[SubtreeRef]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(refs.len() * SUBTREE_REF_SIZE);
    for r in refs {
        buf.put_u64_le(r.addr);
        buf.put_u64_le(r.begin);
        buf.put_u64_le(r.end);
        put_aggregates(&mut buf, &r.agg);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EMPTY_ADDR;

    fn sample_refs() -> Vec<SubtreeRef> {
        (0..5)
            .map(|i| {
                let mut agg = Aggregates::new();
                agg.add(i * 100, i as f64);
                agg.add(i * 100 + 50, i as f64 * 2.0);
                SubtreeRef {
                    addr: 10 + i,
                    begin: i * 100,
                    end: i * 100 + 50,
                    agg,
                }
            })
            .collect()
    }

    #[test]
    fn test_inner_node_roundtrip() {
        let refs = sample_refs();
        let payload = serialize_refs(&refs);

        let mut summary = Aggregates::new();
        for r in &refs {
            summary.combine(&r.agg);
        }
        let header = NodeHeader {
            kind: NodeKind::Inner,
            level: 1,
            count: refs.len() as u16,
            series: 77,
            prev: EMPTY_ADDR,
            begin: refs[0].begin,
            end: refs.last().unwrap().end,
            summary,
        };

        let block = seal_node(&header, &payload).unwrap();
        let node = Node::parse(&block).unwrap();
        assert_eq!(node.header.level, 1);
        assert_eq!(node.header.series, 77);
        assert_eq!(node.header.begin, 0);
        assert_eq!(node.header.end, 450);
        assert_eq!(node.subtree_refs().unwrap(), refs);
    }

    #[test]
    fn test_corrupt_payload_detected() {
        let refs = sample_refs();
        let payload = serialize_refs(&refs);
        let header = NodeHeader {
            kind: NodeKind::Inner,
            level: 1,
            count: refs.len() as u16,
            series: 1,
            prev: EMPTY_ADDR,
            begin: 0,
            end: 450,
            summary: Aggregates::new(),
        };
        let mut block = seal_node(&header, &payload).unwrap();
        let last = block.len() - 1;
        block[last] ^= 0x01;

        let err = Node::parse(&block).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_fanout_fits_payload() {
        assert!(crate::config::TREE_FANOUT <= MAX_INNER_ENTRIES);
    }
}
