//! Per-series storage tree
//!
//! Each series owns a multi-level tree of immutable sealed nodes plus one
//! open extent per level. Samples land in the level-0 extent; when a leaf
//! fills it is sealed into a block and its subtree reference bubbles into
//! the level above, recursively. Sealed nodes at each level are chained
//! through their `prev` header field, which is what makes crash recovery
//! possible: the per-level list of last-sealed addresses (the rescue
//! points) pins down every node that is not yet covered by a parent.

mod iter;
mod node;

pub use iter::{TreeAggIter, TreeEventIter, TreeScanIter};
pub use node::{
    seal_node, serialize_refs, Node, NodeHeader, NodeKind, SubtreeRef, MAX_INNER_ENTRIES,
    NODE_PAYLOAD_CAPACITY,
};

use std::sync::Arc;
use tracing::{error, warn};

use crate::blockstore::BlockStore;
use crate::codec::{
    frame_event_leaf, frame_float_leaf, EventEncoder, FloatEncoder, EVENT_LEAF_OVERHEAD,
    FLOAT_LEAF_OVERHEAD, MAX_FLOAT_SAMPLE_BYTES,
};
use crate::config::TREE_FANOUT;
use crate::error::{EmberError, Result};
use crate::types::{
    is_event_series, Aggregates, LogicAddr, Payload, SeriesId, Timestamp, EMPTY_ADDR,
};

/// Result of a successful append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Sample stored in the open leaf
    Ok,
    /// Sample stored and at least one node was sealed; the caller should
    /// persist fresh rescue points before the next restart
    OkFlushNeeded,
}

/// Classification of a persisted rescue-point list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStatus {
    /// New series or cleanly closed tree; no replay needed
    Ok,
    /// Open leaf was lost; sealed levels are intact, WAL replay required
    Repair,
    /// The list is inconsistent; unflushed data is unrecoverable
    Lost,
}

enum LeafExtent {
    Float {
        enc: FloatEncoder,
        samples: Vec<(Timestamp, f64)>,
    },
    Event {
        enc: EventEncoder,
        samples: Vec<(Timestamp, Vec<u8>)>,
    },
}

impl LeafExtent {
    fn new(event: bool) -> Self {
        if event {
            LeafExtent::Event {
                enc: EventEncoder::new(),
                samples: Vec::new(),
            }
        } else {
            LeafExtent::Float {
                enc: FloatEncoder::new(),
                samples: Vec::new(),
            }
        }
    }

    fn count(&self) -> usize {
        match self {
            LeafExtent::Float { samples, .. } => samples.len(),
            LeafExtent::Event { samples, .. } => samples.len(),
        }
    }
}

/// In-memory state of one series tree
pub struct SeriesTree {
    id: SeriesId,
    store: Arc<BlockStore>,
    rescue_points: Vec<LogicAddr>,
    initialized: bool,
    dirty: bool,
    leaf: LeafExtent,
    /// Open inner extents; `inner[i]` is the extent at tree level `i + 1`
    inner: Vec<Vec<SubtreeRef>>,
    /// Last sealed node address per level; `prev.len() == inner.len() + 1`
    prev: Vec<LogicAddr>,
    last_ts: Option<Timestamp>,
}

impl SeriesTree {
    /// Create a tree shell; nothing is read until `force_init`
    pub fn new(id: SeriesId, rescue_points: Vec<LogicAddr>, store: Arc<BlockStore>) -> Self {
        Self {
            id,
            store,
            rescue_points,
            initialized: false,
            dirty: false,
            leaf: LeafExtent::new(is_event_series(id)),
            inner: Vec::new(),
            prev: vec![EMPTY_ADDR],
            last_ts: None,
        }
    }

    /// Series id
    pub fn id(&self) -> SeriesId {
        self.id
    }

    /// Whether `force_init` already ran
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Timestamp of the newest stored sample
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.last_ts
    }

    /// Classify a persisted rescue-point list.
    ///
    /// A clean close collapses the tree into a single root, leaving exactly
    /// one address in the final position. A running snapshot is a prefix of
    /// addresses followed by empty slots (the open levels). Anything else
    /// cannot arise from normal operation.
    pub fn classify(rescue_points: &[LogicAddr]) -> RepairStatus {
        if rescue_points.is_empty() {
            return RepairStatus::Ok;
        }
        let nonempty = rescue_points.iter().filter(|a| **a != EMPTY_ADDR).count();
        let last = *rescue_points.last().expect("non-empty list");
        if nonempty == 1 && last != EMPTY_ADDR {
            return RepairStatus::Ok;
        }
        let highest = match rescue_points.iter().rposition(|a| *a != EMPTY_ADDR) {
            Some(i) => i,
            None => return RepairStatus::Repair, // only the open leaf existed
        };
        if rescue_points[..=highest].iter().all(|a| *a != EMPTY_ADDR) {
            RepairStatus::Repair
        } else {
            RepairStatus::Lost
        }
    }

    /// Initialize the tree from its rescue points, reading blocks as needed.
    ///
    /// Returns the repair classification so the caller can schedule WAL
    /// replay. A `Lost` tree is reopened empty.
    pub fn force_init(&mut self) -> Result<RepairStatus> {
        if self.initialized {
            return Ok(RepairStatus::Ok);
        }
        let status = Self::classify(&self.rescue_points);
        match status {
            RepairStatus::Ok => {
                if !self.rescue_points.is_empty() {
                    let root = *self.rescue_points.last().expect("non-empty list");
                    self.restore_from_root(root)?;
                }
            }
            RepairStatus::Repair => {
                self.restore_from_chains()?;
            }
            RepairStatus::Lost => {
                error!(series = self.id, "inconsistent rescue points, tree reopened empty");
            }
        }
        self.initialized = true;
        Ok(status)
    }

    /// Append a float sample
    pub fn append(&mut self, ts: Timestamp, value: f64) -> Result<AppendOutcome> {
        self.append_sample(ts, &Payload::Float(value), false)
    }

    /// Append an event sample
    pub fn append_event(&mut self, ts: Timestamp, data: &[u8]) -> Result<AppendOutcome> {
        self.append_sample(ts, &Payload::Event(data.to_vec()), false)
    }

    /// Append with replay semantics: non-advancing timestamps are silently
    /// coalesced to the first-seen value instead of failing
    pub fn append_sample(
        &mut self,
        ts: Timestamp,
        payload: &Payload,
        allow_duplicates: bool,
    ) -> Result<AppendOutcome> {
        if !self.initialized {
            self.force_init()?;
        }
        if let Some(last) = self.last_ts {
            if ts <= last {
                if allow_duplicates {
                    return Ok(AppendOutcome::Ok);
                }
                return Err(EmberError::Late { ts, last });
            }
        }

        let needs_seal = match (&self.leaf, payload) {
            (LeafExtent::Float { enc, .. }, Payload::Float(_)) => {
                let projected = enc.body_len() + MAX_FLOAT_SAMPLE_BYTES + FLOAT_LEAF_OVERHEAD;
                enc.count() > 0 && projected > NODE_PAYLOAD_CAPACITY
            }
            (LeafExtent::Event { enc, .. }, Payload::Event(data)) => {
                let sample_size = 10 + 4 + data.len();
                if sample_size + EVENT_LEAF_OVERHEAD > NODE_PAYLOAD_CAPACITY {
                    return Err(EmberError::BadArg(format!(
                        "event of {} bytes does not fit one block",
                        data.len()
                    )));
                }
                let projected = enc.body_len() + sample_size + EVENT_LEAF_OVERHEAD;
                enc.count() > 0 && projected > NODE_PAYLOAD_CAPACITY
            }
            (LeafExtent::Float { .. }, Payload::Event(_)) => {
                return Err(EmberError::BadArg(format!(
                    "event payload for float series {}",
                    self.id
                )));
            }
            (LeafExtent::Event { .. }, Payload::Float(_)) => {
                return Err(EmberError::BadArg(format!(
                    "float payload for event series {}",
                    self.id
                )));
            }
        };
        if needs_seal {
            self.seal_leaf()?;
        }
        match (&mut self.leaf, payload) {
            (LeafExtent::Float { enc, samples }, Payload::Float(value)) => {
                enc.encode(ts, *value);
                samples.push((ts, *value));
            }
            (LeafExtent::Event { enc, samples }, Payload::Event(data)) => {
                enc.encode(ts, data);
                samples.push((ts, data.clone()));
            }
            _ => unreachable!("payload kind was checked above"),
        }

        self.last_ts = Some(ts);
        self.dirty = true;
        if needs_seal {
            Ok(AppendOutcome::OkFlushNeeded)
        } else {
            Ok(AppendOutcome::Ok)
        }
    }

    /// Current rescue-point list: the last sealed address at every level
    pub fn roots(&self) -> Vec<LogicAddr> {
        self.prev.clone()
    }

    /// Seal the open leaf early, before it fills.
    ///
    /// Used when the input log retires a volume: the samples leaving the
    /// replay window must be redundant in the main store first. Returns the
    /// fresh rescue points, or `None` when there was nothing to seal.
    pub fn flush_tail(&mut self) -> Result<Option<Vec<LogicAddr>>> {
        if !self.initialized || self.leaf.count() == 0 {
            return Ok(None);
        }
        self.seal_leaf()?;
        Ok(Some(self.roots()))
    }

    /// Seal every level bottom-up and return the new rescue-point list.
    ///
    /// The tree collapses into a single root; it must be re-initialized
    /// before the next use.
    pub fn close(&mut self) -> Result<Vec<LogicAddr>> {
        if !self.initialized || !self.dirty {
            self.reset();
            return Ok(self.rescue_points.clone());
        }

        if self.leaf.count() > 0 {
            self.seal_leaf()?;
        }
        let mut level = 1;
        while level <= self.inner.len() {
            let len = self.inner[level - 1].len();
            let higher_nonempty = self.inner[level..].iter().any(|e| !e.is_empty());
            if len > 0 && (len > 1 || higher_nonempty) {
                self.seal_inner(level)?;
            }
            level += 1;
        }

        // The only populated extent is now a singleton at the top: the root.
        let rescue = match self.inner.iter().rposition(|e| !e.is_empty()) {
            Some(idx) => {
                debug_assert_eq!(self.inner[idx].len(), 1);
                let root_level = idx; // extent at level idx+1 holds nodes of level idx
                let mut list = vec![EMPTY_ADDR; root_level + 1];
                list[root_level] = self.inner[idx][0].addr;
                list
            }
            None => Vec::new(),
        };

        self.store.flush()?;
        self.rescue_points = rescue.clone();
        self.reset();
        Ok(rescue)
    }

    fn reset(&mut self) {
        self.initialized = false;
        self.dirty = false;
        self.leaf = LeafExtent::new(is_event_series(self.id));
        self.inner.clear();
        self.prev = vec![EMPTY_ADDR];
        self.last_ts = None;
    }

    fn seal_leaf(&mut self) -> Result<()> {
        let taken = std::mem::replace(&mut self.leaf, LeafExtent::new(is_event_series(self.id)));
        let (payload, agg, begin, end, count) = match taken {
            LeafExtent::Float { enc, samples } => {
                if samples.is_empty() {
                    return Ok(());
                }
                let begin = samples[0].0;
                let end = samples[samples.len() - 1].0;
                let count = samples.len();
                let (payload, agg) = frame_float_leaf(enc);
                (payload, agg, begin, end, count)
            }
            LeafExtent::Event { enc, samples } => {
                if samples.is_empty() {
                    return Ok(());
                }
                let begin = samples[0].0;
                let end = samples[samples.len() - 1].0;
                let count = samples.len();
                let payload = frame_event_leaf(enc, true);
                let mut agg = Aggregates::new();
                agg.count = count as u64;
                (payload, agg, begin, end, count)
            }
        };

        let kind = if is_event_series(self.id) {
            NodeKind::EventLeaf
        } else {
            NodeKind::FloatLeaf
        };
        let header = NodeHeader {
            kind,
            level: 0,
            count: count as u16,
            series: self.id,
            prev: self.prev[0],
            begin,
            end,
            summary: agg,
        };
        let block = seal_node(&header, &payload)?;
        let addr = self.store.append(&block)?;
        self.prev[0] = addr;
        self.push_ref(
            1,
            SubtreeRef {
                addr,
                begin,
                end,
                agg,
            },
        )
    }

    fn push_ref(&mut self, level: usize, r: SubtreeRef) -> Result<()> {
        while self.inner.len() < level {
            self.inner.push(Vec::new());
            self.prev.push(EMPTY_ADDR);
        }
        self.inner[level - 1].push(r);
        if self.inner[level - 1].len() >= TREE_FANOUT {
            self.seal_inner(level)?;
        }
        Ok(())
    }

    fn seal_inner(&mut self, level: usize) -> Result<()> {
        let refs = std::mem::take(&mut self.inner[level - 1]);
        debug_assert!(!refs.is_empty() && refs.len() <= MAX_INNER_ENTRIES);

        let mut summary = Aggregates::new();
        for r in &refs {
            summary.combine(&r.agg);
        }
        let begin = refs[0].begin;
        let end = refs[refs.len() - 1].end;
        let header = NodeHeader {
            kind: NodeKind::Inner,
            level: level as u8,
            count: refs.len() as u16,
            series: self.id,
            prev: self.prev[level],
            begin,
            end,
            summary,
        };
        let block = seal_node(&header, &serialize_refs(&refs))?;
        let addr = self.store.append(&block)?;
        self.prev[level] = addr;
        self.push_ref(
            level + 1,
            SubtreeRef {
                addr,
                begin,
                end,
                agg: summary,
            },
        )
    }

    fn load(&self, addr: LogicAddr) -> Result<Node> {
        let block = self.store.read_block(addr)?;
        Node::parse(&block)
    }

    /// Reopen after a clean close: the root either becomes the top open
    /// extent again (so restarts do not grow the tree) or, when full or a
    /// leaf, a single reference in a fresh extent above it.
    fn restore_from_root(&mut self, root_addr: LogicAddr) -> Result<()> {
        let root = match self.load(root_addr) {
            Ok(node) => node,
            Err(e) => {
                error!(series = self.id, %e, "failed to load root, tree reopened empty");
                return Ok(());
            }
        };
        self.last_ts = Some(root.header.end);
        let root_level = root.header.level as usize;

        let reopen_in_place = root.header.kind == NodeKind::Inner
            && (root.header.count as usize) < TREE_FANOUT;

        if reopen_in_place {
            let refs = root.subtree_refs()?;
            while self.inner.len() < root_level {
                self.inner.push(Vec::new());
                self.prev.push(EMPTY_ADDR);
            }
            self.prev[root_level] = root.header.prev;
            // Rebuild the sibling chain tails along the rightmost spine so a
            // later crash snapshot stays in prefix form.
            let mut spine = refs.last().map(|r| r.addr);
            self.inner[root_level - 1] = refs;
            let mut lvl = root_level - 1;
            while let Some(addr) = spine {
                self.prev[lvl] = addr;
                if lvl == 0 {
                    break;
                }
                let node = self.load(addr)?;
                spine = node.subtree_refs()?.last().map(|r| r.addr);
                lvl -= 1;
            }
        } else {
            while self.inner.len() < root_level + 1 {
                self.inner.push(Vec::new());
                self.prev.push(EMPTY_ADDR);
            }
            self.prev[root_level] = root_addr;
            let self_ref = root.header.self_ref(root_addr);
            self.inner[root_level].push(self_ref);
            if root.header.kind == NodeKind::Inner {
                let mut spine = root.subtree_refs()?.last().map(|r| r.addr);
                let mut lvl = root_level - 1;
                while let Some(addr) = spine {
                    self.prev[lvl] = addr;
                    if lvl == 0 {
                        break;
                    }
                    let node = self.load(addr)?;
                    spine = node.subtree_refs()?.last().map(|r| r.addr);
                    lvl -= 1;
                }
            }
        }
        Ok(())
    }

    /// Reopen from a running-state snapshot: per level, walk the sibling
    /// chain back from the last sealed node collecting everything not yet
    /// covered by a sealed parent, then refill the open extents.
    fn restore_from_chains(&mut self) -> Result<()> {
        let rescue = self.rescue_points.clone();
        let highest = match rescue.iter().rposition(|a| *a != EMPTY_ADDR) {
            Some(i) => i,
            None => return Ok(()), // only the open leaf existed; WAL has the data
        };

        self.prev = rescue[..=highest].to_vec();
        self.prev.push(EMPTY_ADDR);
        while self.inner.len() < highest + 1 {
            self.inner.push(Vec::new());
        }

        let mut pending: Vec<Vec<SubtreeRef>> = Vec::with_capacity(highest + 1);
        for level in 0..=highest {
            let cover_addr = if level < highest {
                match self.load(rescue[level + 1]) {
                    Ok(parent) => parent
                        .subtree_refs()?
                        .last()
                        .map(|r| r.addr)
                        .unwrap_or(EMPTY_ADDR),
                    Err(e) => {
                        warn!(series = self.id, level, %e, "unreadable rescue node");
                        EMPTY_ADDR
                    }
                }
            } else {
                EMPTY_ADDR
            };

            let mut chain = Vec::new();
            let mut addr = rescue[level];
            while addr != EMPTY_ADDR && addr != cover_addr {
                if chain.len() > 4 * TREE_FANOUT {
                    warn!(series = self.id, level, "sibling chain too long, truncating");
                    break;
                }
                match self.load(addr) {
                    Ok(node) => {
                        if level == 0 && self.last_ts.is_none() {
                            self.last_ts = Some(node.header.end);
                        }
                        chain.push(node.header.self_ref(addr));
                        addr = node.header.prev;
                    }
                    Err(e) => {
                        // Ring recycling truncates history; anything older
                        // than this node is gone.
                        warn!(series = self.id, level, %e, "chain walk stopped");
                        break;
                    }
                }
            }
            chain.reverse();
            pending.push(chain);
        }

        // Refill top-down so synthesized parents land after restored ones.
        for level in (0..=highest).rev() {
            for r in pending[level].drain(..) {
                self.push_ref(level + 1, r)?;
            }
        }
        Ok(())
    }

    /// Aggregate over `[begin, end]`, both inclusive, using subtree
    /// summaries for fully covered nodes
    pub fn aggregate(&mut self, begin: Timestamp, end: Timestamp) -> Result<Aggregates> {
        if !self.initialized {
            self.force_init()?;
        }
        if is_event_series(self.id) {
            return Err(EmberError::QueryParsing(
                "aggregate is not defined for event series".into(),
            ));
        }
        let (lo, hi) = if begin <= end { (begin, end) } else { (end, begin) };
        let mut agg = Aggregates::new();
        for extent in self.inner.iter().rev() {
            for r in extent {
                self.fold_ref(r, lo, hi, &mut agg)?;
            }
        }
        if let LeafExtent::Float { samples, .. } = &self.leaf {
            for (ts, v) in samples {
                if *ts >= lo && *ts <= hi {
                    agg.add(*ts, *v);
                }
            }
        }
        Ok(agg)
    }

    fn fold_ref(
        &self,
        r: &SubtreeRef,
        lo: Timestamp,
        hi: Timestamp,
        agg: &mut Aggregates,
    ) -> Result<()> {
        if r.end < lo || r.begin > hi {
            return Ok(());
        }
        if r.begin >= lo && r.end <= hi {
            agg.combine(&r.agg);
            return Ok(());
        }
        let node = self.load(r.addr)?;
        match node.header.kind {
            NodeKind::Inner => {
                for child in node.subtree_refs()? {
                    self.fold_ref(&child, lo, hi, agg)?;
                }
            }
            NodeKind::FloatLeaf => {
                let view = crate::codec::FloatLeafView::parse(&node.payload)?;
                let mut decoder = view.iter();
                while let Some((ts, v)) = decoder.next_pair()? {
                    if ts >= lo && ts <= hi {
                        agg.add(ts, v);
                    }
                }
            }
            NodeKind::EventLeaf => {
                return Err(EmberError::Corruption(
                    "event leaf under a float series".into(),
                ));
            }
        }
        Ok(())
    }

    /// Range scan in time order; descending when `begin > end`
    pub fn search(&mut self, begin: Timestamp, end: Timestamp) -> Result<TreeScanIter> {
        if !self.initialized {
            self.force_init()?;
        }
        if is_event_series(self.id) {
            return Err(EmberError::QueryParsing(
                "value scan over an event series".into(),
            ));
        }
        let ascending = begin <= end;
        let (lo, hi) = if ascending { (begin, end) } else { (end, begin) };
        Ok(TreeScanIter::new(
            self.store(),
            self.snapshot_sources(ascending),
            lo,
            hi,
            ascending,
        ))
    }

    /// Range scan over an event series
    pub fn search_events(&mut self, begin: Timestamp, end: Timestamp) -> Result<TreeEventIter> {
        if !self.initialized {
            self.force_init()?;
        }
        if !is_event_series(self.id) {
            return Err(EmberError::QueryParsing(
                "event scan over a float series".into(),
            ));
        }
        let ascending = begin <= end;
        let (lo, hi) = if ascending { (begin, end) } else { (end, begin) };
        Ok(TreeEventIter::new(
            self.store(),
            self.snapshot_sources(ascending),
            lo,
            hi,
            ascending,
        ))
    }

    /// Aggregate per step bucket aligned to `begin`
    pub fn group_aggregate(
        &mut self,
        begin: Timestamp,
        end: Timestamp,
        step: u64,
    ) -> Result<TreeAggIter> {
        if step == 0 {
            return Err(EmberError::BadArg("group step must be positive".into()));
        }
        let scan = self.search(begin, end)?;
        Ok(TreeAggIter::new(scan, begin, step))
    }

    pub(crate) fn snapshot_sources(&self, ascending: bool) -> Vec<iter::Source> {
        let mut sources = Vec::new();
        for extent in self.inner.iter().rev() {
            for r in extent {
                sources.push(iter::Source::Sealed(*r));
            }
        }
        match &self.leaf {
            LeafExtent::Float { samples, .. } => {
                if !samples.is_empty() {
                    sources.push(iter::Source::FloatTail(samples.clone()));
                }
            }
            LeafExtent::Event { samples, .. } => {
                if !samples.is_empty() {
                    sources.push(iter::Source::EventTail(samples.clone()));
                }
            }
        }
        if !ascending {
            sources.reverse();
        }
        sources
    }

    pub(crate) fn store(&self) -> Arc<BlockStore> {
        Arc::clone(&self.store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_tree(id: SeriesId) -> SeriesTree {
        SeriesTree::new(id, Vec::new(), Arc::new(BlockStore::new_memory()))
    }

    #[test]
    fn test_append_and_late_rejection() {
        let mut tree = memory_tree(1);
        assert_eq!(tree.append(100, 1.0).unwrap(), AppendOutcome::Ok);
        assert_eq!(tree.append(200, 2.0).unwrap(), AppendOutcome::Ok);

        let err = tree.append(200, 3.0).unwrap_err();
        assert!(matches!(err, EmberError::Late { ts: 200, last: 200 }));
        let err = tree.append(50, 3.0).unwrap_err();
        assert!(matches!(err, EmberError::Late { .. }));
    }

    #[test]
    fn test_replay_coalesces_duplicates() {
        let mut tree = memory_tree(1);
        tree.append(100, 1.0).unwrap();
        let out = tree
            .append_sample(100, &Payload::Float(9.0), true)
            .unwrap();
        assert_eq!(out, AppendOutcome::Ok);

        let agg = tree.aggregate(0, 1000).unwrap();
        assert_eq!(agg.count, 1);
        assert_eq!(agg.first, 1.0);
    }

    #[test]
    fn test_payload_kind_checked() {
        let mut float_tree = memory_tree(7);
        assert!(matches!(
            float_tree
                .append_sample(1, &Payload::Event(vec![1]), false)
                .unwrap_err(),
            EmberError::BadArg(_)
        ));

        let mut event_tree = memory_tree(7 | (1 << 63));
        assert!(matches!(
            event_tree
                .append_sample(1, &Payload::Float(1.0), false)
                .unwrap_err(),
            EmberError::BadArg(_)
        ));
        assert_eq!(
            event_tree.append_event(1, b"boot").unwrap(),
            AppendOutcome::Ok
        );
    }

    #[test]
    fn test_leaf_seal_reports_flush_needed() {
        let mut tree = memory_tree(3);
        let mut flushes = 0;
        // Random-ish values defeat XOR compression enough to fill leaves.
        let mut state = 0x2545F4914F6CDD1Du64;
        for i in 0..20_000u64 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let v = (state % 100_000) as f64 * 0.37;
            if tree.append(1 + i * 1000, v).unwrap() == AppendOutcome::OkFlushNeeded {
                flushes += 1;
            }
        }
        assert!(flushes > 0, "expected at least one sealed leaf");
        assert!(tree.roots()[0] != EMPTY_ADDR);

        let agg = tree.aggregate(0, u64::MAX).unwrap();
        assert_eq!(agg.count, 20_000);
    }

    #[test]
    fn test_close_produces_clean_rescue_points() {
        let mut tree = memory_tree(5);
        for i in 0..100u64 {
            tree.append(i * 10, i as f64).unwrap();
        }
        let rescue = tree.close().unwrap();
        assert!(!rescue.is_empty());
        assert_eq!(SeriesTree::classify(&rescue), RepairStatus::Ok);
        // Everything except the trailing root slot is empty.
        for addr in &rescue[..rescue.len() - 1] {
            assert_eq!(*addr, EMPTY_ADDR);
        }
        assert_ne!(*rescue.last().unwrap(), EMPTY_ADDR);
    }

    #[test]
    fn test_classify_shapes() {
        assert_eq!(SeriesTree::classify(&[]), RepairStatus::Ok);
        assert_eq!(SeriesTree::classify(&[42]), RepairStatus::Ok);
        assert_eq!(
            SeriesTree::classify(&[EMPTY_ADDR, EMPTY_ADDR, 42]),
            RepairStatus::Ok
        );
        assert_eq!(SeriesTree::classify(&[EMPTY_ADDR]), RepairStatus::Repair);
        assert_eq!(
            SeriesTree::classify(&[42, EMPTY_ADDR]),
            RepairStatus::Repair
        );
        assert_eq!(
            SeriesTree::classify(&[42, 43, EMPTY_ADDR]),
            RepairStatus::Repair
        );
        assert_eq!(
            SeriesTree::classify(&[EMPTY_ADDR, 42, EMPTY_ADDR]),
            RepairStatus::Lost
        );
        assert_eq!(
            SeriesTree::classify(&[42, EMPTY_ADDR, 43, EMPTY_ADDR]),
            RepairStatus::Lost
        );
    }

    #[test]
    fn test_close_reopen_keeps_data() {
        let store = Arc::new(BlockStore::new_memory());
        let mut tree = SeriesTree::new(9, Vec::new(), Arc::clone(&store));
        for i in 0..1000u64 {
            tree.append(i * 100, (i % 17) as f64).unwrap();
        }
        let rescue = tree.close().unwrap();

        let mut reopened = SeriesTree::new(9, rescue, store);
        assert_eq!(reopened.force_init().unwrap(), RepairStatus::Ok);
        assert_eq!(reopened.last_timestamp(), Some(999 * 100));

        let agg = reopened.aggregate(0, u64::MAX).unwrap();
        assert_eq!(agg.count, 1000);

        // The reopened tree keeps accepting appends after the stored data.
        reopened.append(1000 * 100, 5.0).unwrap();
        let agg = reopened.aggregate(0, u64::MAX).unwrap();
        assert_eq!(agg.count, 1001);
    }

    #[test]
    fn test_crash_snapshot_repairs_sealed_levels() {
        let store = Arc::new(BlockStore::new_memory());
        let mut tree = SeriesTree::new(11, Vec::new(), Arc::clone(&store));
        let mut rescue = Vec::new();
        let mut state = 0x9E3779B97F4A7C15u64;
        let mut appended = 0u64;
        for i in 0..50_000u64 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let v = (state % 1_000_000) as f64 * 0.001;
            if tree.append(1 + i * 10, v).unwrap() == AppendOutcome::OkFlushNeeded {
                // The seal covered every sample before this one; this sample
                // itself sits in the fresh open leaf.
                rescue = tree.roots();
                appended = i;
            }
        }
        assert!(!rescue.is_empty());
        assert_eq!(SeriesTree::classify(&rescue), RepairStatus::Repair);

        // Drop the in-memory tree; reopen from the snapshot as after a crash.
        drop(tree);
        let mut reopened = SeriesTree::new(11, rescue, store);
        assert_eq!(reopened.force_init().unwrap(), RepairStatus::Repair);

        // Everything up to the last seal survives; the open leaf is lost.
        let agg = reopened.aggregate(0, u64::MAX).unwrap();
        assert_eq!(agg.count, appended);
    }

    #[test]
    fn test_search_spans_sealed_nodes_and_tail() {
        let mut tree = memory_tree(21);
        let mut state = 1u64;
        for i in 0..10_000u64 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            tree.append(i * 10, (state >> 33) as f64).unwrap();
        }
        assert!(tree.roots()[0] != EMPTY_ADDR, "test needs sealed leaves");

        let samples: Vec<_> = tree
            .search(0, u64::MAX)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(samples.len(), 10_000);
        for (i, (ts, _)) in samples.iter().enumerate() {
            assert_eq!(*ts, i as u64 * 10);
        }

        // Sub-range with both endpoints inside sealed data.
        let window: Vec<_> = tree
            .search(5_000, 6_000)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(window.len(), 101);
        assert_eq!(window[0].0, 5_000);
        assert_eq!(window.last().unwrap().0, 6_000);
    }

    #[test]
    fn test_search_descending() {
        let mut tree = memory_tree(22);
        for i in 0..500u64 {
            tree.append(100 + i, i as f64).unwrap();
        }
        let samples: Vec<_> = tree
            .search(400, 200)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(samples.first().unwrap().0, 400);
        assert_eq!(samples.last().unwrap().0, 200);
        assert!(samples.windows(2).all(|w| w[0].0 > w[1].0));
    }

    #[test]
    fn test_event_search() {
        let id = 4 | (1 << 63);
        let mut tree = memory_tree(id);
        for i in 0..200u64 {
            tree.append_event(i * 5, format!("ev-{}", i).as_bytes())
                .unwrap();
        }
        let events: Vec<_> = tree
            .search_events(10, 20)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], (10, b"ev-2".to_vec()));
        assert_eq!(events[2], (20, b"ev-4".to_vec()));

        assert!(tree.search(0, 100).is_err());
    }

    #[test]
    fn test_group_aggregate_buckets() {
        let mut tree = memory_tree(23);
        // One sample per tick over [1000, 1400); buckets of 100 ticks.
        for i in 0..400u64 {
            tree.append(1000 + i, i as f64).unwrap();
        }
        let buckets: Vec<_> = tree
            .group_aggregate(1000, 1400, 100)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(buckets.len(), 4);
        for (i, (start, agg)) in buckets.iter().enumerate() {
            assert_eq!(*start, 1000 + i as u64 * 100);
            assert_eq!(agg.count, 100);
            assert_eq!(agg.min, (i as f64) * 100.0);
            assert_eq!(agg.max, (i as f64) * 100.0 + 99.0);
        }
    }

    #[test]
    fn test_aggregate_uses_contained_summaries() {
        // A range covering everything must count every append even when the
        // answer comes from subtree summaries alone.
        let mut tree = memory_tree(24);
        for i in 0..30_000u64 {
            tree.append(i, (i % 251) as f64).unwrap();
        }
        let agg = tree.aggregate(0, u64::MAX).unwrap();
        assert_eq!(agg.count, 30_000);
        assert_eq!(agg.min, 0.0);
        assert_eq!(agg.max, 250.0);
        assert_eq!(agg.first, 0.0);
        assert_eq!(agg.last, ((30_000u64 - 1) % 251) as f64);
    }
}
