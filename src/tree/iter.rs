//! Lazy iterators over series trees
//!
//! Iterators are single-pass and not restartable. They hold a snapshot of
//! the open extents taken under the tree lock plus the shared block store;
//! sealed nodes are read lazily as the scan advances. A corrupt block
//! surfaces as one error item, after which the iterator is exhausted.

use std::collections::VecDeque;
use std::sync::Arc;

use super::node::{Node, NodeKind, SubtreeRef};
use crate::blockstore::BlockStore;
use crate::codec::{EventLeaf, FloatLeafView};
use crate::error::{EmberError, Result};
use crate::types::{Aggregates, Timestamp};

/// One pending input of a scan: a sealed subtree or a tail snapshot
pub(crate) enum Source {
    Sealed(SubtreeRef),
    FloatTail(Vec<(Timestamp, f64)>),
    EventTail(Vec<(Timestamp, Vec<u8>)>),
}

fn overlaps(r: &SubtreeRef, lo: Timestamp, hi: Timestamp) -> bool {
    r.end >= lo && r.begin <= hi
}

/// Range scan over a float series
pub struct TreeScanIter {
    store: Arc<BlockStore>,
    lo: Timestamp,
    hi: Timestamp,
    ascending: bool,
    /// Pending sources, next on top
    stack: Vec<Source>,
    buffer: VecDeque<(Timestamp, f64)>,
    failed: bool,
}

impl TreeScanIter {
    pub(crate) fn new(
        store: Arc<BlockStore>,
        sources: Vec<Source>,
        lo: Timestamp,
        hi: Timestamp,
        ascending: bool,
    ) -> Self {
        let mut stack = sources;
        stack.reverse();
        Self {
            store,
            lo,
            hi,
            ascending,
            stack,
            buffer: VecDeque::new(),
            failed: false,
        }
    }

    fn expand(&mut self, r: SubtreeRef) -> Result<()> {
        let block = self.store.read_block(r.addr)?;
        let node = Node::parse(&block)?;
        match node.header.kind {
            NodeKind::Inner => {
                let mut children: Vec<SubtreeRef> = node
                    .subtree_refs()?
                    .into_iter()
                    .filter(|c| overlaps(c, self.lo, self.hi))
                    .collect();
                if self.ascending {
                    children.reverse();
                }
                for child in children {
                    self.stack.push(Source::Sealed(child));
                }
            }
            NodeKind::FloatLeaf => {
                let view = FloatLeafView::parse(&node.payload)?;
                let mut decoder = view.iter();
                let mut samples = Vec::with_capacity(view.count() as usize);
                while let Some((ts, v)) = decoder.next_pair()? {
                    if ts >= self.lo && ts <= self.hi {
                        samples.push((ts, v));
                    }
                }
                if !self.ascending {
                    samples.reverse();
                }
                self.buffer.extend(samples);
            }
            NodeKind::EventLeaf => {
                return Err(EmberError::Corruption(
                    "event leaf reached by a value scan".into(),
                ));
            }
        }
        Ok(())
    }
}

impl Iterator for TreeScanIter {
    type Item = Result<(Timestamp, f64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(pair) = self.buffer.pop_front() {
                return Some(Ok(pair));
            }
            match self.stack.pop() {
                None => return None,
                Some(Source::Sealed(r)) => {
                    if !overlaps(&r, self.lo, self.hi) {
                        continue;
                    }
                    if let Err(e) = self.expand(r) {
                        self.failed = true;
                        return Some(Err(e));
                    }
                }
                Some(Source::FloatTail(samples)) => {
                    let lo = self.lo;
                    let hi = self.hi;
                    let mut kept: Vec<(Timestamp, f64)> = samples
                        .into_iter()
                        .filter(|(ts, _)| *ts >= lo && *ts <= hi)
                        .collect();
                    if !self.ascending {
                        kept.reverse();
                    }
                    self.buffer.extend(kept);
                }
                Some(Source::EventTail(_)) => {
                    self.failed = true;
                    return Some(Err(EmberError::QueryParsing(
                        "value scan over an event series".into(),
                    )));
                }
            }
        }
    }
}

/// Range scan over an event series
pub struct TreeEventIter {
    store: Arc<BlockStore>,
    lo: Timestamp,
    hi: Timestamp,
    ascending: bool,
    stack: Vec<Source>,
    buffer: VecDeque<(Timestamp, Vec<u8>)>,
    failed: bool,
}

impl TreeEventIter {
    pub(crate) fn new(
        store: Arc<BlockStore>,
        sources: Vec<Source>,
        lo: Timestamp,
        hi: Timestamp,
        ascending: bool,
    ) -> Self {
        let mut stack = sources;
        stack.reverse();
        Self {
            store,
            lo,
            hi,
            ascending,
            stack,
            buffer: VecDeque::new(),
            failed: false,
        }
    }

    fn expand(&mut self, r: SubtreeRef) -> Result<()> {
        let block = self.store.read_block(r.addr)?;
        let node = Node::parse(&block)?;
        match node.header.kind {
            NodeKind::Inner => {
                let mut children: Vec<SubtreeRef> = node
                    .subtree_refs()?
                    .into_iter()
                    .filter(|c| overlaps(c, self.lo, self.hi))
                    .collect();
                if self.ascending {
                    children.reverse();
                }
                for child in children {
                    self.stack.push(Source::Sealed(child));
                }
            }
            NodeKind::EventLeaf => {
                let leaf = EventLeaf::parse(&node.payload)?;
                let mut decoder = leaf.iter();
                let mut events = Vec::with_capacity(leaf.count() as usize);
                while let Some((ts, data)) = decoder.next_event()? {
                    if ts >= self.lo && ts <= self.hi {
                        events.push((ts, data));
                    }
                }
                if !self.ascending {
                    events.reverse();
                }
                self.buffer.extend(events);
            }
            NodeKind::FloatLeaf => {
                return Err(EmberError::Corruption(
                    "float leaf reached by an event scan".into(),
                ));
            }
        }
        Ok(())
    }
}

impl Iterator for TreeEventIter {
    type Item = Result<(Timestamp, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(ev) = self.buffer.pop_front() {
                return Some(Ok(ev));
            }
            match self.stack.pop() {
                None => return None,
                Some(Source::Sealed(r)) => {
                    if !overlaps(&r, self.lo, self.hi) {
                        continue;
                    }
                    if let Err(e) = self.expand(r) {
                        self.failed = true;
                        return Some(Err(e));
                    }
                }
                Some(Source::EventTail(events)) => {
                    let lo = self.lo;
                    let hi = self.hi;
                    let mut kept: Vec<(Timestamp, Vec<u8>)> = events
                        .into_iter()
                        .filter(|(ts, _)| *ts >= lo && *ts <= hi)
                        .collect();
                    if !self.ascending {
                        kept.reverse();
                    }
                    self.buffer.extend(kept);
                }
                Some(Source::FloatTail(_)) => {
                    self.failed = true;
                    return Some(Err(EmberError::QueryParsing(
                        "event scan over a float series".into(),
                    )));
                }
            }
        }
    }
}

/// Step-bucketed aggregation over a scan.
///
/// Buckets are aligned to the query origin and labeled with their leading
/// edge in iteration direction; empty buckets are skipped.
pub struct TreeAggIter {
    inner: TreeScanIter,
    anchor: Timestamp,
    step: u64,
    ascending: bool,
    open: Option<(Timestamp, Aggregates)>,
    done: bool,
}

impl TreeAggIter {
    pub(crate) fn new(inner: TreeScanIter, anchor: Timestamp, step: u64) -> Self {
        let ascending = inner.ascending;
        Self {
            inner,
            anchor,
            step,
            ascending,
            open: None,
            done: false,
        }
    }

    fn bucket_of(&self, ts: Timestamp) -> Timestamp {
        if self.ascending {
            self.anchor + (ts - self.anchor) / self.step * self.step
        } else {
            self.anchor - (self.anchor - ts) / self.step * self.step
        }
    }
}

impl Iterator for TreeAggIter {
    type Item = Result<(Timestamp, Aggregates)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.inner.next() {
                Some(Ok((ts, v))) => {
                    let bucket = self.bucket_of(ts);
                    match &mut self.open {
                        Some((open_bucket, agg)) if *open_bucket == bucket => {
                            agg.add(ts, v);
                        }
                        Some(_) => {
                            let finished = self.open.take();
                            let mut agg = Aggregates::new();
                            agg.add(ts, v);
                            self.open = Some((bucket, agg));
                            return finished.map(Ok);
                        }
                        None => {
                            let mut agg = Aggregates::new();
                            agg.add(ts, v);
                            self.open = Some((bucket, agg));
                        }
                    }
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    return self.open.take().map(Ok);
                }
            }
        }
    }
}
