//! K-way time-ordered merge across series

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use super::SampleIter;
use crate::error::Result;
use crate::types::{SeriesId, Timestamp};

/// Merges per-series scans into one stream ordered by timestamp.
///
/// Inputs must already be sorted in the merge direction (they are, coming
/// from tree scans). Ties on timestamp are resolved by input position, so
/// passing series in id order yields a deterministic interleaving.
pub struct MergeOperator {
    inputs: Vec<(SeriesId, SampleIter)>,
    heap: BinaryHeap<Reverse<(u64, usize)>>,
    pending: Vec<Option<(Timestamp, f64)>>,
    ascending: bool,
    started: bool,
    failed: bool,
}

impl MergeOperator {
    /// Create a merge over `(series, iterator)` pairs
    pub fn new(inputs: Vec<(SeriesId, SampleIter)>, ascending: bool) -> Self {
        let n = inputs.len();
        Self {
            inputs,
            heap: BinaryHeap::with_capacity(n),
            pending: (0..n).map(|_| None).collect(),
            ascending,
            started: false,
            failed: false,
        }
    }

    fn sort_key(&self, ts: Timestamp) -> u64 {
        if self.ascending {
            ts
        } else {
            !ts
        }
    }

    fn pull(&mut self, idx: usize) -> Result<()> {
        match self.inputs[idx].1.next() {
            Some(Ok((ts, v))) => {
                self.pending[idx] = Some((ts, v));
                self.heap.push(Reverse((self.sort_key(ts), idx)));
            }
            Some(Err(e)) => return Err(e),
            None => {}
        }
        Ok(())
    }
}

impl Iterator for MergeOperator {
    type Item = Result<(SeriesId, Timestamp, f64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if !self.started {
            self.started = true;
            for idx in 0..self.inputs.len() {
                if let Err(e) = self.pull(idx) {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        let Reverse((_, idx)) = self.heap.pop()?;
        let (ts, v) = self.pending[idx].take().expect("heap entry has a value");
        if let Err(e) = self.pull(idx) {
            self.failed = true;
            return Some(Err(e));
        }
        Some(Ok((self.inputs[idx].0, ts, v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(id: SeriesId, points: Vec<(Timestamp, f64)>) -> (SeriesId, SampleIter) {
        (id, Box::new(points.into_iter().map(Ok)))
    }

    #[test]
    fn test_merge_interleaves_by_timestamp() {
        let merged: Vec<_> = MergeOperator::new(
            vec![
                series(1, vec![(10, 1.0), (30, 3.0)]),
                series(2, vec![(20, 2.0), (40, 4.0)]),
            ],
            true,
        )
        .collect::<Result<Vec<_>>>()
        .unwrap();

        assert_eq!(
            merged,
            vec![(1, 10, 1.0), (2, 20, 2.0), (1, 30, 3.0), (2, 40, 4.0)]
        );
    }

    #[test]
    fn test_merge_ties_resolved_by_input_order() {
        let merged: Vec<_> = MergeOperator::new(
            vec![
                series(5, vec![(100, 5.0)]),
                series(3, vec![(100, 3.0)]),
                series(9, vec![(100, 9.0)]),
            ],
            true,
        )
        .collect::<Result<Vec<_>>>()
        .unwrap();

        let ids: Vec<_> = merged.iter().map(|(id, _, _)| *id).collect();
        assert_eq!(ids, vec![5, 3, 9]);
    }

    #[test]
    fn test_merge_descending() {
        let merged: Vec<_> = MergeOperator::new(
            vec![
                series(1, vec![(30, 3.0), (10, 1.0)]),
                series(2, vec![(20, 2.0)]),
            ],
            false,
        )
        .collect::<Result<Vec<_>>>()
        .unwrap();

        let ts: Vec<_> = merged.iter().map(|(_, ts, _)| *ts).collect();
        assert_eq!(ts, vec![30, 20, 10]);
    }
}
