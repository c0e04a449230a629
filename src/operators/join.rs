//! Timestamp join across series

use super::SampleIter;
use crate::error::Result;
use crate::types::Timestamp;

/// Aligns several series on exact timestamps, producing one row per tick.
///
/// A row holds one slot per input; series without a sample at that tick get
/// `None` (full outer join). Inputs must be ascending.
pub struct JoinOperator {
    inputs: Vec<SampleIter>,
    heads: Vec<Option<(Timestamp, f64)>>,
    failed: bool,
}

impl JoinOperator {
    /// Create a join over per-series iterators
    pub fn new(inputs: Vec<SampleIter>) -> Self {
        let n = inputs.len();
        Self {
            inputs,
            heads: (0..n).map(|_| None).collect(),
            failed: false,
        }
    }

    fn pull(&mut self, idx: usize) -> Result<()> {
        if self.heads[idx].is_none() {
            match self.inputs[idx].next() {
                Some(Ok(pair)) => self.heads[idx] = Some(pair),
                Some(Err(e)) => return Err(e),
                None => {}
            }
        }
        Ok(())
    }
}

impl Iterator for JoinOperator {
    type Item = Result<(Timestamp, Vec<Option<f64>>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        for idx in 0..self.inputs.len() {
            if let Err(e) = self.pull(idx) {
                self.failed = true;
                return Some(Err(e));
            }
        }

        let tick = self
            .heads
            .iter()
            .filter_map(|h| h.map(|(ts, _)| ts))
            .min()?;

        let row = self
            .heads
            .iter_mut()
            .map(|h| match h {
                Some((ts, v)) if *ts == tick => {
                    let value = *v;
                    *h = None;
                    Some(value)
                }
                _ => None,
            })
            .collect();
        Some(Ok((tick, row)))
    }
}
