//! Query operators
//!
//! The column store hands query execution one lazy, single-pass iterator
//! per series; the operators here reshape those streams: k-way time-ordered
//! merge, timestamp join, aggregate combination, and value/aggregate
//! filtering. Iterators fail with at most one error item and are exhausted
//! afterwards.

mod join;
mod merge;

pub use join::JoinOperator;
pub use merge::MergeOperator;

use crate::error::Result;
use crate::types::{AggregateFilter, Aggregates, Timestamp, ValueFilter};

/// Lazy stream of float samples from one series
pub type SampleIter = Box<dyn Iterator<Item = Result<(Timestamp, f64)>> + Send>;

/// Lazy stream of event samples from one series
pub type EventIter = Box<dyn Iterator<Item = Result<(Timestamp, Vec<u8>)>> + Send>;

/// Lazy stream of aggregate buckets from one series
pub type AggregateIter = Box<dyn Iterator<Item = Result<(Timestamp, Aggregates)>> + Send>;

/// Keep only samples whose value passes the filter; errors pass through
pub fn filter_samples(iter: SampleIter, filter: ValueFilter) -> SampleIter {
    Box::new(iter.filter(move |item| match item {
        Ok((_, v)) => filter.matches(*v),
        Err(_) => true,
    }))
}

/// Keep only buckets whose chosen statistic passes the filter
pub fn filter_aggregates(iter: AggregateIter, filter: AggregateFilter) -> AggregateIter {
    Box::new(iter.filter(move |item| match item {
        Ok((_, agg)) => filter.matches(agg),
        Err(_) => true,
    }))
}

/// Keep only events whose body contains `pattern`
pub fn filter_events(iter: EventIter, pattern: Vec<u8>) -> EventIter {
    Box::new(iter.filter(move |item| match item {
        Ok((_, body)) => contains(body, &pattern),
        Err(_) => true,
    }))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Fold several single-series aggregate streams into one overall summary.
///
/// Count, sum, min, and max merge exactly; first and last follow the input
/// order, so callers pass iterators in the order they want those resolved.
/// The result carries the range start as its timestamp.
pub fn combine_aggregates(
    inputs: Vec<AggregateIter>,
    range_start: Timestamp,
) -> Result<(Timestamp, Aggregates)> {
    let mut total = Aggregates::new();
    for input in inputs {
        for item in input {
            let (_, agg) = item?;
            if agg.count == 0 {
                continue;
            }
            if total.count == 0 {
                total = agg;
            } else {
                total.combine(&agg);
            }
        }
    }
    Ok((range_start, total))
}
