//! Temporal correlation of event streams
//!
//! Three join policies link events across streams:
//!
//! - containment ([`contained_within`]): one-to-many, every inner event with
//!   the same key whose interval lies inside an outer interval
//! - correlation-id chaining ([`chain_by_correlation_id`]): links an already
//!   matched API call to the kernels it launched
//! - as-of ([`AsOfJoin`]): one-to-one, the nearest right event in one
//!   direction within a tolerance
//!
//! Results borrow from the input streams; nothing is copied.

mod asof;

use std::collections::{BTreeMap, HashMap};

pub use asof::{AsOfJoin, Direction, Edge};

use crate::trace::{Event, EventStream};

/// A matched group of events
///
/// `anchor` is the event the join started from (outer interval or left
/// row), `matched` the event it was linked to, and `via` the intermediate
/// event of a chained join.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correlation<'a> {
    /// Partition key of the result (the key of `matched` for chains)
    pub key: i64,
    pub anchor: &'a Event,
    pub via: Option<&'a Event>,
    pub matched: &'a Event,
}

impl<'a> Correlation<'a> {
    pub fn pair(anchor: &'a Event, matched: &'a Event) -> Self {
        Correlation {
            key: anchor.key,
            anchor,
            via: None,
            matched,
        }
    }
}

/// Every inner event lying inside an outer event of the same key
///
/// `inner.start >= outer.start && inner.end <= outer.end`, both inclusive.
/// Results follow the outer order, then the inner order.
pub fn contained_within<'a>(outer: &'a EventStream, inner: &'a EventStream) -> Vec<Correlation<'a>> {
    if outer.is_empty() || inner.is_empty() {
        return Vec::new();
    }
    let by_key: BTreeMap<i64, Vec<&Event>> = inner.partition_by_key();

    let mut out = Vec::new();
    for o in outer {
        let Some(candidates) = by_key.get(&o.key) else {
            continue;
        };
        // Candidates are sorted by start: skip those starting too early,
        // stop at the first one starting after the outer end
        let first = candidates.partition_point(|e| e.start < o.start);
        for e in candidates[first..].iter().take_while(|e| e.start <= o.end) {
            if e.end <= o.end {
                out.push(Correlation::pair(o, *e));
            }
        }
    }
    out
}

/// Extend matched pairs with every event of `stream` sharing the matched
/// event's correlation id
///
/// Produces (anchor, via = previous match, matched = stream event) keyed by
/// the stream event's key. Pairs whose matched event carries no
/// correlation id are dropped.
pub fn chain_by_correlation_id<'a>(
    pairs: &[Correlation<'a>],
    stream: &'a EventStream,
) -> Vec<Correlation<'a>> {
    let mut by_id: HashMap<i64, Vec<&'a Event>> = HashMap::new();
    for event in stream {
        if let Some(id) = event.correlation_id {
            by_id.entry(id).or_default().push(event);
        }
    }

    let mut out = Vec::new();
    for pair in pairs {
        let Some(id) = pair.matched.correlation_id else {
            continue;
        };
        for &target in by_id.get(&id).into_iter().flatten() {
            out.push(Correlation {
                key: target.key,
                anchor: pair.anchor,
                via: Some(pair.matched),
                matched: target,
            });
        }
    }
    out
}
