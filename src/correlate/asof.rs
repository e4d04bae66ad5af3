//! As-of (nearest-in-time) joins

use std::collections::BTreeMap;

use super::Correlation;
use crate::config::DEFAULT_ASOF_TOLERANCE_NS;
use crate::trace::{Event, EventStream};

/// Search direction from the left edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// First right event whose edge is `>=` the left edge
    Forward,
    /// Last right event whose edge is `<=` the left edge
    Backward,
}

/// Which timestamp of an event to compare
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Start,
    End,
}

impl Edge {
    fn of(self, event: &Event) -> i64 {
        match self {
            Edge::Start => event.start,
            Edge::End => event.end,
        }
    }
}

/// One-to-one nearest-event join
///
/// Each left event is matched with at most one right event. The distance
/// between the two edges must not exceed the tolerance (inclusive).
/// Unmatched left events are dropped. On equal right edges the forward
/// search keeps the earliest event in stream order, the backward search the
/// latest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsOfJoin {
    pub direction: Direction,
    pub left_edge: Edge,
    pub right_edge: Edge,
    /// Maximum edge distance in ns; `None` is unbounded
    pub tolerance: Option<i64>,
    /// Only match events with equal keys
    pub by_key: bool,
}

impl AsOfJoin {
    /// Forward join with the default tolerance, matched per key
    pub fn forward(left_edge: Edge, right_edge: Edge) -> Self {
        AsOfJoin {
            direction: Direction::Forward,
            left_edge,
            right_edge,
            tolerance: Some(DEFAULT_ASOF_TOLERANCE_NS),
            by_key: true,
        }
    }

    /// Backward join with the default tolerance, matched per key
    pub fn backward(left_edge: Edge, right_edge: Edge) -> Self {
        AsOfJoin {
            direction: Direction::Backward,
            ..AsOfJoin::forward(left_edge, right_edge)
        }
    }

    pub fn with_tolerance(mut self, tolerance_ns: i64) -> Self {
        self.tolerance = Some(tolerance_ns);
        self
    }

    /// Disable the tolerance
    pub fn unbounded(mut self) -> Self {
        self.tolerance = None;
        self
    }

    /// Match across keys
    pub fn across_keys(mut self) -> Self {
        self.by_key = false;
        self
    }

    fn within_tolerance(&self, distance: i64) -> bool {
        self.tolerance.map_or(true, |t| distance <= t)
    }

    // Right events sorted by edge per key, stream order kept on ties
    fn index<'a>(&self, right: &'a EventStream) -> BTreeMap<i64, Vec<(i64, &'a Event)>> {
        let mut index: BTreeMap<i64, Vec<(i64, &'a Event)>> = BTreeMap::new();
        for event in right {
            let key = if self.by_key { event.key } else { 0 };
            index
                .entry(key)
                .or_default()
                .push((self.right_edge.of(event), event));
        }
        for entries in index.values_mut() {
            entries.sort_by_key(|(edge, _)| *edge);
        }
        index
    }

    fn nearest<'a>(&self, entries: &[(i64, &'a Event)], at: i64) -> Option<&'a Event> {
        match self.direction {
            Direction::Forward => {
                let pos = entries.partition_point(|(edge, _)| *edge < at);
                let (edge, event) = entries.get(pos)?;
                self.within_tolerance(edge - at).then_some(*event)
            }
            Direction::Backward => {
                let pos = entries.partition_point(|(edge, _)| *edge <= at);
                let (edge, event) = entries.get(pos.checked_sub(1)?)?;
                self.within_tolerance(at - edge).then_some(*event)
            }
        }
    }

    /// Run the join; results follow the left stream order
    pub fn join<'a>(&self, left: &'a EventStream, right: &'a EventStream) -> Vec<Correlation<'a>> {
        if left.is_empty() || right.is_empty() {
            return Vec::new();
        }
        let index = self.index(right);

        let mut out = Vec::new();
        for l in left {
            let key = if self.by_key { l.key } else { 0 };
            let Some(entries) = index.get(&key) else {
                continue;
            };
            if let Some(r) = self.nearest(entries, self.left_edge.of(l)) {
                out.push(Correlation::pair(l, r));
            }
        }
        out
    }
}
