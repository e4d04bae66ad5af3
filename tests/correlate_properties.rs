//! Property-based tests for the join and aggregation primitives

use ccl_metrics::stats::percentile;
use ccl_metrics::{contained_within, AsOfJoin, Edge, Event, EventStream, MetricSummary};
use proptest::prelude::*;

fn events(max_len: usize) -> impl Strategy<Value = Vec<Event>> {
    prop::collection::vec((0i64..10_000, 0i64..2_000, 0i64..3), 0..max_len).prop_map(|raw| {
        raw.into_iter()
            .enumerate()
            .map(|(i, (start, len, key))| Event::new(start, start + len, key, format!("e{}", i)))
            .collect()
    })
}

proptest! {
    #[test]
    fn test_percentiles_monotone_and_bounded(
        mut values in prop::collection::vec(-1e6f64..1e6, 1..64),
        a in 0.0f64..=1.0,
        b in 0.0f64..=1.0,
    ) {
        values.sort_by(f64::total_cmp);
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let p_lo = percentile(&values, lo);
        let p_hi = percentile(&values, hi);
        prop_assert!(p_lo <= p_hi + 1e-9);
        prop_assert!(p_lo >= values[0] - 1e-9);
        prop_assert!(p_hi <= values[values.len() - 1] + 1e-9);
    }

    #[test]
    fn test_summary_ordering(values in prop::collection::vec(-1e6f64..1e6, 1..64)) {
        let summary = MetricSummary::from_values(&values);
        let stats = summary.stats().expect("non-empty input");
        prop_assert_eq!(stats.count, values.len());
        prop_assert!(stats.min <= stats.p25 + 1e-9);
        prop_assert!(stats.p25 <= stats.median + 1e-9);
        prop_assert!(stats.median <= stats.p75 + 1e-9);
        prop_assert!(stats.p75 <= stats.p99 + 1e-9);
        prop_assert!(stats.p99 <= stats.max + 1e-9);
        prop_assert!(stats.std >= 0.0);
    }

    #[test]
    fn test_containment_is_sound(outer in events(12), inner in events(40)) {
        let outer = EventStream::new("outer", outer);
        let inner = EventStream::new("inner", inner);
        for c in contained_within(&outer, &inner) {
            prop_assert_eq!(c.anchor.key, c.matched.key);
            prop_assert!(c.matched.start >= c.anchor.start);
            prop_assert!(c.matched.end <= c.anchor.end);
        }
    }

    #[test]
    fn test_containment_is_complete(outer in events(12), inner in events(40)) {
        let outer = EventStream::new("outer", outer);
        let inner = EventStream::new("inner", inner);
        let expected = outer
            .iter()
            .map(|o| {
                inner
                    .iter()
                    .filter(|e| e.key == o.key && e.start >= o.start && e.end <= o.end)
                    .count()
            })
            .sum::<usize>();
        prop_assert_eq!(contained_within(&outer, &inner).len(), expected);
    }

    #[test]
    fn test_forward_asof_is_one_to_one(
        left in events(30),
        right in events(30),
        tolerance in 0i64..3_000,
    ) {
        let left = EventStream::new("left", left);
        let right = EventStream::new("right", right);
        let matches = AsOfJoin::forward(Edge::End, Edge::Start)
            .with_tolerance(tolerance)
            .join(&left, &right);

        prop_assert!(matches.len() <= left.len());
        let mut anchors: Vec<&str> = matches.iter().map(|c| c.anchor.name.as_str()).collect();
        anchors.sort_unstable();
        anchors.dedup();
        prop_assert_eq!(anchors.len(), matches.len());

        for c in &matches {
            let gap = c.matched.start - c.anchor.end;
            prop_assert!(gap >= 0 && gap <= tolerance);
            prop_assert_eq!(c.anchor.key, c.matched.key);
            // Nothing on the same key starts strictly between the two edges
            let closer = right.iter().any(|r| {
                r.key == c.anchor.key && r.start >= c.anchor.end && r.start < c.matched.start
            });
            prop_assert!(!closer);
        }
    }

    #[test]
    fn test_backward_asof_never_looks_ahead(left in events(30), right in events(30)) {
        let left = EventStream::new("left", left);
        let right = EventStream::new("right", right);
        for c in AsOfJoin::backward(Edge::Start, Edge::End).unbounded().join(&left, &right) {
            prop_assert!(c.matched.end <= c.anchor.start);
        }
    }
}
