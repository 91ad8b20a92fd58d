// tests/thread_boundaries.rs
//
// The documented boundary scenario: records at t=0, t=10min and t=2h on
// one channel with a 30-minute idle threshold split into exactly two
// threads — [t=0, t=10min] and [t=2h].

use chrono::{Duration, TimeZone, Utc};
use nba_engine::aggregate::ThreadAggregator;
use nba_engine::record::{Channel, Direction, ValidRecord};

fn rec(id: &str, minute: i64, text: &str) -> ValidRecord {
    ValidRecord {
        source_record_id: id.to_string(),
        customer_id: "A".to_string(),
        channel: Channel::Twitter,
        direction: Direction::Inbound,
        ts: Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap() + Duration::minutes(minute),
        text: text.to_string(),
    }
}

#[test]
fn idle_gap_splits_into_two_threads() {
    let agg = ThreadAggregator::new(30 * 60);
    let map = agg.aggregate(vec![
        rec("1", 0, "hi"),
        rec("2", 10, "still there?"),
        rec("3", 120, "new issue"),
    ]);

    let threads = &map["A"];
    assert_eq!(threads.len(), 2);

    assert_eq!(threads[0].len(), 2);
    assert_eq!(threads[0].records[0].text, "hi");
    assert_eq!(threads[0].records[1].text, "still there?");

    assert_eq!(threads[1].len(), 1);
    assert_eq!(threads[1].records[0].text, "new issue");
}

#[test]
fn gap_exactly_at_threshold_stays_in_one_thread() {
    let agg = ThreadAggregator::new(30 * 60);
    let map = agg.aggregate(vec![rec("1", 0, "a"), rec("2", 30, "b")]);
    assert_eq!(map["A"].len(), 1);

    // One second past the threshold splits.
    let agg_tight = ThreadAggregator::new(30 * 60 - 1);
    let map = agg_tight.aggregate(vec![rec("1", 0, "a"), rec("2", 30, "b")]);
    assert_eq!(map["A"].len(), 2);
}

#[test]
fn timestamps_inside_a_thread_never_decrease() {
    let agg = ThreadAggregator::new(1800);
    let map = agg.aggregate(vec![rec("3", 20, "c"), rec("1", 0, "a"), rec("2", 10, "b")]);
    let thread = &map["A"][0];
    for pair in thread.records.windows(2) {
        assert!(pair[0].ts <= pair[1].ts);
    }
}
