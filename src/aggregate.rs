//! Thread aggregation: turns an unordered, possibly duplicated stream of
//! validated records into per-customer conversation threads.
//!
//! Idempotent by construction: `merge` re-threads the union of everything
//! seen so far, so thread boundaries never depend on how the input was
//! chunked across aggregation calls. Input is trusted (`ValidRecord` only);
//! structural problems are surfaced through `verify_invariants`, not panics.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::record::{Channel, Direction, ValidRecord};

/// Ordered records for one `(customer, channel)` pair with no internal gap
/// above the idle threshold. Read-only once the aggregation run ends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationThread {
    pub customer_id: String,
    pub channel: Channel,
    pub records: Vec<ValidRecord>,
}

impl ConversationThread {
    pub fn started_at(&self) -> DateTime<Utc> {
        self.records.first().map(|r| r.ts).unwrap_or_default()
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.records.last().map(|r| r.ts).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// A thread is unresolved while the customer spoke last.
    pub fn is_unresolved(&self) -> bool {
        self.records
            .last()
            .map(|r| r.direction == Direction::Inbound)
            .unwrap_or(false)
    }
}

/// Threads per customer, deterministically ordered.
pub type ThreadMap = BTreeMap<String, Vec<ConversationThread>>;

#[derive(Debug, Clone)]
pub struct ThreadAggregator {
    idle_threshold: Duration,
}

impl ThreadAggregator {
    pub fn new(idle_threshold_secs: u64) -> Self {
        Self {
            idle_threshold: Duration::seconds(idle_threshold_secs as i64),
        }
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self::new(cfg.idle_threshold_secs)
    }

    /// Thread a record set from scratch. Dedup by `source_record_id`
    /// happens before grouping; sort order is `(ts, source_record_id)`
    /// so ties are stable across runs.
    pub fn aggregate(&self, records: Vec<ValidRecord>) -> ThreadMap {
        let mut records = records;
        records.sort_by(|a, b| {
            (
                a.customer_id.as_str(),
                a.channel,
                a.ts,
                a.source_record_id.as_str(),
            )
                .cmp(&(
                    b.customer_id.as_str(),
                    b.channel,
                    b.ts,
                    b.source_record_id.as_str(),
                ))
        });

        let mut seen: HashSet<String> = HashSet::with_capacity(records.len());
        let mut out: ThreadMap = BTreeMap::new();

        let mut current: Option<ConversationThread> = None;
        for rec in records {
            if !seen.insert(rec.source_record_id.clone()) {
                continue; // already a member of some thread
            }

            let splits = match &current {
                Some(t) => {
                    t.customer_id != rec.customer_id
                        || t.channel != rec.channel
                        || rec.ts - t.last_activity() > self.idle_threshold
                }
                None => true,
            };

            if splits {
                if let Some(done) = current.take() {
                    out.entry(done.customer_id.clone()).or_default().push(done);
                }
                current = Some(ConversationThread {
                    customer_id: rec.customer_id.clone(),
                    channel: rec.channel,
                    records: Vec::new(),
                });
            }
            current
                .as_mut()
                .expect("current thread set above")
                .records
                .push(rec);
        }
        if let Some(done) = current.take() {
            out.entry(done.customer_id.clone()).or_default().push(done);
        }

        // Per-customer order: by start time, then channel.
        for threads in out.values_mut() {
            threads.sort_by(|a, b| (a.started_at(), a.channel).cmp(&(b.started_at(), b.channel)));
        }
        out
    }

    /// Incremental aggregation: thread the union of previously-seen and new
    /// records. Equivalent to one `aggregate` over everything at once.
    pub fn merge(&self, existing: ThreadMap, new_records: Vec<ValidRecord>) -> ThreadMap {
        let mut all: Vec<ValidRecord> = existing
            .into_values()
            .flatten()
            .flat_map(|t| t.records)
            .collect();
        all.extend(new_records);
        self.aggregate(all)
    }
}

/// Structural checks the engine runs before building a profile. A failure
/// here is a programming-contract bug, not a business error.
pub fn verify_invariants(threads: &[ConversationThread]) -> Result<(), String> {
    let mut seen: HashSet<&str> = HashSet::new();
    for t in threads {
        if t.is_empty() {
            return Err("empty thread".to_string());
        }
        for pair in t.records.windows(2) {
            if pair[1].ts < pair[0].ts {
                return Err(format!(
                    "thread for {} not time-ordered at record {}",
                    t.customer_id, pair[1].source_record_id
                ));
            }
        }
        for r in &t.records {
            if r.customer_id != t.customer_id {
                return Err(format!(
                    "record {} owned by {} found in thread for {}",
                    r.source_record_id, r.customer_id, t.customer_id
                ));
            }
            if !seen.insert(r.source_record_id.as_str()) {
                return Err(format!(
                    "record {} belongs to more than one thread",
                    r.source_record_id
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn rec(id: &str, customer: &str, minute_offset: i64, text: &str) -> ValidRecord {
        ValidRecord {
            source_record_id: id.to_string(),
            customer_id: customer.to_string(),
            channel: Channel::Twitter,
            direction: Direction::Inbound,
            ts: Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
                + Duration::minutes(minute_offset),
            text: text.to_string(),
        }
    }

    #[test]
    fn splits_on_idle_gap() {
        let agg = ThreadAggregator::new(1800);
        let map = agg.aggregate(vec![
            rec("1", "A", 0, "hi"),
            rec("2", "A", 10, "still there?"),
            rec("3", "A", 120, "new issue"),
        ]);
        let threads = &map["A"];
        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].len(), 2);
        assert_eq!(threads[1].len(), 1);
    }

    #[test]
    fn out_of_order_input_yields_same_threads() {
        let agg = ThreadAggregator::new(1800);
        let ordered = agg.aggregate(vec![
            rec("1", "A", 0, "a"),
            rec("2", "A", 10, "b"),
            rec("3", "A", 120, "c"),
        ]);
        let shuffled = agg.aggregate(vec![
            rec("3", "A", 120, "c"),
            rec("1", "A", 0, "a"),
            rec("2", "A", 10, "b"),
        ]);
        assert_eq!(ordered, shuffled);
    }

    #[test]
    fn duplicates_are_dropped_not_reinserted() {
        let agg = ThreadAggregator::new(1800);
        let first = agg.aggregate(vec![rec("1", "A", 0, "a"), rec("2", "A", 5, "b")]);
        let merged = agg.merge(first.clone(), vec![rec("2", "A", 5, "b")]);
        assert_eq!(first, merged);
    }

    #[test]
    fn merge_equals_single_pass_for_any_chunking() {
        let agg = ThreadAggregator::new(1800);
        let all = vec![
            rec("1", "A", 0, "a"),
            rec("2", "A", 40, "b"),
            rec("3", "B", 0, "x"),
            rec("4", "A", 50, "c"),
        ];
        let single = agg.aggregate(all.clone());

        let chunked = agg.merge(
            agg.merge(agg.aggregate(vec![all[3].clone()]), vec![all[0].clone()]),
            vec![all[2].clone(), all[1].clone()],
        );
        assert_eq!(single, chunked);
    }

    #[test]
    fn channels_never_share_a_thread() {
        let agg = ThreadAggregator::new(1800);
        let mut email = rec("2", "A", 1, "b");
        email.channel = Channel::Email;
        let map = agg.aggregate(vec![rec("1", "A", 0, "a"), email]);
        assert_eq!(map["A"].len(), 2);
    }

    #[test]
    fn invariants_hold_for_aggregated_output() {
        let agg = ThreadAggregator::new(1800);
        let map = agg.aggregate(vec![
            rec("1", "A", 0, "a"),
            rec("2", "A", 10, "b"),
            rec("3", "A", 120, "c"),
        ]);
        assert!(verify_invariants(&map["A"]).is_ok());
    }

    #[test]
    fn invariants_catch_foreign_records() {
        let thread = ConversationThread {
            customer_id: "A".into(),
            channel: Channel::Twitter,
            records: vec![rec("1", "B", 0, "a")],
        };
        assert!(verify_invariants(&[thread]).is_err());
    }
}
