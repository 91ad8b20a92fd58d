//! Customer profile: a versioned, deterministic summary of one customer's
//! thread set. Pure fold — same threads in, byte-identical profile out
//! (the version counter is an explicit input, never wall clock).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregate::ConversationThread;
use crate::record::{Channel, Direction};
use crate::sentiment::SentimentScorer;

/// Vocabulary that flags a conversation as urgent / escalating.
const URGENT_WORDS: &[&str] = &["urgent", "asap", "immediately", "right now", "help"];
const ESCALATION_WORDS: &[&str] = &["escalate", "manager", "complaint", "unacceptable", "lawyer"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadSummary {
    pub channel: Channel,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub messages: u32,
    pub inbound: u32,
    pub outbound: u32,
    pub unresolved: bool,
    pub sentiment: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomerProfile {
    pub customer_id: String,
    /// Monotonically increasing; bumped by the engine on every rebuild.
    pub version: u64,
    pub threads: Vec<ThreadSummary>,
    pub total_messages: u32,
    pub total_threads: u32,
    pub open_threads: u32,
    pub last_activity: Option<DateTime<Utc>>,
    pub avg_message_len: f32,
    pub sentiment_score: i32,
    pub has_urgent_language: bool,
    pub has_escalation_language: bool,
}

impl CustomerProfile {
    /// Well-defined profile for a customer with no threads yet.
    pub fn new_customer(customer_id: impl Into<String>, version: u64) -> Self {
        Self {
            customer_id: customer_id.into(),
            version,
            threads: Vec::new(),
            total_messages: 0,
            total_threads: 0,
            open_threads: 0,
            last_activity: None,
            avg_message_len: 0.0,
            sentiment_score: 0,
            has_urgent_language: false,
            has_escalation_language: false,
        }
    }

    pub fn hours_since_last_activity(&self, now: DateTime<Utc>) -> Option<f64> {
        self.last_activity
            .map(|t| (now - t).num_seconds() as f64 / 3600.0)
    }

    /// Messages in threads whose last activity falls inside the window.
    pub fn messages_active_within(&self, now: DateTime<Utc>, window_hours: i64) -> u32 {
        self.threads
            .iter()
            .filter(|t| (now - t.last_activity).num_hours() < window_hours)
            .map(|t| t.messages)
            .sum()
    }
}

pub struct ProfileBuilder {
    scorer: Arc<dyn SentimentScorer>,
}

impl ProfileBuilder {
    pub fn new(scorer: Arc<dyn SentimentScorer>) -> Self {
        Self { scorer }
    }

    /// Fold a thread set into a profile. Tolerates an empty set.
    pub fn build(
        &self,
        customer_id: &str,
        threads: &[ConversationThread],
        version: u64,
    ) -> CustomerProfile {
        let mut profile = CustomerProfile::new_customer(customer_id, version);
        if threads.is_empty() {
            return profile;
        }

        let mut total_chars = 0usize;
        for thread in threads {
            let mut summary = ThreadSummary {
                channel: thread.channel,
                started_at: thread.started_at(),
                last_activity: thread.last_activity(),
                messages: thread.len() as u32,
                inbound: 0,
                outbound: 0,
                unresolved: thread.is_unresolved(),
                sentiment: 0,
            };
            for rec in &thread.records {
                match rec.direction {
                    Direction::Inbound => summary.inbound += 1,
                    Direction::Outbound => summary.outbound += 1,
                }
                summary.sentiment += self.scorer.score(&rec.text);
                total_chars += rec.text.chars().count();

                let lower = rec.text.to_ascii_lowercase();
                if URGENT_WORDS.iter().any(|w| lower.contains(w)) {
                    profile.has_urgent_language = true;
                }
                if ESCALATION_WORDS.iter().any(|w| lower.contains(w)) {
                    profile.has_escalation_language = true;
                }
            }

            profile.total_messages += summary.messages;
            profile.total_threads += 1;
            if summary.unresolved {
                profile.open_threads += 1;
            }
            profile.sentiment_score += summary.sentiment;
            profile.last_activity = Some(
                profile
                    .last_activity
                    .map_or(summary.last_activity, |t| t.max(summary.last_activity)),
            );
            profile.threads.push(summary);
        }

        profile
            .threads
            .sort_by(|a, b| (a.started_at, a.channel).cmp(&(b.started_at, b.channel)));
        profile.avg_message_len = total_chars as f32 / profile.total_messages as f32;
        profile
    }
}
