//! Quality gate: per-record validation + normalization ahead of aggregation.
//!
//! Stateless and order-independent: `validate` is a pure function of
//! `(record, now, config)`, so shards can gate records in parallel.
//! Rejections are reported, never fatal; callers keep a `RejectionStats`
//! histogram for observability.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, describe_counter};
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::EngineConfig;
use crate::record::{Channel, Direction, RawInteraction, ValidRecord};

static RE_CUSTOMER_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("customer id regex"));
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("gate_records_total", "Records seen by the quality gate.");
        describe_counter!("gate_rejected_total", "Records rejected by the quality gate.");
    });
}

/// Why a raw record was refused. Counted, logged at debug, never thrown.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectionReason {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unknown channel `{0}`")]
    UnknownChannel(String),
    #[error("unknown direction `{0}`")]
    UnknownDirection(String),
    #[error("timestamp does not parse as RFC 3339")]
    BadTimestamp,
    #[error("timestamp is in the future beyond clock-skew tolerance")]
    FutureTimestamp,
    #[error("text empty after normalization")]
    EmptyText,
    #[error("text shorter than the configured minimum")]
    TextTooShort,
    #[error("customer id is not well-formed")]
    BadCustomerId,
}

impl RejectionReason {
    /// Stable label for histograms and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::MissingField(_) => "missing_field",
            Self::UnknownChannel(_) => "unknown_channel",
            Self::UnknownDirection(_) => "unknown_direction",
            Self::BadTimestamp => "bad_timestamp",
            Self::FutureTimestamp => "future_timestamp",
            Self::EmptyText => "empty_text",
            Self::TextTooShort => "text_too_short",
            Self::BadCustomerId => "bad_customer_id",
        }
    }
}

/// Per-run rejection histogram: reason label -> count.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RejectionStats {
    pub total: u64,
    pub by_reason: BTreeMap<&'static str, u64>,
}

impl RejectionStats {
    pub fn record(&mut self, reason: &RejectionReason) {
        self.total += 1;
        *self.by_reason.entry(reason.label()).or_insert(0) += 1;
    }

    pub fn merge(&mut self, other: &RejectionStats) {
        self.total += other.total;
        for (k, v) in &other.by_reason {
            *self.by_reason.entry(k).or_insert(0) += v;
        }
    }
}

#[derive(Debug, Clone)]
pub struct QualityGate {
    clock_skew: Duration,
    min_text_len: usize,
    max_text_len: usize,
}

impl QualityGate {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            clock_skew: Duration::seconds(cfg.clock_skew_secs as i64),
            min_text_len: cfg.min_text_len,
            max_text_len: cfg.max_text_len,
        }
    }

    /// Validate one raw record against `now`. Pure; no shared state.
    pub fn validate(
        &self,
        raw: &RawInteraction,
        now: DateTime<Utc>,
    ) -> Result<ValidRecord, RejectionReason> {
        ensure_metrics_described();
        counter!("gate_records_total").increment(1);

        self.check(raw, now).inspect_err(|reason| {
            counter!("gate_rejected_total", "reason" => reason.label()).increment(1);
            tracing::debug!(target: "gate", reason = reason.label(), "record rejected");
        })
    }

    /// Validate a batch, splitting it into kept records and a rejection histogram.
    pub fn validate_batch(
        &self,
        raws: &[RawInteraction],
        now: DateTime<Utc>,
    ) -> (Vec<ValidRecord>, RejectionStats) {
        let mut kept = Vec::with_capacity(raws.len());
        let mut stats = RejectionStats::default();
        for raw in raws {
            match self.validate(raw, now) {
                Ok(v) => kept.push(v),
                Err(reason) => stats.record(&reason),
            }
        }
        (kept, stats)
    }

    fn check(
        &self,
        raw: &RawInteraction,
        now: DateTime<Utc>,
    ) -> Result<ValidRecord, RejectionReason> {
        if raw.customer_id.trim().is_empty() {
            return Err(RejectionReason::MissingField("customer_id"));
        }
        if raw.timestamp.trim().is_empty() {
            return Err(RejectionReason::MissingField("timestamp"));
        }
        if !RE_CUSTOMER_ID.is_match(raw.customer_id.trim()) {
            return Err(RejectionReason::BadCustomerId);
        }

        let channel = Channel::parse(&raw.channel)
            .ok_or_else(|| RejectionReason::UnknownChannel(raw.channel.clone()))?;
        let direction = Direction::parse(&raw.direction)
            .ok_or_else(|| RejectionReason::UnknownDirection(raw.direction.clone()))?;

        let ts = DateTime::parse_from_rfc3339(raw.timestamp.trim())
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| RejectionReason::BadTimestamp)?;
        if ts > now + self.clock_skew {
            return Err(RejectionReason::FutureTimestamp);
        }

        let text = normalize_text(&raw.text, self.max_text_len);
        if text.is_empty() {
            return Err(RejectionReason::EmptyText);
        }
        if text.chars().count() < self.min_text_len {
            return Err(RejectionReason::TextTooShort);
        }

        let customer_id = raw.customer_id.trim().to_string();
        let source_record_id = match raw.source_record_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            // No external key: derive a stable one from record content.
            _ => derived_record_id(&customer_id, &raw.timestamp, &text),
        };

        Ok(ValidRecord {
            source_record_id,
            customer_id,
            channel,
            direction,
            ts,
            text,
        })
    }
}

/// Normalize text: decode HTML entities, drop control chars, collapse
/// whitespace, trim, cap length.
pub fn normalize_text(s: &str, max_len: usize) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();
    out.retain(|c| !c.is_control());
    out = RE_WS.replace_all(&out, " ").trim().to_string();
    if out.chars().count() > max_len {
        out = out.chars().take(max_len).collect();
        out = out.trim_end().to_string();
    }
    out
}

/// Content-derived dedup key for records that arrive without one:
/// sha256 over the identifying fields, truncated to 16 hex chars.
fn derived_record_id(customer_id: &str, timestamp: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(customer_id.as_bytes());
    hasher.update(b"|");
    hasher.update(timestamp.trim().as_bytes());
    hasher.update(b"|");
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for b in digest.iter().take(8) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
