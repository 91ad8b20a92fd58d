// src/record.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw customer touchpoint as delivered by upstream ingestion.
/// Untrusted: every field is a string until the quality gate has seen it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawInteraction {
    /// External dedup key; may be absent, the gate derives one then.
    #[serde(default)]
    pub source_record_id: Option<String>,
    pub customer_id: String,
    pub channel: String,   // e.g., "twitter", "email"
    pub direction: String, // "inbound" | "outbound"
    pub timestamp: String, // RFC 3339
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Twitter,
    Email,
    Chat,
    Phone,
}

impl Channel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "twitter" => Some(Self::Twitter),
            "email" => Some(Self::Email),
            "chat" => Some(Self::Chat),
            "phone" => Some(Self::Phone),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Twitter => "twitter",
            Self::Email => "email",
            Self::Chat => "chat",
            Self::Phone => "phone",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

/// Canonical record produced by the quality gate. Immutable once built;
/// the aggregator and everything downstream trusts it by construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidRecord {
    pub source_record_id: String,
    pub customer_id: String,
    pub channel: Channel,
    pub direction: Direction,
    pub ts: DateTime<Utc>,
    pub text: String, // normalized
}
