//! Decision types and the merger: rule scores + model confidence folded
//! into one ranked, explainable action list with total-order tie-breaks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed action vocabulary. The enhancer may re-rank and annotate these,
/// never invent new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    SchedulePhoneCall,
    EmailFollowUp,
    DmReply,
    EscalateToHuman,
    Monitor,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SchedulePhoneCall => "schedule_phone_call",
            Self::EmailFollowUp => "email_follow_up",
            Self::DmReply => "dm_reply",
            Self::EscalateToHuman => "escalate_to_human",
            Self::Monitor => "monitor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "schedule_phone_call" => Some(Self::SchedulePhoneCall),
            "email_follow_up" => Some(Self::EmailFollowUp),
            "dm_reply" => Some(Self::DmReply),
            "escalate_to_human" => Some(Self::EscalateToHuman),
            "monitor" => Some(Self::Monitor),
            _ => None,
        }
    }
}

/// Output of the rule evaluator for one action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionCandidate {
    pub action: ActionType,
    pub rationale: String,
    pub rule_score: f32,
}

/// A candidate after the enhancement step. Degrades to rule-only when the
/// model collaborator is unavailable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnhancedCandidate {
    #[serde(flatten)]
    pub candidate: ActionCandidate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_rationale: Option<String>,
    pub enhancement_unavailable: bool,
}

impl EnhancedCandidate {
    pub fn rule_only(candidate: ActionCandidate) -> Self {
        Self {
            candidate,
            llm_confidence: None,
            llm_rationale: None,
            enhancement_unavailable: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Rule,
    Llm,
    LlmUnavailable,
}

/// One entry of the audit trail a caller can use to see why an action won.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Evidence {
    pub kind: EvidenceKind,
    pub detail: String,
}

impl Evidence {
    pub fn rule(detail: impl Into<String>) -> Self {
        Self {
            kind: EvidenceKind::Rule,
            detail: detail.into(),
        }
    }
    pub fn llm(detail: impl Into<String>) -> Self {
        Self {
            kind: EvidenceKind::Llm,
            detail: detail.into(),
        }
    }
    pub fn llm_unavailable() -> Self {
        Self {
            kind: EvidenceKind::LlmUnavailable,
            detail: "llm_unavailable".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedCandidate {
    pub action: ActionType,
    pub rule_score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_confidence: Option<f32>,
    pub combined_score: f32,
    pub rationale: String,
}

/// Final per-customer output. Immutable; a fresh decision supersedes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub customer_id: String,
    pub action: ActionType,
    pub combined_score: f32,
    pub ranked: Vec<RankedCandidate>,
    pub evidence: Vec<Evidence>,
    /// True when the model collaborator contributed nothing.
    pub degraded: bool,
    pub profile_version: u64,
    pub decided_at: DateTime<Utc>,
}

/// Blend weight for the merger; collapses to rule-only per candidate when
/// the model confidence is absent.
#[derive(Debug, Clone, Copy)]
pub struct MergeWeights {
    pub llm_weight: f32,
}

impl Default for MergeWeights {
    fn default() -> Self {
        Self { llm_weight: 0.3 }
    }
}

fn combined_score(rule_score: f32, llm_confidence: Option<f32>, w: f32) -> f32 {
    match llm_confidence {
        Some(conf) => (1.0 - w) * rule_score + w * conf.clamp(0.0, 1.0),
        None => rule_score,
    }
}

/// Merge enhanced candidates into a ranked decision.
///
/// Ranking: combined score desc, then rule score desc, then action name
/// lexical asc. `f32::total_cmp` keeps the order total and reproducible.
pub fn merge(
    customer_id: &str,
    enhanced: Vec<EnhancedCandidate>,
    weights: MergeWeights,
    profile_version: u64,
    now: DateTime<Utc>,
) -> Decision {
    let degraded = enhanced.iter().all(|c| c.enhancement_unavailable);

    let mut ranked: Vec<RankedCandidate> = enhanced
        .iter()
        .map(|c| RankedCandidate {
            action: c.candidate.action,
            rule_score: c.candidate.rule_score,
            llm_confidence: c.llm_confidence,
            combined_score: combined_score(
                c.candidate.rule_score,
                c.llm_confidence,
                weights.llm_weight,
            ),
            rationale: c
                .llm_rationale
                .clone()
                .unwrap_or_else(|| c.candidate.rationale.clone()),
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.combined_score
            .total_cmp(&a.combined_score)
            .then(b.rule_score.total_cmp(&a.rule_score))
            .then(a.action.as_str().cmp(b.action.as_str()))
    });

    let mut evidence: Vec<Evidence> = Vec::with_capacity(enhanced.len() + 1);
    for c in &enhanced {
        evidence.push(Evidence::rule(format!(
            "{}: {} (rule_score {:.2})",
            c.candidate.action.as_str(),
            c.candidate.rationale,
            c.candidate.rule_score
        )));
        if let Some(r) = &c.llm_rationale {
            evidence.push(Evidence::llm(format!(
                "{}: {} (confidence {:.2})",
                c.candidate.action.as_str(),
                r,
                c.llm_confidence.unwrap_or(0.0)
            )));
        }
    }
    if degraded {
        evidence.push(Evidence::llm_unavailable());
    }

    let top = ranked.first().cloned().unwrap_or(RankedCandidate {
        action: ActionType::Monitor,
        rule_score: 0.0,
        llm_confidence: None,
        combined_score: 0.0,
        rationale: "no candidates".to_string(),
    });

    Decision {
        customer_id: customer_id.to_string(),
        action: top.action,
        combined_score: top.combined_score,
        ranked,
        evidence,
        degraded,
        profile_version,
        decided_at: now,
    }
}
