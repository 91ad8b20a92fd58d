//! Deterministic rule evaluator: a declarative tier table mapping profile
//! predicates to scored action candidates.
//!
//! First match wins within a tier; every tier may contribute one candidate;
//! the result is sorted by rule score descending with declaration order
//! breaking ties. A `monitor` floor candidate is always appended, so the
//! output is never empty. Rules are pure over `(profile, ctx)` — the
//! evaluation instant arrives in `RuleContext`, never from the wall clock,
//! so batch and online runs agree for the same profile.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::config::EngineConfig;
use crate::decision::{ActionCandidate, ActionType};
use crate::profile::CustomerProfile;

/// Everything a rule may look at besides the profile.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext {
    pub now: DateTime<Utc>,
    pub dormant_after_hours: i64,
    pub active_window_hours: i64,
}

impl RuleContext {
    pub fn new(now: DateTime<Utc>, cfg: &EngineConfig) -> Self {
        Self {
            now,
            dormant_after_hours: cfg.dormant_after_hours,
            active_window_hours: cfg.active_window_hours,
        }
    }
}

type Predicate = fn(&CustomerProfile, &RuleContext) -> Option<String>;

pub struct Rule {
    pub name: &'static str,
    pub tier: u8,
    pub action: ActionType,
    pub score: f32,
    pub applies: Predicate,
}

pub struct RuleEvaluator {
    rules: Vec<Rule>,
}

impl RuleEvaluator {
    pub fn with_default_rules() -> Self {
        Self {
            rules: default_rules(),
        }
    }

    /// Evaluate the table against one profile. Never returns empty.
    pub fn evaluate(&self, profile: &CustomerProfile, ctx: &RuleContext) -> Vec<ActionCandidate> {
        let mut fired_tiers: HashSet<u8> = HashSet::new();
        let mut candidates: Vec<ActionCandidate> = Vec::new();

        for rule in &self.rules {
            if fired_tiers.contains(&rule.tier) {
                continue;
            }
            if let Some(rationale) = (rule.applies)(profile, ctx) {
                fired_tiers.insert(rule.tier);
                candidates.push(ActionCandidate {
                    action: rule.action,
                    rationale,
                    rule_score: rule.score,
                });
            }
        }

        // Floor: a valid profile always yields at least "monitor".
        candidates.push(ActionCandidate {
            action: ActionType::Monitor,
            rationale: "no action required; keep monitoring".to_string(),
            rule_score: 0.1,
        });

        // Stable sort keeps declaration order for equal scores.
        candidates.sort_by(|a, b| b.rule_score.total_cmp(&a.rule_score));
        candidates
    }
}

fn default_rules() -> Vec<Rule> {
    vec![
        Rule {
            name: "escalation-language",
            tier: 0,
            action: ActionType::EscalateToHuman,
            score: 0.95,
            applies: |p, _| {
                (p.open_threads > 0 && p.has_escalation_language)
                    .then(|| "escalation language in an open conversation".to_string())
            },
        },
        Rule {
            name: "urgent-language",
            tier: 1,
            action: ActionType::DmReply,
            score: 0.90,
            applies: |p, _| {
                (p.open_threads > 0 && p.has_urgent_language)
                    .then(|| "urgent language detected; respond immediately".to_string())
            },
        },
        Rule {
            name: "long-conversation",
            tier: 2,
            action: ActionType::SchedulePhoneCall,
            score: 0.85,
            applies: |p, _| {
                (p.open_threads > 0 && p.total_messages > 5).then(|| {
                    format!(
                        "conversation has {} messages; a phone call is more efficient",
                        p.total_messages
                    )
                })
            },
        },
        Rule {
            name: "dormant-issue",
            tier: 3,
            action: ActionType::EmailFollowUp,
            score: 0.75,
            applies: |p, ctx| match p.hours_since_last_activity(ctx.now) {
                Some(h) if p.open_threads > 0 && h >= ctx.dormant_after_hours as f64 => Some(
                    format!("issue dormant for {h:.1} hours; email follow-up needed"),
                ),
                _ => None,
            },
        },
        Rule {
            name: "very-active-customer",
            tier: 4,
            action: ActionType::DmReply,
            score: 0.70,
            applies: |p, ctx| {
                let recent = p.messages_active_within(ctx.now, ctx.active_window_hours);
                (p.open_threads > 0 && recent >= 3).then(|| {
                    format!("customer very active ({recent} recent messages); reply in-channel")
                })
            },
        },
        Rule {
            name: "negative-sentiment",
            tier: 5,
            action: ActionType::DmReply,
            score: 0.65,
            applies: |p, _| {
                (p.open_threads > 0 && p.sentiment_score <= -3).then(|| {
                    format!(
                        "negative sentiment ({}); prioritize a direct reply",
                        p.sentiment_score
                    )
                })
            },
        },
        Rule {
            name: "open-thread-default",
            tier: 6,
            action: ActionType::DmReply,
            score: 0.50,
            applies: |p, _| {
                (p.open_threads > 0).then(|| "standard response for an active issue".to_string())
            },
        },
    ]
}
