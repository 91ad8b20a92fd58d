//! Model enhancement: re-rank/annotate rule candidates via an external
//! model behind a retry/timeout-bounded contract.
//!
//! The model may only adjust confidence and rationale for actions that are
//! already in the candidate set; annotations for unknown actions are
//! discarded. Every failure path (absent client, timeout, transport error,
//! bad JSON, retries exhausted) degrades to rule-only candidates with
//! `enhancement_unavailable` set — never a pipeline error.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, ModelConfig};
use crate::decision::{ActionCandidate, ActionType, EnhancedCandidate};
use crate::profile::CustomerProfile;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("enhance_ok_total", "Successful model enhancements.");
        describe_counter!("enhance_degraded_total", "Enhancements degraded to rule-only.");
        describe_counter!(
            "enhance_dropped_annotations_total",
            "Model annotations discarded (unknown or uninvited action)."
        );
    });
}

/// Low-level model collaborator: one remote completion call.
#[async_trait::async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String>;
    fn name(&self) -> &'static str;
}

pub type DynModelClient = Arc<dyn ModelClient>;

/// What the model is asked to return, one entry per candidate it wants to
/// annotate.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModelAnnotation {
    action: String,
    confidence: f32,
    rationale: String,
}

/// OpenAI chat-completions client. Requires an API key.
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(api_key: String, model_override: Option<&str>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("nba-engine/0.1")
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self {
            http,
            api_key,
            model: model_override.unwrap_or("gpt-4o-mini").to_string(),
        }
    }
}

#[async_trait::async_trait]
impl ModelClient for OpenAiClient {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            max_tokens: u32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: String,
        }

        let sys = "You annotate next-best-action candidates for customer support. \
                   Respond ONLY with a JSON array of objects with keys \
                   \"action\", \"confidence\" (0..1), \"rationale\". \
                   Use only the action names given; never invent actions.";
        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: sys,
                },
                Msg {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.0,
            max_tokens: 400,
        };

        let resp = self
            .http
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("model call failed with status {}", resp.status());
        }
        let body: Resp = resp.json().await?;
        Ok(body
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// Deterministic mock: annotates every known action with a fixed confidence.
pub struct MockClient {
    pub confidence: f32,
}

#[async_trait::async_trait]
impl ModelClient for MockClient {
    async fn complete(&self, _prompt: &str) -> anyhow::Result<String> {
        let all = [
            ActionType::SchedulePhoneCall,
            ActionType::EmailFollowUp,
            ActionType::DmReply,
            ActionType::EscalateToHuman,
            ActionType::Monitor,
        ];
        let annotations: Vec<ModelAnnotation> = all
            .iter()
            .map(|a| ModelAnnotation {
                action: a.as_str().to_string(),
                confidence: self.confidence,
                rationale: format!("mock annotation for {}", a.as_str()),
            })
            .collect();
        Ok(serde_json::to_string(&annotations)?)
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Always errors; handy for degradation tests.
pub struct FailingClient;

#[async_trait::async_trait]
impl ModelClient for FailingClient {
    async fn complete(&self, _prompt: &str) -> anyhow::Result<String> {
        anyhow::bail!("model collaborator unavailable")
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

/// Factory: build a client according to config and environment.
///
/// * `MODEL_TEST_MODE=mock` forces the deterministic mock client.
/// * A disabled config or unresolvable key yields `None` — the engine then
///   runs degraded, which is reported once at startup, not per call.
pub fn build_model_client(config: &ModelConfig) -> Option<DynModelClient> {
    if std::env::var("MODEL_TEST_MODE")
        .map(|v| v == "mock")
        .unwrap_or(false)
    {
        return Some(Arc::new(MockClient { confidence: 0.9 }));
    }
    if !config.enabled {
        return None;
    }
    match config.provider.as_str() {
        "openai" => match config.resolved_api_key() {
            Some(key) => Some(Arc::new(OpenAiClient::new(key, config.model.as_deref()))),
            None => {
                tracing::warn!("model provider configured but no API key resolved");
                None
            }
        },
        other => {
            tracing::warn!(provider = other, "unsupported model provider");
            None
        }
    }
}

pub struct Enhancer {
    client: Option<DynModelClient>,
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
}

impl Enhancer {
    pub fn new(client: Option<DynModelClient>, cfg: &EngineConfig) -> Self {
        Self {
            client,
            timeout: Duration::from_secs(cfg.llm_timeout_secs),
            max_retries: cfg.llm_max_retries,
            backoff: Duration::from_millis(cfg.llm_backoff_ms),
        }
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    /// Annotate candidates with model confidence/rationale, or degrade.
    pub async fn enhance(
        &self,
        profile: &CustomerProfile,
        candidates: Vec<ActionCandidate>,
    ) -> Vec<EnhancedCandidate> {
        ensure_metrics_described();

        let Some(client) = &self.client else {
            counter!("enhance_degraded_total", "cause" => "no_client").increment(1);
            return degrade(candidates);
        };

        let prompt = build_prompt(profile, &candidates);
        let mut attempt: u32 = 0;
        loop {
            match tokio::time::timeout(self.timeout, client.complete(&prompt)).await {
                Ok(Ok(body)) => {
                    if let Some(annotations) = parse_annotations(&body) {
                        counter!("enhance_ok_total").increment(1);
                        return apply_annotations(candidates, annotations);
                    }
                    tracing::warn!(provider = client.name(), "model returned unparsable JSON");
                }
                Ok(Err(err)) => {
                    tracing::warn!(provider = client.name(), error = %err, "model call failed");
                }
                Err(_) => {
                    tracing::warn!(provider = client.name(), "model call timed out");
                }
            }
            if attempt >= self.max_retries {
                break;
            }
            attempt += 1;
            tokio::time::sleep(self.backoff * attempt).await;
        }

        counter!("enhance_degraded_total", "cause" => "retries_exhausted").increment(1);
        degrade(candidates)
    }
}

fn degrade(candidates: Vec<ActionCandidate>) -> Vec<EnhancedCandidate> {
    candidates
        .into_iter()
        .map(EnhancedCandidate::rule_only)
        .collect()
}

fn build_prompt(profile: &CustomerProfile, candidates: &[ActionCandidate]) -> String {
    let mut lines = vec![format!(
        "Customer {}: {} messages across {} threads ({} open), sentiment {}, last activity {}.",
        profile.customer_id,
        profile.total_messages,
        profile.total_threads,
        profile.open_threads,
        profile.sentiment_score,
        profile
            .last_activity
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string()),
    )];
    lines.push("Candidates:".to_string());
    for c in candidates {
        lines.push(format!(
            "- {} (rule_score {:.2}): {}",
            c.action.as_str(),
            c.rule_score,
            c.rationale
        ));
    }
    lines.push(
        "Return a JSON array annotating these candidates with confidence and rationale."
            .to_string(),
    );
    lines.join("\n")
}

/// Accept either a bare array or an object wrapping it under "candidates".
fn parse_annotations(body: &str) -> Option<Vec<ModelAnnotation>> {
    let trimmed = body.trim();
    if let Ok(list) = serde_json::from_str::<Vec<ModelAnnotation>>(trimmed) {
        return Some(list);
    }
    #[derive(Deserialize)]
    struct Wrapped {
        candidates: Vec<ModelAnnotation>,
    }
    serde_json::from_str::<Wrapped>(trimmed).ok().map(|w| w.candidates)
}

fn apply_annotations(
    candidates: Vec<ActionCandidate>,
    annotations: Vec<ModelAnnotation>,
) -> Vec<EnhancedCandidate> {
    let invited: HashSet<ActionType> = candidates.iter().map(|c| c.action).collect();

    let mut by_action: HashMap<ActionType, ModelAnnotation> = HashMap::new();
    for ann in annotations {
        match ActionType::parse(&ann.action) {
            Some(action) if invited.contains(&action) => {
                by_action.entry(action).or_insert(ann);
            }
            _ => {
                counter!("enhance_dropped_annotations_total").increment(1);
                tracing::warn!(action = %ann.action, "model annotated an uninvited action; dropped");
            }
        }
    }

    candidates
        .into_iter()
        .map(|c| {
            let ann = by_action.get(&c.action);
            EnhancedCandidate {
                llm_confidence: ann.map(|a| a.confidence.clamp(0.0, 1.0)),
                llm_rationale: ann.map(|a| sanitize_rationale(&a.rationale)),
                enhancement_unavailable: false,
                candidate: c,
            }
        })
        .collect()
}

/// Single line, collapsed whitespace, capped at 200 chars.
pub fn sanitize_rationale(input: &str) -> String {
    let mut out = String::with_capacity(200);
    let mut prev_space = false;
    for ch in input.chars() {
        let c = if ch.is_whitespace() { ' ' } else { ch };
        if c == ' ' {
            if !prev_space && !out.is_empty() {
                out.push(' ');
            }
            prev_space = true;
        } else {
            out.push(c);
            prev_space = false;
        }
        if out.chars().count() >= 200 {
            break;
        }
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::CustomerProfile;

    fn candidates() -> Vec<ActionCandidate> {
        vec![
            ActionCandidate {
                action: ActionType::DmReply,
                rationale: "active issue".into(),
                rule_score: 0.5,
            },
            ActionCandidate {
                action: ActionType::Monitor,
                rationale: "floor".into(),
                rule_score: 0.1,
            },
        ]
    }

    fn cfg() -> EngineConfig {
        EngineConfig {
            llm_timeout_secs: 1,
            llm_max_retries: 1,
            llm_backoff_ms: 1,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn absent_client_degrades_with_flag() {
        let enhancer = Enhancer::new(None, &cfg());
        let out = enhancer
            .enhance(&CustomerProfile::new_customer("A", 1), candidates())
            .await;
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|c| c.enhancement_unavailable));
        assert!(out.iter().all(|c| c.llm_confidence.is_none()));
    }

    #[tokio::test]
    async fn failing_client_degrades_after_retries() {
        let enhancer = Enhancer::new(Some(Arc::new(FailingClient)), &cfg());
        let out = enhancer
            .enhance(&CustomerProfile::new_customer("A", 1), candidates())
            .await;
        assert!(out.iter().all(|c| c.enhancement_unavailable));
    }

    #[tokio::test]
    async fn mock_client_annotates_only_invited_actions() {
        let enhancer = Enhancer::new(Some(Arc::new(MockClient { confidence: 0.8 })), &cfg());
        let out = enhancer
            .enhance(&CustomerProfile::new_customer("A", 1), candidates())
            .await;
        assert!(out.iter().all(|c| !c.enhancement_unavailable));
        assert!(out
            .iter()
            .all(|c| c.llm_confidence == Some(0.8) && c.llm_rationale.is_some()));
        // Only the two invited actions come back; nothing invented.
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn unknown_actions_are_dropped() {
        let anns = vec![
            ModelAnnotation {
                action: "send_pigeon".into(),
                confidence: 0.99,
                rationale: "nope".into(),
            },
            ModelAnnotation {
                action: "dm_reply".into(),
                confidence: 0.7,
                rationale: "ok".into(),
            },
        ];
        let out = apply_annotations(candidates(), anns);
        assert_eq!(out[0].llm_confidence, Some(0.7));
        assert_eq!(out[1].llm_confidence, None); // monitor not annotated
    }

    #[test]
    fn parse_accepts_array_or_wrapped_object() {
        let arr = r#"[{"action":"monitor","confidence":0.5,"rationale":"r"}]"#;
        let obj = r#"{"candidates":[{"action":"monitor","confidence":0.5,"rationale":"r"}]}"#;
        assert!(parse_annotations(arr).is_some());
        assert!(parse_annotations(obj).is_some());
        assert!(parse_annotations("not json").is_none());
    }

    #[test]
    fn sanitize_collapses_and_caps() {
        assert_eq!(sanitize_rationale("a\n\n  b\tc  "), "a b c");
        let long = "x".repeat(500);
        assert_eq!(sanitize_rationale(&long).chars().count(), 200);
    }
}
