//! Model provider client.
//!
//! The provider itself is a replaceable collaborator; the pipeline only
//! depends on this contract: submit a prompt at a chosen capability tier,
//! get structured JSON text back, and know what the call cost. Charges are
//! computed from reported token usage so the cost ledger can enforce the
//! per-review ceiling.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use goshawk_core::{Category, Finding, Severity};

use crate::error::{ReviewError, Result};

pub const DEFAULT_MODEL_API_BASE: &str = "https://api.openai.com";

const CHEAP_MODEL: &str = "gpt-5-mini";
const CAPABLE_MODEL: &str = "gpt-5.2";

// Price per million tokens, (input, output).
const CHEAP_PRICE: (f64, f64) = (0.25, 2.00);
const CAPABLE_PRICE: (f64, f64) = (1.25, 10.00);

/// Capability tier for a model call. Hunk-level sweeps use the cheap tier;
/// security-sensitive or large files get the capable one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Cheap,
    Capable,
}

impl ModelTier {
    fn model(&self) -> &'static str {
        match self {
            ModelTier::Cheap => CHEAP_MODEL,
            ModelTier::Capable => CAPABLE_MODEL,
        }
    }

    fn price(&self) -> (f64, f64) {
        match self {
            ModelTier::Cheap => CHEAP_PRICE,
            ModelTier::Capable => CAPABLE_PRICE,
        }
    }
}

/// A completed model call: the raw text plus what it cost.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub cost_usd: f64,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

pub struct ModelClient {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl ModelClient {
    pub fn new(client: reqwest::Client, api_base: String, api_key: String) -> Self {
        ModelClient {
            client,
            api_base,
            api_key,
        }
    }

    /// One JSON-mode completion. Cost is derived from reported usage; if
    /// the provider omits usage, a conservative estimate from prompt length
    /// is charged instead.
    pub async fn complete(&self, tier: ModelTier, system: &str, user: &str) -> Result<Completion> {
        let url = format!("{}/v1/chat/completions", self.api_base);
        let payload = json!({
            "model": tier.model(),
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "response_format": { "type": "json_object" },
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ReviewError::RateLimited { reset_at: None });
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(ReviewError::Auth("model provider rejected credential".to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "model call failed");
            return Err(ReviewError::Transient(format!("model call failed: {status} {body}")));
        }

        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|e| ReviewError::Transient(format!("bad model response: {e}")))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ReviewError::Transient("model returned no choices".to_string()))?;

        let cost_usd = match parsed.usage {
            Some(usage) => call_cost(tier, usage.prompt_tokens, usage.completion_tokens),
            None => call_cost(tier, (system.len() + user.len()) as u64 / 4, 1024),
        };

        Ok(Completion { text, cost_usd })
    }
}

/// Dollar cost of a call from token counts.
pub fn call_cost(tier: ModelTier, prompt_tokens: u64, completion_tokens: u64) -> f64 {
    let (input, output) = tier.price();
    (prompt_tokens as f64 * input + completion_tokens as f64 * output) / 1_000_000.0
}

/// Rough pre-call cost estimate used to charge the ledger before the call
/// begins.
pub fn estimate_cost(tier: ModelTier, prompt_chars: usize) -> f64 {
    call_cost(tier, prompt_chars as u64 / 4, 1024)
}

// ---------------------------------------------------------------------------
// Structured response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Elevated risk triggers the cross-file stage.
    pub fn is_elevated(&self) -> bool {
        matches!(self, RiskLevel::Medium | RiskLevel::High)
    }
}

/// Stage S1 output: prose summary plus a risk level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffSummary {
    pub summary: String,
    pub risk: RiskLevel,
}

/// One finding as emitted by a model, before position resolution.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFinding {
    pub line_start: u32,
    #[serde(default)]
    pub line_end: Option<u32>,
    pub severity: String,
    pub category: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub suggestion: Option<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

fn default_confidence() -> f32 {
    0.5
}

#[derive(Debug, Clone, Deserialize)]
pub struct FindingsResponse {
    pub findings: Vec<RawFinding>,
}

impl RawFinding {
    /// Convert to a domain finding against a file path. Unknown severities
    /// and categories degrade to medium/defect rather than dropping the
    /// finding.
    pub fn into_finding(self, path: &str) -> Finding {
        let line_end = self.line_end.unwrap_or(self.line_start).max(self.line_start);
        Finding {
            path: path.to_string(),
            line_start: self.line_start,
            line_end,
            position: None,
            severity: Severity::parse(&self.severity).unwrap_or(Severity::Medium),
            category: Category::parse(&self.category).unwrap_or(Category::Defect),
            title: self.title,
            body: self.body,
            suggestion: self.suggestion,
            confidence: self.confidence.clamp(0.0, 1.0),
        }
    }
}

/// Strip a markdown code fence if the model wrapped its JSON in one.
fn strip_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.trim().strip_suffix("```").unwrap_or(inner).trim()
}

pub fn parse_summary(text: &str) -> Result<DiffSummary> {
    serde_json::from_str(strip_fence(text))
        .map_err(|e| ReviewError::Transient(format!("unparseable summary response: {e}")))
}

pub fn parse_findings(text: &str) -> Result<Vec<RawFinding>> {
    let response: FindingsResponse = serde_json::from_str(strip_fence(text))
        .map_err(|e| ReviewError::Transient(format!("unparseable findings response: {e}")))?;
    Ok(response.findings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_scales_with_tokens_and_tier() {
        let cheap = call_cost(ModelTier::Cheap, 1_000_000, 0);
        let capable = call_cost(ModelTier::Capable, 1_000_000, 0);
        assert!((cheap - 0.25).abs() < 1e-9);
        assert!((capable - 1.25).abs() < 1e-9);
        assert!(call_cost(ModelTier::Cheap, 0, 0) == 0.0);
    }

    #[test]
    fn estimate_is_positive_for_nonempty_prompt() {
        assert!(estimate_cost(ModelTier::Cheap, 4000) > 0.0);
    }

    #[test]
    fn parses_summary_json() {
        let summary = parse_summary(r#"{"summary":"Adds retry logic.","risk":"high"}"#).unwrap();
        assert_eq!(summary.risk, RiskLevel::High);
        assert!(summary.risk.is_elevated());
    }

    #[test]
    fn parses_fenced_summary() {
        let text = "```json\n{\"summary\":\"ok\",\"risk\":\"low\"}\n```";
        let summary = parse_summary(text).unwrap();
        assert_eq!(summary.risk, RiskLevel::Low);
        assert!(!summary.risk.is_elevated());
    }

    #[test]
    fn parses_findings_and_maps_to_domain() {
        let text = r#"{"findings":[{
            "line_start": 12,
            "line_end": 14,
            "severity": "high",
            "category": "security",
            "title": "SQL built by concatenation",
            "body": "Use a parameterized query.",
            "confidence": 0.9
        }]}"#;
        let raw = parse_findings(text).unwrap();
        assert_eq!(raw.len(), 1);
        let finding = raw.into_iter().next().unwrap().into_finding("db.py");
        assert_eq!(finding.path, "db.py");
        assert_eq!(finding.severity, Severity::High);
        assert_eq!(finding.category, Category::Security);
        assert_eq!(finding.line_end, 14);
        assert!(finding.position.is_none());
    }

    #[test]
    fn unknown_severity_degrades_to_medium() {
        let raw = RawFinding {
            line_start: 3,
            line_end: None,
            severity: "catastrophic".to_string(),
            category: "weird".to_string(),
            title: "t".to_string(),
            body: "b".to_string(),
            suggestion: None,
            confidence: 7.0,
        };
        let finding = raw.into_finding("a.rs");
        assert_eq!(finding.severity, Severity::Medium);
        assert_eq!(finding.category, Category::Defect);
        assert_eq!(finding.line_end, 3);
        assert!((finding.confidence - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn garbage_findings_response_is_transient() {
        assert!(matches!(
            parse_findings("not json"),
            Err(ReviewError::Transient(_))
        ));
    }
}
