//! Digest summaries: an optional external language-model summarizer and the
//! deterministic text used whenever it is absent or fails.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

use super::ServiceMetrics;

const MAX_FALLBACK_LINES: usize = 5;
const EXTERNAL_TIMEOUT: Duration = Duration::from_secs(10);

pub const RECOMMENDATIONS: &str = "Recommendations: tune timeouts, add retries with backoff, \
implement circuit breakers, set alerts on error_rate>2% or p95_latency>1000ms.";

#[derive(Debug, thiserror::Error)]
pub enum SummarizerError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to encode metrics: {0}")]
    Json(#[from] serde_json::Error),
    #[error("response contained no summary")]
    Empty,
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        metrics: &BTreeMap<String, ServiceMetrics>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<String, SummarizerError>;
}

/// Deterministic summary: a header line, the five worst services by error
/// rate then p95 latency, and a fixed recommendations line.
pub fn fallback_summary(
    metrics: &BTreeMap<String, ServiceMetrics>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> String {
    let mut lines = vec![format!(
        "Summary for {} to {}",
        start.to_rfc3339(),
        end.to_rfc3339()
    )];

    let mut ranked: Vec<(&String, &ServiceMetrics)> = metrics.iter().collect();
    ranked.sort_by(|(_, a), (_, b)| {
        b.error_rate
            .total_cmp(&a.error_rate)
            .then(b.p95_latency.total_cmp(&a.p95_latency))
    });

    for (name, m) in ranked.iter().take(MAX_FALLBACK_LINES) {
        lines.push(format!(
            "- {}: error_rate={:.2}%, p95_latency={:.0}ms anomalies={}",
            name,
            m.error_rate * 100.0,
            m.p95_latency,
            m.anomalies.len()
        ));
    }
    if ranked.is_empty() {
        lines.push("- No data available.".to_string());
    }

    lines.push(RECOMMENDATIONS.to_string());
    lines.join("\n")
}

/// Summarizer backed by an OpenAI-compatible chat completions endpoint.
pub struct ExternalSummarizer {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl ExternalSummarizer {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(EXTERNAL_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
            model: model.into(),
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[async_trait]
impl Summarizer for ExternalSummarizer {
    async fn summarize(
        &self,
        metrics: &BTreeMap<String, ServiceMetrics>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<String, SummarizerError> {
        let data = serde_json::to_string(&json!({
            "period_start": start.to_rfc3339(),
            "period_end": end.to_rfc3339(),
            "services": metrics,
        }))?;
        let prompt = format!(
            "Summarize API health over the period. Name key incidents, the services \
             with the highest error rates and latency, critical time windows, and \
             concrete recommendations on timeouts, retries, circuit breakers and \
             alerting. Data: {}",
            data
        );

        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: Some(prompt),
            }],
            temperature: 0.2,
            max_tokens: 300,
        };

        let response: ChatResponse = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or(SummarizerError::Empty)
    }
}
