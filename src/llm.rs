//! Generation collaborator
//!
//! The orchestrator talks to the model through `GenerationCollaborator`, so
//! tests can substitute scripted replies. `LlmClient` is the production
//! implementation over an OpenAI-compatible chat completions endpoint.

use crate::config::LlmSettings;
use crate::error::{QueryBuilderError, Result};
use crate::validator::QueryMode;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

const SYSTEM_PROMPT: &str = "You are a precise JSON-only responder for a school district reporting tool. \
Always return valid JSON, no other text.";

/// One call to the collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaboratorRequest {
    pub mode: QueryMode,
    /// 1-based attempt number this call belongs to
    pub attempt: u32,
    pub prompt: String,
}

/// What the collaborator proposed, after lenient parsing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollaboratorReply {
    pub sql: Option<String>,
    pub fragment_ids: Vec<String>,
    pub referenced_views: Vec<String>,
    pub explanation: Option<String>,
    pub raw: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplyJson {
    #[serde(default)]
    sql: Option<String>,
    #[serde(default, alias = "fragmentIds", alias = "fragment_ids")]
    fragments: Vec<String>,
    #[serde(default, alias = "referenced_views", alias = "views")]
    referenced_views: Vec<String>,
    #[serde(default)]
    explanation: Option<serde_json::Value>,
}

impl CollaboratorReply {
    /// Parse a model reply. JSON is preferred; in view mode a reply that is
    /// not JSON is taken as bare SQL. Anything unusable yields an empty reply,
    /// which then fails validation like any other bad candidate.
    pub fn parse(mode: QueryMode, raw: &str) -> Self {
        let text = strip_code_fences(raw);

        if let Some(parsed) = json_object(&text).and_then(|j| serde_json::from_str::<ReplyJson>(j).ok()) {
            let explanation = parsed.explanation.and_then(|e| match e {
                serde_json::Value::String(s) => Some(s),
                serde_json::Value::Null => None,
                other => Some(other.to_string()),
            });
            return Self {
                sql: parsed.sql.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
                fragment_ids: parsed
                    .fragments
                    .into_iter()
                    .map(|f| f.trim().to_string())
                    .filter(|f| !f.is_empty())
                    .collect(),
                referenced_views: parsed.referenced_views,
                explanation,
                raw: raw.to_string(),
            };
        }

        debug!("Collaborator reply was not JSON ({} chars)", raw.len());
        match mode {
            QueryMode::View if !text.is_empty() => Self {
                sql: Some(text),
                raw: raw.to_string(),
                ..Default::default()
            },
            _ => Self {
                raw: raw.to_string(),
                ..Default::default()
            },
        }
    }
}

fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let inner = ["```json", "```sql", "```"]
        .iter()
        .find_map(|fence| trimmed.strip_prefix(fence))
        .unwrap_or(trimmed);
    inner.trim().trim_end_matches("```").trim().to_string()
}

fn json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

#[async_trait]
pub trait GenerationCollaborator: Send + Sync {
    async fn generate(&self, request: &CollaboratorRequest) -> Result<CollaboratorReply>;
}

#[derive(Debug, Clone)]
pub struct LlmClient {
    api_key: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_settings(settings: &LlmSettings) -> Result<Self> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| QueryBuilderError::Config("OPENAI_API_KEY is not set".to_string()))?;
        Ok(Self::new(api_key, settings.model.clone(), settings.base_url.clone()))
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn call_llm(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt}
            ],
            "temperature": 0.0,
            "max_tokens": 1500
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| QueryBuilderError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(QueryBuilderError::Llm(format!(
                "LLM API returned {}: {}",
                status,
                text.chars().take(300).collect::<String>()
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| QueryBuilderError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| QueryBuilderError::Llm("No content in LLM response".to_string()))?;

        Ok(content.to_string())
    }
}

#[async_trait]
impl GenerationCollaborator for LlmClient {
    async fn generate(&self, request: &CollaboratorRequest) -> Result<CollaboratorReply> {
        let content = self.call_llm(&request.prompt).await?;
        Ok(CollaboratorReply::parse(request.mode, &content))
    }
}
