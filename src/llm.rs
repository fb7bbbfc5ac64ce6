//! LLM gateway: chat-completion requests for header detection, mapping
//! proposal, mapping refinement, and transform-plan generation.
//!
//! One synchronous request per call, no retry or backoff for any failure.
//! Each failure mode is a distinct [`GatewayError`] variant so callers can
//! surface connectivity, rate-limit, bad-status, and malformed-reply cases
//! separately.

use crate::mapping::{HeaderDetection, MappingEntry, MappingProposal};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

const API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const MAX_TOKENS: u32 = 16384;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to load instruction template {path}: {message}")]
    TemplateLoad { path: String, message: String },
    #[error("could not connect to the model API: {0}")]
    Connect(String),
    #[error("model API rate limit hit: {0}")]
    RateLimited(String),
    #[error("model API returned status {code}: {body}")]
    Status { code: u16, body: String },
    #[error("malformed model reply ({detail}): {snippet}")]
    MalformedReply { detail: String, snippet: String },
}

/// The four request purposes, each backed by a static instruction template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    HeaderDetection,
    Mapping,
    MappingRefine,
    PlanGeneration,
}

impl Purpose {
    pub fn template_file(&self) -> &'static str {
        match self {
            Purpose::HeaderDetection => "header_detection.md",
            Purpose::Mapping => "mapping.md",
            Purpose::MappingRefine => "mapping_refine.md",
            Purpose::PlanGeneration => "plan_generation.md",
        }
    }
}

/// Loads instruction templates from the prompt directory. Read per request so
/// template edits take effect without a restart.
#[derive(Debug, Clone)]
pub struct PromptStore {
    dir: PathBuf,
}

impl PromptStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn load(&self, purpose: Purpose) -> Result<String, GatewayError> {
        let path = self.dir.join(purpose.template_file());
        std::fs::read_to_string(&path).map_err(|e| GatewayError::TemplateLoad {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }
}

/// Chat-completion client for the hosted model API.
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    api_key: String,
    model: String,
    prompts: PromptStore,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, prompts: PromptStore) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            prompts,
        }
    }

    /// Ask which row (if any) holds the column labels.
    pub async fn detect_header(
        &self,
        payload: &serde_json::Value,
    ) -> Result<HeaderDetection, GatewayError> {
        self.ask_json(Purpose::HeaderDetection, payload).await
    }

    /// Ask for a column-to-field mapping proposal.
    pub async fn propose_mapping(
        &self,
        payload: &serde_json::Value,
    ) -> Result<MappingProposal, GatewayError> {
        self.ask_json(Purpose::Mapping, payload).await
    }

    /// Refine an existing mapping from a free-text instruction.
    pub async fn refine_mapping(
        &self,
        original: &[MappingEntry],
        instruction: &str,
    ) -> Result<MappingProposal, GatewayError> {
        let payload = serde_json::json!({
            "originalMapping": original,
            "userInstruction": instruction,
        });
        self.ask_json(Purpose::MappingRefine, &payload).await
    }

    /// Request raw transform-plan text. The caller strips fences and persists
    /// the text before interpreting it.
    pub async fn generate_plan_text(
        &self,
        payload: &serde_json::Value,
    ) -> Result<String, GatewayError> {
        let template = self.prompts.load(Purpose::PlanGeneration)?;
        let messages = vec![
            Message::system(template),
            Message::user(format!("Here is the JSON data:\n{}", payload)),
        ];
        self.chat(messages).await
    }

    /// One purpose-templated request whose reply must parse as `T`.
    async fn ask_json<T: for<'de> Deserialize<'de>>(
        &self,
        purpose: Purpose,
        payload: &serde_json::Value,
    ) -> Result<T, GatewayError> {
        let template = self.prompts.load(purpose)?;
        let messages = vec![
            Message::system(template),
            Message::user(format!("Here is the JSON data:\n{}", payload)),
        ];
        let reply = self.chat(messages).await?;
        parse_reply(&reply)
    }

    /// Send one chat-completion request and return the reply text.
    pub async fn chat(&self, messages: Vec<Message>) -> Result<String, GatewayError> {
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            max_tokens: Some(MAX_TOKENS),
            temperature: Some(0.0),
        };
        debug!("Sending request to model API: model={}", request.model);

        let response = self
            .client
            .post(API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| GatewayError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), body));
        }

        let parsed: ChatCompletionResponse =
            response.json().await.map_err(|e| GatewayError::MalformedReply {
                detail: "completion envelope did not parse".to_string(),
                snippet: e.to_string(),
            })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        if let Some(usage) = parsed.usage {
            info!(
                "Model reply: {} tokens (prompt: {}, completion: {})",
                usage.total_tokens, usage.prompt_tokens, usage.completion_tokens
            );
        }

        Ok(content)
    }
}

/// Map a non-2xx status to the matching error variant.
fn classify_status(code: u16, body: String) -> GatewayError {
    if code == 429 {
        GatewayError::RateLimited(body)
    } else {
        GatewayError::Status { code, body }
    }
}

/// Strip markdown code fences from a model reply, if present.
pub fn strip_code_fences(reply: &str) -> &str {
    if reply.contains("```json") {
        reply
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .unwrap_or(reply)
            .trim()
    } else if reply.contains("```") {
        reply.split("```").nth(1).unwrap_or(reply).trim()
    } else {
        reply.trim()
    }
}

/// Parse a (possibly fenced) model reply as JSON of the expected shape.
pub fn parse_reply<T: serde::de::DeserializeOwned>(reply: &str) -> Result<T, GatewayError> {
    let json_str = strip_code_fences(reply);
    serde_json::from_str(json_str).map_err(|e| GatewayError::MalformedReply {
        detail: e.to_string(),
        snippet: json_str.chars().take(200).collect(),
    })
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_json_fences() {
        let reply = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fences(reply), "{\"a\": 1}");
    }

    #[test]
    fn strips_bare_fences() {
        let reply = "```\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fences(reply), "{\"a\": 1}");
    }

    #[test]
    fn unfenced_text_passes_through() {
        assert_eq!(strip_code_fences("  {\"a\": 1} \n"), "{\"a\": 1}");
    }

    #[test]
    fn parse_reply_reports_malformed() {
        let err = parse_reply::<HeaderDetection>("not json at all").unwrap_err();
        assert!(matches!(err, GatewayError::MalformedReply { .. }));
    }

    #[test]
    fn parse_reply_header_detection() {
        let reply = "```json\n{\"isHeaderPresent\": true, \"headerRowIndex\": 0, \"reason\": \"labels\"}\n```";
        let parsed: HeaderDetection = parse_reply(reply).unwrap();
        assert!(parsed.is_header_present);
        assert_eq!(parsed.header_row_index, 0);
    }

    #[test]
    fn rate_limit_is_distinct_from_bad_status() {
        assert!(matches!(
            classify_status(429, String::new()),
            GatewayError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(500, String::new()),
            GatewayError::Status { code: 500, .. }
        ));
    }
}
