//! Environment-driven server configuration.
//!
//! Everything is read once at startup via [`AppConfig::from_env`]. A missing
//! LLM credential degrades to a warning and a placeholder key so the server
//! still starts (analysis endpoints will then fail at the gateway).

use std::env;
use std::path::PathBuf;
use tracing::warn;
use uuid::Uuid;

/// Fallback key used when `OPENROUTER_API_KEY` is absent.
pub const PLACEHOLDER_API_KEY: &str = "sk-placeholder-not-configured";

const DEFAULT_MODEL: &str = "openai/gpt-4o";
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 500 * 1024 * 1024; // 500MB
const DEFAULT_MAX_PREVIEW_ROWS: usize = 100;
const DEFAULT_REQUIRED_FIELDS: &[&str] = &["distributorCode", "CustomerName", "AccountNumber"];

/// Application configuration shared across handlers.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// LLM gateway credential (placeholder when unset).
    pub api_key: String,
    /// Chat-completion model identifier.
    pub model: String,
    /// Address the HTTP server binds to.
    pub bind_addr: String,
    /// Directory for uploaded spreadsheets.
    pub upload_dir: PathBuf,
    /// Directory for generated artifacts (plan + transformed data).
    pub generated_dir: PathBuf,
    /// Directory holding the per-purpose instruction templates.
    pub prompt_dir: PathBuf,
    /// Maximum accepted upload size in bytes.
    pub max_upload_bytes: u64,
    /// Row cap applied to preview reads (analyze); codegen re-reads uncapped.
    pub max_preview_rows: usize,
    /// Target fields that must be mapped before codegen may proceed.
    pub required_fields: Vec<String>,
    /// Login credentials for `/api/login`.
    pub user_id: String,
    pub password: String,
    /// HS256 secret for issued session tokens.
    pub session_secret: String,
}

impl AppConfig {
    /// Read configuration from the environment. Never fails: every setting has
    /// a default, and the one external credential degrades to a placeholder.
    pub fn from_env() -> Self {
        let api_key = match env::var("OPENROUTER_API_KEY") {
            Ok(key) if !key.trim().is_empty() => key,
            _ => {
                warn!("OPENROUTER_API_KEY is not set; LLM requests will fail until it is configured");
                PLACEHOLDER_API_KEY.to_string()
            }
        };

        let required_fields = env::var("SM_REQUIRED_FIELDS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|f| f.trim().to_string())
                    .filter(|f| !f.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|fields: &Vec<String>| !fields.is_empty())
            .unwrap_or_else(|| {
                DEFAULT_REQUIRED_FIELDS
                    .iter()
                    .map(|f| f.to_string())
                    .collect()
            });

        Self {
            api_key,
            model: env::var("SM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            bind_addr: env::var("SM_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string()),
            upload_dir: env::var("SM_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("uploads")),
            generated_dir: env::var("SM_GENERATED_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("generated")),
            prompt_dir: env::var("SM_PROMPT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("prompts")),
            max_upload_bytes: env::var("SM_MAX_UPLOAD_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
            max_preview_rows: env::var("SM_MAX_PREVIEW_ROWS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_PREVIEW_ROWS),
            required_fields,
            user_id: env::var("SM_USER_ID").unwrap_or_else(|_| "test".to_string()),
            password: env::var("SM_PASSWORD").unwrap_or_else(|_| "test".to_string()),
            session_secret: env::var("SM_SESSION_SECRET")
                .unwrap_or_else(|_| Uuid::new_v4().to_string()),
        }
    }

    /// Fixed path of the persisted transform plan artifact.
    pub fn plan_path(&self) -> PathBuf {
        self.generated_dir.join("transform_plan.json")
    }

    /// Fixed path of the persisted transformed-data artifact.
    pub fn data_path(&self) -> PathBuf {
        self.generated_dir.join("transformed_data.json")
    }
}
