//! Plan generation and execution pipeline.
//!
//! One confirmed request walks Validating → Confirming → Generating →
//! Persisting → Executing; every failure state is terminal and nothing is
//! retried. Validation happens at propose time, the rest after an explicit
//! confirm, so the confirmation gate is an API contract instead of a blocking
//! terminal prompt.

use crate::llm::{strip_code_fences, GatewayError, LlmClient};
use crate::mapping::{self, MappingEntry};
use crate::plan::{self, PlanError, Record};
use crate::sheet::CellValue;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("required fields are not mapped: {0:?}")]
    MissingFields(Vec<String>),
    #[error("user declined; processing cancelled")]
    Cancelled,
    #[error("plan generation failed: {0}")]
    Generation(#[from] GatewayError),
    #[error("failed to write {path}: {message}")]
    Persistence { path: String, message: String },
    #[error("generated plan failed to load: {0}")]
    PlanSyntax(PlanError),
    #[error("plan execution failed: {0}")]
    Execution(PlanError),
}

/// The external yes/no decision. Anything other than an affirmative answer,
/// malformed input included, declines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Affirmed,
    Declined,
}

impl Decision {
    pub fn from_input(input: &str) -> Self {
        match input.trim().to_lowercase().as_str() {
            "ok" | "yes" => Decision::Affirmed,
            _ => Decision::Declined,
        }
    }
}

/// Seam for plan generation so the pipeline can run against a stub in tests.
#[async_trait::async_trait]
pub trait PlanSource: Send + Sync {
    async fn generate_plan_text(
        &self,
        payload: &serde_json::Value,
    ) -> Result<String, GatewayError>;
}

#[async_trait::async_trait]
impl PlanSource for LlmClient {
    async fn generate_plan_text(
        &self,
        payload: &serde_json::Value,
    ) -> Result<String, GatewayError> {
        LlmClient::generate_plan_text(self, payload).await
    }
}

/// A validated request waiting for its confirm call. Held in app state and
/// consumed by the first confirm, affirmative or not.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub id: String,
    pub file_name: String,
    pub mapping: Vec<MappingEntry>,
    #[serde(skip)]
    pub sample_rows: Vec<Vec<CellValue>>,
}

pub struct CodegenPipeline {
    generator: Arc<dyn PlanSource>,
    required_fields: Vec<String>,
    plan_path: PathBuf,
    data_path: PathBuf,
}

impl CodegenPipeline {
    pub fn new(
        generator: Arc<dyn PlanSource>,
        required_fields: Vec<String>,
        plan_path: PathBuf,
        data_path: PathBuf,
    ) -> Self {
        Self {
            generator,
            required_fields,
            plan_path,
            data_path,
        }
    }

    pub fn required_fields(&self) -> &[String] {
        &self.required_fields
    }

    /// Validating: all required fields must be mapped before anything else
    /// happens. All-or-nothing, reporting every missing field.
    pub fn propose(
        &self,
        file_name: String,
        mapping: Vec<MappingEntry>,
        sample_rows: Vec<Vec<CellValue>>,
    ) -> Result<Proposal, PipelineError> {
        let missing = mapping::missing_required_fields(&mapping, &self.required_fields);
        if !missing.is_empty() {
            return Err(PipelineError::MissingFields(missing));
        }

        let proposal = Proposal {
            id: format!("prop_{}", Uuid::new_v4().simple()),
            file_name,
            mapping,
            sample_rows,
        };
        info!("Proposal {} validated, awaiting confirmation", proposal.id);
        Ok(proposal)
    }

    /// Confirming through Executing for one consumed proposal. `full_rows` is
    /// the uncapped row set, not the sample used for generation.
    pub async fn run(
        &self,
        proposal: &Proposal,
        decision: Decision,
        full_rows: &[Vec<CellValue>],
    ) -> Result<Vec<Record>, PipelineError> {
        if decision != Decision::Affirmed {
            info!("Proposal {} declined", proposal.id);
            return Err(PipelineError::Cancelled);
        }

        // Generating
        let payload = serde_json::json!({
            "mapping": proposal.mapping,
            "rowData": proposal.sample_rows,
            "requiredFields": self.required_fields,
        });
        debug!("Requesting transform plan for proposal {}", proposal.id);
        let reply = self.generator.generate_plan_text(&payload).await?;
        let plan_text = strip_code_fences(&reply).to_string();

        // Persisting: the raw plan text is the downloadable artifact,
        // overwritten on every run.
        self.write_artifact(&self.plan_path, plan_text.as_bytes())?;
        info!("Plan persisted to {:?}", self.plan_path);

        // Executing: reload the persisted text, then interpret it against the
        // full row set.
        let persisted =
            std::fs::read_to_string(&self.plan_path).map_err(|e| PipelineError::Persistence {
                path: self.plan_path.display().to_string(),
                message: e.to_string(),
            })?;
        let plan = plan::parse_plan(&persisted).map_err(PipelineError::PlanSyntax)?;

        let records = plan::execute_plan(&plan, full_rows, &self.required_fields)
            .map_err(PipelineError::Execution)?;

        let records_json =
            serde_json::to_vec_pretty(&records).map_err(|e| PipelineError::Persistence {
                path: self.data_path.display().to_string(),
                message: e.to_string(),
            })?;
        self.write_artifact(&self.data_path, &records_json)?;

        info!(
            "Proposal {} executed: {} records from {} rows",
            proposal.id,
            records.len(),
            full_rows.len()
        );
        Ok(records)
    }

    fn write_artifact(&self, path: &std::path::Path, bytes: &[u8]) -> Result<(), PipelineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::Persistence {
                path: parent.display().to_string(),
                message: e.to_string(),
            })?;
        }
        std::fs::write(path, bytes).map_err(|e| PipelineError::Persistence {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }
}
