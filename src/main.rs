//! sheet-mapper - LLM-assisted spreadsheet mapping and transformation server.

mod auth;
mod config;
mod error;
mod llm;
mod mapping;
mod pipeline;
mod plan;
mod sheet;

use auth::{AuthError, AuthService};
use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use config::AppConfig;
use error::ApiError;
use llm::{GatewayError, LlmClient, PromptStore};
use mapping::MappingEntry;
use pipeline::{CodegenPipeline, Decision, PipelineError, Proposal};
use serde::Deserialize;
use serde_json::json;
use sheet::CellValue;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<AppConfig>,
    auth: Arc<AuthService>,
    llm: Arc<LlmClient>,
    pipeline: Arc<CodegenPipeline>,
    /// Proposals awaiting their confirm call; consumed on first use.
    proposals: Arc<RwLock<HashMap<String, Proposal>>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sheet_mapper=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(AppConfig::from_env());
    std::fs::create_dir_all(&config.upload_dir)?;
    std::fs::create_dir_all(&config.generated_dir)?;

    let auth = Arc::new(AuthService::new(
        config.user_id.clone(),
        config.password.clone(),
        &config.session_secret,
    ));

    let llm = Arc::new(LlmClient::new(
        config.api_key.clone(),
        config.model.clone(),
        PromptStore::new(config.prompt_dir.clone()),
    ));
    info!("LLM gateway initialized (model={})", config.model);

    let pipeline = Arc::new(CodegenPipeline::new(
        llm.clone(),
        config.required_fields.clone(),
        config.plan_path(),
        config.data_path(),
    ));

    let state = AppState {
        auth,
        llm,
        pipeline,
        proposals: Arc::new(RwLock::new(HashMap::new())),
        config: config.clone(),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/login", post(login))
        .route("/api/upload", post(upload_file))
        .route("/api/analyze", post(analyze_file))
        .route("/api/remap", post(remap))
        .route("/api/codegen", post(codegen_propose))
        .route("/api/codegen/confirm", post(codegen_confirm))
        .route("/api/download/plan", get(download_plan))
        .route("/api/download/data", get(download_data))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes as usize))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Server listening on http://{}", config.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    password: String,
}

/// Check credentials and issue a session token.
async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let token = state
        .auth
        .login(&body.user_id, &body.password)
        .map_err(|e| ApiError::unauthorized(e.to_string()))?;

    Ok(Json(json!({
        "status": "success",
        "message": "login ok",
        "token": token,
    })))
}

/// Store an uploaded spreadsheet under a unique name.
async fn upload_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;

    let mut filename = String::new();
    let mut file_data = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Multipart error: {}", e)))?
    {
        if field.name() == Some("file") {
            filename = field.file_name().unwrap_or("upload").to_string();
            file_data = field
                .bytes()
                .await
                .map_err(|e| ApiError::bad_request(format!("Failed to read file: {}", e)))?
                .to_vec();
            break;
        }
    }

    if file_data.is_empty() {
        return Err(ApiError::bad_request("No file uploaded"));
    }

    if file_data.len() as u64 > state.config.max_upload_bytes {
        return Err(ApiError::bad_request(format!(
            "File size exceeds the {} byte limit",
            state.config.max_upload_bytes
        )));
    }

    let ext = filename.rsplit('.').next().unwrap_or("").to_lowercase();
    if !sheet::ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        return Err(ApiError::bad_request(
            "Unsupported extension; only .xlsx, .csv, and .json are accepted",
        ));
    }

    // Strip any path components from the client-provided name
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("upload")
        .to_string();
    let saved_name = format!("{}_{}", Uuid::new_v4(), base);
    let save_path = state.config.upload_dir.join(&saved_name);

    std::fs::write(&save_path, &file_data)
        .map_err(|e| ApiError::internal(format!("Failed to save file: {}", e)))?;

    info!("Stored upload {} ({} bytes)", saved_name, file_data.len());
    Ok(Json(json!({
        "status": "success",
        "message": "file uploaded",
        "savedFileName": saved_name,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeRequest {
    #[serde(default)]
    file_name: String,
}

/// Read the uploaded file (capped), detect the header row, and propose a
/// column mapping.
async fn analyze_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AnalyzeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    let path = resolve_upload(&state, &body.file_name)?;

    let data = sheet::read_rows(
        &path,
        state.config.max_upload_bytes,
        Some(state.config.max_preview_rows),
    )
    .map_err(sheet_error)?;

    let header_payload = json!({
        "fileType": data.file_type,
        "rowData": data.rows,
    });
    let header = state
        .llm
        .detect_header(&header_payload)
        .await
        .map_err(gateway_error)?;

    let mapping_payload = json!({
        "fileType": data.file_type,
        "headerRowIndex": header.header_row_index,
        "rowData": data.rows,
        "requiredFields": state.config.required_fields,
    });
    let proposal = state
        .llm
        .propose_mapping(&mapping_payload)
        .await
        .map_err(gateway_error)?;

    Ok(Json(json!({
        "status": "success",
        "headerResponse": header,
        "mappingResponse": proposal,
        "rowData": data.rows,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemapRequest {
    #[serde(default)]
    original_mapping: Vec<MappingEntry>,
    #[serde(default)]
    user_instruction: String,
}

/// Refine an existing mapping from a free-text instruction.
async fn remap(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RemapRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;

    let refined = state
        .llm
        .refine_mapping(&body.original_mapping, &body.user_instruction)
        .await
        .map_err(gateway_error)?;

    Ok(Json(json!({
        "status": "success",
        "mappingResponse": refined,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CodegenRequest {
    #[serde(default)]
    file_name: String,
    #[serde(default)]
    mapping: Vec<MappingEntry>,
    #[serde(default)]
    row_data: Vec<Vec<CellValue>>,
}

/// Phase one: validate the mapping and park a proposal for confirmation.
async fn codegen_propose(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CodegenRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    resolve_upload(&state, &body.file_name)?;

    let proposal = state
        .pipeline
        .propose(body.file_name, body.mapping, body.row_data)
        .map_err(pipeline_error)?;

    let id = proposal.id.clone();
    state
        .proposals
        .write()
        .unwrap()
        .insert(id.clone(), proposal);

    Ok(Json(json!({
        "status": "pending_confirmation",
        "message": "all required fields mapped; confirm to generate the transform plan",
        "proposalId": id,
        "requiredFields": state.config.required_fields,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmRequest {
    #[serde(default)]
    proposal_id: String,
    /// Kept loose on purpose: malformed decisions cancel rather than 422.
    #[serde(default)]
    decision: serde_json::Value,
}

/// Phase two: consume the proposal. An affirmative decision runs generation
/// and execution against the full file; anything else cancels. Single-shot.
async fn codegen_confirm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ConfirmRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;

    let proposal = state
        .proposals
        .write()
        .unwrap()
        .remove(&body.proposal_id)
        .ok_or_else(|| ApiError::not_found("Unknown or already-consumed proposal"))?;

    let decision = Decision::from_input(body.decision.as_str().unwrap_or(""));

    // The plan runs against the full row set, not the preview sample. A
    // declined confirm never touches the stored file.
    let full_rows = if decision == Decision::Affirmed {
        let path = resolve_upload(&state, &proposal.file_name)?;
        sheet::read_rows(&path, state.config.max_upload_bytes, None)
            .map_err(sheet_error)?
            .rows
    } else {
        Vec::new()
    };

    match state.pipeline.run(&proposal, decision, &full_rows).await {
        Ok(records) => Ok(Json(json!({
            "status": "success",
            "message": "transform plan generated and executed",
            "recordCount": records.len(),
            "planPath": "/api/download/plan",
            "dataPath": "/api/download/data",
        }))),
        Err(PipelineError::Cancelled) => Ok(Json(json!({
            "status": "cancelled",
            "message": "user declined; processing cancelled",
        }))),
        Err(e) => {
            error!("codegen failed for proposal {}: {}", body.proposal_id, e);
            Err(pipeline_error(e))
        }
    }
}

/// Serve the most recently generated transform plan.
async fn download_plan(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&state, &headers)?;
    serve_artifact(&state.config.plan_path(), "transform_plan.json")
}

/// Serve the most recently transformed data.
async fn download_data(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&state, &headers)?;
    serve_artifact(&state.config.data_path(), "transformed_data.json")
}

// ============================================================================
// Helper functions
// ============================================================================

/// Validate the bearer token on a protected route.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    state
        .auth
        .verify_bearer(header)
        .map(|_| ())
        .map_err(|e: AuthError| ApiError::unauthorized(e.to_string()))
}

/// Resolve an uploaded file name to its stored path, rejecting traversal.
fn resolve_upload(state: &AppState, file_name: &str) -> Result<PathBuf, ApiError> {
    if file_name.is_empty() {
        return Err(ApiError::bad_request("fileName is missing"));
    }
    if file_name.contains(['/', '\\']) || file_name.contains("..") {
        return Err(ApiError::bad_request("Invalid file name"));
    }
    let path = state.config.upload_dir.join(file_name);
    if !path.exists() {
        return Err(ApiError::not_found("File not found on server"));
    }
    Ok(path)
}

/// Serve a generated artifact as a JSON attachment; 404 when absent.
fn serve_artifact(path: &std::path::Path, download_name: &str) -> Result<Response, ApiError> {
    let bytes = std::fs::read(path)
        .map_err(|_| ApiError::not_found(format!("No generated {} found", download_name)))?;

    let response = (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", download_name),
            ),
        ],
        bytes,
    )
        .into_response();
    Ok(response)
}

fn sheet_error(e: sheet::SheetError) -> ApiError {
    use sheet::SheetError::*;
    match e {
        UnsupportedExtension(_) | TooLarge { .. } | SheetCount(_) | BadJson(_) | Corrupt(_) => {
            ApiError::bad_request(e.to_string())
        }
        Io(_) => ApiError::internal(e.to_string()),
    }
}

fn gateway_error(e: GatewayError) -> ApiError {
    let status = match &e {
        GatewayError::TemplateLoad { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        GatewayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::Connect(_)
        | GatewayError::Status { .. }
        | GatewayError::MalformedReply { .. } => StatusCode::BAD_GATEWAY,
    };
    ApiError::new(status, e.to_string())
}

fn pipeline_error(e: PipelineError) -> ApiError {
    match &e {
        PipelineError::MissingFields(missing) => ApiError::bad_request(e.to_string())
            .with_detail("missingRequiredFields", json!(missing)),
        PipelineError::Cancelled => ApiError::bad_request(e.to_string()),
        PipelineError::Generation(g) => {
            let status = match g {
                GatewayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
                GatewayError::TemplateLoad { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::BAD_GATEWAY,
            };
            ApiError::new(status, e.to_string())
        }
        PipelineError::Persistence { .. } => ApiError::internal(e.to_string()),
        PipelineError::PlanSyntax(p) | PipelineError::Execution(p) => {
            ApiError::internal(e.to_string()).with_detail("detail", json!(p.to_string()))
        }
    }
}
