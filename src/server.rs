//! HTTP API for ingestion, the widget, and per-site configuration.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/documents` | Submit a document `{site_id, title, content, source_url?}` |
//! | `POST` | `/documents/upload` | Multipart upload: `file` + `site_id` |
//! | `GET`  | `/documents?site_id=` | List a site's documents, newest first |
//! | `DELETE` | `/documents/{id}` | Delete a document and its chunks |
//! | `POST` | `/widget` | One chat turn `{site_id, session_id?, message, visitor_id?}` |
//! | `GET`  | `/sites/{site_id}/widget-config` | Public display config (safe subset only) |
//! | `PUT`  | `/sites/{site_id}/ai-config` | Store the full AI config |
//!
//! # Error Contract
//!
//! All error responses use the envelope:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "site_id and message required" } }
//! ```
//!
//! Codes: `bad_request` (400), `not_found` (404), `upstream_error` (502,
//! embedding or completion provider failure), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted: the widget runs on
//! arbitrary customer domains.

use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::chat::{answer_turn, UpstreamError, WidgetRequest};
use crate::completion::CompletionClient;
use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::extract::{extract_text, file_extension, SUPPORTED_EXTENSIONS};
use crate::ingest::{delete_document, ingest_document, list_documents, NewDocument};
use crate::models::SiteAiConfig;
use crate::sites::{load_site_config, save_site_config};
use crate::{db, migrate};

/// Shared application state; clients are constructed once at startup and
/// injected into every handler.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    pool: SqlitePool,
    embedder: Arc<EmbeddingClient>,
    completion: Arc<CompletionClient>,
}

impl AppState {
    pub fn new(
        config: Config,
        pool: SqlitePool,
        embedder: EmbeddingClient,
        completion: CompletionClient,
    ) -> Self {
        Self {
            config: Arc::new(config),
            pool,
            embedder: Arc::new(embedder),
            completion: Arc::new(completion),
        }
    }
}

/// Build the router with all routes and the permissive CORS layer.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/documents", post(handle_create_document))
        .route("/documents", get(handle_list_documents))
        .route("/documents/upload", post(handle_upload_document))
        .route("/documents/{id}", delete(handle_delete_document))
        .route("/widget", post(handle_widget))
        .route("/sites/{site_id}/widget-config", get(handle_widget_config))
        .route("/sites/{site_id}/ai-config", put(handle_put_ai_config))
        .layer(cors)
        .with_state(state)
}

/// Start the server on the configured bind address. Runs until the
/// process terminates.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let embedder = EmbeddingClient::new(&config.embedding)?;
    let completion = CompletionClient::shared(&config.completion)?;

    let bind_addr = config.server.bind.clone();
    let state = AppState::new(config.clone(), pool, embedder, completion);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "server listening");
    println!("sitebrain listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn upstream_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_GATEWAY,
        code: "upstream_error".to_string(),
        message: message.into(),
    }
}

fn internal_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

/// Map pipeline errors onto the HTTP contract: provider failures are
/// 502, unknown ids 404, validation 400, everything else 500.
fn classify_error(err: anyhow::Error) -> AppError {
    if err
        .chain()
        .any(|cause| cause.downcast_ref::<UpstreamError>().is_some())
    {
        return upstream_error(err.to_string());
    }

    let msg = err.to_string();
    if msg.contains("not found") || msg.contains("unknown session") {
        not_found(msg)
    } else if msg.contains("required") || msg.contains("unsupported") || msg.contains("empty") {
        bad_request(msg)
    } else {
        internal_error(msg)
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /documents ============

#[derive(Deserialize)]
struct CreateDocumentBody {
    site_id: Option<String>,
    title: Option<String>,
    content: Option<String>,
    source_url: Option<String>,
}

#[derive(Serialize)]
struct DocumentCreatedResponse {
    id: String,
    title: String,
    status: String,
    chunk_count: usize,
    char_count: usize,
}

async fn handle_create_document(
    State(state): State<AppState>,
    Json(body): Json<CreateDocumentBody>,
) -> Result<Json<DocumentCreatedResponse>, AppError> {
    let (site_id, title, content) = match (body.site_id, body.title, body.content) {
        (Some(s), Some(t), Some(c)) if !s.is_empty() && !t.is_empty() && !c.is_empty() => {
            (s, t, c)
        }
        _ => return Err(bad_request("site_id, title, content required")),
    };

    let title_clone = title.clone();
    let outcome = ingest_document(
        &state.pool,
        &state.config,
        &state.embedder,
        NewDocument {
            site_id,
            title,
            content,
            source_url: body.source_url,
        },
    )
    .await
    .map_err(classify_ingest_error)?;

    Ok(Json(DocumentCreatedResponse {
        id: outcome.document_id,
        title: title_clone,
        status: outcome.status.as_str().to_string(),
        chunk_count: outcome.chunk_count,
        char_count: outcome.char_count,
    }))
}

/// Ingestion failures are almost always the embedding provider; the
/// document is already marked `error` by the pipeline.
fn classify_ingest_error(err: anyhow::Error) -> AppError {
    let msg = err.to_string();
    if msg.contains("required") {
        bad_request(msg)
    } else if msg.contains("embedding") || msg.contains("ingestion failed") {
        upstream_error(msg)
    } else {
        internal_error(msg)
    }
}

// ============ POST /documents/upload ============

async fn handle_upload_document(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<DocumentCreatedResponse>, AppError> {
    let mut site_id: Option<String> = None;
    let mut filename: Option<String> = None;
    let mut bytes: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        match field.name() {
            Some("site_id") => {
                site_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| bad_request(e.to_string()))?,
                );
            }
            Some("file") => {
                filename = field.file_name().map(|s| s.to_string());
                bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| bad_request(e.to_string()))?
                        .to_vec(),
                );
            }
            _ => {}
        }
    }

    let site_id = site_id.filter(|s| !s.is_empty());
    let (site_id, filename, bytes) = match (site_id, filename, bytes) {
        (Some(s), Some(f), Some(b)) => (s, f, b),
        _ => return Err(bad_request("file and site_id required")),
    };

    // Reject unsupported extensions before any processing.
    match file_extension(&filename) {
        Some(ext) if SUPPORTED_EXTENSIONS.contains(&ext.as_str()) => {}
        _ => {
            return Err(bad_request(format!(
                "Unsupported file type. Supported: {}",
                SUPPORTED_EXTENSIONS.join(", ")
            )))
        }
    }

    let text = extract_text(&bytes, &filename).map_err(|e| bad_request(e.to_string()))?;
    if text.trim().is_empty() {
        return Err(bad_request("File is empty or could not extract text"));
    }

    let outcome = ingest_document(
        &state.pool,
        &state.config,
        &state.embedder,
        NewDocument {
            site_id,
            title: filename.clone(),
            content: text,
            source_url: Some(format!("upload://{}", filename)),
        },
    )
    .await
    .map_err(classify_ingest_error)?;

    Ok(Json(DocumentCreatedResponse {
        id: outcome.document_id,
        title: filename,
        status: outcome.status.as_str().to_string(),
        chunk_count: outcome.chunk_count,
        char_count: outcome.char_count,
    }))
}

// ============ GET /documents ============

#[derive(Deserialize)]
struct ListDocumentsQuery {
    site_id: Option<String>,
}

async fn handle_list_documents(
    State(state): State<AppState>,
    Query(query): Query<ListDocumentsQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let site_id = query
        .site_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| bad_request("site_id required"))?;

    let documents = list_documents(&state.pool, &site_id)
        .await
        .map_err(classify_error)?;
    Ok(Json(serde_json::json!({ "documents": documents })))
}

// ============ DELETE /documents/{id} ============

async fn handle_delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let deleted = delete_document(&state.pool, &id)
        .await
        .map_err(classify_error)?;
    if !deleted {
        return Err(not_found(format!("document not found: {}", id)));
    }
    Ok(Json(serde_json::json!({ "success": true })))
}

// ============ POST /widget ============

#[derive(Deserialize)]
struct WidgetBody {
    site_id: Option<String>,
    session_id: Option<String>,
    message: Option<String>,
    visitor_id: Option<String>,
}

async fn handle_widget(
    State(state): State<AppState>,
    Json(body): Json<WidgetBody>,
) -> Result<Json<crate::chat::WidgetResponse>, AppError> {
    let (site_id, message) = match (body.site_id, body.message) {
        (Some(s), Some(m)) if !s.is_empty() && !m.is_empty() => (s, m),
        _ => return Err(bad_request("site_id and message required")),
    };

    let response = answer_turn(
        &state.pool,
        &state.config,
        &state.embedder,
        &state.completion,
        WidgetRequest {
            site_id,
            session_id: body.session_id,
            message,
            visitor_id: body.visitor_id,
        },
    )
    .await
    .map_err(classify_error)?;

    Ok(Json(response))
}

// ============ GET /sites/{site_id}/widget-config ============

/// The widget-visible subset. Credentials and pricing never leave the
/// server.
#[derive(Serialize)]
struct WidgetConfigResponse {
    assistant_name: Option<String>,
    welcome_message: Option<String>,
    brand_color: Option<String>,
}

async fn handle_widget_config(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> Result<Json<WidgetConfigResponse>, AppError> {
    let config = load_site_config(&state.pool, &site_id)
        .await
        .map_err(classify_error)?;

    Ok(Json(WidgetConfigResponse {
        assistant_name: config.assistant_name,
        welcome_message: config.welcome_message,
        brand_color: config.brand_color,
    }))
}

// ============ PUT /sites/{site_id}/ai-config ============

async fn handle_put_ai_config(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    Json(config): Json<SiteAiConfig>,
) -> Result<Json<serde_json::Value>, AppError> {
    if site_id.is_empty() {
        return Err(bad_request("site_id required"));
    }

    save_site_config(&state.pool, &site_id, &config)
        .await
        .map_err(classify_error)?;
    Ok(Json(serde_json::json!({ "success": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompletionConfig, Config, DbConfig, EmbeddingConfig};
    use httpmock::prelude::*;

    async fn spawn_app(
        dir: &tempfile::TempDir,
        provider: &MockServer,
    ) -> (String, SqlitePool) {
        let config = Config {
            db: DbConfig {
                path: dir.path().join("server.sqlite"),
            },
            chunking: Default::default(),
            embedding: EmbeddingConfig {
                base_url: provider.base_url(),
                api_key: Some("test-key".to_string()),
                dims: 3,
                ..Default::default()
            },
            completion: CompletionConfig {
                base_url: provider.base_url(),
                api_key: Some("test-key".to_string()),
                model: "model-a".to_string(),
                fallback_models: vec![],
                retry_delay_ms: 10,
                ..Default::default()
            },
            retrieval: Default::default(),
            server: Default::default(),
        };

        let pool = db::connect(&config).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();

        let embedder = EmbeddingClient::new(&config.embedding).unwrap();
        let completion = CompletionClient::shared(&config.completion).unwrap();
        let state = AppState::new(config, pool.clone(), embedder, completion);
        let app = build_router(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}", addr), pool)
    }

    async fn mock_embeddings_any(provider: &MockServer, count: usize) {
        let data: Vec<serde_json::Value> = (0..count)
            .map(|i| serde_json::json!({ "embedding": [1.0, i as f32 * 0.01, 0.0] }))
            .collect();
        provider
            .mock_async(move |when, then| {
                when.method(POST).path("/embeddings");
                then.status(200).json_body(serde_json::json!({ "data": data }));
            })
            .await;
    }

    #[tokio::test]
    async fn health_reports_version() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MockServer::start_async().await;
        let (base, _pool) = spawn_app(&dir, &provider).await;

        let body: serde_json::Value = reqwest::get(format!("{}/health", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert!(body["version"].is_string());
    }

    #[tokio::test]
    async fn document_roundtrip_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MockServer::start_async().await;
        mock_embeddings_any(&provider, 3).await;
        let (base, _pool) = spawn_app(&dir, &provider).await;
        let client = reqwest::Client::new();

        // Create
        let created: serde_json::Value = client
            .post(format!("{}/documents", base))
            .json(&serde_json::json!({
                "site_id": "site-1",
                "title": "Handbook",
                "content": "a".repeat(2500),
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(created["status"], "ready");
        assert_eq!(created["chunk_count"], 3);
        let doc_id = created["id"].as_str().unwrap().to_string();

        // List
        let listed: serde_json::Value = client
            .get(format!("{}/documents?site_id=site-1", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed["documents"].as_array().unwrap().len(), 1);

        // Delete
        let deleted = client
            .delete(format!("{}/documents/{}", base, doc_id))
            .send()
            .await
            .unwrap();
        assert_eq!(deleted.status(), 200);

        let missing = client
            .delete(format!("{}/documents/{}", base, doc_id))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);
    }

    #[tokio::test]
    async fn missing_fields_get_400_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MockServer::start_async().await;
        let (base, _pool) = spawn_app(&dir, &provider).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/documents", base))
            .json(&serde_json::json!({ "site_id": "site-1" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"]["code"], "bad_request");

        let response = client
            .post(format!("{}/widget", base))
            .json(&serde_json::json!({ "message": "hi" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
    }

    #[tokio::test]
    async fn widget_turn_and_upstream_failure_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MockServer::start_async().await;
        mock_embeddings_any(&provider, 1).await;
        let chat_mock = provider
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(200).json_body(serde_json::json!({
                    "choices": [{ "message": { "content": "Hello there." } }],
                    "usage": { "prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8 }
                }));
            })
            .await;
        let (base, _pool) = spawn_app(&dir, &provider).await;
        let client = reqwest::Client::new();

        let response: serde_json::Value = client
            .post(format!("{}/widget", base))
            .json(&serde_json::json!({ "site_id": "site-1", "message": "hi" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(response["answer"], "Hello there.");
        assert!(response["session_id"].is_string());

        // Completion outage turns into a 502.
        chat_mock.delete_async().await;
        provider
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(500).body("boom");
            })
            .await;

        let failed = client
            .post(format!("{}/widget", base))
            .json(&serde_json::json!({ "site_id": "site-1", "message": "hi again" }))
            .send()
            .await
            .unwrap();
        assert_eq!(failed.status(), 502);
        let body: serde_json::Value = failed.json().await.unwrap();
        assert_eq!(body["error"]["code"], "upstream_error");
    }

    #[tokio::test]
    async fn upload_rejects_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MockServer::start_async().await;
        let (base, _pool) = spawn_app(&dir, &provider).await;
        let client = reqwest::Client::new();

        let form = reqwest::multipart::Form::new()
            .text("site_id", "site-1")
            .part(
                "file",
                reqwest::multipart::Part::bytes(b"binary".to_vec()).file_name("image.png"),
            );
        let response = client
            .post(format!("{}/documents/upload", base))
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: serde_json::Value = response.json().await.unwrap();
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("Unsupported file type"));
    }

    #[tokio::test]
    async fn upload_accepts_markdown() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MockServer::start_async().await;
        mock_embeddings_any(&provider, 1).await;
        let (base, _pool) = spawn_app(&dir, &provider).await;
        let client = reqwest::Client::new();

        let content = format!("# Notes\n\n{}", "useful content here. ".repeat(20));
        let form = reqwest::multipart::Form::new()
            .text("site_id", "site-1")
            .part(
                "file",
                reqwest::multipart::Part::bytes(content.into_bytes()).file_name("notes.md"),
            );
        let response: serde_json::Value = client
            .post(format!("{}/documents/upload", base))
            .multipart(form)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(response["status"], "ready");
        assert_eq!(response["title"], "notes.md");
        assert_eq!(response["chunk_count"], 1);
    }

    #[tokio::test]
    async fn widget_config_exposes_only_the_safe_subset() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MockServer::start_async().await;
        let (base, _pool) = spawn_app(&dir, &provider).await;
        let client = reqwest::Client::new();

        let put = client
            .put(format!("{}/sites/site-1/ai-config", base))
            .json(&serde_json::json!({
                "api_key": "sk-secret",
                "base_url": "https://tenant.example/v1",
                "model": "tenant-model",
                "input_price": 2.0,
                "output_price": 6.0,
                "assistant_name": "Helper",
                "welcome_message": "Hi!",
                "brand_color": "#336699"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(put.status(), 200);

        let body = client
            .get(format!("{}/sites/site-1/widget-config", base))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("Helper"));
        assert!(body.contains("#336699"));
        assert!(!body.contains("sk-secret"));
        assert!(!body.contains("input_price"));
    }
}
