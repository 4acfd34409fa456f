//! REST API Server for the reconciliation service
//!
//! Exposes reconciliation runs, batch details, document processing and the
//! audit trail over HTTP.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::audit::{self, AuditEvent, AuditLog};
use crate::documents::{DocumentProcessor, PolicyDocumentFields};
use crate::error::ReconciliationError;
use crate::models::{BatchDetails, UploadedDocument};
use crate::orchestrator::Orchestrator;

pub const BANK_STATEMENT_FIELD: &str = "bank_statement";
pub const POLICY_LOG_FIELD: &str = "policy_log";
pub const DOCUMENT_FIELD: &str = "document";

/// =============================
/// Response Models
/// =============================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    pub message: String,
    pub batch_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentResponse {
    pub status: String,
    pub message: String,
    pub data: Option<PolicyDocumentFields>,
}

impl DocumentResponse {
    pub fn success(data: PolicyDocumentFields) -> Self {
        Self {
            status: "success".to_string(),
            message: "Document processed by Gemini.".to_string(),
            data: Some(data),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            status: "error".to_string(),
            message,
            data: None,
        }
    }
}

/// Error wrapper turning crate errors into `{message}` bodies.
/// Internal details are logged, never returned.
pub struct ApiError(ReconciliationError);

impl From<ReconciliationError> for ApiError {
    fn from(err: ReconciliationError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            warn!("Request rejected: {}", self.0);
        }

        (
            status,
            Json(MessageResponse {
                message: self.0.public_message(),
            }),
        )
            .into_response()
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub documents: Arc<DocumentProcessor>,
    pub audit_log: Arc<AuditLog>,
}

/// =============================
/// Multipart Helpers
/// =============================

/// Collect the named file fields. Zero-length uploads are treated as absent.
async fn read_uploads(
    mut multipart: Multipart,
    wanted: &[&str],
) -> Result<HashMap<String, UploadedDocument>, ReconciliationError> {
    let mut uploads = HashMap::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ReconciliationError::InvalidInput(format!("Malformed upload: {}", e)))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        if !wanted.contains(&name.as_str()) {
            continue;
        }

        let file_name = field.file_name().map(str::to_string);
        let mime_type = field.content_type().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ReconciliationError::InvalidInput(format!("Malformed upload: {}", e)))?;

        if bytes.is_empty() {
            continue;
        }

        uploads.insert(
            name,
            UploadedDocument {
                file_name,
                mime_type,
                bytes: bytes.to_vec(),
            },
        );
    }

    Ok(uploads)
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Reconciliation Endpoints
/// =============================

async fn run_reconciliation(
    State(state): State<ApiState>,
    multipart: Multipart,
) -> Result<Json<RunResponse>, ApiError> {
    let mut uploads = read_uploads(multipart, &[BANK_STATEMENT_FIELD, POLICY_LOG_FIELD]).await?;
    info!(files = uploads.len(), "Received reconciliation request");

    let summary = state
        .orchestrator
        .run(
            uploads.remove(BANK_STATEMENT_FIELD),
            uploads.remove(POLICY_LOG_FIELD),
        )
        .await?;

    Ok(Json(RunResponse {
        message: "Reconciliation process completed.".to_string(),
        batch_id: summary.batch_id,
    }))
}

async fn batch_details(
    State(state): State<ApiState>,
    Path(batch_id): Path<i64>,
) -> Result<Json<BatchDetails>, ApiError> {
    let details = state.orchestrator.get_batch_details(batch_id).await?;
    Ok(Json(details))
}

/// =============================
/// Document Endpoint
/// =============================

async fn process_document(
    State(state): State<ApiState>,
    multipart: Multipart,
) -> (StatusCode, Json<DocumentResponse>) {
    let document = match read_uploads(multipart, &[DOCUMENT_FIELD]).await {
        Ok(mut uploads) => uploads.remove(DOCUMENT_FIELD),
        Err(e) => return document_failure(e),
    };

    let Some(document) = document else {
        return (
            StatusCode::BAD_REQUEST,
            Json(DocumentResponse::error("No document file part".to_string())),
        );
    };

    match state.documents.process(&document).await {
        Ok(fields) => {
            let details = serde_json::json!({
                "fileName": document.file_name,
                "mimeType": document.mime_type,
                "fingerprint": audit::fingerprint(&document.bytes),
                "policyNumber": fields.policy_number,
            });
            if let Err(e) = state.audit_log.record(audit::DOCUMENT_PROCESSED, details).await {
                warn!("Failed to record audit event: {}", e);
            }

            (StatusCode::OK, Json(DocumentResponse::success(fields)))
        }
        Err(e) => document_failure(e),
    }
}

fn document_failure(err: ReconciliationError) -> (StatusCode, Json<DocumentResponse>) {
    let status = err.status_code();
    if status.is_server_error() {
        error!("Document processing failed: {}", err);
    }

    (status, Json(DocumentResponse::error(err.public_message())))
}

/// =============================
/// Audit Endpoint
/// =============================

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<usize>,
    pub event_type: Option<String>,
}

async fn list_audits(
    State(state): State<ApiState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEvent>>, ApiError> {
    let limit = query.limit.unwrap_or(audit::DEFAULT_LIST_LIMIT);

    let events = match query.event_type.as_deref() {
        Some(event_type) => state.audit_log.list_by_type(event_type, limit).await?,
        None => state.audit_log.list(limit).await?,
    };

    Ok(Json(events))
}

/// =============================
/// Router
/// =============================

pub fn create_router(state: ApiState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/reconciliation/run", post(run_reconciliation))
        .route("/api/reconciliation/batches/:batch_id", get(batch_details))
        .route("/api/documents/process", post(process_document))
        .route("/api/audits", get(list_audits))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    state: ApiState,
    port: u16,
    max_upload_bytes: usize,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(state, max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::{MockTextExtractor, ScriptedExtractor, StructuredExtractor};
    use crate::matching::FuzzyMatcher;
    use crate::parser::{ParserOptions, StatementParser};
    use crate::store::InMemoryBatchStore;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    const BOUNDARY: &str = "recon-test-boundary";

    fn state(structured: ScriptedExtractor) -> ApiState {
        let text = Arc::new(MockTextExtractor::new());
        let structured: Arc<dyn StructuredExtractor> = Arc::new(structured);
        let options = ParserOptions::default();
        let audit_log = Arc::new(AuditLog::new());

        let parser = Arc::new(StatementParser::new(
            text.clone(),
            structured.clone(),
            options.clone(),
        ));
        let fuzzy = Arc::new(FuzzyMatcher::new(structured.clone(), Duration::from_secs(5)));
        let orchestrator = Arc::new(Orchestrator::new(
            parser,
            fuzzy,
            Arc::new(InMemoryBatchStore::new()),
            audit_log.clone(),
        ));

        ApiState {
            orchestrator,
            documents: Arc::new(DocumentProcessor::new(text, structured, options)),
            audit_log,
        }
    }

    fn scripted() -> ScriptedExtractor {
        ScriptedExtractor::new()
            .on("matched_pairs", r#"{"matched_pairs": []}"#)
            .on("Policy Number", r#"{"policy_number": "POL123456", "customer_name": "John Doe", "premium_amount": 500.0, "policy_end_date": "2026-12-31"}"#)
            .on(
                "BANK",
                r#"[{"transaction_date": "2025-01-01", "amount": 500, "reference_id": "A1"},
                    {"transaction_date": "2025-01-02", "amount": 300, "reference_id": null}]"#,
            )
            .on(
                "POLICY",
                r#"[{"transaction_date": "2025-01-01", "amount": 500, "reference_id": "A1"}]"#,
            )
    }

    fn multipart(parts: &[(&str, &str, &str)]) -> Request<Body> {
        multipart_to("/api/reconciliation/run", parts)
    }

    fn multipart_to(uri: &str, parts: &[(&str, &str, &str)]) -> Request<Body> {
        let mut body = String::new();
        for (name, content_type, content) in parts {
            body.push_str(&format!(
                "--{b}\r\nContent-Disposition: form-data; name=\"{n}\"; filename=\"{n}.txt\"\r\nContent-Type: {ct}\r\n\r\n{c}\r\n",
                b = BOUNDARY,
                n = name,
                ct = content_type,
                c = content
            ));
        }
        body.push_str(&format!("--{}--\r\n", BOUNDARY));

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = create_router(state(scripted()), 1024 * 1024);
        let response = app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_run_then_fetch_details() {
        let app = create_router(state(scripted()), 1024 * 1024);

        let response = app
            .clone()
            .oneshot(multipart(&[
                (BANK_STATEMENT_FIELD, "text/plain", "BANK statement January"),
                (POLICY_LOG_FIELD, "text/plain", "POLICY log January"),
            ]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["message"], "Reconciliation process completed.");
        let batch_id = body["batchId"].as_i64().unwrap();

        let response = app
            .clone()
            .oneshot(get_request(&format!("/api/reconciliation/batches/{}", batch_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let details = body_json(response).await;
        assert_eq!(details["batchId"], batch_id);
        assert_eq!(details["status"], "Completed");
        assert_eq!(details["matchedCount"], 1);
        assert_eq!(details["exceptions"]["bank"].as_array().unwrap().len(), 1);
        assert!(details["exceptions"]["bank"][0]["referenceId"].is_null());
        assert_eq!(details["exceptions"]["bank"][0]["amount"], 300.0);
        assert_eq!(details["exceptions"]["bank"][0]["source"], "bank_statement");
        assert_eq!(details["exceptions"]["bank"][0]["status"], "unmatched");
        assert_eq!(details["exceptions"]["policy"].as_array().unwrap().len(), 0);

        let response = app
            .clone()
            .oneshot(get_request("/api/audits"))
            .await
            .unwrap();
        let audits = body_json(response).await;
        assert_eq!(audits[0]["eventType"], audit::RUN_COMPLETED);
        assert_eq!(audits[0]["details"]["batchId"], batch_id);

        let response = app
            .oneshot(get_request("/api/audits?limit=5&event_type=document_processed"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_json(response).await.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_is_bad_request() {
        let app = create_router(state(scripted()), 1024 * 1024);

        let response = app
            .oneshot(multipart(&[(BANK_STATEMENT_FIELD, "text/plain", "BANK statement")]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(
            body["message"],
            "Both bank_statement and policy_log files are required."
        );
    }

    #[tokio::test]
    async fn test_empty_upload_counts_as_missing() {
        let app = create_router(state(scripted()), 1024 * 1024);

        let response = app
            .oneshot(multipart(&[
                (BANK_STATEMENT_FIELD, "text/plain", "BANK statement"),
                (POLICY_LOG_FIELD, "text/plain", ""),
            ]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_batch_is_not_found() {
        let app = create_router(state(scripted()), 1024 * 1024);
        let response = app
            .oneshot(get_request("/api/reconciliation/batches/999"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["message"], "Batch not found.");
    }

    #[tokio::test]
    async fn test_process_document() {
        let app = create_router(state(scripted()), 1024 * 1024);

        let response = app
            .oneshot(multipart_to(
                "/api/documents/process",
                &[(DOCUMENT_FIELD, "text/plain", "Policy POL123456 for John Doe")],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"]["policy_number"], "POL123456");
        assert_eq!(body["data"]["premium_amount"], 500.0);
        assert_eq!(body["data"]["policy_end_date"], "2026-12-31");
    }

    #[tokio::test]
    async fn test_process_document_without_file() {
        let app = create_router(state(scripted()), 1024 * 1024);

        let response = app
            .oneshot(multipart_to("/api/documents/process", &[]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
    }
}
