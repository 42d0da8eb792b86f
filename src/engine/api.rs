use std::{sync::Arc, time::Instant};

use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Path, Query, Request, State, rejection::JsonRejection},
    http::{HeaderName, HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use uuid::Uuid;

use crate::engine::{
    config::EngineConfig,
    error::{EngineError, EngineResult},
    grader::grade,
    metrics::MetricsRegistry,
    models::{
        Assignment, AssignmentInput, DebugStartRequest, DebugStartResponse, DebugStateResponse,
        GradeRequest, GradeResponse, RunRequest, RunResponse, SourceInput, StepRequest,
        SubmissionDetail, SubmitRequest, SubmitResponse, source_files,
    },
    package::{SubmissionPackager, SubmitInput},
    sandbox::{RunSpec, SandboxBackend},
    session::SessionRegistry,
    store::{GradeStore, download_url},
};

#[derive(Clone)]
pub struct AppState {
    config: EngineConfig,
    store: GradeStore,
    sandbox: Arc<dyn SandboxBackend>,
    packager: Arc<SubmissionPackager>,
    sessions: SessionRegistry,
    metrics: Arc<MetricsRegistry>,
}

impl AppState {
    pub fn new(
        config: EngineConfig,
        store: GradeStore,
        sandbox: Arc<dyn SandboxBackend>,
        sessions: SessionRegistry,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let packager = Arc::new(SubmissionPackager::new(
            sandbox.clone(),
            store.clone(),
            config.submissions_dir.clone(),
            config.default_timeout_ms,
            metrics.clone(),
        ));
        Self {
            config,
            store,
            sandbox,
            packager,
            sessions,
            metrics,
        }
    }
}

pub fn routes(state: AppState) -> Router {
    let max_body_bytes = state.config.max_body_bytes;
    let cors = cors_layer(&state.config.cors_allowed_origins);
    let api = Router::new()
        .route("/run", post(run_program))
        .route("/grade", post(grade_submission))
        .route("/submit", post(submit))
        .route("/submit/{id}/download", get(download_submission))
        .route("/debug/start", post(debug_start))
        .route("/debug/{id}/step", post(debug_step))
        .route("/debug/{id}/state", get(debug_state))
        .route("/debug/{id}", delete(debug_close))
        .route("/assignments", get(list_assignments).post(create_assignment))
        .route(
            "/assignments/{id}",
            get(get_assignment)
                .put(update_assignment)
                .delete(delete_assignment),
        )
        .route("/dashboard/submissions", get(list_submissions))
        .route("/dashboard/submissions/{id}", get(submission_detail));

    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .nest("/api", api)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(cors)
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static("x-request-id"), header::CONTENT_DISPOSITION]);
    if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring malformed CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    (StatusCode::OK, state.metrics.render_prometheus())
}

async fn run_program(
    State(state): State<AppState>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> EngineResult<Json<RunResponse>> {
    let request = parse_body(payload)?;
    let source = request
        .source
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EngineError::InvalidRequest("missing source".to_string()))?;
    let files = source_files(SourceInput::Single(source), None)?;

    let timeout_ms = state.config.default_timeout_ms;
    let result = state
        .sandbox
        .execute(RunSpec { files, timeout_ms })
        .await?
        .completed_or_err(timeout_ms)?;

    Ok(Json(RunResponse {
        stdout: result.stdout,
        stderr: result.stderr,
        exit_code: result.exit_code,
    }))
}

async fn grade_submission(
    State(state): State<AppState>,
    payload: Result<Json<GradeRequest>, JsonRejection>,
) -> EngineResult<Json<GradeResponse>> {
    let request = parse_body(payload)?;
    let code = request
        .code
        .ok_or_else(|| EngineError::InvalidRequest("missing code".to_string()))?;
    let assignment_id = request
        .assignment_id
        .ok_or_else(|| EngineError::InvalidRequest("missing assignmentId".to_string()))?;
    let files = source_files(code, request.file_names)?;

    let assignment = state
        .store
        .get_assignment(assignment_id)
        .ok_or(EngineError::NotFound("assignment"))?;
    let outcome = grade(
        state.sandbox.as_ref(),
        files,
        &assignment.expected_output,
        state.config.default_timeout_ms,
    )
    .await?;

    Ok(Json(outcome.student_view()))
}

async fn submit(
    State(state): State<AppState>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> EngineResult<Json<SubmitResponse>> {
    let request = parse_body(payload)?;
    let missing = || {
        EngineError::InvalidRequest(
            "missing required fields: assignmentId, studentName, sourceCode".to_string(),
        )
    };
    let assignment_id = request.assignment_id.ok_or_else(missing)?;
    let student_name = request
        .student_name
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(missing)?;
    let sources = request.source_code.ok_or_else(missing)?;
    let files = source_files(sources, request.file_names)?;

    let (record, outcome) = state
        .packager
        .submit(SubmitInput {
            assignment_id,
            student_name,
            student_email: request.student_email.filter(|e| !e.is_empty()),
            files,
        })
        .await?;

    Ok(Json(SubmitResponse {
        submission_id: record.id,
        matched: outcome.matched,
        actual_output: outcome.actual_output,
        error: outcome.error,
        download_url: download_url(record.id),
    }))
}

async fn download_submission(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> EngineResult<Response> {
    let record = state
        .store
        .get_submission(id)
        .ok_or(EngineError::NotFound("submission"))?;
    let file = match tokio::fs::File::open(&record.archive_path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(EngineError::NotFound("submission archive"));
        }
        Err(err) => return Err(EngineError::Internal(err.to_string())),
    };
    let length = file
        .metadata()
        .await
        .map_err(|err| EngineError::Internal(err.to_string()))?
        .len();

    let file_name = format!(
        "submission_{}_{}.zip",
        record.id,
        record.student_name.split_whitespace().collect::<Vec<_>>().join("_")
    );
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{file_name}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/zip")),
            (header::CONTENT_DISPOSITION, disposition),
            (header::CONTENT_LENGTH, HeaderValue::from(length)),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

async fn debug_start(
    State(state): State<AppState>,
    payload: Result<Json<DebugStartRequest>, JsonRejection>,
) -> EngineResult<Json<DebugStartResponse>> {
    let request = parse_body(payload)?;
    let sources = request
        .source_code
        .ok_or_else(|| EngineError::InvalidRequest("missing sourceCode".to_string()))?;
    let files = source_files(sources, request.file_names)?;

    let (session_id, debug_state) = state.sessions.start(files).await?;
    Ok(Json(DebugStartResponse {
        session_id,
        state: debug_state,
    }))
}

async fn debug_step(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<StepRequest>, JsonRejection>,
) -> EngineResult<Json<DebugStateResponse>> {
    let count = payload
        .ok()
        .and_then(|Json(body)| body.count)
        .and_then(|count| count.as_i64());

    let debug_state = state.sessions.step(&id, count).await?;
    Ok(Json(DebugStateResponse { state: debug_state }))
}

async fn debug_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> EngineResult<Json<DebugStateResponse>> {
    let debug_state = state.sessions.state(&id).await?;
    Ok(Json(DebugStateResponse { state: debug_state }))
}

async fn debug_close(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    state.sessions.close(&id).await;
    Json(serde_json::json!({ "success": true }))
}

async fn list_assignments(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "assignments": state.store.list_assignments() }))
}

async fn create_assignment(
    State(state): State<AppState>,
    payload: Result<Json<AssignmentInput>, JsonRejection>,
) -> EngineResult<(StatusCode, Json<serde_json::Value>)> {
    let input = parse_body(payload)?;
    let assignment = state.store.create_assignment(input).await?;
    tracing::info!(assignment_id = assignment.id, "assignment created");
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "id": assignment.id, "message": "Assignment created" })),
    ))
}

async fn get_assignment(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> EngineResult<Json<Assignment>> {
    state
        .store
        .get_assignment(id)
        .map(Json)
        .ok_or(EngineError::NotFound("assignment"))
}

async fn update_assignment(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    payload: Result<Json<AssignmentInput>, JsonRejection>,
) -> EngineResult<Json<serde_json::Value>> {
    let input = parse_body(payload)?;
    state.store.update_assignment(id, input).await?;
    Ok(Json(serde_json::json!({ "message": "Assignment updated" })))
}

async fn delete_assignment(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> EngineResult<Json<serde_json::Value>> {
    state.store.delete_assignment(id).await?;
    Ok(Json(serde_json::json!({ "message": "Assignment deleted" })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmissionFilter {
    assignment_id: Option<u64>,
}

async fn list_submissions(
    State(state): State<AppState>,
    Query(filter): Query<SubmissionFilter>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "submissions": state.store.list_submissions(filter.assignment_id)
    }))
}

async fn submission_detail(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> EngineResult<Json<SubmissionDetail>> {
    state.store.submission_detail(id).map(Json)
}

fn parse_body<T>(payload: Result<Json<T>, JsonRejection>) -> EngineResult<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| EngineError::InvalidRequest(rejection.body_text()))
}

async fn log_requests(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        "incoming request"
    );

    let mut response = next.run(request).await;

    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = %response.status(),
        latency_ms = started.elapsed().as_millis() as u64,
        "request completed"
    );
    attach_hardening_headers(&request_id, &mut response);
    response
}

fn attach_hardening_headers(request_id: &str, response: &mut Response) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-request-id"), value);
    }
    response.headers_mut().insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    response.headers_mut().insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    response.headers_mut().insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );
}
