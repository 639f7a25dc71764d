// HTTP route handlers for the Arbiter API

use arbiter_common::{QueueStats, Submission};
use arbiter_judge::pool::PoolStats;
use arbiter_judge::{metrics, ArtifactStore, JudgeError, ProblemRepository};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub language: String,
    pub problem_id: String,
    pub source_code: String,
    /// Original file name, used for the extension check when present
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub submission_id: Uuid,
    pub status: &'static str,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub uptime_secs: f64,
    pub queue: QueueStats,
    pub pool: PoolStats,
}

/// JSON error body with a status code
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<JudgeError> for ApiError {
    fn from(e: JudgeError) -> Self {
        let status = match &e {
            JudgeError::UnsupportedLanguage(_)
            | JudgeError::InvalidSource(_)
            | JudgeError::InvalidConstraints(_)
            | JudgeError::MissingArtifact(_) => StatusCode::BAD_REQUEST,
            JudgeError::InternalScheduling(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

fn observed(endpoint: &str, method: &str, response: Response) -> Response {
    metrics::record_api_request(endpoint, method, response.status().as_u16());
    response
}

/// POST /judge - Queue a submission for judging
pub async fn submit(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SubmitRequest>,
) -> Response {
    let response = match accept(&state, payload).await {
        Ok(accepted) => (StatusCode::ACCEPTED, Json(accepted)).into_response(),
        Err(e) => e.into_response(),
    };
    observed("/judge", "POST", response)
}

async fn accept(state: &AppState, payload: SubmitRequest) -> Result<SubmitResponse, ApiError> {
    let service = state.scheduler.service();
    let language = service.registry().resolve(&payload.language)?;
    let profile = service.registry().get(language)?;

    if payload.problem_id.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "problem_id is required"));
    }
    let code = payload.source_code.as_bytes();
    profile.validate_source(payload.filename.as_deref(), code)?;

    // Reject unknown or broken problems before anything is stored
    service.problems().load(&payload.problem_id).await?;

    let extension = profile
        .extensions
        .first()
        .map(String::as_str)
        .unwrap_or_default();
    let code_ref = state.artifacts.put(extension, code).await.map_err(|e| {
        warn!(error = %e, "could not store submitted code");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    })?;

    let request = arbiter_common::SubmissionRequest {
        language,
        problem_id: payload.problem_id,
        code_ref: code_ref.clone(),
    };
    let submission_id = match state.scheduler.add_submission(request) {
        Ok(id) => id,
        Err(e) => {
            state.artifacts.discard(&code_ref).await;
            return Err(e.into());
        }
    };

    info!(%submission_id, %language, "submission accepted");
    Ok(SubmitResponse {
        submission_id,
        status: "queued",
        message: "Submission added to queue for processing",
    })
}

/// GET /submission/:id - Current state of one submission
pub async fn submission_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let response = match lookup(&state, &id) {
        Ok(submission) => Json(submission).into_response(),
        Err(e) => e.into_response(),
    };
    observed("/submission/:id", "GET", response)
}

fn lookup(state: &AppState, id: &str) -> Result<Submission, ApiError> {
    let id = Uuid::parse_str(id)
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "Invalid submission id"))?;
    state
        .scheduler
        .get_status(id)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Submission not found"))
}

/// GET /submissions - Every known submission, newest first
pub async fn list_submissions(State(state): State<Arc<AppState>>) -> Response {
    let submissions = state.scheduler.list_submissions();
    observed(
        "/submissions",
        "GET",
        Json(serde_json::json!({ "submissions": submissions })).into_response(),
    )
}

/// GET /problems - Problems that load cleanly
pub async fn list_problems(State(state): State<Arc<AppState>>) -> Response {
    let response = match state.scheduler.service().problems().list_problems().await {
        Ok(problems) => Json(serde_json::json!({ "problems": problems })).into_response(),
        Err(e) => {
            warn!(error = %e, "could not list problems");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list problems")
                .into_response()
        }
    };
    observed("/problems", "GET", response)
}

/// GET /problem/:id/metadata - Raw metadata.json of a problem
pub async fn problem_metadata(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let response = match state.scheduler.service().problems().metadata(&id).await {
        Ok(metadata) => Json(metadata).into_response(),
        Err(JudgeError::MissingArtifact(_)) => {
            ApiError::new(StatusCode::NOT_FOUND, "Problem metadata not found").into_response()
        }
        Err(e) => {
            warn!(problem_id = %id, error = %e, "unreadable problem metadata");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read problem metadata")
                .into_response()
        }
    };
    observed("/problem/:id/metadata", "GET", response)
}

/// GET /health - Liveness plus queue and pool state
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime_secs: state.start_time.elapsed().as_secs_f64(),
        queue: state.scheduler.get_queue_stats(),
        pool: state.scheduler.service().pool().stats(),
    })
}

/// GET /metrics - Prometheus text exposition
pub async fn prometheus_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render_metrics(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_common::Config;
    use arbiter_judge::sandbox::local::LocalProvider;
    use arbiter_judge::{DirArtifactStore, JudgeService, Scheduler};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use std::fs;
    use std::time::Instant;
    use tower::ServiceExt;

    fn state(root: &std::path::Path) -> Arc<AppState> {
        let problem = root.join("problems/1");
        fs::create_dir_all(problem.join("output")).unwrap();
        fs::write(
            problem.join("data.json"),
            r#"{"time_limit": 1, "memory_limit": 64, "tests": 1}"#,
        )
        .unwrap();
        fs::write(problem.join("output/1.out"), "Hello, World!\n").unwrap();
        fs::write(problem.join("metadata.json"), r#"{"title": "Hello"}"#).unwrap();

        let mut config = Config::from_env();
        config.problems_dir = root.join("problems");
        config.artifacts_dir = root.join("artifacts");
        config.max_workers = 2;

        let artifacts = Arc::new(DirArtifactStore::new(config.artifacts_dir.clone()));
        let service = JudgeService::from_config(
            &config,
            Arc::new(LocalProvider::new()),
            artifacts.clone(),
        );
        Arc::new(AppState {
            scheduler: Scheduler::new(Arc::new(service), config.max_workers),
            artifacts,
            start_time: Arc::new(Instant::now()),
        })
    }

    async fn call(state: Arc<AppState>, request: Request<Body>) -> (StatusCode, Value) {
        let response = crate::app(state).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_judge(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/judge")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_queue() {
        let tmp = tempfile::tempdir().unwrap();
        let (status, body) = call(state(tmp.path()), get("/health")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["queue"]["max_workers"], 2);
        assert_eq!(body["queue"]["queue_length"], 0);
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_input() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(tmp.path());

        let (status, body) = call(
            state.clone(),
            post_judge(serde_json::json!({
                "language": "ruby", "problem_id": "1", "source_code": "puts 1"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("unsupported language"));

        let (status, _) = call(
            state.clone(),
            post_judge(serde_json::json!({
                "language": "python", "problem_id": "1", "source_code": "   \n"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            state.clone(),
            post_judge(serde_json::json!({
                "language": "python", "problem_id": "1", "source_code": "print(1)",
                "filename": "main.cpp"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            state.clone(),
            post_judge(serde_json::json!({
                "language": "python", "problem_id": "404", "source_code": "print(1)"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Nothing was admitted or stored
        assert_eq!(state.scheduler.get_queue_stats().total_submissions, 0);
        assert!(!tmp.path().join("artifacts").exists()
            || fs::read_dir(tmp.path().join("artifacts")).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_submit_then_status() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(tmp.path());

        let (status, body) = call(
            state.clone(),
            post_judge(serde_json::json!({
                "language": "Python", "problem_id": "1",
                "source_code": "print('Hello, World!')"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "queued");
        let id = body["submission_id"].as_str().unwrap().to_string();

        let (status, body) = call(state.clone(), get(&format!("/submission/{}", id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], id.as_str());
        assert_eq!(body["problem_id"], "1");

        let (status, body) = call(state.clone(), get("/submissions")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["submissions"].as_array().unwrap().len(), 1);

        state.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(tmp.path());

        let (status, _) = call(state.clone(), get("/submission/not-a-uuid")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            state.clone(),
            get(&format!("/submission/{}", Uuid::new_v4())),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Submission not found");
    }

    #[tokio::test]
    async fn test_problem_endpoints() {
        let tmp = tempfile::tempdir().unwrap();
        let state = state(tmp.path());

        let (status, body) = call(state.clone(), get("/problems")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["problems"][0]["id"], "1");
        assert_eq!(body["problems"][0]["title"], "Hello");

        let (status, body) = call(state.clone(), get("/problem/1/metadata")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["title"], "Hello");

        let (status, _) = call(state.clone(), get("/problem/2/metadata")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let tmp = tempfile::tempdir().unwrap();
        metrics::init_metrics();
        let response = crate::app(state(tmp.path()))
            .oneshot(get("/metrics"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
