use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use capsule_error::{CapsuleError, ErrorType, ProblemDetails};
use futures::StreamExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

use crate::frames::{ErrorFrameDetails, StreamFrame};
use crate::generator::GenerationInput;
use crate::relay::GenerationRelay;
use crate::session::GenerationSession;
use crate::store::{ProjectRecord, ProjectStatus, ProjectStore};
use crate::usage::{UsageTotals, UsageTracker};

mod types;

pub use types::*;

#[derive(Debug)]
pub struct AppState {
    relay: GenerationRelay,
    projects: Arc<dyn ProjectStore>,
    usage: Arc<dyn UsageTracker>,
}

impl AppState {
    pub fn new(
        relay: GenerationRelay,
        projects: Arc<dyn ProjectStore>,
        usage: Arc<dyn UsageTracker>,
    ) -> Self {
        Self {
            relay,
            projects,
            usage,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    let v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/openapi.json", get(get_openapi))
        .route("/projects/:project_id", get(get_project))
        .route("/users/:user_id/usage", get(get_usage))
        .with_state(shared.clone());

    let api_router = Router::new()
        .route("/claude-code", post(post_generation))
        .with_state(shared);

    let mut router = Router::new()
        .route("/", get(get_root))
        .nest("/v1", v1_router)
        .nest("/api", api_router)
        .fallback(not_found);

    let http_logging = match std::env::var("CAPSULE_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    router
}

#[derive(OpenApi)]
#[openapi(
    paths(get_health, get_project, get_usage, post_generation),
    components(
        schemas(
            HealthResponse,
            GenerateRequest,
            FileEdition,
            StreamFrame,
            ErrorFrameDetails,
            ProjectRecord,
            ProjectStatus,
            UsageTotals,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "generation", description = "Streaming code generation"),
        (name = "projects", description = "Project records and usage")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:3001")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Capsule(#[from] CapsuleError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Capsule(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

const SERVER_INFO: &str = "\
This is a Capsule generation server. Available endpoints:\n\
  - POST /api/claude-code                - Stream a code generation (SSE)\n\
  - GET  /v1/health                      - Health check\n\
  - GET  /v1/projects/{project_id}       - Project record\n\
  - GET  /v1/users/{user_id}/usage       - Usage totals\n\
  - GET  /v1/openapi.json                - OpenAPI document";

async fn get_root() -> &'static str {
    SERVER_INFO
}

async fn not_found() -> (StatusCode, String) {
    (
        StatusCode::NOT_FOUND,
        format!("404 Not Found\n\n{SERVER_INFO}"),
    )
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/v1/projects/{project_id}",
    params(("project_id" = String, Path, description = "Project id")),
    responses(
        (status = 200, body = ProjectRecord),
        (status = 404, body = ProblemDetails)
    ),
    tag = "projects"
)]
async fn get_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Json<ProjectRecord>, ApiError> {
    let project = state
        .projects
        .get(&project_id)
        .await?
        .ok_or(CapsuleError::ProjectNotFound { project_id })?;
    Ok(Json(project))
}

#[utoipa::path(
    get,
    path = "/v1/users/{user_id}/usage",
    params(("user_id" = String, Path, description = "User id")),
    responses((status = 200, body = UsageTotals)),
    tag = "projects"
)]
async fn get_usage(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<UsageTotals>, ApiError> {
    Ok(Json(state.usage.user_totals(&user_id).await?))
}

#[utoipa::path(
    post,
    path = "/api/claude-code",
    request_body = GenerateRequest,
    responses(
        (status = 200, description = "SSE stream of generation frames", body = StreamFrame, content_type = "text/event-stream"),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails)
    ),
    tag = "generation"
)]
async fn post_generation(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) =
        payload.map_err(|rejection| CapsuleError::invalid_request(rejection.body_text()))?;
    let fields = request.validate()?;

    let project = state
        .projects
        .get(&fields.project_id)
        .await?
        .ok_or_else(|| CapsuleError::ProjectNotFound {
            project_id: fields.project_id.clone(),
        })?;

    let sandbox_id = non_blank(request.sandbox_id.clone())
        .or_else(|| non_blank(project.sandbox_id.clone()))
        .ok_or_else(|| CapsuleError::SandboxMissing {
            project_id: project.id.clone(),
        })?;
    let conversation_id =
        non_blank(request.conversation_id.clone()).or_else(|| project.conversation_id.clone());

    tracing::info!(
        user_id = %fields.user_id,
        project_id = %project.id,
        sandbox_id = %sandbox_id,
        resume = conversation_id.is_some(),
        "generation requested"
    );

    let session = GenerationSession::new(fields.user_id, project.id, sandbox_id)
        .with_message_id(request.message_id.clone())
        .with_team_id(request.team_id.clone())
        .with_conversation_id(conversation_id);
    let input = request.into_input(fields.user_message);

    let stream = state
        .relay
        .start(session, input)
        .map(|frame| Ok::<Event, Infallible>(frame.to_sse_event()));

    Ok((
        [(
            header::HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        )],
        Sse::new(stream),
    )
        .into_response())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}
