//! HTTP request handlers

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;

use crate::deploy::events::DeployEvent;
use crate::deploy::machine::Phase;
use crate::deploy::orchestrator::{credentials_from_json, DeployOutcome, DeployRequest};
use crate::discovery::ResolvedService;
use crate::errors::LauncherError;
use crate::profile::InputFieldSpec;
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Error surfaced to API callers: stable kind tag plus a readable message
pub struct ApiError(LauncherError);

impl From<LauncherError> for ApiError {
    fn from(err: LauncherError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            LauncherError::AlreadyRunning | LauncherError::NothingToUninstall => {
                StatusCode::CONFLICT
            }
            LauncherError::UnknownProfile(_) => StatusCode::NOT_FOUND,
            LauncherError::MissingRequiredField(_) | LauncherError::UnknownField(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "kind": self.0.kind(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "launchpad".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    Json(version_info())
}

/// Active profile metadata for the front-end; never includes credential
/// values
#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    pub active_profile: String,
    pub description: String,
    pub heading: String,
    pub versions: Vec<String>,
    pub default_version: String,
    pub show_version_selector: bool,
    pub show_dry_run: bool,
    pub launcher_path: String,
    pub project_name: String,
    pub has_uninstall: bool,
    pub deployed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployed_version: Option<String>,
    pub input_fields: Vec<InputFieldSpec>,
    pub services: Vec<ResolvedService>,
}

/// Config handler
pub async fn config_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<impl IntoResponse, ApiError> {
    let profile = state.orchestrator.resolve_profile(None)?;
    let snapshot = state.orchestrator.state().await;
    let deployed = snapshot.phase == Phase::Deployed;

    Ok(Json(ConfigResponse {
        active_profile: profile.id.clone(),
        description: profile.description.clone(),
        heading: profile.heading.clone(),
        versions: profile.versions.clone(),
        default_version: profile.default_version.clone(),
        show_version_selector: !profile.versions.is_empty(),
        show_dry_run: state.show_dry_run,
        launcher_path: state.ui_path.clone(),
        project_name: state.profiles.meta.project_name.clone(),
        has_uninstall: profile.has_uninstall(),
        deployed,
        deployed_at: if deployed { snapshot.finished_at } else { None },
        deployed_version: if deployed { snapshot.version.clone() } else { None },
        input_fields: profile.input_fields.clone(),
        services: snapshot.service_links,
    }))
}

/// Help content pass-through
pub async fn help_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    match state.help_file.read_json::<serde_json::Value>().await {
        Ok(content) => Json(content),
        Err(_) => Json(json!({
            "title": "Deployment Guide",
            "sections": [{
                "title": "Getting Started",
                "content": "Fill in the required fields and start a deployment."
            }]
        })),
    }
}

/// Deployment state handler
pub async fn state_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.orchestrator.state().await)
}

/// Deploy request body
#[derive(Debug, Deserialize)]
pub struct DeployBody {
    #[serde(default)]
    pub profile_id: Option<String>,

    #[serde(default)]
    pub credentials: HashMap<String, String>,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub dry_run: bool,
}

/// Deploy handler: a dry run returns the resolved plan as JSON, a real
/// run returns the live event stream.
pub async fn deploy_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(body): Json<DeployBody>,
) -> Result<Response, ApiError> {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let request = DeployRequest {
        profile_id: body.profile_id,
        credentials: credentials_from_json(body.credentials),
        version: body.version,
        dry_run: body.dry_run,
    };

    match state.orchestrator.start_deploy(request, host).await? {
        DeployOutcome::DryRun(report) => Ok(Json(*report).into_response()),
        DeployOutcome::Started(run) => {
            let (history, rx) = run.subscribe();
            Ok(event_stream(history, rx).into_response())
        }
    }
}

/// Runtime status poll
pub async fn deploy_status_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.orchestrator.status().await)
}

/// Attach to the current or most recent run's event stream. Replays the
/// full history, then follows the live tail until the terminal event.
pub async fn deploy_logs_handler(
    State(state): State<Arc<ServerState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    match state.orchestrator.current_run() {
        Some(run) => {
            let (history, rx) = run.subscribe();
            event_stream(history, rx)
        }
        None => {
            // No run yet: an empty stream that ends immediately
            let (tx, rx) = broadcast::channel(1);
            drop(tx);
            event_stream(Vec::new(), rx)
        }
    }
}

/// Cancel the current run
pub async fn deploy_cancel_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let cancelled = state.orchestrator.cancel();
    Json(json!({ "cancelled": cancelled }))
}

/// Uninstall handler: streams teardown output, terminated by the
/// phase-reset summary.
pub async fn uninstall_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let run = state.orchestrator.start_uninstall().await?;
    let (history, rx) = run.subscribe();
    Ok(event_stream(history, rx))
}

/// Render a run feed as an SSE stream: buffered history first, then the
/// live tail, closing after the terminal event.
fn event_stream(
    history: Vec<DeployEvent>,
    rx: broadcast::Receiver<DeployEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let ended = history.last().map(DeployEvent::is_terminal).unwrap_or(false);
    let head = stream::iter(
        history
            .into_iter()
            .map(|event| Ok(to_sse_event(&event)))
            .collect::<Vec<_>>(),
    );

    let tail = stream::unfold((rx, ended), |(mut rx, ended)| async move {
        if ended {
            return None;
        }
        match rx.recv().await {
            Ok(event) => {
                let terminal = event.is_terminal();
                Some((Ok(to_sse_event(&event)), (rx, terminal)))
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {
                Some((Ok(Event::default().comment("lagged")), (rx, false)))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    });

    Sse::new(head.chain(tail)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

fn to_sse_event(event: &DeployEvent) -> Event {
    let json = serde_json::to_string(event).unwrap_or_default();
    Event::default().data(json)
}
