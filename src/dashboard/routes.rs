use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use super::state::DashboardState;
use super::templates;
use crate::error::Error;
use crate::execution::ExecutionMode;
use crate::messages::WidgetConfig;
use crate::utils::cookie_value;
use crate::widgets::WidgetDescription;

pub const SESSION_COOKIE: &str = "session_id";

static CLIENT_RUNTIME: &str = include_str!("../../static/numerous.js");

// ── GET /: the app page ─────────────────────────────────────────────

/// Every page load starts a new session; the cookie it sets only carries
/// affinity for `/api/widgets` and the websocket.
pub async fn index(State(state): State<Arc<DashboardState>>) -> Response {
    let session_id = new_session_id();

    let session = match state.registry.get_or_create(&session_id, &state.launch).await {
        Ok(session) => session,
        Err(e) => {
            log_failure(&session_id, &e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                templates::render_error(&e, state.dev_mode),
            )
                .into_response();
        }
    };

    let widget_ids = session.init_config().await.widgets;
    let page = match state.renderer.render(&state.launch, &widget_ids) {
        Ok(page) => page,
        Err(e) => {
            log_failure(&session_id, &e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                templates::render_error(&e, state.dev_mode),
            )
                .into_response();
        }
    };

    let mut response = Html(page).into_response();
    if let Ok(cookie) = HeaderValue::from_str(&format!("{SESSION_COOKIE}={session_id}; Path=/; SameSite=Lax")) {
        response.headers_mut().insert(header::SET_COOKIE, cookie);
    }
    response
}

// ── GET /api/widgets: widget configs for the client runtime ─────────

#[derive(Deserialize)]
pub struct WidgetsQuery {
    pub session_id: Option<String>,
}

#[derive(Serialize)]
pub struct WidgetsResponse {
    pub session_id: String,
    pub widgets: BTreeMap<String, WidgetConfig>,
    #[serde(rename = "logLevel")]
    pub log_level: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error_type: String,
    pub message: String,
}

pub async fn get_widgets(
    State(state): State<Arc<DashboardState>>,
    Query(query): Query<WidgetsQuery>,
    headers: HeaderMap,
) -> Response {
    // The browser runtime sends "null" before it has stored an id.
    let session_id = query
        .session_id
        .filter(|id| !id.is_empty() && id != "null" && id != "undefined")
        .or_else(|| cookie_value(&headers, SESSION_COOKIE))
        .unwrap_or_else(new_session_id);

    match state.registry.get_or_create(&session_id, &state.launch).await {
        Ok(session) => Json(WidgetsResponse {
            session_id,
            widgets: session.init_config().await.widget_configs,
            log_level: state.client_log_level(),
        })
        .into_response(),
        Err(e) => {
            log_failure(&session_id, &e);
            startup_failure(&state, &e)
        }
    }
}

/// 500 with the error detail in development mode and a generic message
/// otherwise.
fn startup_failure(state: &DashboardState, e: &Error) -> Response {
    let body = if state.dev_mode {
        ErrorResponse {
            error_type: e.kind().to_string(),
            message: e.to_string(),
        }
    } else {
        ErrorResponse {
            error_type: "ServerError".to_string(),
            message: "The application could not be started.".to_string(),
        }
    };
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

// ── GET /api/describe: static description of the served app ─────────

#[derive(Serialize)]
pub struct AppInfo {
    pub dev_mode: bool,
    pub base_dir: String,
    pub module_path: String,
    pub allow_threaded: bool,
}

#[derive(Serialize)]
pub struct TemplateDescription {
    pub name: String,
    pub source: String,
    pub variables: Vec<String>,
}

#[derive(Serialize)]
pub struct AppDescription {
    pub app_info: AppInfo,
    pub template: TemplateDescription,
    pub widgets: BTreeMap<String, WidgetDescription>,
}

pub async fn describe(State(state): State<Arc<DashboardState>>) -> Response {
    match describe_app(&state).await {
        Ok(description) => Json(description).into_response(),
        Err(e) => {
            error!(error_type = e.kind(), "describe failed: {e}");
            startup_failure(&state, &e)
        }
    }
}

async fn describe_app(state: &DashboardState) -> Result<AppDescription, Error> {
    let launch = &state.launch;
    let path = launch.base_dir.join(&launch.template);
    let source = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| Error::Template(format!("{}: {e}", path.display())))?;
    let widgets = state.registry.describe_widgets(launch).await?;

    Ok(AppDescription {
        app_info: AppInfo {
            dev_mode: state.dev_mode,
            base_dir: launch.base_dir.display().to_string(),
            module_path: launch.module_path.clone(),
            allow_threaded: state.registry.mode() == ExecutionMode::Thread,
        },
        template: TemplateDescription {
            name: launch.template.clone(),
            variables: templates::template_variables(&source),
            source,
        },
        widgets,
    })
}

// ── GET/PUT /api/widgets/:widget_id/traits/:trait_name ──────────────

#[derive(Deserialize)]
pub struct TraitQuery {
    pub session_id: String,
}

#[derive(Serialize)]
pub struct TraitValue {
    pub widget_id: String,
    #[serde(rename = "trait")]
    pub trait_name: String,
    pub value: Value,
    pub session_id: String,
}

#[derive(Deserialize)]
pub struct SetTraitValue {
    pub value: Value,
}

pub async fn get_trait(
    State(state): State<Arc<DashboardState>>,
    Path((widget_id, trait_name)): Path<(String, String)>,
    Query(query): Query<TraitQuery>,
) -> Response {
    match state
        .registry
        .get_trait(&query.session_id, &widget_id, &trait_name)
        .await
    {
        Ok(value) => Json(TraitValue {
            widget_id,
            trait_name,
            value,
            session_id: query.session_id,
        })
        .into_response(),
        Err(e) => lookup_failure(&e),
    }
}

/// Ask the session's app to set a property. The app applies it
/// asynchronously; the response echoes the requested value.
pub async fn put_trait(
    State(state): State<Arc<DashboardState>>,
    Path((widget_id, trait_name)): Path<(String, String)>,
    Query(query): Query<TraitQuery>,
    Json(body): Json<SetTraitValue>,
) -> Response {
    match state
        .registry
        .set_trait(&query.session_id, &widget_id, &trait_name, body.value.clone())
        .await
    {
        Ok(()) => Json(TraitValue {
            widget_id,
            trait_name,
            value: body.value,
            session_id: query.session_id,
        })
        .into_response(),
        Err(e) => lookup_failure(&e),
    }
}

fn lookup_failure(e: &Error) -> Response {
    let status = match e {
        Error::UnknownSession(_) | Error::UnknownTarget { .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = ErrorResponse {
        error_type: e.kind().to_string(),
        message: e.to_string(),
    };
    (status, Json(body)).into_response()
}

// ── GET /api/sessions: live session stats ───────────────────────────

pub async fn get_sessions(State(state): State<Arc<DashboardState>>) -> impl IntoResponse {
    Json(state.registry.stats().await)
}

// ── GET /numerous.js: browser runtime ───────────────────────────────

pub async fn client_runtime() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/javascript; charset=utf-8")],
        CLIENT_RUNTIME,
    )
}

// ── Helpers ──────────────────────────────────────────────────────────

fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

fn log_failure(session_id: &str, e: &Error) {
    match e {
        Error::AppProcess { traceback, .. } => {
            error!(session_id, error_type = e.kind(), traceback = %traceback, "session failed: {e}");
        }
        _ => error!(session_id, error_type = e.kind(), "session failed: {e}"),
    }
}
