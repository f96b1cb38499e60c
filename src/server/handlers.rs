use axum::body::{to_bytes, Body};
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, warn};

use super::AppState;
use crate::manager::ManagerError;
use crate::proxy::{ProxyRequest, Unavailable};
use crate::store::{AppId, BackendState};

/// Largest request body the proxy buffers
const MAX_PROXY_BODY: usize = 10 * 1024 * 1024;

/// Seconds a client should wait before retrying a cold or busy backend
const RETRY_AFTER_SECS: &str = "2";

const NO_BACKEND_MESSAGE: &str = "App has no backend code.";

// ----- Errors -----

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    retry_after: bool,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after: false,
        }
    }

    fn retry_later(message: impl Into<String>) -> Self {
        Self {
            retry_after: true,
            ..Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(json!({ "message": self.message }))).into_response();
        if self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        response
    }
}

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        let status = match &err {
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            ManagerError::StorageBusy { .. } => StatusCode::CONFLICT,
            e if e.is_spawn_failure() => {
                error!(error = %err, "Backend runtime could not be spawned");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => {
                error!(error = %err, "Backend request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl From<Unavailable> for ApiError {
    fn from(err: Unavailable) -> Self {
        match err {
            Unavailable::NotFound(_) => Self::new(StatusCode::NOT_FOUND, err.to_string()),
            Unavailable::NoBackend => Self::new(StatusCode::BAD_REQUEST, NO_BACKEND_MESSAGE),
            Unavailable::Starting | Unavailable::Busy(_) => Self::retry_later(err.to_string()),
            Unavailable::Upstream(_) => Self::new(StatusCode::BAD_GATEWAY, err.to_string()),
            Unavailable::Status(_) => Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        }
    }
}

fn parse_app_id(raw: &str) -> Result<AppId, ApiError> {
    raw.parse()
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("Invalid app id '{raw}': {e}")))
}

// ----- Bodies -----

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateBody {
    backend_state: BackendState,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBody {
    backend_state: BackendState,
    backend_port: Option<u16>,
}

// ----- Handlers -----

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "trackedBackends": state.manager.tracked_count(),
    }))
}

pub async fn start(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StateBody>, ApiError> {
    let app_id = parse_app_id(&id)?;
    let status = state.manager.get_backend_status(&app_id).await?;
    if !status.has_backend {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, NO_BACKEND_MESSAGE));
    }

    let manager = state.manager.clone();
    let task_id = app_id.clone();
    tokio::spawn(async move {
        if let Err(e) = manager.start_backend(&task_id).await {
            error!(app_id = %task_id, error = %e, "Start request failed");
        }
    });

    tokio::time::sleep(state.settle).await;
    let status = state.manager.get_backend_status(&app_id).await?;
    Ok(Json(StateBody {
        backend_state: status.state,
    }))
}

pub async fn stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StateBody>, ApiError> {
    let app_id = parse_app_id(&id)?;
    state.manager.get_backend_status(&app_id).await?;

    let manager = state.manager.clone();
    let task_id = app_id.clone();
    tokio::spawn(async move {
        if let Err(e) = manager.stop_backend(&task_id).await {
            error!(app_id = %task_id, error = %e, "Stop request failed");
        }
    });

    tokio::time::sleep(state.settle).await;
    let status = state.manager.get_backend_status(&app_id).await?;
    Ok(Json(StateBody {
        backend_state: status.state,
    }))
}

pub async fn status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusBody>, ApiError> {
    let app_id = parse_app_id(&id)?;
    let status = state.manager.get_backend_status(&app_id).await?;
    Ok(Json(StatusBody {
        backend_state: status.state,
        backend_port: status.port,
    }))
}

pub async fn activity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let app_id = parse_app_id(&id)?;
    if state.manager.reset_inactivity_timer(&app_id) {
        return Ok(StatusCode::NO_CONTENT);
    }
    // Distinguish an unknown app from one that is simply not running
    let status = state.manager.get_backend_status(&app_id).await?;
    Err(ApiError::new(
        StatusCode::CONFLICT,
        format!("Backend is {}, not RUNNING", status.state),
    ))
}

pub async fn clear_storage(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let app_id = parse_app_id(&id)?;
    let removed = state.manager.clear_storage(&app_id).await?;
    debug!(app_id = %app_id, removed, "Storage clear request handled");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn proxy_root(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    forward(state, &id, String::new(), request).await
}

pub async fn proxy(
    State(state): State<AppState>,
    Path((id, path)): Path<(String, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    forward(state, &id, path, request).await
}

async fn forward(state: AppState, id: &str, path: String, request: Request) -> Result<Response, ApiError> {
    let app_id = parse_app_id(id)?;
    let (parts, body) = request.into_parts();
    let body = to_bytes(body, MAX_PROXY_BODY).await.map_err(|e| {
        warn!(app_id = %app_id, error = %e, "Rejected proxy request body");
        ApiError::new(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large")
    })?;

    let proxied = state
        .proxy
        .handle(
            &app_id,
            ProxyRequest {
                method: parts.method,
                path,
                query: parts.uri.query().map(str::to_string),
                headers: parts.headers,
                body,
            },
        )
        .await?;

    let mut response = Response::new(Body::from(proxied.body));
    *response.status_mut() = proxied.status;
    *response.headers_mut() = proxied.headers;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_status_mapping() {
        let cases = [
            (Unavailable::NotFound("a".into()), StatusCode::NOT_FOUND, false),
            (Unavailable::NoBackend, StatusCode::BAD_REQUEST, false),
            (Unavailable::Starting, StatusCode::SERVICE_UNAVAILABLE, true),
            (
                Unavailable::Busy(BackendState::Stopping),
                StatusCode::SERVICE_UNAVAILABLE,
                true,
            ),
            (
                Unavailable::Upstream("refused".into()),
                StatusCode::BAD_GATEWAY,
                false,
            ),
        ];
        for (err, status, retry) in cases {
            let api = ApiError::from(err);
            assert_eq!(api.status, status);
            assert_eq!(api.retry_after, retry);
        }
    }

    #[test]
    fn test_manager_error_mapping() {
        assert_eq!(
            ApiError::from(ManagerError::app_not_found("x")).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(ManagerError::storage_busy("x")).status,
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_status_body_shape() {
        let body = StatusBody {
            backend_state: BackendState::Running,
            backend_port: Some(9003),
        };
        assert_eq!(
            serde_json::to_value(body).unwrap(),
            json!({ "backendState": "RUNNING", "backendPort": 9003 })
        );
    }

    #[test]
    fn test_invalid_app_id() {
        let err = parse_app_id("../etc").unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}
