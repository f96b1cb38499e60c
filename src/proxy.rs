//! Ingress proxy from the public app route to a backend's local port.
//!
//! The proxy never waits for a cold start. A request for a stopped backend
//! queues a start and is answered right away with [`Unavailable::Starting`];
//! the client retries.

use bytes::Bytes;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::manager::{BackendManager, ManagerError};
use crate::store::{AppId, BackendState};

/// Standard hop-by-hop headers that are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Request headers the upstream recomputes or must not see
const DROPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "cache-control",
    "pragma",
    "if-none-match",
    "if-modified-since",
];

/// An inbound request, already split off the public route prefix
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Path below the app's proxy prefix, without a leading slash
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Why a request could not be forwarded
#[derive(Debug, thiserror::Error)]
pub enum Unavailable {
    #[error("App not found: {0}")]
    NotFound(String),

    #[error("App has no backend code.")]
    NoBackend,

    #[error("Backend is starting, retry shortly")]
    Starting,

    #[error("Backend is {0}, retry shortly")]
    Busy(BackendState),

    #[error("Proxy error: {0}")]
    Upstream(String),

    #[error("Backend status unavailable: {0}")]
    Status(String),
}

pub struct IngressProxy {
    manager: BackendManager,
    client: reqwest::Client,
}

impl IngressProxy {
    pub fn new(manager: BackendManager, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { manager, client })
    }

    /// Forward a request to the app's backend, or explain why not.
    pub async fn handle(
        &self,
        app_id: &AppId,
        request: ProxyRequest,
    ) -> Result<ProxyResponse, Unavailable> {
        let status = match self.manager.get_backend_status(app_id).await {
            Ok(status) => status,
            Err(ManagerError::AppNotFound { app_id: id }) => return Err(Unavailable::NotFound(id)),
            Err(e) => {
                error!(app_id = %app_id, error = %e, "Failed to read backend status");
                return Err(Unavailable::Status(e.to_string()));
            }
        };

        if !status.has_backend {
            return Err(Unavailable::NoBackend);
        }

        match (status.state, status.port) {
            (BackendState::Running, Some(port)) => {
                self.manager.reset_inactivity_timer(app_id);
                self.forward(app_id, port, request).await
            }
            (BackendState::Stopped | BackendState::FailedToStart, _) => {
                info!(
                    app_id = %app_id,
                    state = %status.state,
                    "Backend not running, starting it for an incoming request"
                );
                self.manager.request_start(app_id);
                Err(Unavailable::Starting)
            }
            (state, _) => Err(Unavailable::Busy(state)),
        }
    }

    async fn forward(
        &self,
        app_id: &AppId,
        port: u16,
        request: ProxyRequest,
    ) -> Result<ProxyResponse, Unavailable> {
        let url = target_url(port, &request.path, request.query.as_deref());
        debug!(app_id = %app_id, method = %request.method, url = %url, "Proxying request");

        let response = self
            .client
            .request(request.method, &url)
            .headers(upstream_headers(&request.headers))
            .body(request.body)
            .send()
            .await
            .map_err(|e| {
                error!(app_id = %app_id, url = %url, error = %e, "Proxy request failed");
                Unavailable::Upstream(e.to_string())
            })?;

        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(header::CONTENT_LENGTH);

        let body = response.bytes().await.map_err(|e| {
            error!(app_id = %app_id, url = %url, error = %e, "Failed to read proxied response");
            Unavailable::Upstream(e.to_string())
        })?;

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}

pub fn target_url(port: u16, path: &str, query: Option<&str>) -> String {
    let mut url = format!("http://localhost:{port}/{}", path.trim_start_matches('/'));
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Headers sent upstream: no hop-by-hop headers, no conditional or caching
/// directives, and an explicit `no-cache`.
fn upstream_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut headers = incoming.clone();
    strip_hop_by_hop(&mut headers);
    for name in DROPPED_REQUEST_HEADERS {
        headers.remove(*name);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named in Connection are hop-by-hop too
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    for name in listed {
        headers.remove(name);
    }
}
