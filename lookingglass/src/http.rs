//! HTTP front end: start a diagnostic, then read it back by share link.

use crate::jobs::{JobError, Jobs};
use axum::extract::{ConnectInfo, FromRequestParts, Path, Query, Request, State};
use axum::http::header::{CONTENT_TYPE, RETRY_AFTER};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use diagnostics::{Category, IpVersion};
use serde::Deserialize;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const POWERED_BY: &str = concat!("lookingglass/", env!("CARGO_PKG_VERSION"));
const ROBOTS_TXT: &str = "User-agent: *\nDisallow: /\n";
const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
/// How long killed diagnostics get to unwind once the grace period is over.
pub const KILL_WAIT: Duration = Duration::from_secs(5);

pub struct AppState {
    pub jobs: Arc<Jobs>,
    /// Take the client address from `X-Forwarded-For` instead of the socket peer.
    pub trust_proxy: bool,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/robots.txt", get(robots))
        .route("/{category}/action", get(run_diagnostic))
        .route("/{category}/{id}", get(fetch_result))
        .layer(middleware::from_fn(common_headers))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), log_requests))
        .with_state(state)
}

/// Rate-limit key of the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientKey(pub String);

impl FromRequestParts<Arc<AppState>> for ClientKey {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let peer = parts.extensions.get::<ConnectInfo<SocketAddr>>().map(|ci| ci.0);
        Ok(ClientKey(client_key(&parts.headers, peer, state.trust_proxy)))
    }
}

/// Resolve the rate-limit key of a request.
///
/// Without `trust_proxy` this is the socket peer. Behind a proxy it is the
/// rightmost `X-Forwarded-For` hop that is not an internal address: proxies
/// append to the right, so every entry left of that one came from the client.
/// An unparsable hop falls back to the socket peer.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> String {
    let peer_ip = peer.map_or_else(|| "unknown".to_string(), |p| p.ip().to_string());
    if !trust_proxy {
        return peer_ip;
    }
    let hops: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .collect();
    for hop in hops.iter().rev() {
        match hop.parse::<IpAddr>() {
            Ok(ip) if is_internal(ip) => continue,
            Ok(ip) => return ip.to_string(),
            Err(_) => return peer_ip,
        }
    }
    hops.first().map_or(peer_ip, |h| h.to_string())
}

fn is_internal(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let head = v6.segments()[0];
            // fc00::/7 unique local, fe80::/10 link local
            v6.is_loopback() || (head & 0xfe00) == 0xfc00 || (head & 0xffc0) == 0xfe80
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunParams {
    #[serde(default)]
    pub target: String,
    pub protocol_version: Option<String>,
}

async fn run_diagnostic(
    State(state): State<Arc<AppState>>,
    Path(category): Path<String>,
    client: ClientKey,
    Query(params): Query<RunParams>,
) -> Result<Redirect, ApiError> {
    let category: Category = category.parse().map_err(|_| ApiError::NotFound)?;
    let version = IpVersion::parse(params.protocol_version.as_deref()).map_err(JobError::from)?;
    let token = state.jobs.run(category, &params.target, version, &client.0).await?;
    Ok(Redirect::temporary(&format!("/{category}/{token}")))
}

async fn fetch_result(
    State(state): State<Arc<AppState>>,
    Path((category, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let category: Category = category.parse().map_err(|_| ApiError::NotFound)?;
    match state.jobs.fetch(category, &id).await? {
        Some(body) => Ok(([(CONTENT_TYPE, TEXT_PLAIN)], body).into_response()),
        None => Err(ApiError::NotFound),
    }
}

async fn robots() -> impl IntoResponse {
    ([(CONTENT_TYPE, TEXT_PLAIN)], ROBOTS_TXT)
}

async fn common_headers(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let h = resp.headers_mut();
    h.insert(HeaderName::from_static("x-robots-tag"), HeaderValue::from_static("noindex, nofollow"));
    h.insert(HeaderName::from_static("x-powered-by"), HeaderValue::from_static(POWERED_BY));
    resp
}

async fn log_requests(client: ClientKey, req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = std::time::Instant::now();
    let resp = next.run(req).await;
    info!(
        client = %client.0,
        %method,
        path,
        status = resp.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    resp
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound,
    RateLimited(Duration),
    Unavailable,
    Internal,
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::InvalidInput(e) => ApiError::BadRequest(e.to_string()),
            JobError::RateLimited(r) => ApiError::RateLimited(r.retry_after),
            JobError::ShuttingDown => ApiError::Unavailable,
            other => {
                error!(error = %other, "request failed");
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, [(CONTENT_TYPE, TEXT_PLAIN)], msg).into_response(),
            ApiError::NotFound => (StatusCode::NOT_FOUND, [(CONTENT_TYPE, TEXT_PLAIN)], "not found").into_response(),
            ApiError::RateLimited(wait) => {
                let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
                let mut resp = (StatusCode::TOO_MANY_REQUESTS, [(CONTENT_TYPE, TEXT_PLAIN)], "too many requests").into_response();
                resp.headers_mut().insert(RETRY_AFTER, HeaderValue::from(secs.max(1)));
                resp
            }
            ApiError::Unavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, [(CONTENT_TYPE, TEXT_PLAIN)], "shutting down").into_response()
            }
            ApiError::Internal => {
                (StatusCode::INTERNAL_SERVER_ERROR, [(CONTENT_TYPE, TEXT_PLAIN)], "internal error").into_response()
            }
        }
    }
}

/// Serve until SIGINT/SIGTERM.
///
/// Requests in flight get `grace` to finish. After that running diagnostics
/// are killed and the server gets at most [`KILL_WAIT`] more before its
/// connections are dropped, so shutdown takes no longer than
/// `grace + KILL_WAIT`. The store is closed last.
pub async fn serve(jobs: Arc<Jobs>, bind: &str, trust_proxy: bool, grace: Duration) -> anyhow::Result<()> {
    let app = build_router(Arc::new(AppState { jobs: Arc::clone(&jobs), trust_proxy }));
    let listener = TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "listening");

    let stop = CancellationToken::new();
    let stopped = stop.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move { stopped.cancelled().await })
            .await
    });

    tokio::select! {
        res = &mut server => {
            jobs.close();
            res??;
            return Ok(());
        }
        _ = shutdown_signal() => {}
    }

    info!(?grace, "shutting down, waiting for requests in flight");
    stop.cancel();
    let res = wind_down(&mut server, &jobs, grace).await;
    jobs.close();
    info!("shutdown complete");
    res
}

/// Give a stopping server `grace`, then kill running diagnostics and give it
/// [`KILL_WAIT`] more before aborting it.
async fn wind_down(server: &mut JoinHandle<std::io::Result<()>>, jobs: &Jobs, grace: Duration) -> anyhow::Result<()> {
    if let Ok(res) = tokio::time::timeout(grace, &mut *server).await {
        return Ok(res??);
    }
    warn!("grace period over, killing running diagnostics");
    jobs.cancel_running();
    match tokio::time::timeout(KILL_WAIT, &mut *server).await {
        Ok(res) => res??,
        Err(_) => {
            warn!("connections still open, aborting");
            server.abort();
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
