mod rate_limit;
mod routes;
pub mod templates;

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, info_span, Instrument};

use crate::browser::{generate_request_id, BrowserEngine};
use crate::constants::REQUEST_ID_HEADER;
use crate::handlers::Services;

pub use rate_limit::{
    client_ip, delay_for, CounterStore, Hit, MemoryStore, RateLimiter, RedisStore, SlowDown,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
    pub engine: Arc<dyn BrowserEngine>,
    pub limiter: Arc<RateLimiter>,
}

/// Id assigned to an incoming request, available as a request extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

/// Start the web server and run it until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the address is invalid or the server fails.
pub async fn serve<F>(state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let config = &state.services.config;
    let ip: IpAddr = config
        .web_host
        .parse()
        .with_context(|| format!("Invalid web server host: {}", config.web_host))?;
    let addr = SocketAddr::new(ip, config.web_port);

    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind web server")?;
    info!(addr = %addr, "Server started");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("Web server error")?;

    Ok(())
}

/// Create the main application router.
pub fn create_app(state: AppState) -> Router {
    routes::router(&state)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            request_context,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Assign a request id, open the request span and log start and end lines.
async fn request_context(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let id = generate_request_id();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let ip = client_ip(request.headers(), peer, state.services.config.trust_proxy);
    let method = request.method().clone();
    let uri = request.uri().clone();
    let (ua, referer) = {
        let header_str = |name: header::HeaderName| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string)
        };
        (header_str(header::USER_AGENT), header_str(header::REFERER))
    };
    request.extensions_mut().insert(RequestId(id.clone()));

    let span = info_span!("request", id = %id);
    async move {
        debug!(ip = ?ip, method = %method, url = %uri, ua = ?ua, referer = ?referer, "START");
        let start = Instant::now();

        let mut response = next.run(request).await;

        let took_ms = start.elapsed().as_secs_f64() * 1000.0;
        info!(
            status = response.status().as_u16(),
            took_ms,
            ip = ?ip,
            method = %method,
            url = %uri,
            ua = ?ua,
            referer = ?referer,
            "END"
        );
        if let Ok(value) = HeaderValue::from_str(&id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    }
    .instrument(span)
    .await
}
