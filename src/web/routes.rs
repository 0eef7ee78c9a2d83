use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Extension, Form, Router};
use futures_util::FutureExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use tracing::{error, info, warn};

use super::rate_limit::slow_down;
use super::{templates, AppState, RequestId};
use crate::browser::{generate_request_id, RequestScope};
use crate::handlers::{self, raw, Reply};

const FAVICON: &[u8] = include_bytes!("../../assets/favicon.ico");

const ROBOTS_TXT: &str = "User-agent: *\nDisallow: /";

/// Create the router with all routes.
pub fn router(state: &AppState) -> Router<AppState> {
    let raw_enabled = state.services.config.enable_raw_screenshots;

    let mut render = Router::new().route("/*url", get(render_post));
    if raw_enabled {
        render = render.route("/http-raw/*url", get(render_raw));
    }
    let render = render.route_layer(middleware::from_fn_with_state(state.clone(), slow_down));

    let mut pages = Router::new()
        .route("/", get(home).post(submit_post))
        .route("/healthz", get(health))
        .route("/favicon.ico", get(favicon))
        .route("/robots.txt", get(robots));
    if raw_enabled {
        pages = pages.route("/raw", get(raw_home).post(submit_raw));
    }

    pages.merge(render)
}

// ========== Pages ==========

async fn home() -> Html<String> {
    Html(templates::render_home().into_string())
}

async fn raw_home() -> Html<String> {
    Html(templates::render_raw_home().into_string())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn favicon() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "image/x-icon")], FAVICON)
}

async fn robots() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain")], ROBOTS_TXT)
}

/// Bytes escaped in redirect locations on top of everything non-ASCII.
/// `%` is left alone so already-encoded input passes through unchanged.
const LOCATION_ESCAPES: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

fn redirect(location: &str) -> Response {
    let location = utf8_percent_encode(location, LOCATION_ESCAPES).to_string();
    // Redirect::to panics on values that are not valid header values.
    if HeaderValue::from_str(&location).is_err() {
        return Reply::status(StatusCode::BAD_REQUEST).into_response();
    }
    Redirect::to(&location).into_response()
}

async fn submit_post(Form(form): Form<HashMap<String, String>>) -> Response {
    match form.get("url").map(|url| url.trim()).filter(|url| !url.is_empty()) {
        Some(url) => redirect(&format!("/{url}")),
        None => Reply::status(StatusCode::UNSUPPORTED_MEDIA_TYPE).into_response(),
    }
}

async fn submit_raw(Form(form): Form<Vec<(String, String)>>) -> Response {
    match raw::redirect_location(&form) {
        Ok(location) => redirect(&location),
        Err(status) => Reply::status(status).into_response(),
    }
}

// ========== Rendering ==========

fn request_scope(state: &AppState, id: Option<Extension<RequestId>>) -> RequestScope {
    let id = id.map_or_else(generate_request_id, |Extension(RequestId(id))| id);
    RequestScope::new(id, Arc::clone(&state.engine))
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn finish(outcome: Result<anyhow::Result<Reply>, Box<dyn Any + Send>>) -> Response {
    match outcome {
        Ok(Ok(reply)) => reply.into_response(),
        Ok(Err(e)) => {
            warn!("Handler failed: {e:#}");
            Reply::status(StatusCode::INTERNAL_SERVER_ERROR).into_response()
        }
        Err(panic) => {
            error!("Handler panicked: {}", panic_message(panic.as_ref()));
            Reply::status(StatusCode::INTERNAL_SERVER_ERROR).into_response()
        }
    }
}

async fn render_post(
    State(state): State<AppState>,
    id: Option<Extension<RequestId>>,
    Path(url): Path<String>,
) -> Response {
    info!(url = %url, "Got request to render");
    let mut scope = request_scope(&state, id);

    let outcome = AssertUnwindSafe(handlers::process_post(&state.services, &mut scope, &url))
        .catch_unwind()
        .await;
    scope.close().await;

    info!(url = %url, "Done with rendering");
    finish(outcome)
}

async fn render_raw(
    State(state): State<AppState>,
    id: Option<Extension<RequestId>>,
    Path(url): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    info!(url = %url, "Got request to render");
    let Some(target) = raw::target_url(&url, query.as_deref()) else {
        return Reply::status(StatusCode::BAD_REQUEST).into_response();
    };
    let options = raw::RawOptions::from_query(query.as_deref().unwrap_or_default());
    let mut scope = request_scope(&state, id);

    let outcome = AssertUnwindSafe(raw::handle(&state.services, &mut scope, target, options))
        .catch_unwind()
        .await;
    scope.close().await;

    info!(url = %url, "Done with rendering");
    finish(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let panic: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(panic.as_ref()), "boom");
        let panic: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(panic.as_ref()), "bang");
        let panic: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(panic.as_ref()), "unknown panic");
    }

    #[test]
    fn test_redirect_encodes_non_ascii() {
        let response = redirect("/https://example.com/café?q=naïve");
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers()[header::LOCATION],
            "/https://example.com/caf%C3%A9?q=na%C3%AFve"
        );

        let response = redirect("/https://example.com/a b%20c");
        assert_eq!(
            response.headers()[header::LOCATION],
            "/https://example.com/a%20b%20c"
        );
    }

    #[test]
    fn test_failed_handler_is_500() {
        let response = finish(Ok(Err(anyhow::anyhow!("browser died"))));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
