//! Integration tests for the static and form routes.

mod common;

use axum::http::{header, StatusCode};

use common::{body_string, get, post_form, test_app, test_config, Behavior};
use twitshot::constants::REQUEST_ID_HEADER;

fn app() -> axum::Router {
    let engine = Behavior::new().build();
    test_app(test_config("http://127.0.0.1:9"), &engine)
}

#[tokio::test]
async fn test_health_check() {
    let response = get(app(), "/healthz").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_robots_disallows_everything() {
    let response = get(app(), "/robots.txt").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
    assert_eq!(body_string(response).await, "User-agent: *\nDisallow: /");
}

#[tokio::test]
async fn test_favicon() {
    let response = get(app(), "/favicon.ico").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/x-icon");
}

#[tokio::test]
async fn test_home_page_renders_form() {
    let response = get(app(), "/").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("<form"));
    assert!(body.contains(r#"name="url""#));
}

#[tokio::test]
async fn test_every_response_has_request_id() {
    let response = get(app(), "/healthz").await;
    let id = response.headers()[REQUEST_ID_HEADER].to_str().unwrap();
    assert!(id.len() > 8, "{id}");
    assert!(id.chars().all(|c| c.is_ascii_alphanumeric()), "{id}");
}

#[tokio::test]
async fn test_submit_redirects_to_post_url() {
    let response = post_form(app(), "/", "url=https%3A%2F%2Fx.com%2Fsomeone%2Fstatus%2F12345").await;
    assert!(response.status().is_redirection());
    assert_eq!(
        response.headers()[header::LOCATION],
        "/https://x.com/someone/status/12345"
    );
}

#[tokio::test]
async fn test_submit_encodes_non_ascii_url() {
    let response = post_form(app(), "/", "url=https%3A%2F%2Fexample.social%2F%40j%C3%BCrgen%2F42").await;
    assert!(response.status().is_redirection());
    assert_eq!(
        response.headers()[header::LOCATION],
        "/https://example.social/@j%C3%BCrgen/42"
    );
}

#[tokio::test]
async fn test_submit_without_url_is_unsupported() {
    let response = post_form(app(), "/", "").await;
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let response = post_form(app(), "/", "other=1").await;
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn test_raw_home_lists_options() {
    let response = get(app(), "/raw").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("$$selectElement"));
    assert!(body.contains("$$pageScaleFactor"));
}

#[tokio::test]
async fn test_raw_submit_redirects_with_options() {
    let response = post_form(
        app(),
        "/raw",
        "url=https%3A%2F%2Fexample.com%2F&%24%24selectElement=main&%24%24removeElements=",
    )
    .await;
    assert!(response.status().is_redirection());
    assert_eq!(
        response.headers()[header::LOCATION],
        "/http-raw/https://example.com/?%24%24selectElement=main"
    );
}

#[tokio::test]
async fn test_raw_submit_validates_url() {
    let response = post_form(app(), "/raw", "url=not+a+url").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = post_form(app(), "/raw", "").await;
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn test_raw_routes_can_be_disabled() {
    let engine = Behavior::new().build();
    let mut config = test_config("http://127.0.0.1:9");
    config.enable_raw_screenshots = false;

    // Falls through to the post route, where "raw" is not a URL.
    let response = get(test_app(config, &engine), "/raw").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(engine.contexts_opened(), 0);
}
