//! Post handlers.
//!
//! A request URL is classified into a platform, checked against the
//! platform's public API where one exists, and only then rendered in a fresh
//! browser context.

mod activitypub;
mod bluesky;
pub mod classify;
mod linkedin;
mod mastodon;
mod misskey;
pub mod preflight;
pub mod raw;
mod reply;
pub mod sanitize;
mod traits;
mod tumblr;
mod twitter;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use tracing::debug;

use crate::bluesky::BlueskyService;
use crate::browser::{ContextOptions, RequestScope};
use crate::config::Config;
use crate::constants::{BROWSER_USER_AGENT, UPSTREAM_TIMEOUT};

pub use activitypub::{is_loop, Software, MAX_HOPS};
pub use classify::{classify, Platform, PostReference};
pub use reply::{
    respond_with_screenshot, Reply, ReplyOptions, Screenshot, ScreenshotResponseError,
};
pub use traits::{Renderer, WithFallback};

/// Process-wide services shared by every request.
pub struct Services {
    pub config: Arc<Config>,
    pub http: reqwest::Client,
    pub bluesky: Arc<BlueskyService>,
}

impl Services {
    #[must_use]
    pub fn new(config: Arc<Config>, http: reqwest::Client, bluesky: Arc<BlueskyService>) -> Self {
        Self {
            config,
            http,
            bluesky,
        }
    }

    /// Context settings every platform render starts from.
    #[must_use]
    pub fn context_options(&self) -> ContextOptions {
        ContextOptions::new(&self.config.application_info)
    }
}

/// HTTP client for upstream API calls.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialized.
pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(BROWSER_USER_AGENT)
        .timeout(UPSTREAM_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")
}

/// Screenshot the post at `raw`.
///
/// # Errors
///
/// Returns an error if browser automation fails.
pub async fn process_post(services: &Services, scope: &mut RequestScope, raw: &str) -> Result<Reply> {
    debug!(url = raw, "Starting processing");
    let Some(post) = classify(raw) else {
        debug!(url = ?raw, "URL parse failed");
        return Ok(Reply::status(StatusCode::BAD_REQUEST));
    };

    debug!(platform = post.platform.as_str(), url = %post.url, "Classified post");
    match post.platform {
        Platform::Twitter => twitter::handle(services, scope, &post.url).await,
        Platform::Tumblr => tumblr::handle(services, scope, &post.url).await,
        Platform::Bluesky => bluesky::handle(services, scope, &post.url).await,
        Platform::LinkedIn => linkedin::handle(services, scope, &post.url).await,
        Platform::ActivityPub => activitypub::handle(services, scope, post.url).await,
    }
}
