//! Fediverse instance resolution.

use anyhow::Result;
use axum::http::StatusCode;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tracing::{debug, debug_span, Instrument};
use url::Url;

use super::reply::Reply;
use super::{mastodon, misskey, preflight, Services};
use crate::browser::RequestScope;

/// Most instance hops followed for one request.
pub const MAX_HOPS: usize = 5;

/// Server software behind an ActivityPub host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Software {
    Mastodon,
    /// Misskey and its forks that share its frontend (Sharkey).
    Misskey,
    Unsupported(String),
}

impl Software {
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "mastodon" => Self::Mastodon,
            "misskey" | "sharkey" => Self::Misskey,
            other => Self::Unsupported(other.to_string()),
        }
    }
}

/// Whether following `url` would revisit a URL or exceed [`MAX_HOPS`].
#[must_use]
pub fn is_loop(seen: &[String], url: &str) -> bool {
    seen.len() >= MAX_HOPS || seen.iter().any(|s| s == url)
}

/// Resolve the software behind `url` and hand the post to its handler.
///
/// Boxed because Mastodon posts can point back here for a different
/// instance.
pub fn handle<'a>(
    services: &'a Services,
    scope: &'a mut RequestScope,
    url: Url,
) -> BoxFuture<'a, Result<Reply>> {
    let span = debug_span!("activity-pub", url = %url);
    async move {
        if is_loop(scope.seen_urls(), url.as_str()) {
            debug!(seen = ?scope.seen_urls(), "Loop detected");
            return Ok(Reply::with_body(
                StatusCode::IM_A_TEAPOT,
                format!(
                    "Detected a loop in post URLs ({}). Aborting.",
                    scope.seen_urls().join(" -> ")
                ),
            ));
        }

        let Some(software) = preflight::node_software(&services.http, &url).await else {
            return Ok(Reply::with_body(
                StatusCode::NOT_FOUND,
                "Could not get node info from the server",
            ));
        };

        debug!(software = %software.name, "Getting instance handler");
        match Software::from_name(&software.name) {
            Software::Mastodon => {
                scope.push_seen_url(url.as_str());
                mastodon::handle(services, scope, &url).await
            }
            Software::Misskey => {
                scope.push_seen_url(url.as_str());
                misskey::handle(services, scope, &url).await
            }
            Software::Unsupported(name) => Ok(Reply::with_body(
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("Don't know how to handle {name:?} instances"),
            )),
        }
    }
    .instrument(span)
    .boxed()
}
