use std::sync::LazyLock;

use anyhow::Result;
use async_trait::async_trait;
use axum::http::StatusCode;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, debug_span, Instrument};
use url::Url;

use super::reply::{respond_with_screenshot, Reply, ReplyOptions};
use super::sanitize::{capture_marked, mark_for_capture, Sanitizer};
use super::traits::Renderer;
use super::Services;
use crate::bluesky::STORAGE_KEY;
use crate::browser::{PageScript, RenderContext, RequestScope, ScreenshotConfig, StorageSeed};

static POST_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/profile/(?P<username>[^/]+)/post/(?P<id>[a-zA-Z0-9]+)").unwrap()
});

/// Analytics endpoints the web app would otherwise hit on every load.
const BLOCKED_URLS: &[&str] = &[
    "https://events.bsky.app/v2/rgstr",
    "https://statsigapi.net/v1/sdk_exception",
    "https://events.bsky.app/v2/initialize",
];

/// Username (handle or DID) and post id from `/profile/<user>/post/<id>`.
#[must_use]
pub fn post_ref(path: &str) -> Option<(&str, &str)> {
    let caps = POST_PATH.captures(path)?;
    Some((caps.name("username")?.as_str(), caps.name("id")?.as_str()))
}

/// Handle a `bsky.app` post URL.
///
/// # Errors
///
/// Returns an error if rendering fails.
pub async fn handle(services: &Services, scope: &mut RequestScope, url: &Url) -> Result<Reply> {
    let Some((username, id)) = post_ref(url.path()) else {
        debug!(url = %url, "Invalid Bluesky post URL");
        return Ok(Reply::with_body(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Invalid BlueSky post URL. Should look something like https://bsky.app/profile/some.username/post/randomP0stId",
        ));
    };
    let (username, id) = (username.to_string(), id.to_string());

    let span = debug_span!("bsky", post = %format!("{id}@{username}"));
    async move {
        let thread = match services.bluesky.post_thread(&username, &id).await {
            Ok(thread) => thread,
            Err(e) => {
                debug!("Error getting post: {e:#}");
                return Ok(Reply::with_body(
                    StatusCode::NOT_FOUND,
                    "Could not get post from the API",
                ));
            }
        };
        if !thread["thread"]["post"].is_object() {
            return Ok(Reply::with_body(
                StatusCode::NOT_FOUND,
                "Could not get post info from the API response",
            ));
        }

        let session = services.bluesky.session_blob().await;
        let mut options = services.context_options();
        if let Some(blob) = &session {
            options = options.with_local_storage(StorageSeed {
                origin: url.origin().ascii_serialization(),
                key: STORAGE_KEY.to_string(),
                value: blob.clone(),
            });
        }

        let renderer = BlueskyPost {
            url: url.clone(),
            username: username.clone(),
            session,
        };
        respond_with_screenshot(
            scope,
            options,
            &renderer,
            ReplyOptions::new(format!("bluesky-post.{}.{id}", username.replace('.', "_"))),
        )
        .await
    }
    .instrument(span)
    .await
}

/// Store the session blob unless the page already runs as the same account.
///
/// Returns whether the page needs a reload to pick it up.
pub const SYNC_SESSION: PageScript = PageScript::new(
    "bsky-sync-session",
    r#"(args) => {
        const next = JSON.parse(args.data);
        const nextDid = next?.session?.currentAccount?.did;
        let previous = null;
        try {
            previous = JSON.parse(window.localStorage.getItem(args.key) ?? "{}");
        } catch (_e) {}
        const previousDid = previous?.session?.currentAccount?.did;
        if (previousDid === nextDid) return false;
        window.localStorage.setItem(args.key, args.data);
        return true;
    }"#,
);

const CLEAN_POST: PageScript = PageScript::new(
    "bsky-clean-post",
    r#"() => {
        const post = document.querySelector("[data-twitshot-capture]");
        if (!post) return false;

        // Duplicate info toolbar
        let actions = post.querySelector('[data-testid="replyBtn"]')?.parentElement;
        while (actions && actions.childElementCount <= 1) {
            actions = actions.parentElement;
        }
        actions?.parentElement?.remove();

        post.querySelector('[data-testid="followBtn"]')?.remove();
        post.querySelector('[aria-label="Who can reply"]')?.remove();

        post.style.marginBottom = "1rem";
        const last = post.lastChild;
        if (last?.style) last.style.paddingBottom = "0";
        const innermost = last?.lastChild;
        if (innermost?.style) innermost.style.borderBottom = "0";
        return true;
    }"#,
);

fn thread_item_selector(username: &str) -> String {
    let escaped = username.replace('\\', "\\\\").replace('"', "\\\"");
    format!("[data-testid=\"postThreadItem-by-{escaped}\"]")
}

struct BlueskyPost {
    url: Url,
    username: String,
    session: Option<String>,
}

#[async_trait]
impl Renderer for BlueskyPost {
    fn name(&self) -> &'static str {
        "bsky"
    }

    async fn render(
        &self,
        context: &dyn RenderContext,
        config: &ScreenshotConfig,
    ) -> Result<Option<Vec<u8>>> {
        debug!(url = %self.url, "Start rendering Bluesky page");
        let page = context.new_page().await?;
        page.block_urls(BLOCKED_URLS).await?;
        page.goto(self.url.as_str()).await?;

        if let Some(data) = &self.session {
            let reload = page
                .run(&SYNC_SESSION, json!({ "key": STORAGE_KEY, "data": data }))
                .await?;
            if reload.as_bool().unwrap_or(false) {
                debug!("Bluesky data updated. Reloading page...");
                page.reload().await?;
            } else {
                debug!("Bluesky data already up to date");
            }
        }

        let selector = thread_item_selector(&self.username);
        debug!("Waiting for page to load");
        if !page.wait_for_selector(&selector).await? {
            debug!("Bluesky post not available");
            return Ok(None);
        }
        page.wait_for_network_idle().await?;

        if !mark_for_capture(page.as_ref(), &selector).await? {
            debug!("Bluesky post disappeared");
            return Ok(None);
        }

        let sanitizer = Sanitizer::new(page.as_ref(), "bsky", Value::Null);
        sanitizer.step(&CLEAN_POST).await;

        debug!("Taking screenshot");
        capture_marked(page.as_ref(), config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_ref() {
        assert_eq!(
            post_ref("/profile/alice.example/post/abc123"),
            Some(("alice.example", "abc123"))
        );
        assert_eq!(
            post_ref("/profile/did:plc:xyz/post/3kabc"),
            Some(("did:plc:xyz", "3kabc"))
        );
        assert_eq!(post_ref("/profile/alice.example"), None);
        assert_eq!(post_ref("/profile/alice.example/post/"), None);
        assert_eq!(post_ref("/hashtag/rust"), None);
    }

    #[test]
    fn test_thread_item_selector_escapes_quotes() {
        assert_eq!(
            thread_item_selector("alice.example"),
            "[data-testid=\"postThreadItem-by-alice.example\"]"
        );
        assert_eq!(
            thread_item_selector("a\"b"),
            "[data-testid=\"postThreadItem-by-a\\\"b\"]"
        );
    }
}
