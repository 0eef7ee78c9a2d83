use std::sync::LazyLock;

use anyhow::Result;
use async_trait::async_trait;
use axum::http::StatusCode;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, debug_span, Instrument};
use url::Url;

use super::reply::{respond_with_screenshot, Reply, ReplyOptions};
use super::sanitize::{capture_marked, mark_for_capture, Sanitizer};
use super::traits::Renderer;
use super::Services;
use crate::browser::{PageScript, RenderContext, RequestScope, ScreenshotConfig};

static POST_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/posts/(?P<username>[^_/]+)_(?P<slug>[^/]+)/?").unwrap());

const FONT_CSS: &str = r#"
@import "https://fonts.googleapis.com/css2?family=Roboto:ital,wght@0,100..900;1,100..900&display=swap";

body {
    font-family: "Roboto", sans-serif;
}

.font-sans {
    font-family: "Roboto", sans-serif !important;
}
"#;

/// Username and slug from `/posts/<username>_<slug>`.
#[must_use]
pub fn post_ref(path: &str) -> Option<(&str, &str)> {
    let caps = POST_PATH.captures(path)?;
    Some((caps.name("username")?.as_str(), caps.name("slug")?.as_str()))
}

/// Handle a `www.linkedin.com` post URL.
///
/// # Errors
///
/// Returns an error if rendering fails.
pub async fn handle(services: &Services, scope: &mut RequestScope, url: &Url) -> Result<Reply> {
    let Some((username, slug)) = post_ref(url.path()) else {
        debug!(url = %url, "Invalid LinkedIn post URL");
        return Ok(Reply::with_body(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Invalid LinkedIn post URL. Should look something like https://www.linkedin.com/posts/username_some-random-slug-in-url/",
        ));
    };
    let filename = format!("linkedin.{username}.{slug}");

    let span = debug_span!("linkedin", post = %format!("{slug}@{username}"));
    async move {
        let renderer = LinkedInPost { url: url.clone() };
        respond_with_screenshot(
            scope,
            services.context_options(),
            &renderer,
            ReplyOptions::new(filename),
        )
        .await
    }
    .instrument(span)
    .await
}

const EXPAND_TEXT: PageScript = PageScript::new(
    "linkedin-expand-text",
    r#"() => {
        const more = document.querySelector(
            '[data-twitshot-capture] button[data-feed-action="see-more-post"]',
        );
        if (!more) return false;
        more.click();
        return true;
    }"#,
);

const TRIM_AFTER_ACTIONS: PageScript = PageScript::new(
    "linkedin-trim-after-actions",
    r#"() => {
        const post = document.querySelector("[data-twitshot-capture]");
        let next = post?.querySelector(".main-feed-activity-card__social-actions")?.nextSibling;
        let removed = 0;
        while (next) {
            const current = next;
            next = next.nextSibling;
            current.remove();
            removed += 1;
        }
        return removed;
    }"#,
);

const FONTS_READY: PageScript = PageScript::new(
    "linkedin-fonts-ready",
    r"async () => {
        await document.fonts.ready;
        return true;
    }",
);

struct LinkedInPost {
    url: Url,
}

#[async_trait]
impl Renderer for LinkedInPost {
    fn name(&self) -> &'static str {
        "linkedin"
    }

    async fn render(
        &self,
        context: &dyn RenderContext,
        config: &ScreenshotConfig,
    ) -> Result<Option<Vec<u8>>> {
        debug!(url = %self.url, "Start rendering LinkedIn page");
        let page = context.new_page().await?;
        page.goto(self.url.as_str()).await?;
        page.wait_for_network_idle().await?;

        if !mark_for_capture(page.as_ref(), "article").await? {
            debug!("Post not found");
            return Ok(None);
        }

        let sanitizer = Sanitizer::new(page.as_ref(), "linkedin", Value::Null);
        // Banners and overlays
        sanitizer
            .remove(&[".top-level-modal-container", ".global-alert-banner"])
            .await;
        sanitizer.steps(&[EXPAND_TEXT, TRIM_AFTER_ACTIONS]).await;
        sanitizer
            .remove(&[
                "[data-twitshot-capture] .main-feed-activity-card__ellipsis-menu",
                "[data-twitshot-capture] [aria-label=\"Video Player\"] [title=\"Play Video\"]",
            ])
            .await;

        page.add_style(FONT_CSS).await?;
        page.run(&FONTS_READY, Value::Null).await?;

        debug!("Screenshot post");
        capture_marked(page.as_ref(), config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_ref() {
        assert_eq!(
            post_ref("/posts/someone_some-random-slug-123/"),
            Some(("someone", "some-random-slug-123"))
        );
        assert_eq!(
            post_ref("/posts/jane-doe_launch-day-activity-7123"),
            Some(("jane-doe", "launch-day-activity-7123"))
        );
    }

    #[test]
    fn test_post_ref_rejects_other_paths() {
        assert_eq!(post_ref("/posts/noslug"), None);
        assert_eq!(post_ref("/in/someone"), None);
        assert_eq!(post_ref("/feed/update/urn:li:activity:1"), None);
    }
}
