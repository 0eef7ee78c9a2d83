use anyhow::Result;
use async_trait::async_trait;
use axum::http::StatusCode;
use serde_json::json;
use tracing::{debug, debug_span, Instrument};
use url::Url;

use super::reply::{respond_with_screenshot, Reply, ReplyOptions};
use super::sanitize::{capture_marked, mark_for_capture, Sanitizer};
use super::traits::Renderer;
use super::Services;
use crate::browser::{PageScript, RenderContext, RequestScope, ScreenshotConfig};

/// Blog name and post id from `/<blog>/<id>(/<slug>)`.
#[must_use]
pub fn post_ref(path: &str) -> Option<(&str, &str)> {
    let mut segments = path.trim_start_matches('/').split('/');
    let blog = segments.next().filter(|s| !s.is_empty())?;
    let id = segments
        .next()
        .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))?;
    Some((blog, id))
}

/// Handle a `www.tumblr.com` post URL.
///
/// # Errors
///
/// Returns an error if rendering fails.
pub async fn handle(services: &Services, scope: &mut RequestScope, url: &Url) -> Result<Reply> {
    let Some((blog, id)) = post_ref(url.path()) else {
        debug!(url = %url, "Invalid Tumblr URL");
        return Ok(Reply::with_body(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Invalid Tumblr post URL. Should look something like https://www.tumblr.com/blogname/1234567890/post-slug",
        ));
    };
    let (blog, id) = (blog.to_string(), id.to_string());

    let span = debug_span!("tumblr", post = %format!("{id}@{blog}"));
    async move {
        debug!(url = %url, "Tumblr URL");
        let renderer = TumblrPost {
            url: url.clone(),
            id: id.clone(),
        };
        respond_with_screenshot(
            scope,
            services.context_options(),
            &renderer,
            ReplyOptions::new(format!("tumblr.{blog}.{id}")),
        )
        .await
    }
    .instrument(span)
    .await
}

const CLEAN_HEADER: PageScript = PageScript::new(
    "tumblr-clean-header",
    r#"() => {
        const header = document.querySelector('[data-twitshot-capture] header[role="banner"]');
        if (!header) return false;
        header.querySelector('[aria-label="More options"]')?.remove();
        header.querySelector('[aria-label="Follow"]')?.remove();
        return true;
    }"#,
);

const KEEP_BOTTOM_PADDING: PageScript = PageScript::new(
    "tumblr-keep-bottom-padding",
    r#"() => {
        const post = document.querySelector("[data-twitshot-capture]");
        if (!post) return false;
        post.style.paddingBottom = "1px";
        return true;
    }"#,
);

const EXPAND_TAGS: PageScript = PageScript::new(
    "tumblr-expand-tags",
    r#"() => {
        const more = document.querySelector(
            '[data-twitshot-capture] [data-testid="tag-link"] + a[role="button"]',
        );
        if (!more) return false;
        more.click();
        return true;
    }"#,
);

const CLEAN_FOOTER: PageScript = PageScript::new(
    "tumblr-clean-footer",
    r#"() => {
        const footer = document.querySelector('[data-twitshot-capture] footer[role="contentinfo"]');
        if (!footer) return false;
        footer.firstChild?.remove();

        const activity = footer.querySelector('[aria-label="Post Activity"]');
        if (!activity) return true;
        activity.style.height = "auto";
        activity
            .querySelector('[data-testid="desktop-selector"], [data-testid="mobile-selector"]')
            ?.remove();
        activity.querySelector('[role="tab"][title="Reblog Graph"]')?.remove();
        activity.querySelector('[data-testid="notes-root"]')?.remove();

        const replies = activity.querySelector('[role="tab"][title="Replies"]');
        const tab = activity.querySelector('[role="tab"] + [role="tab"]');
        if (replies && tab) {
            replies.className = tab.className;
        }
        return true;
    }"#,
);

const REMOVE_SIGNUP_OVERLAY: PageScript = PageScript::new(
    "tumblr-remove-signup-overlay",
    r#"() => {
        let overlay = document.querySelector('[aria-label="Sign me up"] + [aria-label="Log in"]');
        while (overlay) {
            const grandparent = overlay.parentElement?.parentElement;
            if (grandparent?.dataset?.testid === "scroll-container") {
                overlay.remove();
                return true;
            }
            overlay = overlay.parentElement;
        }
        return false;
    }"#,
);

struct TumblrPost {
    url: Url,
    id: String,
}

#[async_trait]
impl Renderer for TumblrPost {
    fn name(&self) -> &'static str {
        "tumblr"
    }

    async fn render(
        &self,
        context: &dyn RenderContext,
        config: &ScreenshotConfig,
    ) -> Result<Option<Vec<u8>>> {
        debug!(url = %self.url, "Start rendering Tumblr page");
        let page = context.new_page().await?;
        page.goto(self.url.as_str()).await?;
        page.wait_for_network_idle().await?;

        let selector = format!("*[data-id=\"{}\"] article:has(header + div + div)", self.id);
        if !mark_for_capture(page.as_ref(), &selector).await? {
            debug!("Post not found");
            return Ok(None);
        }

        let sanitizer = Sanitizer::new(page.as_ref(), "tumblr", json!({ "postId": self.id }));
        sanitizer.steps(&[CLEAN_HEADER, KEEP_BOTTOM_PADDING]).await;
        // Alt text popovers
        sanitizer.remove(&["[data-alt-text-popover=\"true\"]"]).await;
        sanitizer.steps(&[EXPAND_TAGS, CLEAN_FOOTER]).await;
        // Consent and login overlays
        sanitizer
            .remove(&[".components-modal__screen-overlay", "body > #cmp-app-container"])
            .await;
        sanitizer.step(&REMOVE_SIGNUP_OVERLAY).await;

        debug!("Screenshot post");
        capture_marked(page.as_ref(), config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_ref() {
        assert_eq!(post_ref("/someblog/123456"), Some(("someblog", "123456")));
        assert_eq!(post_ref("/someblog/123456/a-slug"), Some(("someblog", "123456")));
    }

    #[test]
    fn test_post_ref_rejects_other_paths() {
        assert_eq!(post_ref("/"), None);
        assert_eq!(post_ref("/someblog"), None);
        assert_eq!(post_ref("/someblog/tagged"), None);
        assert_eq!(post_ref("//123"), None);
    }
}
