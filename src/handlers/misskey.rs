use anyhow::Result;
use async_trait::async_trait;
use axum::http::StatusCode;
use serde_json::Value;
use tracing::{debug, debug_span, Instrument};
use url::Url;

use super::reply::{respond_with_screenshot, Reply, ReplyOptions};
use super::sanitize::{capture_marked, Sanitizer};
use super::traits::Renderer;
use super::Services;
use crate::browser::{PageScript, RenderContext, RequestScope, ScreenshotConfig};

/// Note id from a `/notes/<id>` path.
#[must_use]
pub fn note_id(path: &str) -> Option<&str> {
    let mut segments = path.trim_end_matches('/').rsplit('/');
    let id = segments.next()?;
    (!id.is_empty() && segments.next() == Some("notes")).then_some(id)
}

/// Handle a post on a Misskey or Sharkey instance.
///
/// # Errors
///
/// Returns an error if rendering fails.
pub async fn handle(services: &Services, scope: &mut RequestScope, url: &Url) -> Result<Reply> {
    let Some(id) = note_id(url.path()).map(ToString::to_string) else {
        debug!(url = %url, "Invalid note URL");
        return Ok(Reply::status(StatusCode::UNPROCESSABLE_ENTITY));
    };
    let span = debug_span!("misskey", url = %url);
    async move {
        debug!("Misskey post");
        let host = url.host_str().unwrap_or_default();
        let renderer = NotePage { url: url.clone() };
        respond_with_screenshot(
            scope,
            services.context_options(),
            &renderer,
            ReplyOptions::new(format!("misskey-post.{host}.{id}")),
        )
        .await
    }
    .instrument(span)
    .await
}

const MARK_NOTE: PageScript = PageScript::new(
    "misskey-mark-note",
    r#"() => {
        const post = document.querySelector("main article");
        const container = post?.parentElement;
        if (!container) return false;
        document.querySelectorAll("[data-twitshot-capture], [data-twitshot-post]").forEach((el) => {
            el.removeAttribute("data-twitshot-capture");
            el.removeAttribute("data-twitshot-post");
        });
        post.setAttribute("data-twitshot-post", "");
        container.setAttribute("data-twitshot-capture", "");
        return true;
    }"#,
);

const REMOVE_STICKY_HEADER: PageScript = PageScript::new(
    "misskey-remove-sticky-header",
    r#"() => {
        const header = document.querySelector("main > div > div");
        if (!header || header.querySelector("[data-twitshot-post]")) return false;
        header.remove();
        return true;
    }"#,
);

const ISOLATE_NOTE: PageScript = PageScript::new(
    "misskey-isolate-note",
    r#"() => {
        const container = document.querySelector("[data-twitshot-capture]");
        if (!container) return 0;
        let removed = 0;
        for (const child of Array.from(container.childNodes)) {
            if (child.nodeType === Node.ELEMENT_NODE && child.hasAttribute("data-twitshot-post")) {
                continue;
            }
            child.remove();
            removed += 1;
        }
        return removed;
    }"#,
);

const TRIM_FOOTERS: PageScript = PageScript::new(
    "misskey-trim-footers",
    r#"() => {
        const container = document.querySelector("[data-twitshot-capture]");
        if (!container) return false;
        for (const footer of container.querySelectorAll("footer")) {
            let next = footer.parentElement
                ?.querySelector("footer > button")
                ?.nextSibling?.nextSibling;
            while (next) {
                const current = next;
                next = next.nextSibling;
                current.remove();
            }
            footer.style.justifyContent = "flex-start";
        }
        return true;
    }"#,
);

const OPEN_SUMMARIES: PageScript = PageScript::new(
    "misskey-open-summaries",
    r#"() => {
        const container = document.querySelector("[data-twitshot-capture]");
        if (!container) return 0;
        let opened = 0;
        container.querySelectorAll("details > summary").forEach((summary) => {
            summary.click();
            summary.style.display = "none";
            opened += 1;
        });
        return opened;
    }"#,
);

struct NotePage {
    url: Url,
}

#[async_trait]
impl Renderer for NotePage {
    fn name(&self) -> &'static str {
        "misskey"
    }

    async fn render(
        &self,
        context: &dyn RenderContext,
        config: &ScreenshotConfig,
    ) -> Result<Option<Vec<u8>>> {
        debug!(url = %self.url, "Start rendering Misskey page");
        let page = context.new_page().await?;
        page.goto(self.url.as_str()).await?;
        page.wait_for_network_idle().await?;

        if !page.run(&MARK_NOTE, Value::Null).await?.as_bool().unwrap_or(false) {
            debug!("Post not available");
            return Ok(None);
        }

        let sanitizer = Sanitizer::new(page.as_ref(), "misskey", Value::Null);
        sanitizer
            .steps(&[REMOVE_STICKY_HEADER, ISOLATE_NOTE, TRIM_FOOTERS])
            .await;
        sanitizer.click_through(&OPEN_SUMMARIES, None).await?;

        capture_marked(page.as_ref(), config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_id() {
        assert_eq!(note_id("/notes/9abcdefghi"), Some("9abcdefghi"));
        assert_eq!(note_id("/notes/9abcdefghi/"), Some("9abcdefghi"));
    }

    #[test]
    fn test_note_id_rejects_empty_paths() {
        assert_eq!(note_id("/notes/"), None);
        assert_eq!(note_id("/notes"), None);
        assert_eq!(note_id("/"), None);
        assert_eq!(note_id("/@alice"), None);
    }
}
