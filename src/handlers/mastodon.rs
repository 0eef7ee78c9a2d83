use anyhow::Result;
use async_trait::async_trait;
use axum::http::StatusCode;
use serde_json::Value;
use tracing::{debug, debug_span, Instrument};
use url::Url;

use super::reply::{respond_with_screenshot, Reply, ReplyOptions};
use super::sanitize::{capture_marked, Sanitizer};
use super::traits::Renderer;
use super::{activitypub, preflight, Services};
use crate::browser::{PageScript, RenderContext, RequestScope, ScreenshotConfig};

/// Numeric status id at the end of a toot path (`/@user/<id>`, `/users/x/statuses/<id>`).
#[must_use]
pub fn toot_id(path: &str) -> Option<&str> {
    let id = path.trim_end_matches('/').rsplit('/').next()?;
    (!id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())).then_some(id)
}

fn same_instance(a: &Url, b: &Url) -> bool {
    a.host_str() == b.host_str() && a.port_or_known_default() == b.port_or_known_default()
}

/// Handle a post on a Mastodon instance.
///
/// If the instance reports the toot's canonical URL on another server, the
/// request is resolved again against that server.
///
/// # Errors
///
/// Returns an error if rendering fails.
pub async fn handle(services: &Services, scope: &mut RequestScope, url: &Url) -> Result<Reply> {
    let Some(id) = toot_id(url.path()).map(ToString::to_string) else {
        debug!(url = %url, "Invalid toot ID");
        return Ok(Reply::status(StatusCode::UNPROCESSABLE_ENTITY));
    };

    let span = debug_span!("mastodon", toot = %id);
    async move {
        let origin = url.origin().ascii_serialization();
        let Some(toot_url) = preflight::mastodon_status_url(&services.http, &origin, &id).await
        else {
            debug!("Toot not found");
            return Ok(Reply::not_found());
        };

        if !same_instance(&toot_url, url) {
            debug!(from = %url, to = %toot_url, "Toot URL not from this instance, replacing");
            return activitypub::handle(services, scope, toot_url).await;
        }

        let host = url.host_str().unwrap_or_default();
        let renderer = TootPage { url: url.clone() };
        respond_with_screenshot(
            scope,
            services.context_options(),
            &renderer,
            ReplyOptions::new(format!("toot.{host}.{id}")),
        )
        .await
    }
    .instrument(span)
    .await
}

const TOOT: &str = "#mastodon .detailed-status__wrapper";

const MARK_CONTAINER: PageScript = PageScript::new(
    "mastodon-mark-container",
    r##"() => {
        const toot = document.querySelector("#mastodon .detailed-status__wrapper");
        if (!toot) return false;
        const container =
            document.querySelector("#mastodon .scrollable:has(.detailed-status__wrapper)") ?? toot;
        document.querySelectorAll("[data-twitshot-capture]").forEach((el) => {
            el.removeAttribute("data-twitshot-capture");
        });
        container.setAttribute("data-twitshot-capture", "");
        return true;
    }"##,
);

const TRIM_REPLIES: PageScript = PageScript::new(
    "mastodon-trim-replies",
    r#"() => {
        const container = document.querySelector("[data-twitshot-capture]");
        if (!container) return false;
        const main = container.querySelector("*:has(.detailed-status__wrapper)");
        let next = main?.nextSibling;
        while (next) {
            const current = next;
            next = next.nextSibling;
            current.remove();
        }
        container.style.flex = "0";
        return true;
    }"#,
);

const EXPAND_SPOILERS: PageScript = PageScript::new(
    "mastodon-expand-spoilers",
    r#"() => {
        const container = document.querySelector("[data-twitshot-capture]");
        if (!container) return 0;
        let clicked = 0;
        container
            .querySelectorAll('button.status__content__spoiler-link[aria-expanded="false"]')
            .forEach((button) => {
                button.click();
                clicked += 1;
            });
        container
            .querySelectorAll('.spoiler-button > button[class="spoiler-button__overlay"]')
            .forEach((button) => {
                button.click();
                clicked += 1;
            });
        return clicked;
    }"#,
);

struct TootPage {
    url: Url,
}

#[async_trait]
impl Renderer for TootPage {
    fn name(&self) -> &'static str {
        "mastodon"
    }

    async fn render(
        &self,
        context: &dyn RenderContext,
        config: &ScreenshotConfig,
    ) -> Result<Option<Vec<u8>>> {
        debug!(url = %self.url, "Start rendering Mastodon page");
        let page = context.new_page().await?;
        page.goto(self.url.as_str()).await?;
        page.wait_for_network_idle().await?;

        if !page.exists(TOOT).await? {
            debug!("Toot not available");
            return Ok(None);
        }

        let sanitizer = Sanitizer::new(page.as_ref(), "mastodon", Value::Null);
        // Global toolbars
        sanitizer.remove(&[".tabs-bar__wrapper", ".ui__header"]).await;

        if !page.run(&MARK_CONTAINER, Value::Null).await?.as_bool().unwrap_or(false) {
            debug!("Toot disappeared while cleaning up");
            return Ok(None);
        }

        sanitizer.step(&TRIM_REPLIES).await;
        sanitizer
            .remove(&[
                "[data-twitshot-capture] .status__action-bar",
                "[data-twitshot-capture] .detailed-status__action-bar",
            ])
            .await;
        sanitizer.click_through(&EXPAND_SPOILERS, None).await?;
        sanitizer
            .remove(&["[data-twitshot-capture] .spoiler-button--minified"])
            .await;

        capture_marked(page.as_ref(), config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toot_id() {
        assert_eq!(toot_id("/@someone/110123456789"), Some("110123456789"));
        assert_eq!(toot_id("/@someone/110123456789/"), Some("110123456789"));
        assert_eq!(toot_id("/users/someone/statuses/42"), Some("42"));
        assert_eq!(toot_id("/@someone"), None);
        assert_eq!(toot_id("/"), None);
        assert_eq!(toot_id("/notes/9abcdef"), None);
    }

    #[test]
    fn test_same_instance_compares_port() {
        let a = Url::parse("https://mastodon.social/@a/1").unwrap();
        let b = Url::parse("https://mastodon.social:443/@b/2").unwrap();
        let c = Url::parse("https://mastodon.social:8443/@b/2").unwrap();
        let d = Url::parse("https://fosstodon.org/@b/2").unwrap();
        assert!(same_instance(&a, &b));
        assert!(!same_instance(&a, &c));
        assert!(!same_instance(&a, &d));
    }
}
