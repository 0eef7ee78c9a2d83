use std::sync::LazyLock;

use anyhow::Result;
use async_trait::async_trait;
use axum::http::StatusCode;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, debug_span, Instrument};
use url::Url;

use super::preflight;
use super::reply::{respond_with_screenshot, Reply, ReplyOptions};
use super::sanitize::{capture_marked, mark_for_capture, Sanitizer};
use super::traits::{Renderer, WithFallback};
use super::Services;
use crate::browser::{PageScript, RenderContext, RequestScope, ScreenshotConfig};

/// `/<user>/status/<id>`
static TWEET_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/\w{1,15}/status/(?P<id>\d+)$").unwrap());

/// Extract the tweet id from a canonical tweet path.
#[must_use]
pub fn tweet_id(path: &str) -> Option<&str> {
    TWEET_PATH
        .captures(path)
        .and_then(|caps| caps.name("id"))
        .map(|id| id.as_str())
}

/// Handle an `x.com` post URL.
///
/// # Errors
///
/// Returns an error if rendering fails.
pub async fn handle(services: &Services, scope: &mut RequestScope, url: &Url) -> Result<Reply> {
    let Some(id) = tweet_id(url.path()).map(ToString::to_string) else {
        debug!(url = %url, "Invalid tweet URL");
        return Ok(Reply::with_body(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Invalid tweet URL. Should look something like https://x.com/username/status/1234567890",
        ));
    };

    let span = debug_span!("twitter", tweet = %id);
    async move {
        if !preflight::tweet_exists(&services.http, &services.config.twitter_syndication_url, &id)
            .await
        {
            debug!("Tweet info not found");
            return Ok(Reply::not_found());
        }

        let renderer = WithFallback {
            primary: TweetPage { url: url.clone() },
            secondary: TweetEmbed { url: url.clone() },
        };
        respond_with_screenshot(
            scope,
            services.context_options(),
            &renderer,
            ReplyOptions::new(format!("tweet.{id}")),
        )
        .await
    }
    .instrument(span)
    .await
}

const LOCATE_TWEET: PageScript = PageScript::new(
    "twitter-locate-tweet",
    r#"() => {
        const cell = document.querySelector('[data-testid="cellInnerDiv"]');
        if (!cell) return { found: false, reason: null };
        const tweet = cell.querySelector('[data-testid="tweet"]');
        if (!tweet || !tweet.parentElement) {
            return { found: false, reason: cell.innerText };
        }
        document.querySelectorAll("[data-twitshot-capture]").forEach((el) => {
            el.removeAttribute("data-twitshot-capture");
        });
        tweet.parentElement.setAttribute("data-twitshot-capture", "");
        return { found: true, reason: null };
    }"#,
);

const REMOVE_FOLLOW_AND_DOTS: PageScript = PageScript::new(
    "twitter-remove-follow",
    r#"() => {
        const username = document.querySelector('[data-testid="User-Name"]');
        if (!username) return false;
        let node = username.parentElement;
        while (node && node !== document.body && node.childElementCount === 1) {
            node = node.parentElement;
        }
        if (!node || node === document.body) return false;
        node.lastChild?.remove();
        return true;
    }"#,
);

const TRIM_AFTER_META: PageScript = PageScript::new(
    "twitter-trim-after-meta",
    r#"() => {
        const tweet = document.querySelector("[data-twitshot-capture]");
        const meta = tweet?.querySelector('*[role="group"]:has([role="separator"])');
        let next = meta?.nextSibling;
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

const SHOW_SENSITIVE: PageScript = PageScript::new(
    "twitter-show-sensitive",
    r#"() => {
        const tweet = document.querySelector("[data-twitshot-capture]");
        const settings = tweet?.querySelector('a[href="/settings/content_you_see"]');
        if (!settings) return false;
        const popup = settings.parentNode?.parentNode?.parentNode;
        const view = popup?.querySelector('[role="button"]');
        if (!view) return false;
        view.click();
        return true;
    }"#,
);

const ROUND_CORNERS: PageScript = PageScript::new(
    "twitter-round-corners",
    r#"() => {
        const tweet = document.querySelector("[data-twitshot-capture]");
        if (!tweet) return false;
        tweet.style.borderRadius = "12px";
        tweet.style.marginBottom = "2px";
        return true;
    }"#,
);

const REMOVE_SHARE: PageScript = PageScript::new(
    "twitter-remove-share",
    r#"() => {
        const tweet = document.querySelector("[data-twitshot-capture]");
        const share = tweet?.querySelector('[aria-label="Share post"]')?.parentElement?.parentElement;
        if (!share) return false;
        const siblings = share.parentElement?.children;
        share.remove();
        for (const sibling of siblings ?? []) {
            sibling.style.justifyContent = "center";
        }
        return true;
    }"#,
);

/// Renders the tweet from its own page on x.com.
struct TweetPage {
    url: Url,
}

#[async_trait]
impl Renderer for TweetPage {
    fn name(&self) -> &'static str {
        "twitter-page"
    }

    async fn render(
        &self,
        context: &dyn RenderContext,
        config: &ScreenshotConfig,
    ) -> Result<Option<Vec<u8>>> {
        debug!(url = %self.url, "Start rendering twitter page");
        let page = context.new_page().await?;
        page.goto(self.url.as_str()).await?;
        page.wait_for_network_idle().await?;

        let located = page.run(&LOCATE_TWEET, Value::Null).await?;
        if located["found"] != Value::Bool(true) {
            debug!(reason = %located["reason"], "Tweet not available");
            return Ok(None);
        }

        let sanitizer = Sanitizer::new(page.as_ref(), "twitter", Value::Null);
        // Login and cookie prompts
        sanitizer.remove(&["#layers"]).await;
        sanitizer.steps(&[REMOVE_FOLLOW_AND_DOTS, TRIM_AFTER_META]).await;
        if sanitizer
            .click_through(&SHOW_SENSITIVE, Some(".twimg.com"))
            .await?
        {
            debug!("Enabled sensitive content");
        }
        sanitizer.step(&ROUND_CORNERS).await;
        sanitizer
            .remove(&["[data-twitshot-capture] [data-testid=\"logged_out_read_replies_pivot\"]"])
            .await;
        sanitizer.step(&REMOVE_SHARE).await;
        sanitizer
            .remove(&["div[aria-label=\"Home timeline\"] > :nth-child(1)"])
            .await;

        capture_marked(page.as_ref(), config).await
    }
}

/// Widget iframe created by `widgets.js` once the embed has rendered.
const EMBED_IFRAME: &str = ".twitter-tweet-rendered iframe";

/// Width the embed widget renders at.
const EMBED_WIDTH_PX: u32 = 550;

/// Host page loading the official embed widget for `url`.
fn embed_html(url: &Url) -> String {
    maud::html! {
        (maud::DOCTYPE)
        html {
            head {
                meta charset="utf-8";
                style { "body { margin: 0; background: transparent; }" }
            }
            body {
                blockquote.twitter-tweet data-theme="dark" data-dnt="true" data-width=(EMBED_WIDTH_PX) {
                    a href=(url.as_str()) {}
                }
                script src="https://platform.twitter.com/widgets.js" charset="utf-8" {}
            }
        }
    }
    .into_string()
}

const EMBED_FRAME_SRC: PageScript = PageScript::new(
    "twitter-embed-frame-src",
    r"(args) => document.querySelector(args.selector)?.src ?? null",
);

const EMBED_FIT_WIDTH: PageScript = PageScript::new(
    "twitter-embed-fit-width",
    r#"(args) => {
        const app = document.getElementById("app");
        if (!app) return false;
        app.style.maxWidth = `${args.width}px`;
        document.body.style.background = "transparent";
        return true;
    }"#,
);

const EMBED_REMOVE_RETWEET_LINK: PageScript = PageScript::new(
    "twitter-embed-remove-retweet",
    r#"() => {
        const links = document.querySelectorAll('a[role="link"]');
        const last = links[links.length - 1];
        if (!last?.parentNode) return false;
        last.parentNode.remove();
        return true;
    }"#,
);

const EMBED_REMOVE_COPY_LINK: PageScript = PageScript::new(
    "twitter-embed-remove-copy-link",
    r#"() => {
        const like = document.querySelector('a[role="link"][aria-label^="Like."]');
        const copy = like?.parentNode?.querySelector('div[role="button"]');
        if (!copy) return false;
        copy.remove();
        return true;
    }"#,
);

const EMBED_SHOW_SENSITIVE: PageScript = PageScript::new(
    "twitter-embed-show-sensitive",
    r#"() => {
        const text = document.querySelector('[data-testid="tweetText"]');
        const view = text?.parentNode?.parentNode?.querySelector('[role="button"]');
        if (!view || view.innerText !== "View") return false;
        view.click();
        return true;
    }"#,
);

const EMBED_REMOVE_REPLY_CONTEXT: PageScript = PageScript::new(
    "twitter-embed-remove-reply-context",
    r#"(args) => {
        const backlinks = document.querySelectorAll(
            `a[href*="twitter.com${args.pathname}"], a[href*="x.com${args.pathname}"]`,
        );
        for (const link of backlinks) {
            if (link.textContent?.startsWith("Read the full conversation on")) {
                link.parentNode?.parentNode?.remove();
                break;
            }
        }

        const text = document.querySelector('[data-testid="tweetText"]');
        const tweet = text?.parentNode?.parentNode?.parentNode;
        if (!tweet || tweet.childNodes.length <= 1) return false;
        tweet.removeChild(tweet.childNodes[0]);
        return true;
    }"#,
);

const EMBED_REMOVE_BRANDING: PageScript = PageScript::new(
    "twitter-embed-remove-branding",
    r#"(args) => {
        const backlinks = document.querySelectorAll(
            `a[href*="twitter.com${args.pathname}"], a[href*="x.com${args.pathname}"]`,
        );
        for (const link of backlinks) {
            if (link.textContent?.includes("·")) continue;
            if (link.querySelector('img[src^="https://pbs.twimg.com"]')) continue;
            link.remove();
        }

        document.querySelector('[aria-label="Twitter Ads info and privacy"]')?.remove();
        document.querySelector('[aria-label="X Ads info and privacy"]')?.remove();

        const follow = document.querySelector(
            'a[href^="https://twitter.com/intent/follow"], a[href^="https://x.com/intent/follow"]',
        );
        follow?.parentNode?.remove();
        return true;
    }"#,
);

/// Renders the tweet through the official embed widget.
///
/// The widget draws into a cross-origin iframe, so once it has rendered the
/// page navigates to the iframe's own document and cleans that up.
struct TweetEmbed {
    url: Url,
}

#[async_trait]
impl Renderer for TweetEmbed {
    fn name(&self) -> &'static str {
        "twitter-embed"
    }

    async fn render(
        &self,
        context: &dyn RenderContext,
        config: &ScreenshotConfig,
    ) -> Result<Option<Vec<u8>>> {
        debug!(url = %self.url, "Start rendering embedded page");
        let page = context.new_page().await?;
        page.set_content(&embed_html(&self.url)).await?;
        page.wait_for_network_idle().await?;

        if !page.wait_for_selector(EMBED_IFRAME).await? {
            debug!("Embed widget never rendered");
            return Ok(None);
        }
        let src = page
            .run(&EMBED_FRAME_SRC, json!({ "selector": EMBED_IFRAME }))
            .await?;
        let Some(src) = src.as_str().filter(|src| !src.is_empty()) else {
            debug!("Embed iframe has no source");
            return Ok(None);
        };

        page.goto(src).await?;
        page.wait_for_network_idle().await?;

        let sanitizer = Sanitizer::new(
            page.as_ref(),
            "twitter-embed",
            json!({ "pathname": self.url.path(), "width": EMBED_WIDTH_PX }),
        );
        sanitizer
            .steps(&[
                EMBED_FIT_WIDTH,
                EMBED_REMOVE_RETWEET_LINK,
                EMBED_REMOVE_COPY_LINK,
            ])
            .await;
        if sanitizer
            .click_through(&EMBED_SHOW_SENSITIVE, Some(".twimg.com"))
            .await?
        {
            debug!("Enabled sensitive content");
        }
        sanitizer
            .steps(&[EMBED_REMOVE_REPLY_CONTEXT, EMBED_REMOVE_BRANDING])
            .await;

        if !mark_for_capture(page.as_ref(), "#app").await? {
            debug!("Embed has no #app element");
            return Ok(None);
        }
        capture_marked(page.as_ref(), config).await
    }
}
