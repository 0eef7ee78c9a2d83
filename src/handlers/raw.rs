//! Generic screenshots of arbitrary pages.
//!
//! Options ride along as `$$`-prefixed query parameters so that the rest of
//! the query string can be forwarded to the target untouched.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use axum::http::StatusCode;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde_json::Value;
use tracing::{debug, debug_span, Instrument};
use url::form_urlencoded;
use url::Url;

use super::reply::{respond_with_screenshot, Reply, ReplyOptions, ScreenshotResponseError};
use super::sanitize::{capture_marked, mark_for_capture, Sanitizer};
use super::traits::Renderer;
use super::Services;
use crate::blocklist::{resolve_host, BLOCKED_IPS};
use crate::bluesky::STORAGE_KEY;
use crate::browser::{
    to_base36, CaptureTarget, Dimensions, RenderContext, RequestScope, ScreenshotConfig,
    StorageSeed,
};
use crate::constants::RAW_CACHE_SECS;

/// Prefix marking a query parameter as a screenshot option.
pub const OPTION_PREFIX: &str = "$$";

/// Scale factor used when the request does not set one.
pub const DEFAULT_RAW_SCALE_FACTOR: f64 = 1.5;

const BSKY_ORIGIN: &str = "https://bsky.app";

/// Limits of a numeric option, rendered as `<input type="number">` attributes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumberLimits {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

/// A user-facing raw screenshot option.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawOption {
    pub name: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub placeholder: Option<&'static str>,
    pub number: Option<NumberLimits>,
}

/// Every option the raw mode understands, in form order.
pub static RAW_OPTIONS: &[RawOption] = &[
    RawOption {
        name: "selectElement",
        title: "Element to screenshot",
        description: "CSS selector for which element to screenshot. Will capture the entire element irregardless of page size.",
        placeholder: None,
        number: None,
    },
    RawOption {
        name: "removeElements",
        title: "Elements to remove",
        description: "Comma-separated list of CSS selectors to remove from the page before taking the screenshot. Useful for removing annoying elements like login banners or simple ads.",
        placeholder: Some("body > footer, #an-ad-banner, .my-annoying-element"),
        number: None,
    },
    RawOption {
        name: "waitForElement",
        title: "Wait for element to be present",
        description: "CSS selector which determines which element to wait for to be present on the page before taking the screenshot. Useful for SPAs where the page is loaded asynchronously.",
        placeholder: None,
        number: None,
    },
    RawOption {
        name: "pageWidthPx",
        title: "Page width",
        description: "Width of the page in pixels.",
        placeholder: Some("1152"),
        number: Some(NumberLimits {
            min: 100.0,
            max: 3000.0,
            step: 10.0,
        }),
    },
    RawOption {
        name: "pageHeightPx",
        title: "Page height",
        description: "Height of the page in pixels.",
        placeholder: Some("1536"),
        number: Some(NumberLimits {
            min: 100.0,
            max: 3000.0,
            step: 10.0,
        }),
    },
    RawOption {
        name: "pageScaleFactor",
        title: "Page scale factor",
        description: "Scale factor of the page from 0.5 to 3. Used to \"zoom\" the page which in practice means smaller or clearer screenshots.",
        placeholder: Some("1.5"),
        number: Some(NumberLimits {
            min: 0.5,
            max: 3.0,
            step: 0.5,
        }),
    },
];

/// Options parsed from `$$` query parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawOptions {
    pub select_element: Option<String>,
    pub remove_elements: Vec<String>,
    pub wait_for_element: Option<String>,
    pub page_width_px: Option<f64>,
    pub page_height_px: Option<f64>,
    pub page_scale_factor: Option<f64>,
}

impl RawOptions {
    /// Collect options from a query string. Unknown and empty options are
    /// ignored, as are parameters without the `$$` prefix.
    #[must_use]
    pub fn from_query(query: &str) -> Self {
        let mut options = Self::default();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            let Some(name) = key.strip_prefix(OPTION_PREFIX) else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            let number = || value.parse::<f64>().ok().filter(|v| v.is_finite());
            match name {
                "selectElement" => options.select_element = Some(value.to_string()),
                "removeElements" => {
                    options.remove_elements = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(ToString::to_string)
                        .collect();
                }
                "waitForElement" => options.wait_for_element = Some(value.to_string()),
                "pageWidthPx" => options.page_width_px = number(),
                "pageHeightPx" => options.page_height_px = number(),
                "pageScaleFactor" => options.page_scale_factor = number(),
                other => debug!(option = other, "Ignoring unknown raw option"),
            }
        }
        options
    }

    /// Viewport for the render, defaulting the scale to
    /// [`DEFAULT_RAW_SCALE_FACTOR`].
    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        let scale = self
            .page_scale_factor
            .filter(|s| *s != 0.0)
            .unwrap_or(DEFAULT_RAW_SCALE_FACTOR);
        Dimensions::clamped(self.page_width_px, self.page_height_px, Some(scale))
    }
}

/// Build the page URL from the wildcard path segment and the request query.
///
/// The request query replaces any query in `raw`, minus the option
/// parameters. Returns `None` if `raw` is not an absolute URL.
#[must_use]
pub fn target_url(raw: &str, query: Option<&str>) -> Option<Url> {
    let mut url = Url::parse(raw).ok()?;
    let forwarded = query
        .map(|q| {
            form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .filter(|(key, _)| !key.starts_with(OPTION_PREFIX))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    if forwarded.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(forwarded);
    }
    Some(url)
}

/// Where `POST /raw` sends the browser.
///
/// # Errors
///
/// `415` when no URL was submitted, `400` when it does not parse.
pub fn redirect_location(form: &[(String, String)]) -> Result<String, StatusCode> {
    let url = form
        .iter()
        .find(|(key, _)| key == "url")
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
        .ok_or(StatusCode::UNSUPPORTED_MEDIA_TYPE)?;
    if Url::parse(url).is_err() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let params = form
        .iter()
        .filter(|(key, value)| key != "url" && !value.is_empty())
        .fold(form_urlencoded::Serializer::new(String::new()), |mut s, (k, v)| {
            s.append_pair(k, v);
            s
        })
        .finish();

    if params.is_empty() {
        Ok(format!("/http-raw/{url}"))
    } else {
        Ok(format!("/http-raw/{url}?{params}"))
    }
}

fn raw_filename(url: &Url) -> String {
    let origin = URL_SAFE_NO_PAD.encode(url.origin().ascii_serialization());
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis());
    format!("raw.{origin}.{}", to_base36(millis))
}

/// Screenshot an arbitrary page.
///
/// The target host is resolved before any browser work; hosts resolving into
/// a blocked range are refused.
///
/// # Errors
///
/// Returns an error if rendering fails.
pub async fn handle(
    services: &Services,
    scope: &mut RequestScope,
    url: Url,
    options: RawOptions,
) -> Result<Reply> {
    let span = debug_span!("raw", raw = %url);
    async move {
        debug!("Raw URL");
        if !matches!(url.scheme(), "http" | "https") {
            return Ok(Reply::with_body(
                StatusCode::BAD_REQUEST,
                format!("Unsupported URL scheme {:?}", url.scheme()),
            ));
        }
        let Some(host) = url.host_str() else {
            return Ok(Reply::status(StatusCode::BAD_REQUEST));
        };

        let ips = match resolve_host(host).await {
            Ok(ips) => ips,
            Err(e) => {
                debug!("DNS lookup failed: {e:#}");
                return Ok(Reply::with_body(
                    StatusCode::BAD_REQUEST,
                    format!("Could not resolve {host:?}"),
                ));
            }
        };
        debug!(host, ips = ?ips, "Resolved");

        if ips.iter().any(|ip| BLOCKED_IPS.check(*ip)) {
            return Ok(Reply::with_body(
                StatusCode::FORBIDDEN,
                format!(
                    "Some domain IPs resolve to restricted IPs: {}",
                    ips.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
                ),
            ));
        }

        let dimensions = options.dimensions();
        debug!(?dimensions, "Using browser dimensions");
        let mut context_options = services.context_options().with_dimensions(dimensions);
        let origin = url.origin().ascii_serialization();
        if origin == BSKY_ORIGIN {
            if let Some(blob) = services.bluesky.session_blob().await {
                context_options = context_options.with_local_storage(StorageSeed {
                    origin,
                    key: STORAGE_KEY.to_string(),
                    value: blob,
                });
            }
        }

        let filename = raw_filename(&url);
        let renderer = RawPage { url, options };
        respond_with_screenshot(
            scope,
            context_options,
            &renderer,
            ReplyOptions::new(filename).cache_for(RAW_CACHE_SECS),
        )
        .await
    }
    .instrument(span)
    .await
}

struct RawPage {
    url: Url,
    options: RawOptions,
}

#[async_trait]
impl Renderer for RawPage {
    fn name(&self) -> &'static str {
        "raw"
    }

    async fn render(
        &self,
        context: &dyn RenderContext,
        config: &ScreenshotConfig,
    ) -> Result<Option<Vec<u8>>> {
        debug!(url = %self.url, "Start rendering raw page");
        let page = context.new_page().await?;
        page.goto(self.url.as_str()).await?;

        if let Some(selector) = &self.options.wait_for_element {
            debug!(selector, "Waiting for element");
            if !page.wait_for_selector(selector).await? {
                return Err(ScreenshotResponseError::new(
                    StatusCode::NOT_FOUND,
                    format!("Element did not appear: {selector}"),
                )
                .into());
            }
        }
        debug!("Waiting for page to load");
        page.wait_for_network_idle().await?;

        let sanitizer = Sanitizer::new(page.as_ref(), "raw", Value::Null);
        if !self.options.remove_elements.is_empty() {
            debug!(selectors = ?self.options.remove_elements, "Removing elements");
            let selectors: Vec<&str> = self
                .options
                .remove_elements
                .iter()
                .map(String::as_str)
                .collect();
            sanitizer.remove(&selectors).await;
        }

        debug!("Taking screenshot");
        let Some(selector) = &self.options.select_element else {
            return page.capture(&CaptureTarget::Viewport, config).await;
        };

        let found = match mark_for_capture(page.as_ref(), selector).await {
            Ok(found) => found,
            Err(e) => {
                debug!("Invalid selector: {e:#}");
                false
            }
        };
        if !found {
            debug!("Element not found");
            return Err(ScreenshotResponseError::new(
                StatusCode::NOT_FOUND,
                format!("Selected element not found: {selector}"),
            )
            .into());
        }
        capture_marked(page.as_ref(), config).await
    }
}
