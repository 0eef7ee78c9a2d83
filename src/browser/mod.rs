//! Browser automation.
//!
//! Renderers talk to the browser through three traits: a [`BrowserEngine`]
//! owning the long-lived browser process, one [`RenderContext`] per request
//! (isolated cookies, storage and emulation settings) and the [`RenderPage`]s
//! opened inside it. In-page code crosses the boundary as a [`PageScript`]
//! plus a JSON payload and only plain JSON comes back.

mod chromium;
mod network;
mod scope;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

pub use chromium::{ChromiumConfig, ChromiumEngine};
pub use scope::{generate_request_id, to_base36, RequestScope};

/// Default viewport width in CSS pixels.
pub const DEFAULT_VIEWPORT_WIDTH: u32 = 1152;

/// Default viewport height in CSS pixels.
pub const DEFAULT_VIEWPORT_HEIGHT: u32 = 1536;

/// Default device scale factor.
pub const DEFAULT_SCALE_FACTOR: f64 = 2.0;

/// Navigation timeout applied to every page.
pub const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(35);

/// Timeout for explicit waits (selectors, network idle, responses).
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Quiet period after which the network counts as idle.
pub const NETWORK_IDLE_QUIET: Duration = Duration::from_millis(500);

/// Image encoding produced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
        }
    }

    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
        }
    }
}

/// Browser family behind an engine; decides the screenshot encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Chromium,
    Other,
}

/// Screenshot encoding, fixed for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenshotConfig {
    pub format: ImageFormat,
    /// JPEG quality; ignored for PNG.
    pub quality: Option<u8>,
    /// Render with a transparent page background.
    pub omit_background: bool,
}

impl ScreenshotConfig {
    #[must_use]
    pub fn for_engine(kind: EngineKind) -> Self {
        match kind {
            EngineKind::Chromium => Self {
                format: ImageFormat::Png,
                quality: None,
                omit_background: true,
            },
            EngineKind::Other => Self {
                format: ImageFormat::Jpeg,
                quality: Some(85),
                omit_background: false,
            },
        }
    }
}

/// Viewport emulation for a context.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
    pub scale_factor: f64,
}

impl Default for Dimensions {
    fn default() -> Self {
        Self::clamped(None, None, None)
    }
}

impl Dimensions {
    /// Build dimensions from optional user overrides.
    ///
    /// Width and height are clamped to `100..=3000`, the scale to `0.5..=3`,
    /// and the resulting CSS viewport is the clamped size times the scale.
    #[must_use]
    pub fn clamped(width: Option<f64>, height: Option<f64>, scale_factor: Option<f64>) -> Self {
        let pick = |value: Option<f64>, default: f64| {
            value.filter(|v| v.is_finite() && *v != 0.0).unwrap_or(default)
        };

        let scale = pick(scale_factor, DEFAULT_SCALE_FACTOR).clamp(0.5, 3.0);
        let width = pick(width, f64::from(DEFAULT_VIEWPORT_WIDTH)).clamp(100.0, 3000.0) * scale;
        let height = pick(height, f64::from(DEFAULT_VIEWPORT_HEIGHT)).clamp(100.0, 3000.0) * scale;

        Self {
            width: width.round() as u32,
            height: height.round() as u32,
            scale_factor: scale,
        }
    }
}

/// A local-storage entry present before any page script runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSeed {
    pub origin: String,
    pub key: String,
    pub value: String,
}

/// Settings for a new isolated browsing context.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub dimensions: Dimensions,
    pub locale: String,
    pub dark_mode: bool,
    pub extra_headers: Vec<(String, String)>,
    pub local_storage: Vec<StorageSeed>,
    pub navigation_timeout: Duration,
}

impl ContextOptions {
    /// Standard context: default dimensions, `en-US`, dark color scheme and the
    /// identifying headers every render sends.
    #[must_use]
    pub fn new(application_info: &str) -> Self {
        Self {
            dimensions: Dimensions::default(),
            locale: "en-US".to_string(),
            dark_mode: true,
            extra_headers: vec![
                ("x-application".to_string(), application_info.to_string()),
                ("x-is-twitshot".to_string(), "true".to_string()),
            ],
            local_storage: Vec::new(),
            navigation_timeout: NAVIGATION_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_dimensions(mut self, dimensions: Dimensions) -> Self {
        self.dimensions = dimensions;
        self
    }

    #[must_use]
    pub fn with_local_storage(mut self, seed: StorageSeed) -> Self {
        self.local_storage.push(seed);
        self
    }
}

/// In-page function source plus a name for logs.
///
/// `source` must be a JavaScript function expression taking a single argument
/// (the JSON payload) and returning JSON-serializable data. It may be async.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageScript {
    pub name: &'static str,
    pub source: &'static str,
}

impl PageScript {
    #[must_use]
    pub const fn new(name: &'static str, source: &'static str) -> Self {
        Self { name, source }
    }

    /// Expression invoking the script with `args`.
    #[must_use]
    pub fn invocation(&self, args: &Value) -> String {
        format!("({})({})", self.source, args)
    }
}

/// What to capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureTarget {
    /// Bounding box of the first element matching a selector.
    Element(String),
    /// The visible viewport.
    Viewport,
}

/// Position in a page's response log, used to wait for responses that arrive
/// after some action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ResponseMark(pub usize);

/// Long-lived browser process.
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    /// Encoding used for every screenshot this engine produces.
    fn screenshot_config(&self) -> ScreenshotConfig;

    /// Create an isolated browsing context.
    async fn new_context(&self, options: ContextOptions) -> Result<Box<dyn RenderContext>>;

    /// Terminate the browser process.
    async fn shutdown(&self) {}
}

/// Isolated browsing context owned by exactly one request.
#[async_trait]
pub trait RenderContext: Send + Sync {
    async fn new_page(&self) -> Result<Box<dyn RenderPage>>;

    /// Close the context and every page in it.
    async fn close(&self) -> Result<()>;
}

/// A tab inside a [`RenderContext`].
#[async_trait]
pub trait RenderPage: Send + Sync {
    /// Fail requests to these exact URLs.
    async fn block_urls(&self, urls: &[&str]) -> Result<()>;

    /// Navigate and wait for the load event.
    async fn goto(&self, url: &str) -> Result<()>;

    /// Replace the document with `html`.
    async fn set_content(&self, html: &str) -> Result<()>;

    async fn reload(&self) -> Result<()>;

    /// Wait until no requests have been in flight for [`NETWORK_IDLE_QUIET`].
    async fn wait_for_network_idle(&self) -> Result<()>;

    /// Wait for `selector` to match. Returns `false` if it never did before
    /// [`WAIT_TIMEOUT`].
    async fn wait_for_selector(&self, selector: &str) -> Result<bool>;

    /// Current end of the response log.
    async fn response_mark(&self) -> ResponseMark;

    /// Wait for a response whose host ends with `host_suffix`, received after
    /// `since`.
    async fn wait_for_response(&self, host_suffix: &str, since: ResponseMark) -> Result<()>;

    /// Whether `selector` currently matches anything.
    async fn exists(&self, selector: &str) -> Result<bool>;

    /// Run an in-page script and return its JSON result.
    async fn run(&self, script: &PageScript, args: Value) -> Result<Value>;

    /// Inject a stylesheet.
    async fn add_style(&self, css: &str) -> Result<()>;

    /// Screenshot a target. `None` when an element target does not exist.
    async fn capture(
        &self,
        target: &CaptureTarget,
        config: &ScreenshotConfig,
    ) -> Result<Option<Vec<u8>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_screenshot_config_per_engine() {
        let chromium = ScreenshotConfig::for_engine(EngineKind::Chromium);
        assert_eq!(chromium.format, ImageFormat::Png);
        assert!(chromium.omit_background);

        let other = ScreenshotConfig::for_engine(EngineKind::Other);
        assert_eq!(other.format, ImageFormat::Jpeg);
        assert_eq!(other.quality, Some(85));
        assert!(!other.omit_background);
    }

    #[test]
    fn test_default_dimensions() {
        let dims = Dimensions::default();
        assert_eq!(dims.width, 2304);
        assert_eq!(dims.height, 3072);
        assert!((dims.scale_factor - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_dimensions_are_clamped() {
        let dims = Dimensions::clamped(Some(50.0), Some(9000.0), Some(1.0));
        assert_eq!(dims.width, 100);
        assert_eq!(dims.height, 3000);

        let dims = Dimensions::clamped(Some(800.0), Some(600.0), Some(10.0));
        assert!((dims.scale_factor - 3.0).abs() < f64::EPSILON);
        assert_eq!(dims.width, 2400);
        assert_eq!(dims.height, 1800);

        let dims = Dimensions::clamped(None, None, Some(0.1));
        assert!((dims.scale_factor - 0.5).abs() < f64::EPSILON);
        assert_eq!(dims.width, 576);
    }

    #[test]
    fn test_script_invocation() {
        let script = PageScript::new("noop", "(args) => args.value");
        let expr = script.invocation(&serde_json::json!({"value": 1}));
        assert_eq!(expr, r#"((args) => args.value)({"value":1})"#);
    }

    #[test]
    fn test_context_options_headers() {
        let options = ContextOptions::new("app-info");
        assert_eq!(options.locale, "en-US");
        assert!(options.dark_mode);
        assert!(options
            .extra_headers
            .contains(&("x-application".to_string(), "app-info".to_string())));
        assert!(options
            .extra_headers
            .contains(&("x-is-twitshot".to_string(), "true".to_string())));
    }
}
