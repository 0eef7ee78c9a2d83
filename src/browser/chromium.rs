//! Chromium engine driven over CDP with chromiumoxide.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::{
    MediaFeature, SetDeviceMetricsOverrideParams, SetEmulatedMediaParams, SetLocaleOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    Headers, SetBlockedUrLsParams, SetExtraHttpHeadersParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, CaptureScreenshotFormat, Viewport,
};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::network::NetworkMonitor;
use super::{
    BrowserEngine, CaptureTarget, ContextOptions, EngineKind, ImageFormat, PageScript,
    RenderContext, RenderPage, ResponseMark, ScreenshotConfig, NETWORK_IDLE_QUIET, WAIT_TIMEOUT,
};

const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Chromium launch configuration.
#[derive(Debug, Clone, Default)]
pub struct ChromiumConfig {
    /// Path to Chrome/Chromium executable (None for auto-detection).
    pub chrome_path: Option<String>,
}

/// One Chromium process shared by every request.
pub struct ChromiumEngine {
    browser: Arc<Mutex<Browser>>,
    screenshot: ScreenshotConfig,
}

impl ChromiumEngine {
    /// Launch the browser.
    ///
    /// # Errors
    ///
    /// Returns an error if Chromium cannot be started.
    pub async fn launch(config: &ChromiumConfig) -> Result<Self> {
        info!("Launching headless browser");

        let mut config_builder = BrowserConfig::builder()
            .viewport(None)
            .no_sandbox()
            .disable_default_args()
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-software-rasterizer")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-background-networking")
            .arg("--disable-extensions")
            .arg("--disable-sync")
            .arg("--disable-translate")
            .arg("--mute-audio")
            .arg("--hide-scrollbars");

        if let Some(ref chrome_path) = config.chrome_path {
            config_builder = config_builder.chrome_executable(chrome_path);
        }

        let browser_config = config_builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .context("Failed to launch browser")?;

        // Spawn handler in background
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error: {e}");
                }
            }
        });

        info!("Headless browser ready");

        Ok(Self {
            browser: Arc::new(Mutex::new(browser)),
            screenshot: ScreenshotConfig::for_engine(EngineKind::Chromium),
        })
    }
}

#[async_trait]
impl BrowserEngine for ChromiumEngine {
    fn screenshot_config(&self) -> ScreenshotConfig {
        self.screenshot
    }

    async fn new_context(&self, options: ContextOptions) -> Result<Box<dyn RenderContext>> {
        let id = self
            .browser
            .lock()
            .await
            .create_browser_context(CreateBrowserContextParams::default())
            .await
            .context("Failed to create browser context")?;

        debug!(context = ?id, "Created browser context");

        Ok(Box::new(ChromiumContext {
            browser: Arc::clone(&self.browser),
            id,
            options,
        }))
    }

    async fn shutdown(&self) {
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            error!("Failed to close browser: {e}");
        } else {
            info!("Browser shutdown complete");
        }
    }
}

struct ChromiumContext {
    browser: Arc<Mutex<Browser>>,
    id: BrowserContextId,
    options: ContextOptions,
}

#[async_trait]
impl RenderContext for ChromiumContext {
    async fn new_page(&self) -> Result<Box<dyn RenderPage>> {
        let params = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(self.id.clone())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build target params: {e}"))?;

        let page = self
            .browser
            .lock()
            .await
            .new_page(params)
            .await
            .context("Failed to create new page")?;

        let network = NetworkMonitor::attach(&page).await?;
        apply_emulation(&page, &self.options).await?;

        Ok(Box::new(ChromiumPage {
            page,
            network,
            navigation_timeout: self.options.navigation_timeout,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.browser
            .lock()
            .await
            .dispose_browser_context(self.id.clone())
            .await
            .context("Failed to dispose browser context")?;
        debug!(context = ?self.id, "Disposed browser context");
        Ok(())
    }
}

/// Apply per-context emulation to a freshly created page.
async fn apply_emulation(page: &Page, options: &ContextOptions) -> Result<()> {
    let dims = options.dimensions;
    page.execute(SetDeviceMetricsOverrideParams::new(
        i64::from(dims.width),
        i64::from(dims.height),
        dims.scale_factor,
        false,
    ))
    .await
    .context("Failed to set viewport")?;

    page.execute(
        SetLocaleOverrideParams::builder()
            .locale(options.locale.clone())
            .build(),
    )
    .await
    .context("Failed to set locale")?;

    let scheme = if options.dark_mode { "dark" } else { "light" };
    page.execute(
        SetEmulatedMediaParams::builder()
            .feature(MediaFeature::new("prefers-color-scheme", scheme))
            .build(),
    )
    .await
    .context("Failed to set color scheme")?;

    let mut headers = serde_json::Map::new();
    headers.insert(
        "Accept-Language".to_string(),
        Value::String(options.locale.clone()),
    );
    for (name, value) in &options.extra_headers {
        headers.insert(name.clone(), Value::String(value.clone()));
    }
    page.execute(SetExtraHttpHeadersParams::new(Headers::new(Value::Object(
        headers,
    ))))
    .await
    .context("Failed to set extra headers")?;

    for seed in &options.local_storage {
        let source = format!(
            "(() => {{ const seed = {}; if (location.origin === seed.origin && window.localStorage.getItem(seed.key) === null) {{ window.localStorage.setItem(seed.key, seed.value); }} }})()",
            json!({ "origin": seed.origin, "key": seed.key, "value": seed.value })
        );
        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(source))
            .await
            .context("Failed to seed local storage")?;
    }

    Ok(())
}

struct ChromiumPage {
    page: Page,
    network: NetworkMonitor,
    navigation_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct Rect {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

const ELEMENT_RECT: PageScript = PageScript::new(
    "element-rect",
    r#"(args) => {
        const el = document.querySelector(args.selector);
        if (!el) return null;
        el.scrollIntoView({ block: "nearest", inline: "nearest" });
        const rect = el.getBoundingClientRect();
        return {
            x: rect.left + window.scrollX,
            y: rect.top + window.scrollY,
            width: rect.width,
            height: rect.height,
        };
    }"#,
);

const SELECTOR_EXISTS: PageScript = PageScript::new(
    "selector-exists",
    r"(args) => document.querySelector(args.selector) !== null",
);

const ADD_STYLE: PageScript = PageScript::new(
    "add-style",
    r#"(args) => {
        const style = document.createElement("style");
        style.textContent = args.css;
        (document.head || document.documentElement).appendChild(style);
        return true;
    }"#,
);

impl ChromiumPage {
    async fn navigate<F, Fut>(&self, what: &str, f: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send,
        Fut: std::future::Future<Output = Result<()>> + Send,
    {
        self.network.reset_in_flight();
        tokio::time::timeout(self.navigation_timeout, f())
            .await
            .with_context(|| {
                format!(
                    "{what} timed out after {}s",
                    self.navigation_timeout.as_secs()
                )
            })?
    }
}

#[async_trait]
impl RenderPage for ChromiumPage {
    async fn block_urls(&self, urls: &[&str]) -> Result<()> {
        let urls = urls.iter().map(ToString::to_string).collect();
        self.page
            .execute(SetBlockedUrLsParams::new(urls))
            .await
            .context("Failed to block URLs")?;
        Ok(())
    }

    async fn goto(&self, url: &str) -> Result<()> {
        self.navigate("Navigation", || async {
            self.page
                .goto(url)
                .await
                .with_context(|| format!("Failed to navigate to {url}"))?;
            Ok(())
        })
        .await
    }

    async fn set_content(&self, html: &str) -> Result<()> {
        self.navigate("Setting content", || async {
            self.page
                .set_content(html)
                .await
                .context("Failed to set page content")?;
            Ok(())
        })
        .await
    }

    async fn reload(&self) -> Result<()> {
        self.navigate("Reload", || async {
            self.page.reload().await.context("Failed to reload page")?;
            Ok(())
        })
        .await
    }

    async fn wait_for_network_idle(&self) -> Result<()> {
        self.network
            .wait_for_idle(NETWORK_IDLE_QUIET, WAIT_TIMEOUT)
            .await
    }

    async fn wait_for_selector(&self, selector: &str) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            if self.exists(selector).await? {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                debug!(selector, "Timed out waiting for selector");
                return Ok(false);
            }
            tokio::time::sleep(SELECTOR_POLL_INTERVAL).await;
        }
    }

    async fn response_mark(&self) -> ResponseMark {
        self.network.mark()
    }

    async fn wait_for_response(&self, host_suffix: &str, since: ResponseMark) -> Result<()> {
        self.network
            .wait_for_response(host_suffix, since, WAIT_TIMEOUT)
            .await
    }

    async fn exists(&self, selector: &str) -> Result<bool> {
        let value = self
            .run(&SELECTOR_EXISTS, json!({ "selector": selector }))
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn run(&self, script: &PageScript, args: Value) -> Result<Value> {
        let params = EvaluateParams::builder()
            .expression(script.invocation(&args))
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build evaluate params: {e}"))?;

        let result = self
            .page
            .evaluate_expression(params)
            .await
            .with_context(|| format!("Script {} failed", script.name))?;

        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    async fn add_style(&self, css: &str) -> Result<()> {
        self.run(&ADD_STYLE, json!({ "css": css })).await?;
        Ok(())
    }

    async fn capture(
        &self,
        target: &CaptureTarget,
        config: &ScreenshotConfig,
    ) -> Result<Option<Vec<u8>>> {
        let format = match config.format {
            ImageFormat::Png => CaptureScreenshotFormat::Png,
            ImageFormat::Jpeg => CaptureScreenshotFormat::Jpeg,
        };

        let mut params = ScreenshotParams::builder()
            .format(format)
            .omit_background(config.omit_background);
        if let Some(quality) = config.quality {
            params = params.quality(i64::from(quality));
        }

        if let CaptureTarget::Element(selector) = target {
            let rect = self
                .run(&ELEMENT_RECT, json!({ "selector": selector }))
                .await?;
            if rect.is_null() {
                return Ok(None);
            }
            let rect: Rect = serde_json::from_value(rect).context("Invalid element rect")?;
            if rect.width <= 0.0 || rect.height <= 0.0 {
                warn!(selector = %selector, "Capture target has no size");
                return Ok(None);
            }
            params = params
                .clip(Viewport {
                    x: rect.x,
                    y: rect.y,
                    width: rect.width,
                    height: rect.height,
                    scale: 1.0,
                })
                .capture_beyond_viewport(true);
        }

        let bytes = self
            .page
            .screenshot(params.build())
            .await
            .context("Failed to capture screenshot")?;
        Ok(Some(bytes))
    }
}
