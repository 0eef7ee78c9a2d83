//! Shared fixtures for integration tests: a scriptable browser engine and an
//! app builder wired to it.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, Response};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use twitshot::bluesky::BlueskyService;
use twitshot::browser::{
    BrowserEngine, CaptureTarget, ContextOptions, EngineKind, PageScript, RenderContext,
    RenderPage, ResponseMark, ScreenshotConfig,
};
use twitshot::config::Config;
use twitshot::handlers::Services;
use twitshot::web::{create_app, AppState, MemoryStore, RateLimiter};

/// How fake pages answer.
#[derive(Default)]
pub struct Behavior {
    script_results: HashMap<&'static str, Value>,
    capture: Option<Vec<u8>>,
    selectors_match: bool,
    fail_goto: bool,
    panic_on_goto: bool,
}

impl Behavior {
    pub fn new() -> Self {
        Self::default()
    }

    /// Result returned by the script with this name. Unlisted scripts return `null`.
    pub fn script(mut self, name: &'static str, result: Value) -> Self {
        self.script_results.insert(name, result);
        self
    }

    /// Bytes every capture returns.
    pub fn capture(mut self, bytes: &[u8]) -> Self {
        self.capture = Some(bytes.to_vec());
        self
    }

    /// Make `exists` and `wait_for_selector` succeed.
    pub fn selectors_match(mut self) -> Self {
        self.selectors_match = true;
        self
    }

    pub fn fail_goto(mut self) -> Self {
        self.fail_goto = true;
        self
    }

    pub fn panic_on_goto(mut self) -> Self {
        self.panic_on_goto = true;
        self
    }

    pub fn build(self) -> Arc<FakeEngine> {
        Arc::new(FakeEngine {
            behavior: Arc::new(self),
            log: Arc::new(Log::default()),
        })
    }
}

/// Everything the fake engine saw.
#[derive(Default)]
pub struct Log {
    contexts_opened: AtomicUsize,
    contexts_closed: AtomicUsize,
    options: Mutex<Vec<ContextOptions>>,
    gotos: Mutex<Vec<String>>,
    scripts: Mutex<Vec<String>>,
    captures: Mutex<Vec<CaptureTarget>>,
}

pub struct FakeEngine {
    behavior: Arc<Behavior>,
    log: Arc<Log>,
}

impl FakeEngine {
    pub fn contexts_opened(&self) -> usize {
        self.log.contexts_opened.load(Ordering::SeqCst)
    }

    pub fn contexts_closed(&self) -> usize {
        self.log.contexts_closed.load(Ordering::SeqCst)
    }

    pub fn context_options(&self) -> Vec<ContextOptions> {
        self.log.options.lock().unwrap().clone()
    }

    pub fn gotos(&self) -> Vec<String> {
        self.log.gotos.lock().unwrap().clone()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.log.scripts.lock().unwrap().clone()
    }

    pub fn captures(&self) -> Vec<CaptureTarget> {
        self.log.captures.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrowserEngine for FakeEngine {
    fn screenshot_config(&self) -> ScreenshotConfig {
        ScreenshotConfig::for_engine(EngineKind::Chromium)
    }

    async fn new_context(&self, options: ContextOptions) -> Result<Box<dyn RenderContext>> {
        self.log.contexts_opened.fetch_add(1, Ordering::SeqCst);
        self.log.options.lock().unwrap().push(options);
        Ok(Box::new(FakeContext {
            behavior: Arc::clone(&self.behavior),
            log: Arc::clone(&self.log),
        }))
    }
}

struct FakeContext {
    behavior: Arc<Behavior>,
    log: Arc<Log>,
}

#[async_trait]
impl RenderContext for FakeContext {
    async fn new_page(&self) -> Result<Box<dyn RenderPage>> {
        Ok(Box::new(FakePage {
            behavior: Arc::clone(&self.behavior),
            log: Arc::clone(&self.log),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.log.contexts_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakePage {
    behavior: Arc<Behavior>,
    log: Arc<Log>,
}

#[async_trait]
impl RenderPage for FakePage {
    async fn block_urls(&self, _urls: &[&str]) -> Result<()> {
        Ok(())
    }

    async fn goto(&self, url: &str) -> Result<()> {
        self.log.gotos.lock().unwrap().push(url.to_string());
        if self.behavior.panic_on_goto {
            panic!("renderer blew up");
        }
        if self.behavior.fail_goto {
            anyhow::bail!("navigation timed out");
        }
        Ok(())
    }

    async fn set_content(&self, _html: &str) -> Result<()> {
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        Ok(())
    }

    async fn wait_for_network_idle(&self) -> Result<()> {
        Ok(())
    }

    async fn wait_for_selector(&self, _selector: &str) -> Result<bool> {
        Ok(self.behavior.selectors_match)
    }

    async fn response_mark(&self) -> ResponseMark {
        ResponseMark::default()
    }

    async fn wait_for_response(&self, _host_suffix: &str, _since: ResponseMark) -> Result<()> {
        Ok(())
    }

    async fn exists(&self, _selector: &str) -> Result<bool> {
        Ok(self.behavior.selectors_match)
    }

    async fn run(&self, script: &PageScript, _args: Value) -> Result<Value> {
        self.log.scripts.lock().unwrap().push(script.name.to_string());
        Ok(self
            .behavior
            .script_results
            .get(script.name)
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn add_style(&self, _css: &str) -> Result<()> {
        Ok(())
    }

    async fn capture(
        &self,
        target: &CaptureTarget,
        _config: &ScreenshotConfig,
    ) -> Result<Option<Vec<u8>>> {
        self.log.captures.lock().unwrap().push(target.clone());
        Ok(self.behavior.capture.clone())
    }
}

/// Test configuration pointing upstream APIs at `upstream`.
pub fn test_config(upstream: &str) -> Config {
    let mut config = Config::for_testing();
    config.twitter_syndication_url = upstream.to_string();
    config.bsky_service_url = upstream.to_string();
    config
}

/// Application router backed by `engine`.
pub fn test_app(config: Config, engine: &Arc<FakeEngine>) -> Router {
    let http = reqwest::Client::new();
    let bluesky = Arc::new(BlueskyService::new(http.clone(), config.bsky_service_url.clone()));
    let limiter = RateLimiter::new(
        Arc::new(MemoryStore::new()),
        Duration::from_secs(60),
        60,
        Duration::from_millis(734),
    );

    let engine: Arc<dyn BrowserEngine> = engine.clone();
    create_app(AppState {
        services: Arc::new(Services::new(Arc::new(config), http, bluesky)),
        engine,
        limiter: Arc::new(limiter),
    })
}

/// Send a GET request through the router.
pub async fn get(app: Router, uri: &str) -> Response<Body> {
    app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

/// Send a form POST through the router.
pub async fn post_form(app: Router, uri: &str, body: &str) -> Response<Body> {
    app.oneshot(
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
    .unwrap()
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8_lossy(&bytes).into_owned()
}
