//! Per-request browser state.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use rand::Rng;
use tracing::{debug, warn};

use super::{BrowserEngine, ContextOptions, RenderContext};

/// State owned by one incoming request.
///
/// Holds the request id, the post URLs already visited while following
/// cross-instance references, and at most one open browser context. The
/// context must be released with [`RequestScope::close`] once the response is
/// ready.
pub struct RequestScope {
    id: String,
    engine: Arc<dyn BrowserEngine>,
    seen_urls: Vec<String>,
    context: Option<Box<dyn RenderContext>>,
}

impl RequestScope {
    #[must_use]
    pub fn new(id: impl Into<String>, engine: Arc<dyn BrowserEngine>) -> Self {
        Self {
            id: id.into(),
            engine,
            seen_urls: Vec::new(),
            context: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<dyn BrowserEngine> {
        &self.engine
    }

    /// Post URLs visited so far, in order.
    #[must_use]
    pub fn seen_urls(&self) -> &[String] {
        &self.seen_urls
    }

    pub fn push_seen_url(&mut self, url: impl Into<String>) {
        self.seen_urls.push(url.into());
    }

    /// Open this request's browser context.
    ///
    /// # Errors
    ///
    /// Returns an error if a context is already open or the engine fails.
    pub async fn open_context(&mut self, options: ContextOptions) -> Result<&dyn RenderContext> {
        if self.context.is_some() {
            anyhow::bail!("Request {} already has an open browser context", self.id);
        }
        let context = self.engine.new_context(options).await?;
        debug!(request_id = %self.id, "Opened browser context");
        Ok(&**self.context.insert(context))
    }

    #[must_use]
    pub fn has_context(&self) -> bool {
        self.context.is_some()
    }

    /// Close the context if one is open. Failures are logged, not returned.
    pub async fn close(&mut self) {
        if let Some(context) = self.context.take() {
            match context.close().await {
                Ok(()) => debug!(request_id = %self.id, "Closed browser context"),
                Err(e) => warn!(request_id = %self.id, "Failed to close browser context: {e:#}"),
            }
        }
    }
}

/// Generate a request id: base-36 milliseconds followed by random base-36
/// characters.
#[must_use]
pub fn generate_request_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis());
    let mut id = to_base36(millis);
    let mut rng = rand::thread_rng();
    for _ in 0..8 {
        let digit = rng.gen_range(0..36u32);
        if let Some(c) = char::from_digit(digit, 36) {
            id.push(c);
        }
    }
    id
}

/// Lowercase base-36 rendering of `value`.
#[must_use]
pub fn to_base36(mut value: u128) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        let digit = (value % 36) as u32;
        digits.extend(char::from_digit(digit, 36));
        value /= 36;
    }
    digits.iter().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1_700_000_000_000), "loyw3v28");
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }
}
