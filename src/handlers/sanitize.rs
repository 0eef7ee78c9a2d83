//! DOM clean-up shared by the platform renderers.
//!
//! Renderers locate the post once and tag it with [`CAPTURE_MARKER`]; every
//! later step re-queries the page through that attribute instead of holding
//! element handles across the page boundary. Steps query before they act, so
//! running them against an already cleaned page is a no-op.

use anyhow::Result;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::browser::{CaptureTarget, PageScript, RenderPage, ScreenshotConfig};

/// Attribute set on the element to capture.
pub const CAPTURE_MARKER: &str = "data-twitshot-capture";

/// Selector matching the element tagged with [`CAPTURE_MARKER`].
pub const CAPTURE_SELECTOR: &str = "[data-twitshot-capture]";

/// Tag the first element matching `args.selector` for capture.
///
/// Returns whether anything matched.
pub const MARK_ELEMENT: PageScript = PageScript::new(
    "mark-element",
    r#"(args) => {
        document.querySelectorAll("[data-twitshot-capture]").forEach((el) => {
            el.removeAttribute("data-twitshot-capture");
        });
        const el = document.querySelector(args.selector);
        if (!el) return false;
        el.setAttribute("data-twitshot-capture", "");
        return true;
    }"#,
);

/// Remove every element matching any of `args.selectors`.
///
/// Returns the number of removed elements and the selectors that failed to
/// parse. An invalid selector does not stop the others.
pub const REMOVE_MATCHING: PageScript = PageScript::new(
    "remove-matching",
    r"(args) => {
        let removed = 0;
        const invalid = [];
        for (const selector of args.selectors) {
            let matches;
            try {
                matches = document.querySelectorAll(selector);
            } catch (_e) {
                invalid.push(selector);
                continue;
            }
            matches.forEach((el) => {
                el.remove();
                removed += 1;
            });
        }
        return { removed, invalid };
    }",
);

/// Whether a script result counts as "did something".
#[must_use]
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Runs ordered clean-up scripts against one page.
pub struct Sanitizer<'a> {
    page: &'a dyn RenderPage,
    platform: &'static str,
    args: Value,
}

impl<'a> Sanitizer<'a> {
    /// `args` is passed to every script.
    pub fn new(page: &'a dyn RenderPage, platform: &'static str, args: Value) -> Self {
        Self {
            page,
            platform,
            args,
        }
    }

    #[must_use]
    pub fn page(&self) -> &'a dyn RenderPage {
        self.page
    }

    /// Run one optional step. A failing step is logged and reported as
    /// `Value::Null`.
    pub async fn step(&self, script: &PageScript) -> Value {
        debug!(platform = self.platform, step = script.name, "Sanitize step");
        match self.page.run(script, self.args.clone()).await {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    platform = self.platform,
                    step = script.name,
                    "Sanitize step failed: {e:#}"
                );
                Value::Null
            }
        }
    }

    /// Run optional steps in order.
    pub async fn steps(&self, scripts: &[PageScript]) {
        for script in scripts {
            self.step(script).await;
        }
    }

    /// Remove everything matching `selectors`, ignoring failures.
    ///
    /// Returns the selectors the page could not parse.
    pub async fn remove(&self, selectors: &[&str]) -> Vec<String> {
        let args = json!({ "selectors": selectors });
        let outcome = match self.page.run(&REMOVE_MATCHING, args).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(platform = self.platform, "Failed to remove {selectors:?}: {e:#}");
                return Vec::new();
            }
        };

        let invalid: Vec<String> = outcome["invalid"]
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if !invalid.is_empty() {
            warn!(platform = self.platform, invalid = ?invalid, "Skipped invalid selectors");
        }
        debug!(platform = self.platform, removed = %outcome["removed"], "Removed elements");
        invalid
    }

    /// Run a gate-opening step (sensitive media, spoilers, "see more").
    ///
    /// When the script reports a click, waits for the page to settle, first for
    /// a response from `response_host` if given, then for network idle. Wait
    /// failures are returned: a half-revealed post is not acceptable output.
    ///
    /// # Errors
    ///
    /// Returns an error if a post-click wait times out.
    pub async fn click_through(
        &self,
        script: &PageScript,
        response_host: Option<&str>,
    ) -> Result<bool> {
        let mark = self.page.response_mark().await;
        let clicked = truthy(&self.step(script).await);
        if !clicked {
            return Ok(false);
        }

        debug!(platform = self.platform, step = script.name, "Clicked through gate");
        if let Some(host) = response_host {
            self.page.wait_for_response(host, mark).await?;
        }
        self.page.wait_for_network_idle().await?;
        Ok(true)
    }
}

/// Tag the element matching `selector` for capture.
///
/// # Errors
///
/// Returns an error if the script cannot be evaluated.
pub async fn mark_for_capture(page: &dyn RenderPage, selector: &str) -> Result<bool> {
    let found = page
        .run(&MARK_ELEMENT, json!({ "selector": selector }))
        .await?;
    Ok(truthy(&found))
}

/// Screenshot the tagged element.
///
/// # Errors
///
/// Returns an error if the capture fails.
pub async fn capture_marked(
    page: &dyn RenderPage,
    config: &ScreenshotConfig,
) -> Result<Option<Vec<u8>>> {
    page.capture(&CaptureTarget::Element(CAPTURE_SELECTOR.to_string()), config)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::browser::ResponseMark;

    #[derive(Default)]
    struct ScriptedPage {
        failing: Vec<&'static str>,
        results: Vec<(&'static str, Value)>,
        log: Mutex<Vec<String>>,
    }

    impl ScriptedPage {
        fn record(&self, entry: impl Into<String>) {
            self.log.lock().unwrap().push(entry.into());
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RenderPage for ScriptedPage {
        async fn block_urls(&self, _urls: &[&str]) -> Result<()> {
            Ok(())
        }
        async fn goto(&self, url: &str) -> Result<()> {
            self.record(format!("goto {url}"));
            Ok(())
        }
        async fn set_content(&self, _html: &str) -> Result<()> {
            Ok(())
        }
        async fn reload(&self) -> Result<()> {
            Ok(())
        }
        async fn wait_for_network_idle(&self) -> Result<()> {
            self.record("idle");
            Ok(())
        }
        async fn wait_for_selector(&self, _selector: &str) -> Result<bool> {
            Ok(true)
        }
        async fn response_mark(&self) -> ResponseMark {
            ResponseMark(3)
        }
        async fn wait_for_response(&self, host_suffix: &str, since: ResponseMark) -> Result<()> {
            self.record(format!("response {host_suffix} after {}", since.0));
            Ok(())
        }
        async fn exists(&self, _selector: &str) -> Result<bool> {
            Ok(false)
        }
        async fn run(&self, script: &PageScript, _args: Value) -> Result<Value> {
            self.record(format!("run {}", script.name));
            if self.failing.contains(&script.name) {
                anyhow::bail!("TypeError: cannot read properties of null");
            }
            Ok(self
                .results
                .iter()
                .find(|(name, _)| *name == script.name)
                .map_or(Value::Null, |(_, value)| value.clone()))
        }
        async fn add_style(&self, _css: &str) -> Result<()> {
            Ok(())
        }
        async fn capture(
            &self,
            _target: &CaptureTarget,
            _config: &ScreenshotConfig,
        ) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
    }

    const FIRST: PageScript = PageScript::new("first", "() => true");
    const SECOND: PageScript = PageScript::new("second", "() => true");
    const THIRD: PageScript = PageScript::new("third", "() => true");

    #[tokio::test]
    async fn test_failing_step_does_not_stop_the_rest() {
        let page = ScriptedPage {
            failing: vec!["second"],
            ..Default::default()
        };
        let sanitizer = Sanitizer::new(&page, "test", Value::Null);

        sanitizer.steps(&[FIRST, SECOND, THIRD]).await;

        assert_eq!(page.log(), vec!["run first", "run second", "run third"]);
    }

    #[tokio::test]
    async fn test_remove_reports_invalid_selectors() {
        let page = ScriptedPage {
            results: vec![(
                "remove-matching",
                json!({ "removed": 2, "invalid": ["div[", "::nope"] }),
            )],
            ..Default::default()
        };
        let sanitizer = Sanitizer::new(&page, "test", Value::Null);

        let invalid = sanitizer.remove(&["div[", "footer", "::nope"]).await;

        assert_eq!(invalid, vec!["div[", "::nope"]);
        assert_eq!(page.log(), vec!["run remove-matching"]);
    }

    #[tokio::test]
    async fn test_remove_survives_script_failure() {
        let page = ScriptedPage {
            failing: vec!["remove-matching"],
            ..Default::default()
        };
        let sanitizer = Sanitizer::new(&page, "test", Value::Null);

        assert!(sanitizer.remove(&["footer"]).await.is_empty());
    }

    #[test]
    fn test_remove_matching_guards_each_selector() {
        let source = REMOVE_MATCHING.source;
        let loop_start = source.find("for (const selector").unwrap();
        let guard = source.find("try {").unwrap();
        let query = source.find("querySelectorAll(selector)").unwrap();
        assert!(loop_start < guard && guard < query);
        assert!(source.contains("invalid.push(selector)"));
    }

    #[tokio::test]
    async fn test_running_steps_twice_is_harmless() {
        let page = ScriptedPage::default();
        let sanitizer = Sanitizer::new(&page, "test", Value::Null);

        sanitizer.steps(&[FIRST, SECOND]).await;
        sanitizer.steps(&[FIRST, SECOND]).await;

        assert_eq!(page.log().len(), 4);
    }

    #[tokio::test]
    async fn test_click_through_waits_only_after_click() {
        let page = ScriptedPage::default();
        let sanitizer = Sanitizer::new(&page, "test", Value::Null);
        assert!(!sanitizer.click_through(&FIRST, Some(".twimg.com")).await.unwrap());
        assert_eq!(page.log(), vec!["run first"]);

        let page = ScriptedPage {
            results: vec![("first", Value::Bool(true))],
            ..Default::default()
        };
        let sanitizer = Sanitizer::new(&page, "test", Value::Null);
        assert!(sanitizer.click_through(&FIRST, Some(".twimg.com")).await.unwrap());
        assert_eq!(
            page.log(),
            vec!["run first", "response .twimg.com after 3", "idle"]
        );
    }

    #[test]
    fn test_truthy() {
        assert!(!truthy(&Value::Null));
        assert!(!truthy(&json!(false)));
        assert!(!truthy(&json!(0)));
        assert!(truthy(&json!(2)));
        assert!(truthy(&json!(true)));
        assert!(!truthy(&json!("")));
    }
}
