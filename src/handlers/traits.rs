use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::browser::{RenderContext, ScreenshotConfig};

/// A platform render pipeline.
///
/// Runs inside a browser context the caller owns and produces the screenshot
/// bytes, or `None` when the post is not there (deleted, private, tombstoned).
/// Absence is never an error; `Err` means the automation itself broke.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &'static str;

    /// Render the post.
    ///
    /// # Errors
    ///
    /// Returns an error if navigation, a wait, or an in-page script fails.
    async fn render(
        &self,
        context: &dyn RenderContext,
        config: &ScreenshotConfig,
    ) -> Result<Option<Vec<u8>>>;
}

/// Two renderers tried in order.
///
/// The secondary only runs when the primary reports the post as not found.
/// An error from the primary is returned as-is.
pub struct WithFallback<P, S> {
    pub primary: P,
    pub secondary: S,
}

#[async_trait]
impl<P: Renderer + 'static, S: Renderer + 'static> Renderer for WithFallback<P, S> {
    fn name(&self) -> &'static str {
        self.primary.name()
    }

    async fn render(
        &self,
        context: &dyn RenderContext,
        config: &ScreenshotConfig,
    ) -> Result<Option<Vec<u8>>> {
        if let Some(bytes) = self.primary.render(context, config).await? {
            return Ok(Some(bytes));
        }

        debug!(
            primary = self.primary.name(),
            secondary = self.secondary.name(),
            "Primary renderer found nothing, trying fallback"
        );
        self.secondary.render(context, config).await
    }
}
