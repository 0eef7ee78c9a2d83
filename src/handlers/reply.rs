use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::debug;

use super::traits::Renderer;
use crate::browser::{ContextOptions, ImageFormat, RequestScope};
use crate::constants::POST_CACHE_SECS;

/// Error raised by a renderer to force a specific response.
///
/// Everything else a renderer returns as `Err` is an automation failure and
/// ends up as a 500.
#[derive(Debug, Error)]
#[error("{status}: {body}")]
pub struct ScreenshotResponseError {
    pub status: StatusCode,
    pub body: String,
}

impl ScreenshotResponseError {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// A rendered screenshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Screenshot {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
    /// File name without extension.
    pub filename: String,
    pub cache_secs: u64,
}

/// Outcome of handling one post request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Image(Screenshot),
    Status { status: StatusCode, body: String },
}

impl Reply {
    #[must_use]
    pub fn status(status: StatusCode) -> Self {
        Self::Status {
            status,
            body: status.canonical_reason().unwrap_or_default().to_string(),
        }
    }

    pub fn with_body(status: StatusCode, body: impl Into<String>) -> Self {
        Self::Status {
            status,
            body: body.into(),
        }
    }

    #[must_use]
    pub fn not_found() -> Self {
        Self::status(StatusCode::NOT_FOUND)
    }

    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Image(_) => StatusCode::OK,
            Self::Status { status, .. } => *status,
        }
    }
}

impl From<ScreenshotResponseError> for Reply {
    fn from(err: ScreenshotResponseError) -> Self {
        Self::Status {
            status: err.status,
            body: err.body,
        }
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        match self {
            Self::Status { status, body } => (status, body).into_response(),
            Self::Image(shot) => {
                let disposition = format!(
                    "inline; filename=\"{}.{}\"",
                    shot.filename.replace(['"', '\\'], "_"),
                    shot.format.extension()
                );
                let cache = format!(
                    "public, max-age={0}, s-max-age={0}",
                    shot.cache_secs
                );
                let length = shot.bytes.len();

                let mut response = shot.bytes.into_response();
                let headers = response.headers_mut();
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static(shot.format.content_type()),
                );
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
                headers.insert(
                    header::ACCESS_CONTROL_ALLOW_ORIGIN,
                    HeaderValue::from_static("*"),
                );
                if let Ok(value) = HeaderValue::from_str(&cache) {
                    headers.insert(header::CACHE_CONTROL, value);
                }
                if let Ok(value) = HeaderValue::from_str(&disposition) {
                    headers.insert(header::CONTENT_DISPOSITION, value);
                }
                response
            }
        }
    }
}

/// How a screenshot response is labelled and cached.
#[derive(Debug, Clone)]
pub struct ReplyOptions {
    pub filename: String,
    pub cache_secs: u64,
}

impl ReplyOptions {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            cache_secs: POST_CACHE_SECS,
        }
    }

    #[must_use]
    pub fn cache_for(mut self, secs: u64) -> Self {
        self.cache_secs = secs;
        self
    }
}

/// Open the request's browser context, run `renderer` in it and turn the
/// outcome into a [`Reply`].
///
/// `Ok(None)` from the renderer becomes a 404 and a
/// [`ScreenshotResponseError`] becomes its own status. Any other error is
/// returned for the request wrapper to report. The context stays attached to
/// `scope` and is closed by whoever owns the scope.
///
/// # Errors
///
/// Returns an error if the context cannot be opened or the renderer fails.
pub async fn respond_with_screenshot(
    scope: &mut RequestScope,
    context_options: ContextOptions,
    renderer: &dyn Renderer,
    options: ReplyOptions,
) -> anyhow::Result<Reply> {
    let config = scope.engine().screenshot_config();
    let context = scope.open_context(context_options).await?;

    let result = renderer.render(context, &config).await;
    match result {
        Ok(Some(bytes)) => {
            debug!(renderer = renderer.name(), size = bytes.len(), "Screenshot taken");
            Ok(Reply::Image(Screenshot {
                bytes,
                format: config.format,
                filename: options.filename,
                cache_secs: options.cache_secs,
            }))
        }
        Ok(None) => {
            debug!(renderer = renderer.name(), "Content not found");
            Ok(Reply::not_found())
        }
        Err(e) => match e.downcast::<ScreenshotResponseError>() {
            Ok(err) => {
                debug!(renderer = renderer.name(), status = %err.status, "Renderer rejected request");
                Ok(err.into())
            }
            Err(e) => Err(e),
        },
    }
}
