//! Shared constants used across the application.

use std::time::Duration;

/// User agent string used for upstream metadata requests.
///
/// Matches a desktop Chrome build so syndication endpoints serve the same
/// payloads they would to a regular browser.
pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Timeout for pre-flight and instance discovery requests.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// How long clients may cache a rendered post.
pub const POST_CACHE_SECS: u64 = 15 * 60;

/// How long clients may cache a raw screenshot.
pub const RAW_CACHE_SECS: u64 = 30 * 60;

/// Header carrying the per-request id on every response.
pub const REQUEST_ID_HEADER: &str = "x-twitshot-request-id";
