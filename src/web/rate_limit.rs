//! Per-client slow-down.
//!
//! Requests are never rejected. Within a window the first `delay_after`
//! requests from a client go through immediately and every further request is
//! held back a little longer than the previous one.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::AppState;
use crate::config::Config;

const KEY_PREFIX: &str = "twitshot:rl:";

/// Entries kept by [`MemoryStore`] before expired windows are pruned.
const MEMORY_PRUNE_THRESHOLD: usize = 4096;

/// Counter state after a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    pub count: u64,
    pub reset_at: DateTime<Utc>,
}

/// Where hit counters live.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Count one hit for `key` in a window of length `window`.
    async fn increment(&self, key: &str, window: Duration) -> Result<Hit>;
}

/// In-process counters.
#[derive(Default)]
pub struct MemoryStore {
    windows: Mutex<HashMap<String, Hit>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<Hit> {
        let now = Utc::now();
        let window = chrono::Duration::from_std(window).context("Rate limit window too large")?;
        let mut windows = self.windows.lock().await;

        if windows.len() >= MEMORY_PRUNE_THRESHOLD {
            windows.retain(|_, hit| hit.reset_at > now);
        }

        let hit = windows
            .entry(key.to_string())
            .and_modify(|hit| {
                if hit.reset_at <= now {
                    *hit = Hit {
                        count: 0,
                        reset_at: now + window,
                    };
                }
            })
            .or_insert(Hit {
                count: 0,
                reset_at: now + window,
            });
        hit.count += 1;
        Ok(*hit)
    }
}

/// Counters shared between instances through Redis.
pub struct RedisStore {
    connection: redis::aio::MultiplexedConnection,
}

impl RedisStore {
    /// Connect to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid Redis URL")?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<Hit> {
        let key = format!("{KEY_PREFIX}{key}");
        let window_ms = i64::try_from(window.as_millis()).context("Rate limit window too large")?;
        let mut connection = self.connection.clone();

        let (count, ttl): (u64, i64) = redis::pipe()
            .atomic()
            .incr(&key, 1)
            .cmd("PTTL")
            .arg(&key)
            .query_async(&mut connection)
            .await
            .context("Failed to count hit")?;

        let ttl = if ttl <= 0 {
            let _: i64 = redis::cmd("PEXPIRE")
                .arg(&key)
                .arg(window_ms)
                .query_async(&mut connection)
                .await
                .context("Failed to set window expiry")?;
            window_ms
        } else {
            ttl
        };

        Ok(Hit {
            count,
            reset_at: Utc::now() + chrono::Duration::milliseconds(ttl),
        })
    }
}

/// Outcome of a hit, reported back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlowDown {
    pub limit: u64,
    pub used: u64,
    pub reset_at: DateTime<Utc>,
    pub delay: Duration,
}

impl SlowDown {
    /// Attach the `x-ratelimit-*` headers.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-used", HeaderValue::from(self.used));
        let reset = self.reset_at.to_rfc3339_opts(SecondsFormat::Millis, true);
        if let Ok(value) = HeaderValue::from_str(&reset) {
            headers.insert("x-ratelimit-reset", value);
        }
    }
}

/// Delay for the `used`-th request in a window.
#[must_use]
pub fn delay_for(used: u64, delay_after: u64, delay: Duration) -> Duration {
    let over = used.saturating_sub(delay_after);
    delay.saturating_mul(u32::try_from(over).unwrap_or(u32::MAX))
}

/// Slow-down limiter keyed by client address.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    window: Duration,
    delay_after: u64,
    delay: Duration,
}

impl RateLimiter {
    #[must_use]
    pub fn new(
        store: Arc<dyn CounterStore>,
        window: Duration,
        delay_after: u64,
        delay: Duration,
    ) -> Self {
        Self {
            store,
            window,
            delay_after,
            delay,
        }
    }

    /// Build the limiter described by `config`, backed by Redis when a URL is
    /// configured.
    ///
    /// # Errors
    ///
    /// Returns an error if Redis is configured but unreachable.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store: Arc<dyn CounterStore> = match &config.redis_url {
            Some(url) => Arc::new(RedisStore::connect(url).await?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::new(
            store,
            config.rate_limit_window,
            config.rate_limit_delay_after,
            config.rate_limit_delay,
        ))
    }

    /// Count a request from `client`. `None` if the store failed.
    pub async fn hit(&self, client: &str) -> Option<SlowDown> {
        match self.store.increment(client, self.window).await {
            Ok(hit) => Some(SlowDown {
                limit: self.delay_after,
                used: hit.count,
                reset_at: hit.reset_at,
                delay: delay_for(hit.count, self.delay_after, self.delay),
            }),
            Err(e) => {
                warn!(client, "Rate limit store failed: {e:#}");
                None
            }
        }
    }
}

/// Client address, trusting `trust_proxy` hops of `X-Forwarded-For`.
///
/// Addresses are considered from the socket peer backwards through the
/// forwarded chain; the first untrusted one is the client.
#[must_use]
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>, trust_proxy: usize) -> Option<IpAddr> {
    let forwarded: Vec<IpAddr> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|part| part.trim().parse().ok())
        .collect();

    let chain: Vec<IpAddr> = peer.into_iter().chain(forwarded.into_iter().rev()).collect();
    chain
        .get(trust_proxy.min(chain.len().saturating_sub(1)))
        .copied()
}

/// Middleware applying the slow-down to render routes.
pub async fn slow_down(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let client = client_ip(
        request.headers(),
        peer,
        state.services.config.trust_proxy,
    )
    .map_or_else(|| "unknown".to_string(), |ip| ip.to_string());

    let outcome = state.limiter.hit(&client).await;
    if let Some(outcome) = outcome.filter(|o| !o.delay.is_zero()) {
        debug!(client = %client, used = outcome.used, delay = ?outcome.delay, "Slowing down client");
        tokio::time::sleep(outcome.delay).await;
    }

    let mut response = next.run(request).await;
    if let Some(outcome) = outcome {
        outcome.apply_headers(response.headers_mut());
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_after_threshold() {
        let delay = Duration::from_millis(734);
        assert_eq!(delay_for(1, 60, delay), Duration::ZERO);
        assert_eq!(delay_for(60, 60, delay), Duration::ZERO);
        assert_eq!(delay_for(61, 60, delay), Duration::from_millis(734));
        assert_eq!(delay_for(63, 60, delay), Duration::from_millis(3 * 734));
    }

    #[tokio::test]
    async fn test_memory_store_counts_per_key() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);
        assert_eq!(store.increment("a", window).await.unwrap().count, 1);
        assert_eq!(store.increment("a", window).await.unwrap().count, 2);
        assert_eq!(store.increment("b", window).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_memory_store_resets_after_window() {
        let store = MemoryStore::new();
        let window = Duration::from_millis(20);
        store.increment("a", window).await.unwrap();
        store.increment("a", window).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.increment("a", window).await.unwrap().count, 1);
    }

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn increment(&self, _key: &str, _window: Duration) -> Result<Hit> {
            anyhow::bail!("store offline")
        }
    }

    #[tokio::test]
    async fn test_store_failure_lets_request_through() {
        let limiter = RateLimiter::new(
            Arc::new(BrokenStore),
            Duration::from_secs(60),
            1,
            Duration::from_secs(1),
        );
        assert!(limiter.hit("127.0.0.1").await.is_none());
    }

    #[tokio::test]
    async fn test_limiter_reports_usage() {
        let limiter = RateLimiter::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(60),
            2,
            Duration::from_millis(100),
        );
        let first = limiter.hit("10.0.0.1").await.unwrap();
        assert_eq!((first.used, first.limit, first.delay), (1, 2, Duration::ZERO));
        limiter.hit("10.0.0.1").await.unwrap();
        let third = limiter.hit("10.0.0.1").await.unwrap();
        assert_eq!(third.delay, Duration::from_millis(100));
    }

    #[test]
    fn test_headers() {
        let outcome = SlowDown {
            limit: 60,
            used: 3,
            reset_at: DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
                .unwrap()
                .with_timezone(&Utc),
            delay: Duration::ZERO,
        };
        let mut headers = HeaderMap::new();
        outcome.apply_headers(&mut headers);
        assert_eq!(headers["x-ratelimit-limit"], "60");
        assert_eq!(headers["x-ratelimit-used"], "3");
        assert_eq!(headers["x-ratelimit-reset"], "2024-01-02T03:04:05.000Z");
    }

    #[test]
    fn test_client_ip_trusts_proxy_hops() {
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 198.51.100.2"));

        assert_eq!(client_ip(&headers, Some(peer), 0), Some(peer));
        assert_eq!(
            client_ip(&headers, Some(peer), 1),
            Some("198.51.100.2".parse().unwrap())
        );
        assert_eq!(
            client_ip(&headers, Some(peer), 2),
            Some("203.0.113.7".parse().unwrap())
        );
        // More hops than addresses: furthest one.
        assert_eq!(
            client_ip(&headers, Some(peer), 5),
            Some("203.0.113.7".parse().unwrap())
        );
        assert_eq!(client_ip(&HeaderMap::new(), None, 1), None);
    }
}
