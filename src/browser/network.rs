//! Network activity tracking for a single page.
//!
//! CDP has no "network idle" wait, so each page keeps a small ledger fed by
//! the `Network.*` events: requests currently in flight, the last time that set
//! changed, and the URL of every response seen so far.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent, EventResponseReceived,
};
use chromiumoxide::Page;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::trace;

use super::ResponseMark;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct Ledger {
    in_flight: HashSet<String>,
    last_activity: Instant,
    responses: Vec<String>,
}

impl Ledger {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Tracks requests for one page until dropped.
#[derive(Debug)]
pub struct NetworkMonitor {
    ledger: Arc<Mutex<Ledger>>,
    task: JoinHandle<()>,
}

impl NetworkMonitor {
    /// Subscribe to the page's network events.
    ///
    /// Must run before navigation so the first document request is counted.
    pub async fn attach(page: &Page) -> Result<Self> {
        let mut sent = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .context("Failed to listen for requests")?;
        let mut finished = page
            .event_listener::<EventLoadingFinished>()
            .await
            .context("Failed to listen for finished loads")?;
        let mut failed = page
            .event_listener::<EventLoadingFailed>()
            .await
            .context("Failed to listen for failed loads")?;
        let mut responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .context("Failed to listen for responses")?;

        let ledger = Arc::new(Mutex::new(Ledger {
            in_flight: HashSet::new(),
            last_activity: Instant::now(),
            responses: Vec::new(),
        }));

        let task_ledger = Arc::clone(&ledger);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(event) = sent.next() => {
                        let mut ledger = task_ledger.lock().unwrap_or_else(PoisonError::into_inner);
                        ledger.in_flight.insert(event.request_id.inner().clone());
                        ledger.touch();
                    }
                    Some(event) = finished.next() => {
                        let mut ledger = task_ledger.lock().unwrap_or_else(PoisonError::into_inner);
                        ledger.in_flight.remove(event.request_id.inner());
                        ledger.touch();
                    }
                    Some(event) = failed.next() => {
                        let mut ledger = task_ledger.lock().unwrap_or_else(PoisonError::into_inner);
                        ledger.in_flight.remove(event.request_id.inner());
                        ledger.touch();
                    }
                    Some(event) = responses.next() => {
                        trace!(url = %event.response.url, "Response received");
                        let mut ledger = task_ledger.lock().unwrap_or_else(PoisonError::into_inner);
                        ledger.responses.push(event.response.url.clone());
                        ledger.touch();
                    }
                    else => break,
                }
            }
        });

        Ok(Self { ledger, task })
    }

    fn with_ledger<T>(&self, f: impl FnOnce(&Ledger) -> T) -> T {
        let ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        f(&ledger)
    }

    /// Forget requests left over from a previous document.
    pub fn reset_in_flight(&self) {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        ledger.in_flight.clear();
        ledger.touch();
    }

    pub fn mark(&self) -> ResponseMark {
        ResponseMark(self.with_ledger(|l| l.responses.len()))
    }

    /// Wait until nothing has been in flight for `quiet`.
    pub async fn wait_for_idle(&self, quiet: Duration, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let idle = self.with_ledger(|l| l.in_flight.is_empty() && l.last_activity.elapsed() >= quiet);
            if idle {
                return Ok(());
            }
            if Instant::now() >= deadline {
                let pending = self.with_ledger(|l| l.in_flight.len());
                anyhow::bail!("Timed out waiting for network idle ({pending} requests pending)");
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait for a response from a host ending in `host_suffix` after `since`.
    pub async fn wait_for_response(
        &self,
        host_suffix: &str,
        since: ResponseMark,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = self.with_ledger(|l| {
                l.responses
                    .iter()
                    .skip(since.0)
                    .any(|url| response_matches(url, host_suffix))
            });
            if seen {
                return Ok(());
            }
            if Instant::now() >= deadline {
                anyhow::bail!("Timed out waiting for a response from *{host_suffix}");
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn response_matches(url: &str, host_suffix: &str) -> bool {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.ends_with(host_suffix)))
        .unwrap_or(false)
}
