//! Bluesky (AT Protocol) session and thread lookups.
//!
//! The service logs in once at startup, refreshes the session on a timer and
//! keeps the `BSKY_STORAGE` blob the Bluesky web app reads from local storage,
//! so rendered pages show the logged-in view.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::constants::UPSTREAM_TIMEOUT;

/// Local-storage key the Bluesky web app keeps its state under.
pub const STORAGE_KEY: &str = "BSKY_STORAGE";

/// How often the session is refreshed.
pub const SESSION_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

const FEED_POST_COLLECTION: &str = "app.bsky.feed.post";
const DEFAULT_HOME_FEED: &str =
    "feedgen|at://did:plc:z72i7hdynmk6r22z27h6tvur/app.bsky.feed.generator/whats-hot";

/// Session returned by `createSession` / `refreshSession`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_jwt: String,
    pub refresh_jwt: String,
    pub did: String,
    pub handle: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_confirmed: Option<bool>,
    #[serde(default)]
    pub email_auth_factor: Option<bool>,
    #[serde(default)]
    pub did_doc: Option<Value>,
}

impl Session {
    /// PDS endpoint advertised in the DID document, if any.
    #[must_use]
    pub fn pds_url(&self) -> Option<String> {
        self.did_doc
            .as_ref()?
            .get("service")?
            .as_array()?
            .iter()
            .find(|service| {
                service
                    .get("id")
                    .and_then(Value::as_str)
                    .is_some_and(|id| id.ends_with("#atproto_pds"))
            })?
            .get("serviceEndpoint")?
            .as_str()
            .map(ToString::to_string)
    }
}

#[derive(Debug)]
struct SessionState {
    session: Session,
    storage_blob: String,
}

/// Serialize a session into the web app's local-storage state.
#[must_use]
pub fn storage_blob(session: &Session, service_url: &str) -> String {
    let account = json!({
        "accessJwt": session.access_jwt,
        "active": true,
        "did": session.did,
        "email": session.email,
        "emailAuthFactor": session.email_auth_factor,
        "emailConfirmed": session.email_confirmed,
        "handle": session.handle,
        "pdsUrl": session.pds_url(),
        "refreshJwt": session.refresh_jwt,
        "service": service_url,
        "signupQueued": false,
        "isSelfHosted": false,
    });

    json!({
        "colorMode": "system",
        "reminders": {
            "lastEmailConfirm": Utc::now().to_rfc3339(),
        },
        "languagePrefs": {
            "primaryLanguage": "en",
            "contentLanguages": ["en", "hr"],
            "postLanguage": "en",
            "postLanguageHistory": ["en", "hr", "ja", "pt", "de"],
            "appLanguage": "en",
        },
        "requireAltTextEnabled": false,
        "mutedThreads": [],
        "invites": { "copiedInvites": [] },
        "onboarding": { "step": "Home" },
        "hiddenPosts": [],
        "hasCheckedForStarterPack": true,
        "lastSelectedHomeFeed": DEFAULT_HOME_FEED,
        "session": {
            "accounts": [account.clone()],
            "currentAccount": account,
        },
    })
    .to_string()
}

/// Shared Bluesky client.
pub struct BlueskyService {
    client: reqwest::Client,
    service_url: String,
    state: RwLock<Option<Arc<SessionState>>>,
}

impl BlueskyService {
    pub fn new(client: reqwest::Client, service_url: impl Into<String>) -> Self {
        Self {
            client,
            service_url: service_url.into().trim_end_matches('/').to_string(),
            state: RwLock::new(None),
        }
    }

    /// Create the service and log in with whatever credentials are configured.
    ///
    /// Login failures are logged; the service then works anonymously.
    pub async fn init(config: &Config, client: reqwest::Client) -> Arc<Self> {
        let service = Arc::new(Self::new(client, &config.bsky_service_url));

        let result = match (
            config.bsky_account_identifier.as_deref(),
            config.bsky_account_password.as_deref(),
            config.bsky_refresh_token.as_deref(),
        ) {
            (Some(identifier), Some(password), _) => {
                info!("Logging into Bluesky using credentials");
                service.login(identifier, password).await
            }
            (_, _, Some(refresh_token)) => {
                info!("Logging into Bluesky using refresh token");
                service.refresh_with(refresh_token).await
            }
            _ => {
                debug!("No Bluesky credentials configured");
                return service;
            }
        };

        match result {
            Ok(()) => {
                if let Some(state) = service.state.read().await.as_ref() {
                    info!(handle = %state.session.handle, "Logged in to Bluesky");
                }
                let refresher = Arc::clone(&service);
                tokio::spawn(async move {
                    refresher.run_refresh_loop(SESSION_REFRESH_INTERVAL).await;
                });
            }
            Err(e) => error!("Error logging into Bluesky: {e:#}"),
        }

        service
    }

    /// Log in with an identifier (handle or email) and password.
    ///
    /// # Errors
    ///
    /// Returns an error if the server rejects the login.
    pub async fn login(&self, identifier: &str, password: &str) -> Result<()> {
        let url = format!("{}/xrpc/com.atproto.server.createSession", self.service_url);
        let response = self
            .client
            .post(&url)
            .timeout(UPSTREAM_TIMEOUT)
            .json(&json!({ "identifier": identifier, "password": password }))
            .send()
            .await
            .context("Failed to reach Bluesky")?
            .error_for_status()
            .context("Bluesky rejected the login")?;

        let session: Session = response
            .json()
            .await
            .context("Invalid createSession response")?;
        self.store(session).await;
        Ok(())
    }

    /// Refresh the current session.
    ///
    /// On failure the previous session stays in place.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no session or the refresh fails.
    pub async fn refresh(&self) -> Result<()> {
        let refresh_jwt = self
            .state
            .read()
            .await
            .as_ref()
            .map(|state| state.session.refresh_jwt.clone())
            .context("No Bluesky session to refresh")?;
        self.refresh_with(&refresh_jwt).await
    }

    async fn refresh_with(&self, refresh_jwt: &str) -> Result<()> {
        let url = format!("{}/xrpc/com.atproto.server.refreshSession", self.service_url);
        let response = self
            .client
            .post(&url)
            .timeout(UPSTREAM_TIMEOUT)
            .bearer_auth(refresh_jwt)
            .send()
            .await
            .context("Failed to reach Bluesky")?
            .error_for_status()
            .context("Bluesky rejected the session refresh")?;

        let session: Session = response
            .json()
            .await
            .context("Invalid refreshSession response")?;
        self.store(session).await;
        Ok(())
    }

    async fn store(&self, session: Session) {
        let storage_blob = storage_blob(&session, &self.service_url);
        *self.state.write().await = Some(Arc::new(SessionState {
            session,
            storage_blob,
        }));
    }

    /// Refresh the session every `interval`, forever.
    pub async fn run_refresh_loop(&self, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;

            info!("Refreshing Bluesky credentials");
            match self.refresh().await {
                Ok(()) => debug!("Bluesky session refreshed"),
                Err(e) => error!("Failed to refresh Bluesky session: {e:#}"),
            }
        }
    }

    /// Current `BSKY_STORAGE` blob, if logged in.
    pub async fn session_blob(&self) -> Option<String> {
        self.state
            .read()
            .await
            .as_ref()
            .map(|state| state.storage_blob.clone())
    }

    /// Fetch the thread for a post via `app.bsky.feed.getPostThread`.
    ///
    /// Authenticated against the account's PDS when logged in.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the response is not JSON.
    pub async fn post_thread(&self, actor: &str, post_id: &str) -> Result<Value> {
        let uri = format!("at://{actor}/{FEED_POST_COLLECTION}/{post_id}");
        let state = self.state.read().await.clone();

        let base = state
            .as_ref()
            .and_then(|state| state.session.pds_url())
            .unwrap_or_else(|| self.service_url.clone());
        let url = format!("{}/xrpc/app.bsky.feed.getPostThread", base.trim_end_matches('/'));

        let mut request = self
            .client
            .get(&url)
            .timeout(UPSTREAM_TIMEOUT)
            .query(&[("uri", uri.as_str())]);
        if let Some(state) = &state {
            request = request.bearer_auth(&state.session.access_jwt);
        }

        debug!(uri = %uri, "Fetching Bluesky post thread");
        let response = request
            .send()
            .await
            .context("Failed to reach Bluesky")?
            .error_for_status()
            .context("Bluesky returned an error for the thread")?;

        response.json().await.context("Invalid getPostThread response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session_json(access: &str) -> Value {
        json!({
            "accessJwt": access,
            "refreshJwt": "refresh-1",
            "did": "did:plc:abc",
            "handle": "alice.example",
            "email": "alice@example.com",
            "emailConfirmed": true,
            "didDoc": {
                "service": [{
                    "id": "#atproto_pds",
                    "type": "AtprotoPersonalDataServer",
                    "serviceEndpoint": "https://pds.example"
                }]
            }
        })
    }

    #[test]
    fn test_storage_blob_shape() {
        let session: Session = serde_json::from_value(session_json("access-1")).unwrap();
        let blob: Value =
            serde_json::from_str(&storage_blob(&session, "https://bsky.social")).unwrap();

        let account = &blob["session"]["currentAccount"];
        assert_eq!(account["did"], "did:plc:abc");
        assert_eq!(account["accessJwt"], "access-1");
        assert_eq!(account["pdsUrl"], "https://pds.example");
        assert_eq!(account["service"], "https://bsky.social");
        assert_eq!(account["signupQueued"], false);
        assert_eq!(blob["session"]["accounts"][0], *account);
        assert_eq!(blob["onboarding"]["step"], "Home");
    }

    #[tokio::test]
    async fn test_login_and_refresh_update_blob() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.server.createSession"))
            .respond_with(ResponseTemplate::new(200).set_body_json(session_json("access-1")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.server.refreshSession"))
            .and(header("authorization", "Bearer refresh-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(session_json("access-2")))
            .mount(&server)
            .await;

        let service = BlueskyService::new(reqwest::Client::new(), server.uri());
        assert!(service.session_blob().await.is_none());

        service.login("alice.example", "hunter2").await.unwrap();
        assert!(service.session_blob().await.unwrap().contains("access-1"));

        service.refresh().await.unwrap();
        assert!(service.session_blob().await.unwrap().contains("access-2"));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.server.createSession"))
            .respond_with(ResponseTemplate::new(200).set_body_json(session_json("access-1")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.server.refreshSession"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let service = BlueskyService::new(reqwest::Client::new(), server.uri());
        service.login("alice.example", "hunter2").await.unwrap();
        assert!(service.refresh().await.is_err());
        assert!(service.session_blob().await.unwrap().contains("access-1"));
    }

    #[tokio::test]
    async fn test_anonymous_post_thread() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xrpc/app.bsky.feed.getPostThread"))
            .and(query_param("uri", "at://alice.example/app.bsky.feed.post/abc123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "thread": {"post": {"uri": "at://did:plc:abc/app.bsky.feed.post/abc123"}}
            })))
            .mount(&server)
            .await;

        let service = BlueskyService::new(reqwest::Client::new(), server.uri());
        let thread = service.post_thread("alice.example", "abc123").await.unwrap();
        assert!(thread["thread"]["post"].is_object());
        assert!(service.post_thread("alice.example", "missing").await.is_err());
    }
}
