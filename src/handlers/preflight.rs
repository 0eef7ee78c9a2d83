//! Metadata lookups made before paying for a browser render.
//!
//! Every lookup is bounded by [`UPSTREAM_TIMEOUT`] and folds all failures
//! (transport errors, non-200 statuses, bodies that don't parse) into `None`.

use reqwest::header;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::constants::{BROWSER_USER_AGENT, UPSTREAM_TIMEOUT};

const NODEINFO_SCHEMA_2_PREFIX: &str = "http://nodeinfo.diaspora.software/ns/schema/2.";

/// Fetch `url` and decode a JSON body, or `None` on any failure.
async fn get_json<T: DeserializeOwned>(client: &reqwest::Client, url: &str) -> Option<T> {
    let response = match client
        .get(url)
        .timeout(UPSTREAM_TIMEOUT)
        .header(header::USER_AGENT, BROWSER_USER_AGENT)
        .header(header::ACCEPT, "application/json")
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            debug!(url, "Upstream request failed: {e}");
            return None;
        }
    };

    if response.status() != reqwest::StatusCode::OK {
        debug!(url, status = %response.status(), "Upstream returned non-OK status");
        return None;
    }

    match response.json::<T>().await {
        Ok(body) => Some(body),
        Err(e) => {
            debug!(url, "Upstream returned an unexpected body: {e}");
            None
        }
    }
}

/// Whether the syndication API knows about tweet `id`.
pub async fn tweet_exists(client: &reqwest::Client, syndication_url: &str, id: &str) -> bool {
    let url = format!(
        "{}/tweet-result?id={id}&lang=en",
        syndication_url.trim_end_matches('/')
    );
    debug!(url = %url, "Fetching tweet info");
    get_json::<serde_json::Value>(client, &url)
        .await
        .is_some_and(|info| !info.is_null())
}

#[derive(Debug, Deserialize)]
struct StatusInfo {
    url: String,
}

/// Canonical URL of a Mastodon status, as reported by the instance at
/// `origin`.
pub async fn mastodon_status_url(client: &reqwest::Client, origin: &str, id: &str) -> Option<Url> {
    let url = format!("{origin}/api/v1/statuses/{id}");
    let info: StatusInfo = get_json(client, &url).await?;
    match Url::parse(&info.url) {
        Ok(url) => Some(url),
        Err(e) => {
            debug!(url = %info.url, "Status has an invalid URL: {e}");
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct NodeInfoLinks {
    links: Vec<NodeInfoLink>,
}

#[derive(Debug, Deserialize)]
struct NodeInfoLink {
    rel: String,
    href: String,
}

/// Server software reported by NodeInfo.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeSoftware {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Deserialize)]
struct NodeInfo {
    software: NodeSoftware,
}

/// Discover the software running the server behind `url`.
pub async fn node_software(client: &reqwest::Client, url: &Url) -> Option<NodeSoftware> {
    let list_url = format!("{}/.well-known/nodeinfo", url.origin().ascii_serialization());
    let list: NodeInfoLinks = get_json(client, &list_url).await?;
    debug!(url = %list_url, links = list.links.len(), "Got node info links");

    let href = list
        .links
        .into_iter()
        .find(|link| link.rel.starts_with(NODEINFO_SCHEMA_2_PREFIX))?
        .href;
    if Url::parse(&href).is_err() {
        debug!(href = %href, "Node info link is not a URL");
        return None;
    }

    let info: NodeInfo = get_json(client, &href).await?;
    debug!(url = %href, software = %info.software.name, version = %info.software.version, "Got node info");
    Some(info.software)
}

#[cfg(test)]
mod tests {
    use super::*;

    use wiremock::matchers::{header as header_matcher, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_tweet_exists() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tweet-result"))
            .and(query_param("id", "12345"))
            .and(query_param("lang", "en"))
            .and(header_matcher("accept", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id_str": "12345"})))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        assert!(tweet_exists(&client, &server.uri(), "12345").await);
        assert!(!tweet_exists(&client, &server.uri(), "999").await);
    }

    #[tokio::test]
    async fn test_tweet_with_bad_json_does_not_exist() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tweet-result"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>nope</html>"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        assert!(!tweet_exists(&client, &server.uri(), "12345").await);
    }

    #[tokio::test]
    async fn test_node_software() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/nodeinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "links": [
                    {"rel": "http://nodeinfo.diaspora.software/ns/schema/1.0", "href": "not used"},
                    {"rel": "http://nodeinfo.diaspora.software/ns/schema/2.0", "href": format!("{}/nodeinfo/2.0", server.uri())}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/nodeinfo/2.0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "software": {"name": "mastodon", "version": "4.3.0"}
            })))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = Url::parse(&format!("{}/@someone/1234", server.uri())).unwrap();
        let software = node_software(&client, &url).await.unwrap();
        assert_eq!(software.name, "mastodon");
        assert_eq!(software.version, "4.3.0");
    }

    #[tokio::test]
    async fn test_node_software_without_schema_2_link() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/nodeinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "links": [{"rel": "http://nodeinfo.diaspora.software/ns/schema/1.0", "href": "https://example.com/ni"}]
            })))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = Url::parse(&server.uri()).unwrap();
        assert!(node_software(&client, &url).await.is_none());
    }

    #[tokio::test]
    async fn test_mastodon_status_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/statuses/110"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "110",
                "url": "https://mastodon.social/@someone/110"
            })))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = mastodon_status_url(&client, &server.uri(), "110").await.unwrap();
        assert_eq!(url.as_str(), "https://mastodon.social/@someone/110");
        assert!(mastodon_status_url(&client, &server.uri(), "111").await.is_none());
    }
}
