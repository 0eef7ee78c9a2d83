use std::sync::LazyLock;

use regex::Regex;
use url::Url;

/// Tumblr post on a blog subdomain: `https://<blog>.tumblr.com/post/<id>(/<slug>)`.
static TUMBLR_SUBDOMAIN_POST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^https?://(?P<blog>[^\-][a-zA-Z0-9\-]{0,30}[^\-])\.tumblr\.com/post/(?P<id>\d+)(?:/(?P<slug>[^/]+))?",
    )
    .unwrap()
});

/// Platform a post URL was classified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Twitter,
    Tumblr,
    Bluesky,
    LinkedIn,
    /// Any other host; the server software is discovered through NodeInfo.
    ActivityPub,
}

impl Platform {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Twitter => "twitter",
            Self::Tumblr => "tumblr",
            Self::Bluesky => "bsky",
            Self::LinkedIn => "linkedin",
            Self::ActivityPub => "activity-pub",
        }
    }
}

/// A classified, normalized post URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostReference {
    pub platform: Platform,
    pub url: Url,
}

/// Parse and classify a post URL.
///
/// Known hosts are forced to `https` and rewritten to their canonical alias;
/// Tumblr blog-subdomain posts are rewritten to the path-based form. Returns
/// `None` if `raw` is not an absolute URL.
#[must_use]
pub fn classify(raw: &str) -> Option<PostReference> {
    let mut url = Url::parse(raw).ok()?;
    if url.cannot_be_a_base() {
        return None;
    }
    let host = url.host_str()?.to_ascii_lowercase();

    let canonical = match host.as_str() {
        "twitter.com" | "x.com" | "www.x.com" | "www.twitter.com" => {
            Some((Platform::Twitter, "x.com"))
        }
        "tumblr.com" | "www.tumblr.com" => Some((Platform::Tumblr, "www.tumblr.com")),
        "bsky.app" => Some((Platform::Bluesky, "bsky.app")),
        "linkedin.com" | "www.linkedin.com" => Some((Platform::LinkedIn, "www.linkedin.com")),
        _ => None,
    };

    if let Some((platform, canonical_host)) = canonical {
        secure(&mut url, canonical_host)?;
        return Some(PostReference { platform, url });
    }

    if let Some(caps) = TUMBLR_SUBDOMAIN_POST.captures(url.as_str()) {
        let mut path = format!("/{}/{}", &caps["blog"], &caps["id"]);
        if let Some(slug) = caps.name("slug") {
            path.push('/');
            path.push_str(slug.as_str());
        }
        secure(&mut url, "www.tumblr.com")?;
        url.set_path(&path);
        return Some(PostReference {
            platform: Platform::Tumblr,
            url,
        });
    }

    Some(PostReference {
        platform: Platform::ActivityPub,
        url,
    })
}

/// Force `https` on the canonical host.
fn secure(url: &mut Url, host: &str) -> Option<()> {
    url.set_host(Some(host)).ok()?;
    url.set_scheme("https").ok()?;
    url.set_port(None).ok()
}
