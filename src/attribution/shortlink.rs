use crate::config::AttributionSettings;
use crate::http::{build_client, build_manual_redirect_client};
use reqwest::{Client, Url, header::LOCATION};
use tracing::{debug, warn};

const INSTAGRAM_SHORT_HOSTS: &[&str] = &["instagr.am", "ig.me"];
const LINK_WRAPPER_HOSTS: &[&str] = &["l.facebook.com", "l.instagram.com", "lm.facebook.com"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Expansion {
    /// Every URL discovered while expanding, in discovery order.
    pub urls: Vec<String>,
    /// Last path segment of the short link.
    pub short_code: Option<String>,
}

fn bare_host(url: &Url) -> Option<String> {
    url.host_str()
        .map(|host| host.trim_start_matches("www.").to_lowercase())
}

/// Last non-empty path segment, e.g. `abc123` for `https://fb.me/abc123/`.
pub fn short_code(url: &Url) -> Option<String> {
    url.path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()
        .map(str::to_string)
}

/// Canonical post URLs derivable from an Instagram short code.
pub fn instagram_candidates(code: &str) -> Vec<String> {
    vec![
        format!("https://www.instagram.com/p/{code}/"),
        format!("https://www.instagram.com/reel/{code}/"),
    ]
}

/// Target of an `l.facebook.com/l.php?u=...` style wrapper.
pub fn unwrap_link_wrapper(url: &Url) -> Option<String> {
    let host = bare_host(url)?;
    if !LINK_WRAPPER_HOSTS.contains(&host.as_str()) {
        return None;
    }
    url.query_pairs()
        .find(|(key, _)| key == "u")
        .map(|(_, value)| value.into_owned())
        .filter(|value| value.starts_with("http"))
}

pub struct ShortLinkExpander {
    hosts: Vec<String>,
    max_redirects: usize,
    /// `None` when the no-redirect client could not be built; expansion then
    /// relies on the GET follow alone.
    manual: Option<Client>,
    follow: Client,
}

impl ShortLinkExpander {
    pub fn new(settings: &AttributionSettings) -> Self {
        let manual = build_manual_redirect_client()
            .inspect_err(|err| {
                warn!(target = "salesignal.attribution", error = %err, "manual_redirect_client_unavailable");
            })
            .ok();
        Self::with_clients(settings, manual, build_client())
    }

    fn with_clients(
        settings: &AttributionSettings,
        manual: Option<Client>,
        follow: Client,
    ) -> Self {
        Self {
            hosts: settings.short_link_hosts.clone(),
            max_redirects: settings.max_redirects,
            manual,
            follow,
        }
    }

    pub fn is_short_link(&self, url: &Url) -> bool {
        bare_host(url).is_some_and(|host| self.hosts.iter().any(|known| *known == host))
    }

    /// Resolves a short link to its targets. Network failures only shorten the
    /// result; this never errors. Non-short links expand to nothing.
    pub async fn expand(&self, raw: &str) -> Expansion {
        let Ok(url) = Url::parse(raw.trim()) else {
            return Expansion::default();
        };
        if let Some(target) = unwrap_link_wrapper(&url) {
            return Expansion {
                urls: vec![target],
                short_code: None,
            };
        }
        if !self.is_short_link(&url) {
            return Expansion::default();
        }

        let code = short_code(&url);
        let mut urls = self.walk_redirects(&url).await;
        if urls.is_empty()
            && let Some(target) = self.follow_get(&url).await
        {
            urls.push(target);
        }
        if urls.is_empty()
            && let (Some(host), Some(code)) = (bare_host(&url), code.as_deref())
            && INSTAGRAM_SHORT_HOSTS.contains(&host.as_str())
        {
            urls = instagram_candidates(code);
        }

        // wrapped targets are common after a redirect hop
        let unwrapped: Vec<String> = urls
            .iter()
            .filter_map(|u| Url::parse(u).ok())
            .filter_map(|u| unwrap_link_wrapper(&u))
            .collect();
        urls.extend(unwrapped);

        debug!(target = "salesignal.attribution", source = %url, expanded = urls.len(), "short_link_expanded");
        Expansion {
            urls,
            short_code: code,
        }
    }

    async fn walk_redirects(&self, start: &Url) -> Vec<String> {
        let Some(manual) = &self.manual else {
            return Vec::new();
        };
        let mut hops = Vec::new();
        let mut current = start.clone();
        for _ in 0..self.max_redirects {
            let response = match manual.head(current.clone()).send().await {
                Ok(response) => response,
                Err(err) => {
                    debug!(target = "salesignal.attribution", url = %current, error = %err, "head_hop_failed");
                    break;
                }
            };
            if !response.status().is_redirection() {
                break;
            }
            let Some(next) = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|location| current.join(location).ok())
            else {
                break;
            };
            hops.push(next.to_string());
            current = next;
        }
        hops
    }

    async fn follow_get(&self, url: &Url) -> Option<String> {
        match self.follow.get(url.clone()).send().await {
            Ok(response) if response.url() != url => Some(response.url().to_string()),
            Ok(_) => None,
            Err(err) => {
                debug!(target = "salesignal.attribution", url = %url, error = %err, "get_follow_failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method;
    use httpmock::prelude::*;

    fn local_settings() -> AttributionSettings {
        let mut settings = AttributionSettings::default();
        settings.short_link_hosts.push("127.0.0.1".into());
        settings
    }

    #[test]
    fn wrapper_links_unwrap_without_network() {
        let url = Url::parse(
            "https://l.facebook.com/l.php?u=https%3A%2F%2Fwww.facebook.com%2Fpermalink.php%3Fstory_fbid%3D123%26id%3D9&h=AT0",
        )
        .unwrap();
        assert_eq!(
            unwrap_link_wrapper(&url).as_deref(),
            Some("https://www.facebook.com/permalink.php?story_fbid=123&id=9")
        );
    }

    #[test]
    fn instagram_short_codes_derive_post_and_reel() {
        let url = Url::parse("https://instagr.am/CxYz12AbC/").unwrap();
        let code = short_code(&url).unwrap();
        assert_eq!(
            instagram_candidates(&code),
            vec![
                "https://www.instagram.com/p/CxYz12AbC/".to_string(),
                "https://www.instagram.com/reel/CxYz12AbC/".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn non_short_links_are_left_alone() {
        let expander = ShortLinkExpander::new(&AttributionSettings::default());
        let expansion = expander
            .expand("https://www.facebook.com/loja/posts/123456")
            .await;
        assert_eq!(expansion, Expansion::default());
    }

    #[tokio::test]
    async fn head_redirects_are_walked_manually() {
        let server = MockServer::start_async().await;
        let target = format!("{}/story.php?story_fbid=987654321&id=1001", server.base_url());
        let first = server.mock(|when, then| {
            when.method(Method::HEAD).path("/3xAmPl3");
            then.status(301).header("Location", "/hop");
        });
        let second = server.mock(|when, then| {
            when.method(Method::HEAD).path("/hop");
            then.status(302).header("Location", target.as_str());
        });
        server.mock(|when, then| {
            when.method(Method::HEAD).path("/story.php");
            then.status(200);
        });

        let expander = ShortLinkExpander::new(&local_settings());
        let expansion = expander
            .expand(&format!("{}/3xAmPl3", server.base_url()))
            .await;
        first.assert_calls(1);
        second.assert_calls(1);
        assert_eq!(
            expansion.urls,
            vec![format!("{}/hop", server.base_url()), target]
        );
        assert_eq!(expansion.short_code.as_deref(), Some("3xAmPl3"));
    }

    #[tokio::test]
    async fn get_follow_is_used_when_head_does_not_redirect() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(Method::HEAD).path("/short");
            then.status(405);
        });
        server.mock(|when, then| {
            when.method(GET).path("/short");
            then.status(302).header("Location", "/landing?fbid=42424242");
        });
        server.mock(|when, then| {
            when.method(GET).path("/landing");
            then.status(200).body("ok");
        });
        let expander = ShortLinkExpander::new(&local_settings());
        let expansion = expander
            .expand(&format!("{}/short", server.base_url()))
            .await;
        assert_eq!(
            expansion.urls,
            vec![format!("{}/landing?fbid=42424242", server.base_url())]
        );
    }

    #[tokio::test]
    async fn missing_manual_client_skips_head_walk() {
        let server = MockServer::start_async().await;
        let head = server.mock(|when, then| {
            when.method(Method::HEAD).path("/short");
            then.status(301).header("Location", "/hop");
        });
        server.mock(|when, then| {
            when.method(GET).path("/short");
            then.status(302).header("Location", "/landing?fbid=42424242");
        });
        server.mock(|when, then| {
            when.method(GET).path("/landing");
            then.status(200).body("ok");
        });
        let expander = ShortLinkExpander::with_clients(&local_settings(), None, Client::new());
        let expansion = expander
            .expand(&format!("{}/short", server.base_url()))
            .await;
        head.assert_calls(0);
        assert_eq!(
            expansion.urls,
            vec![format!("{}/landing?fbid=42424242", server.base_url())]
        );
    }

    #[test]
    fn manual_redirect_client_builds() {
        assert!(build_manual_redirect_client().is_ok());
    }
}
