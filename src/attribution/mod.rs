pub mod shortlink;
mod strategies;

use crate::config::AttributionSettings;
use crate::models::{AttributionMatch, AttributionStrategyKind};
use crate::store::{AdRecordStore, LeadStore};
use async_trait::async_trait;
use reqwest::Url;
use tracing::{debug, info};

pub use shortlink::ShortLinkExpander;

/// Everything a strategy may look at for one contact.
pub struct AttributionContext<'a> {
    pub tenant_id: &'a str,
    pub phone: &'a str,
    pub ads: &'a dyn AdRecordStore,
    pub leads: &'a dyn LeadStore,
    pub source_url: Option<String>,
    /// Targets found by short-link expansion.
    pub expanded_urls: Vec<String>,
    pub short_code: Option<String>,
    pub correlation_id: Option<String>,
    pub correlation_prefix_len: usize,
}

impl AttributionContext<'_> {
    /// Source URL followed by every expanded target.
    pub fn candidate_urls(&self) -> impl Iterator<Item = &str> {
        self.source_url
            .as_deref()
            .into_iter()
            .chain(self.expanded_urls.iter().map(String::as_str))
    }

    /// URLs the expansion strategy has not already looked up; that strategy
    /// covers every expanded target.
    pub fn unexpanded_urls(&self) -> impl Iterator<Item = &str> {
        self.source_url.as_deref().into_iter()
    }
}

#[async_trait]
pub trait AttributionStrategy: Send + Sync {
    fn kind(&self) -> AttributionStrategyKind;
    async fn try_match(&self, ctx: &AttributionContext<'_>) -> Option<AttributionMatch>;
}

pub struct AttributionInput<'a> {
    pub tenant_id: &'a str,
    pub phone: &'a str,
    pub source_url: Option<&'a str>,
    pub correlation_id: Option<&'a str>,
}

pub struct AttributionResolver {
    expander: ShortLinkExpander,
    settings: AttributionSettings,
}

impl AttributionResolver {
    pub fn new(settings: AttributionSettings) -> Self {
        Self {
            expander: ShortLinkExpander::new(&settings),
            settings,
        }
    }

    /// Runs the strategy chain; the first match wins. No match is an empty
    /// result, never an error.
    pub async fn resolve(
        &self,
        ads: &dyn AdRecordStore,
        leads: &dyn LeadStore,
        input: &AttributionInput<'_>,
    ) -> AttributionMatch {
        let source_url = input
            .source_url
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string);
        let expansion = match source_url.as_deref() {
            Some(url) => self.expander.expand(url).await,
            None => Default::default(),
        };
        let short_code = expansion.short_code.or_else(|| {
            source_url
                .as_deref()
                .and_then(|url| Url::parse(url).ok())
                .filter(|url| self.expander.is_short_link(url))
                .and_then(|url| shortlink::short_code(&url))
        });

        let ctx = AttributionContext {
            tenant_id: input.tenant_id,
            phone: input.phone,
            ads,
            leads,
            source_url,
            expanded_urls: expansion.urls,
            short_code,
            correlation_id: input.correlation_id.map(str::to_string),
            correlation_prefix_len: self.settings.correlation_prefix_len,
        };

        for strategy in strategies::CHAIN {
            if let Some(found) = strategy.try_match(&ctx).await {
                info!(
                    target = "salesignal.attribution",
                    tenant = input.tenant_id,
                    strategy = ?strategy.kind(),
                    campaign = ?found.campaign_id,
                    "attribution_matched"
                );
                return found;
            }
        }
        debug!(target = "salesignal.attribution", tenant = input.tenant_id, "attribution_unmatched");
        AttributionMatch::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AdRecord, Lead};
    use crate::store::{LeadStore, MemoryStore};
    use chrono::{Duration, Utc};
    use httpmock::Method;
    use httpmock::prelude::*;

    fn ad(id: &str, campaign: &str) -> AdRecord {
        AdRecord {
            ad_id: id.into(),
            ad_set_id: Some(format!("set-{id}")),
            campaign_id: Some(campaign.into()),
            ad_account_id: Some("acc-1".into()),
            ..AdRecord::default()
        }
    }

    fn input<'a>(source_url: Option<&'a str>, correlation: Option<&'a str>) -> AttributionInput<'a> {
        AttributionInput {
            tenant_id: "t-1",
            phone: "5511999990000",
            source_url,
            correlation_id: correlation,
        }
    }

    #[tokio::test]
    async fn short_link_resolves_to_campaign_of_owning_ad() {
        let server = MockServer::start_async().await;
        let target = format!(
            "{}/permalink.php?story_fbid=778899001122&id=1001",
            server.base_url()
        );
        server.mock(|when, then| {
            when.method(Method::HEAD).path("/aBc9");
            then.status(302).header("Location", target.as_str());
        });
        server.mock(|when, then| {
            when.method(Method::HEAD).path("/permalink.php");
            then.status(200);
        });

        let store = MemoryStore::new();
        store
            .add_ad(
                "t-1",
                AdRecord {
                    post_reference: Some("1001_778899001122".into()),
                    ..ad("ad-7", "camp-7")
                },
            )
            .await;
        store.add_ad("t-1", ad("ad-8", "camp-8")).await;

        let mut settings = AttributionSettings::default();
        settings.short_link_hosts.push("127.0.0.1".into());
        let resolver = AttributionResolver::new(settings);
        let source = format!("{}/aBc9", server.base_url());
        let found = resolver
            .resolve(&store, &store, &input(Some(&source), None))
            .await;
        assert_eq!(found.campaign_id.as_deref(), Some("camp-7"));
        assert_eq!(found.strategy, Some(AttributionStrategyKind::ShortLinkExpansion));
    }

    #[tokio::test]
    async fn post_path_identifier_matches_post_reference() {
        let store = MemoryStore::new();
        store
            .add_ad(
                "t-1",
                AdRecord {
                    post_reference: Some("55501_1234567".into()),
                    ..ad("ad-1", "camp-1")
                },
            )
            .await;
        let resolver = AttributionResolver::new(AttributionSettings::default());
        let found = resolver
            .resolve(
                &store,
                &store,
                &input(Some("https://www.facebook.com/lojaexemplo/posts/1234567/"), None),
            )
            .await;
        assert_eq!(found.campaign_id.as_deref(), Some("camp-1"));
        assert_eq!(found.strategy, Some(AttributionStrategyKind::PostIdentifier));
    }

    #[tokio::test]
    async fn normalized_url_matches_destination_field() {
        let store = MemoryStore::new();
        store
            .add_ad(
                "t-1",
                AdRecord {
                    destination_url: Some("https://loja.example.com/oferta-pix?utm_source=fb".into()),
                    ..ad("ad-2", "camp-2")
                },
            )
            .await;
        let resolver = AttributionResolver::new(AttributionSettings::default());
        let found = resolver
            .resolve(
                &store,
                &store,
                &input(Some("http://www.loja.example.com/oferta-pix/?fbclid=xyz"), None),
            )
            .await;
        assert_eq!(found.campaign_id.as_deref(), Some("camp-2"));
        assert_eq!(found.strategy, Some(AttributionStrategyKind::NormalizedUrl));
    }

    #[tokio::test]
    async fn long_numeric_ids_match_on_ten_digit_prefix() {
        let store = MemoryStore::new();
        store
            .add_ad(
                "t-1",
                AdRecord {
                    post_reference: Some("1234567890".into()),
                    ..ad("ad-3", "camp-3")
                },
            )
            .await;
        let resolver = AttributionResolver::new(AttributionSettings::default());
        let found = resolver
            .resolve(
                &store,
                &store,
                &input(Some("https://www.facebook.com/ads/landing/123456789012345678"), None),
            )
            .await;
        assert_eq!(found.campaign_id.as_deref(), Some("camp-3"));
        assert_eq!(found.strategy, Some(AttributionStrategyKind::NumericPrefix));
    }

    #[tokio::test]
    async fn correlation_prefix_borrows_campaign_from_sibling_lead() {
        let store = MemoryStore::new();
        let base = Lead {
            tenant_id: "t-1".into(),
            phone: "5511888880000".into(),
            first_contact_at: Utc::now() - Duration::days(2),
            purchase_sent_at: None,
            purchase_value: 0.0,
            ad_id: Some("ad-old".into()),
            ad_set_id: None,
            campaign_id: Some("camp-old".into()),
            ad_account_id: None,
            page_id: None,
            correlation_id: Some("ARAkLmN0pQrStUvWxYz0-older".into()),
            source_url: None,
            updated_at: Some(Utc::now() - Duration::days(2)),
        };
        store.save_lead(&base).await.unwrap();
        store
            .save_lead(&Lead {
                phone: "5511777770000".into(),
                campaign_id: Some("camp-new".into()),
                ad_id: Some("ad-new".into()),
                correlation_id: Some("ARAkLmN0pQrStUvWxYz0-newer".into()),
                updated_at: Some(Utc::now()),
                ..base.clone()
            })
            .await
            .unwrap();

        let resolver = AttributionResolver::new(AttributionSettings::default());
        let found = resolver
            .resolve(&store, &store, &input(None, Some("ARAkLmN0pQrStUvWxYz0-mine")))
            .await;
        assert_eq!(found.campaign_id.as_deref(), Some("camp-new"));
        assert_eq!(
            found.strategy,
            Some(AttributionStrategyKind::CorrelationSimilarity)
        );
    }

    #[tokio::test]
    async fn nothing_to_go_on_yields_empty_match() {
        let store = MemoryStore::new();
        let resolver = AttributionResolver::new(AttributionSettings::default());
        let found = resolver
            .resolve(&store, &store, &input(Some("not a url"), Some("short")))
            .await;
        assert!(found.is_empty());
        assert_eq!(found.strategy, None);
    }
}
