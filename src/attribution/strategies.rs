use super::{AttributionContext, AttributionStrategy};
use crate::models::{AttributionMatch, AttributionStrategyKind};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use tracing::debug;

const NUMERIC_PREFIX_LEN: usize = 10;
const MIN_SHORT_CODE_LEN: usize = 4;

static LONG_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{15,}").expect("long number regex"));

pub(super) const CHAIN: &[&dyn AttributionStrategy] = &[
    &ShortLinkExpansion,
    &PostIdentifier,
    &NormalizedUrl,
    &NumericPrefix,
    &ShortCode,
    &CorrelationSimilarity,
];

fn push_unique(out: &mut Vec<String>, value: &str) {
    if !value.is_empty() && !out.iter().any(|known| known == value) {
        out.push(value.to_string());
    }
}

/// Post or story identifiers carried by a platform URL:
/// `story_fbid`/`fbid` query params, `/{page}/posts|videos/{id}` paths and
/// Instagram `/p|reel|tv/{code}` paths.
pub fn post_identifiers(url: &Url) -> Vec<String> {
    let mut ids = Vec::new();
    for (key, value) in url.query_pairs() {
        if key == "story_fbid" || key == "fbid" {
            push_unique(&mut ids, value.trim());
        }
    }

    let segments: Vec<&str> = url
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    for window in segments.windows(3) {
        if matches!(window[1], "posts" | "videos") {
            push_unique(&mut ids, window[2]);
        }
    }
    let instagram = url
        .host_str()
        .is_some_and(|host| host.to_lowercase().ends_with("instagram.com"));
    if instagram {
        for window in segments.windows(2) {
            if matches!(window[0], "p" | "reel" | "tv") {
                push_unique(&mut ids, window[1]);
            }
        }
    }
    ids
}

/// Host (without `www.`) plus path, with scheme, query, fragment and trailing
/// slash removed.
pub fn normalize_url(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    let host = url.host_str()?.trim_start_matches("www.").to_lowercase();
    let path = url.path().trim_end_matches('/');
    Some(format!("{host}{path}"))
}

/// First ten digits of every run of 15+ digits.
pub fn numeric_prefixes<'a>(texts: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut prefixes = Vec::new();
    for text in texts {
        for found in LONG_NUMBER.find_iter(text) {
            push_unique(&mut prefixes, &found.as_str()[..NUMERIC_PREFIX_LEN]);
        }
    }
    prefixes
}

async fn match_post_reference(
    ctx: &AttributionContext<'_>,
    fragment: &str,
    kind: AttributionStrategyKind,
) -> Option<AttributionMatch> {
    match ctx.ads.find_ad_by_post_reference(ctx.tenant_id, fragment).await {
        Ok(found) => found.map(|ad| ad.to_match(kind)),
        Err(err) => {
            debug!(target = "salesignal.attribution", fragment, error = %err, "post_reference_lookup_failed");
            None
        }
    }
}

async fn match_url_fragment(
    ctx: &AttributionContext<'_>,
    fragment: &str,
    kind: AttributionStrategyKind,
) -> Option<AttributionMatch> {
    match ctx.ads.find_ad_by_url_fragment(ctx.tenant_id, fragment).await {
        Ok(found) => found.map(|ad| ad.to_match(kind)),
        Err(err) => {
            debug!(target = "salesignal.attribution", fragment, error = %err, "url_fragment_lookup_failed");
            None
        }
    }
}

async fn match_post_ids<'a>(
    ctx: &AttributionContext<'_>,
    urls: impl Iterator<Item = &'a str>,
    kind: AttributionStrategyKind,
) -> Option<AttributionMatch> {
    let parsed: Vec<Url> = urls.filter_map(|raw| Url::parse(raw).ok()).collect();
    for url in &parsed {
        for id in post_identifiers(url) {
            if let Some(found) = match_post_reference(ctx, &id, kind).await {
                return Some(found);
            }
        }
    }
    None
}

async fn match_normalized<'a>(
    ctx: &AttributionContext<'_>,
    urls: impl Iterator<Item = &'a str>,
    kind: AttributionStrategyKind,
) -> Option<AttributionMatch> {
    // host-only forms would match every ad on the domain
    let normalized: Vec<String> = urls
        .filter_map(normalize_url)
        .filter(|url| url.contains('/'))
        .collect();
    for url in &normalized {
        if let Some(found) = match_url_fragment(ctx, url, kind).await {
            return Some(found);
        }
    }
    None
}

pub(super) struct ShortLinkExpansion;
pub(super) struct PostIdentifier;
pub(super) struct NormalizedUrl;
pub(super) struct NumericPrefix;
pub(super) struct ShortCode;
pub(super) struct CorrelationSimilarity;

#[async_trait]
impl AttributionStrategy for ShortLinkExpansion {
    fn kind(&self) -> AttributionStrategyKind {
        AttributionStrategyKind::ShortLinkExpansion
    }

    async fn try_match(&self, ctx: &AttributionContext<'_>) -> Option<AttributionMatch> {
        if ctx.expanded_urls.is_empty() {
            return None;
        }
        let expanded = || ctx.expanded_urls.iter().map(String::as_str);
        if let Some(found) = match_post_ids(ctx, expanded(), self.kind()).await {
            return Some(found);
        }
        match_normalized(ctx, expanded(), self.kind()).await
    }
}

#[async_trait]
impl AttributionStrategy for PostIdentifier {
    fn kind(&self) -> AttributionStrategyKind {
        AttributionStrategyKind::PostIdentifier
    }

    async fn try_match(&self, ctx: &AttributionContext<'_>) -> Option<AttributionMatch> {
        match_post_ids(ctx, ctx.unexpanded_urls(), self.kind()).await
    }
}

#[async_trait]
impl AttributionStrategy for NormalizedUrl {
    fn kind(&self) -> AttributionStrategyKind {
        AttributionStrategyKind::NormalizedUrl
    }

    async fn try_match(&self, ctx: &AttributionContext<'_>) -> Option<AttributionMatch> {
        match_normalized(ctx, ctx.unexpanded_urls(), self.kind()).await
    }
}

#[async_trait]
impl AttributionStrategy for NumericPrefix {
    fn kind(&self) -> AttributionStrategyKind {
        AttributionStrategyKind::NumericPrefix
    }

    async fn try_match(&self, ctx: &AttributionContext<'_>) -> Option<AttributionMatch> {
        for prefix in numeric_prefixes(ctx.candidate_urls()) {
            if let Some(found) = match_post_reference(ctx, &prefix, self.kind()).await {
                return Some(found);
            }
        }
        None
    }
}

#[async_trait]
impl AttributionStrategy for ShortCode {
    fn kind(&self) -> AttributionStrategyKind {
        AttributionStrategyKind::ShortCode
    }

    async fn try_match(&self, ctx: &AttributionContext<'_>) -> Option<AttributionMatch> {
        let code = ctx
            .short_code
            .as_deref()
            .filter(|code| code.len() >= MIN_SHORT_CODE_LEN)?;
        match_url_fragment(ctx, code, self.kind()).await
    }
}

#[async_trait]
impl AttributionStrategy for CorrelationSimilarity {
    fn kind(&self) -> AttributionStrategyKind {
        AttributionStrategyKind::CorrelationSimilarity
    }

    async fn try_match(&self, ctx: &AttributionContext<'_>) -> Option<AttributionMatch> {
        let correlation = ctx.correlation_id.as_deref()?;
        if correlation.chars().count() < ctx.correlation_prefix_len {
            return None;
        }
        let prefix: String = correlation.chars().take(ctx.correlation_prefix_len).collect();
        let lead = match ctx
            .leads
            .find_attributed_lead_by_correlation_prefix(ctx.tenant_id, &prefix, ctx.phone)
            .await
        {
            Ok(lead) => lead?,
            Err(err) => {
                debug!(target = "salesignal.attribution", error = %err, "correlation_lookup_failed");
                return None;
            }
        };
        Some(AttributionMatch {
            ad_id: lead.ad_id,
            ad_set_id: lead.ad_set_id,
            campaign_id: lead.campaign_id,
            ad_account_id: lead.ad_account_id,
            page_id: lead.page_id,
            strategy: Some(self.kind()),
        })
    }
}
