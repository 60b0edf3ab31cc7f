use crate::models::ApiError;
use axum::{
    Json,
    body::{self, Body},
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use eyre::eyre;
use serde::Deserialize;
use std::{collections::HashMap, convert::Infallible, env, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

const WEBHOOK_KEY_HEADER: &str = "X-Webhook-Key";
const DEFAULT_BODY_LIMIT: usize = 256 * 1024;

#[derive(Clone)]
pub struct WebhookAuth {
    records: Arc<HashMap<String, TenantKey>>,
    limiter: Arc<InstanceBuckets>,
    body_limit: usize,
}

/// Inserted into request extensions once a webhook key is accepted.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthContext {
    pub tenant_id: String,
    pub key_id: String,
}

#[derive(Clone)]
struct TenantKey {
    tenant_id: String,
    key_id: String,
}

impl WebhookAuth {
    pub fn from_env() -> eyre::Result<Self> {
        let auth = Self::from_keys(&env::var("WEBHOOK_KEYS").unwrap_or_default())?;
        Ok(auth.with_rate(RateSettings::from_env()))
    }

    /// Fails when no `tenant:secret` pair survives parsing; the webhook is
    /// never served without a key.
    pub fn from_keys(raw: &str) -> eyre::Result<Self> {
        let records = parse_keys(raw);
        if records.is_empty() {
            return Err(eyre!(
                "WEBHOOK_KEYS must contain at least one tenant:secret pair"
            ));
        }
        info!(
            target = "salesignal.api",
            key_count = records.len(),
            "loaded webhook keys"
        );
        Ok(Self {
            records: Arc::new(records),
            limiter: Arc::new(InstanceBuckets::new(RateSettings::default())),
            body_limit: DEFAULT_BODY_LIMIT,
        })
    }

    pub fn with_rate(mut self, rate: RateSettings) -> Self {
        self.limiter = Arc::new(InstanceBuckets::new(rate));
        self
    }

    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    fn authenticate(&self, presented: &str) -> Option<AuthContext> {
        self.records.get(presented).map(|record| AuthContext {
            tenant_id: record.tenant_id.clone(),
            key_id: record.key_id.clone(),
        })
    }
}

#[derive(Deserialize)]
struct InstanceField {
    #[serde(default)]
    instance: Option<String>,
}

/// Gateway instance named in a delivery body; empty when absent or unparseable.
fn delivery_instance(bytes: &[u8]) -> String {
    serde_json::from_slice::<InstanceField>(bytes)
        .ok()
        .and_then(|field| field.instance)
        .map(|instance| instance.trim().to_string())
        .unwrap_or_default()
}

pub async fn require_webhook_key(
    State(state): State<WebhookAuth>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_key(request.headers()) else {
        return Ok(reject(
            StatusCode::UNAUTHORIZED,
            "missing_webhook_key",
            "Provide X-Webhook-Key or Bearer token",
        ));
    };

    let Some(context) = state.authenticate(&presented) else {
        warn!(target = "salesignal.api", "rejected unknown webhook key");
        return Ok(reject(
            StatusCode::UNAUTHORIZED,
            "invalid_webhook_key",
            "Key not recognized",
        ));
    };

    // buffered so the bucket can be chosen by instance; the handler reads it again
    let (parts, body) = request.into_parts();
    let Ok(bytes) = body::to_bytes(body, state.body_limit).await else {
        return Ok(reject(
            StatusCode::PAYLOAD_TOO_LARGE,
            "payload_too_large",
            "Request body exceeds the configured limit",
        ));
    };
    let key = BucketKey {
        tenant_id: context.tenant_id.clone(),
        instance_id: delivery_instance(&bytes),
    };

    match state.limiter.consume(&key).await {
        Ok(permit) => {
            let mut request = Request::from_parts(parts, Body::from(bytes));
            request.extensions_mut().insert(context);
            let mut response = next.run(request).await;
            permit.apply_headers(response.headers_mut());
            Ok(response)
        }
        Err(exceeded) => {
            warn!(
                target = "salesignal.api",
                tenant = %key.tenant_id,
                instance = %key.instance_id,
                "webhook rate limited"
            );
            let mut response = reject(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "Too many requests for this instance",
            );
            exceeded.apply_headers(response.headers_mut());
            Ok(response)
        }
    }
}

fn extract_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get(WEBHOOK_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn reject(status: StatusCode, code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (status, Json(payload)).into_response()
}

/// `tenant:secret` pairs separated by commas.
fn parse_keys(raw: &str) -> HashMap<String, TenantKey> {
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(2, ':');
        let tenant = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let secret = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (tenant, secret) {
            (Some(tenant), Some(secret)) => {
                entries.insert(
                    secret.to_string(),
                    TenantKey {
                        tenant_id: tenant.to_string(),
                        key_id: format!("key-{:02}", idx + 1),
                    },
                );
            }
            _ => warn!(
                target = "salesignal.api",
                "ignored malformed WEBHOOK_KEYS entry at position {}",
                idx + 1
            ),
        }
    }
    entries
}

/// Refill rate and burst size shared by every (tenant, instance) bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateSettings {
    pub per_sec: f64,
    pub burst: f64,
}

impl Default for RateSettings {
    fn default() -> Self {
        Self {
            per_sec: 5.0,
            burst: 10.0,
        }
    }
}

impl RateSettings {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            per_sec: env_f64("RATE_LIMIT_PER_SEC")
                .filter(|value| *value > 0.0)
                .unwrap_or(defaults.per_sec),
            burst: env_f64("RATE_LIMIT_CAPACITY")
                .filter(|value| *value >= 1.0)
                .unwrap_or(defaults.burst),
        }
    }
}

fn env_f64(name: &str) -> Option<f64> {
    env::var(name).ok().and_then(|value| value.parse().ok())
}

/// One gateway instance of one tenant. A busy instance drains only its own bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    tenant_id: String,
    instance_id: String,
}

struct InstanceBuckets {
    rate: RateSettings,
    buckets: Mutex<HashMap<BucketKey, BucketState>>,
}

impl InstanceBuckets {
    fn new(rate: RateSettings) -> Self {
        Self {
            rate,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    async fn consume(&self, key: &BucketKey) -> Result<RatePermit, RateExceeded> {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(key.clone())
            .or_insert_with(|| BucketState::full(self.rate));
        bucket.refill(self.rate, Instant::now());

        let quota = Quota {
            capacity: self.rate.burst,
            tokens: bucket.tokens,
            rate: self.rate.per_sec,
        };
        if bucket.tokens < 1.0 {
            return Err(RateExceeded {
                retry_after: (1.0 - bucket.tokens) / self.rate.per_sec,
                quota,
            });
        }
        bucket.tokens -= 1.0;
        Ok(RatePermit(Quota {
            tokens: bucket.tokens,
            ..quota
        }))
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn full(rate: RateSettings) -> Self {
        Self {
            tokens: rate.burst,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, rate: RateSettings, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate.per_sec).min(rate.burst);
        self.last_refill = now;
    }
}

#[derive(Debug, Clone, Copy)]
struct Quota {
    capacity: f64,
    tokens: f64,
    rate: f64,
}

impl Quota {
    fn apply_headers(&self, headers: &mut http::HeaderMap, remaining: u64) {
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        headers.insert("X-RateLimit-Limit", header_number(self.capacity as u64));
        headers.insert("X-RateLimit-Remaining", header_number(remaining));
        headers.insert("X-RateLimit-Reset", header_number(reset));
    }
}

fn header_number(value: u64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

#[derive(Debug)]
struct RatePermit(Quota);

impl RatePermit {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let remaining = self.0.tokens.max(0.0).floor() as u64;
        self.0.apply_headers(headers, remaining);
    }
}

#[derive(Debug)]
struct RateExceeded {
    retry_after: f64,
    quota: Quota,
}

impl RateExceeded {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let retry = self.retry_after.ceil().max(1.0) as u64;
        headers.insert(http::header::RETRY_AFTER, header_number(retry));
        self.quota.apply_headers(headers, 0);
    }
}
