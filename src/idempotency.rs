use crate::store::RunLogStore;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::warn;

/// Atomic "first writer wins" claim on a key.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// `Ok(true)` when this caller now owns the key.
    async fn try_claim(&self, key: &str, ttl: Duration) -> Result<bool, String>;
    async fn release(&self, key: &str);
}

pub struct RedisClaims {
    client: redis::Client,
}

impl RedisClaims {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClaimStore for RedisClaims {
    async fn try_claim(&self, key: &str, ttl: Duration) -> Result<bool, String> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| err.to_string())?;
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|err| err.to_string())?;
        Ok(set.is_some())
    }

    async fn release(&self, key: &str) {
        if let Ok(mut conn) = self.client.get_multiplexed_async_connection().await {
            let _: Result<(), _> = conn.del(key).await;
        }
    }
}

/// Process-local claims for single-node deployments and tests.
#[derive(Default)]
pub struct LocalClaims {
    claims: Mutex<HashMap<String, Instant>>,
}

impl LocalClaims {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClaimStore for LocalClaims {
    async fn try_claim(&self, key: &str, ttl: Duration) -> Result<bool, String> {
        let mut guard = self.claims.lock().await;
        let now = Instant::now();
        guard.retain(|_, expires| *expires > now);
        if guard.contains_key(key) {
            return Ok(false);
        }
        guard.insert(key.to_string(), now + ttl);
        Ok(true)
    }

    async fn release(&self, key: &str) {
        self.claims.lock().await.remove(key);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    /// Caller owns the paid-label claim and must release it if labeling fails.
    Proceed { claim_key: String },
    AlreadyLabeled { reason: &'static str },
}

pub fn claim_key(tenant_id: &str, instance_id: &str, phone: &str) -> String {
    format!("paid:{tenant_id}:{instance_id}:{phone}")
}

/// Prior-run lookup followed by an atomic claim, so two concurrent proofs for
/// the same contact cannot both reach the label stage.
pub async fn check(
    runs: &dyn RunLogStore,
    claims: &dyn ClaimStore,
    ttl: Duration,
    tenant_id: &str,
    instance_id: &str,
    phone: &str,
) -> GuardDecision {
    match runs.has_label_applied(tenant_id, instance_id, phone).await {
        Ok(true) => return GuardDecision::AlreadyLabeled { reason: "prior_run" },
        Ok(false) => {}
        Err(err) => {
            warn!(target = "salesignal.idempotency", tenant = tenant_id, error = %err, "label_history_lookup_failed");
        }
    }

    let key = claim_key(tenant_id, instance_id, phone);
    match claims.try_claim(&key, ttl).await {
        Ok(true) => GuardDecision::Proceed { claim_key: key },
        Ok(false) => GuardDecision::AlreadyLabeled {
            reason: "concurrent_claim",
        },
        Err(err) => {
            warn!(target = "salesignal.idempotency", key = %key, error = %err, "claim_unavailable_proceeding");
            GuardDecision::Proceed { claim_key: key }
        }
    }
}
