use crate::gateway::{ChatGateway, ChatLabel, GatewayError};
use crate::models::{LabelCacheEntry, LabelOutcome};
use crate::store::LabelCacheStore;
use chrono::Utc;
use tracing::{info, warn};

/// Tenant-scoped cache over the chat platform's "paid" label id. The cached id
/// can go stale whenever the label is deleted or recreated outside the service.
pub struct LabelCache<'a> {
    store: &'a dyn LabelCacheStore,
    gateway: &'a dyn ChatGateway,
    tenant_id: &'a str,
    instance_id: &'a str,
    name: &'a str,
}

impl<'a> LabelCache<'a> {
    pub fn new(
        store: &'a dyn LabelCacheStore,
        gateway: &'a dyn ChatGateway,
        tenant_id: &'a str,
        instance_id: &'a str,
        name: &'a str,
    ) -> Self {
        Self {
            store,
            gateway,
            tenant_id,
            instance_id,
            name,
        }
    }

    async fn cached(&self) -> Option<String> {
        match self
            .store
            .get_label_cache(self.tenant_id, self.instance_id)
            .await
        {
            Ok(entry) => entry
                .filter(|entry| entry.label_name.eq_ignore_ascii_case(self.name))
                .map(|entry| entry.label_id),
            Err(err) => {
                warn!(target = "salesignal.labels", tenant = self.tenant_id, error = %err, "label_cache_read_failed");
                None
            }
        }
    }

    pub async fn invalidate(&self) {
        if let Err(err) = self
            .store
            .clear_label_cache(self.tenant_id, self.instance_id)
            .await
        {
            warn!(target = "salesignal.labels", tenant = self.tenant_id, error = %err, "label_cache_clear_failed");
        }
    }

    async fn remember(&self, label_id: &str) {
        let entry = LabelCacheEntry {
            tenant_id: self.tenant_id.to_string(),
            instance_id: self.instance_id.to_string(),
            label_id: label_id.to_string(),
            label_name: self.name.to_string(),
            updated_at: Utc::now(),
        };
        if let Err(err) = self.store.save_label_cache(&entry).await {
            warn!(target = "salesignal.labels", tenant = self.tenant_id, error = %err, "label_cache_write_failed");
        }
    }

    fn find(&self, labels: &[ChatLabel]) -> Option<String> {
        labels
            .iter()
            .find(|label| label.name.trim().eq_ignore_ascii_case(self.name.trim()))
            .map(|label| label.id.clone())
    }

    /// Cached id when present, otherwise a fresh lookup.
    pub async fn resolve_or_create(&self) -> Result<String, GatewayError> {
        match self.cached().await {
            Some(id) => Ok(id),
            None => self.resolve_fresh().await,
        }
    }

    /// Looks the label up by name, creating it when missing, and caches the id.
    pub async fn resolve_fresh(&self) -> Result<String, GatewayError> {
        let labels = self.gateway.list_labels(self.instance_id).await?;
        if let Some(id) = self.find(&labels) {
            self.remember(&id).await;
            return Ok(id);
        }

        let created = self.gateway.create_label(self.instance_id, self.name).await?;
        info!(target = "salesignal.labels", tenant = self.tenant_id, label = self.name, "label_created");
        let relisted = self.gateway.list_labels(self.instance_id).await?;
        let id = self
            .find(&relisted)
            .or(created)
            .ok_or_else(|| GatewayError::LabelNotFound(self.name.to_string()))?;
        self.remember(&id).await;
        Ok(id)
    }
}

/// Applies the label, self-healing a stale cached id at most once.
pub async fn apply_paid_label(
    cache: &LabelCache<'_>,
    gateway: &dyn ChatGateway,
    instance_id: &str,
    phone: &str,
) -> LabelOutcome {
    let label_id = match cache.resolve_or_create().await {
        Ok(id) => id,
        Err(err) => {
            return LabelOutcome {
                error: Some(format!("resolve_failed: {err}")),
                ..LabelOutcome::default()
            };
        }
    };

    match gateway.apply_label(instance_id, phone, &label_id).await {
        Ok(()) => LabelOutcome {
            applied: true,
            label_id: Some(label_id),
            ..LabelOutcome::default()
        },
        Err(GatewayError::LabelNotFound(_)) => {
            warn!(target = "salesignal.labels", label_id = %label_id, "stale_label_id_self_heal");
            cache.invalidate().await;
            let fresh = match cache.resolve_fresh().await {
                Ok(id) => id,
                Err(err) => {
                    return LabelOutcome {
                        label_id: Some(label_id),
                        self_healed: true,
                        error: Some(format!("re_resolve_failed: {err}")),
                        ..LabelOutcome::default()
                    };
                }
            };
            match gateway.apply_label(instance_id, phone, &fresh).await {
                Ok(()) => LabelOutcome {
                    applied: true,
                    label_id: Some(fresh),
                    self_healed: true,
                    error: None,
                },
                Err(err) => LabelOutcome {
                    applied: false,
                    label_id: Some(fresh),
                    self_healed: true,
                    error: Some(err.to_string()),
                },
            }
        }
        Err(err) => LabelOutcome {
            label_id: Some(label_id),
            error: Some(err.to_string()),
            ..LabelOutcome::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LabelCacheStore, MemoryStore};
    use crate::testing::FakeGateway;

    async fn seed_cache(store: &MemoryStore, id: &str) {
        store
            .save_label_cache(&LabelCacheEntry {
                tenant_id: "t-1".into(),
                instance_id: "inst-1".into(),
                label_id: id.into(),
                label_name: "Pago".into(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_label_is_created_and_cached() {
        let store = MemoryStore::new();
        let gateway = FakeGateway::default();
        let cache = LabelCache::new(&store, &gateway, "t-1", "inst-1", "Pago");
        let outcome = apply_paid_label(&cache, &gateway, "inst-1", "5511999990000").await;
        assert!(outcome.applied);
        assert!(!outcome.self_healed);
        let cached = store.get_label_cache("t-1", "inst-1").await.unwrap().unwrap();
        assert_eq!(Some(cached.label_id), outcome.label_id);
        assert_eq!(gateway.created_labels(), vec!["Pago".to_string()]);
    }

    #[tokio::test]
    async fn stale_cached_id_heals_once_and_refreshes_cache() {
        let store = MemoryStore::new();
        let gateway = FakeGateway::default().with_label("77", "pago");
        seed_cache(&store, "12").await;
        let cache = LabelCache::new(&store, &gateway, "t-1", "inst-1", "Pago");
        let outcome = apply_paid_label(&cache, &gateway, "inst-1", "5511999990000").await;
        assert!(outcome.applied);
        assert!(outcome.self_healed);
        assert_eq!(outcome.label_id.as_deref(), Some("77"));
        assert_eq!(gateway.apply_calls(), vec!["12".to_string(), "77".to_string()]);
        let cached = store.get_label_cache("t-1", "inst-1").await.unwrap().unwrap();
        assert_eq!(cached.label_id, "77");
    }

    #[tokio::test]
    async fn heal_is_bounded_to_a_single_retry() {
        let store = MemoryStore::new();
        let gateway = FakeGateway::default()
            .with_label("77", "Pago")
            .always_stale();
        seed_cache(&store, "12").await;
        let cache = LabelCache::new(&store, &gateway, "t-1", "inst-1", "Pago");
        let outcome = apply_paid_label(&cache, &gateway, "inst-1", "5511999990000").await;
        assert!(!outcome.applied);
        assert!(outcome.self_healed);
        assert_eq!(gateway.apply_calls().len(), 2);
        assert!(outcome.error.is_some());
        // fresh id is cached even though the apply failed
        let cached = store.get_label_cache("t-1", "inst-1").await.unwrap().unwrap();
        assert_eq!(cached.label_id, "77");
    }

    #[tokio::test]
    async fn other_failures_are_terminal_without_heal() {
        let store = MemoryStore::new();
        let gateway = FakeGateway::default()
            .with_label("77", "Pago")
            .failing_apply("HTTP 500");
        let cache = LabelCache::new(&store, &gateway, "t-1", "inst-1", "Pago");
        let outcome = apply_paid_label(&cache, &gateway, "inst-1", "5511999990000").await;
        assert!(!outcome.applied);
        assert!(!outcome.self_healed);
        assert_eq!(gateway.apply_calls().len(), 1);
    }
}
