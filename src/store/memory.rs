use super::{
    AdAccount, AdRecordStore, AutomationFlow, FlowSession, FlowStore, LabelCacheStore,
    LeadStore, NotificationTemplate, RegisteredPixel, RunLogStore, SessionStatus, StoreError,
    TenantStore,
};
use crate::config::TenantConfig;
use crate::models::{AdRecord, LabelCacheEntry, Lead, PipelineRunLog, RecipientRegistryEntry};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::Mutex;

#[derive(Default)]
struct MemoryState {
    configs: HashMap<String, TenantConfig>,
    registry: HashMap<String, Vec<RecipientRegistryEntry>>,
    ad_accounts: HashMap<String, Vec<AdAccount>>,
    pixels: HashMap<String, Vec<RegisteredPixel>>,
    templates: HashMap<String, Vec<NotificationTemplate>>,
    label_cache: HashMap<(String, String), LabelCacheEntry>,
    ads: HashMap<String, Vec<AdRecord>>,
    leads: HashMap<(String, String), Lead>,
    run_logs: Vec<PipelineRunLog>,
    flows: Vec<AutomationFlow>,
    sessions: Vec<FlowSession>,
    cancelled_timers: Vec<String>,
    lead_write_delay: Option<Duration>,
    ad_account_error: Option<String>,
}

/// In-process store used by the offline demo mode and tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_tenant_config(&self, tenant_id: &str, config: TenantConfig) {
        self.state
            .lock()
            .await
            .configs
            .insert(tenant_id.to_string(), config);
    }

    pub async fn add_recipient(&self, tenant_id: &str, entry: RecipientRegistryEntry) {
        self.state
            .lock()
            .await
            .registry
            .entry(tenant_id.to_string())
            .or_default()
            .push(entry);
    }

    pub async fn add_ad_account(&self, tenant_id: &str, account: AdAccount) {
        self.state
            .lock()
            .await
            .ad_accounts
            .entry(tenant_id.to_string())
            .or_default()
            .push(account);
    }

    pub async fn add_pixel(&self, tenant_id: &str, pixel: RegisteredPixel) {
        self.state
            .lock()
            .await
            .pixels
            .entry(tenant_id.to_string())
            .or_default()
            .push(pixel);
    }

    pub async fn add_template(&self, tenant_id: &str, template: NotificationTemplate) {
        self.state
            .lock()
            .await
            .templates
            .entry(tenant_id.to_string())
            .or_default()
            .push(template);
    }

    pub async fn add_ad(&self, tenant_id: &str, ad: AdRecord) {
        self.state
            .lock()
            .await
            .ads
            .entry(tenant_id.to_string())
            .or_default()
            .push(ad);
    }

    pub async fn add_flow(&self, flow: AutomationFlow) {
        self.state.lock().await.flows.push(flow);
    }

    pub async fn add_session(&self, session: FlowSession) {
        self.state.lock().await.sessions.push(session);
    }

    pub async fn run_logs(&self) -> Vec<PipelineRunLog> {
        self.state.lock().await.run_logs.clone()
    }

    pub async fn sessions(&self) -> Vec<FlowSession> {
        self.state.lock().await.sessions.clone()
    }

    pub async fn cancelled_timers(&self) -> Vec<String> {
        self.state.lock().await.cancelled_timers.clone()
    }

    /// Every `save_lead` sleeps this long before writing.
    pub async fn delay_lead_writes(&self, delay: Duration) {
        self.state.lock().await.lead_write_delay = Some(delay);
    }

    pub async fn fail_ad_account_lookups(&self, message: &str) {
        self.state.lock().await.ad_account_error = Some(message.to_string());
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[async_trait]
impl TenantStore for MemoryStore {
    async fn tenant_config(&self, tenant_id: &str) -> Result<Option<TenantConfig>, StoreError> {
        Ok(self.state.lock().await.configs.get(tenant_id).cloned())
    }

    async fn recipient_registry(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<RecipientRegistryEntry>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .registry
            .get(tenant_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn ad_accounts(&self, tenant_id: &str) -> Result<Vec<AdAccount>, StoreError> {
        let state = self.state.lock().await;
        if let Some(message) = &state.ad_account_error {
            return Err(StoreError::Request(message.clone()));
        }
        Ok(state.ad_accounts.get(tenant_id).cloned().unwrap_or_default())
    }

    async fn registered_pixels(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<RegisteredPixel>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .pixels
            .get(tenant_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn notification_templates(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<NotificationTemplate>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .templates
            .get(tenant_id)
            .map(|all| all.iter().filter(|t| t.active).cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl LabelCacheStore for MemoryStore {
    async fn get_label_cache(
        &self,
        tenant_id: &str,
        instance_id: &str,
    ) -> Result<Option<LabelCacheEntry>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .label_cache
            .get(&(tenant_id.to_string(), instance_id.to_string()))
            .cloned())
    }

    async fn save_label_cache(&self, entry: &LabelCacheEntry) -> Result<(), StoreError> {
        self.state.lock().await.label_cache.insert(
            (entry.tenant_id.clone(), entry.instance_id.clone()),
            entry.clone(),
        );
        Ok(())
    }

    async fn clear_label_cache(
        &self,
        tenant_id: &str,
        instance_id: &str,
    ) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .label_cache
            .remove(&(tenant_id.to_string(), instance_id.to_string()));
        Ok(())
    }
}

#[async_trait]
impl AdRecordStore for MemoryStore {
    async fn find_ad_by_post_reference(
        &self,
        tenant_id: &str,
        fragment: &str,
    ) -> Result<Option<AdRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.ads.get(tenant_id).and_then(|ads| {
            ads.iter()
                .find(|ad| {
                    ad.post_reference
                        .as_deref()
                        .is_some_and(|reference| contains_ci(reference, fragment))
                })
                .cloned()
        }))
    }

    async fn find_ad_by_url_fragment(
        &self,
        tenant_id: &str,
        fragment: &str,
    ) -> Result<Option<AdRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.ads.get(tenant_id).and_then(|ads| {
            ads.iter()
                .find(|ad| ad.url_fields().any(|url| contains_ci(url, fragment)))
                .cloned()
        }))
    }
}

#[async_trait]
impl LeadStore for MemoryStore {
    async fn get_lead(&self, tenant_id: &str, phone: &str) -> Result<Option<Lead>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .leads
            .get(&(tenant_id.to_string(), phone.to_string()))
            .cloned())
    }

    async fn save_lead(&self, lead: &Lead) -> Result<(), StoreError> {
        let delay = self.state.lock().await.lead_write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state
            .lock()
            .await
            .leads
            .insert((lead.tenant_id.clone(), lead.phone.clone()), lead.clone());
        Ok(())
    }

    async fn find_attributed_lead_by_correlation_prefix(
        &self,
        tenant_id: &str,
        prefix: &str,
        exclude_phone: &str,
    ) -> Result<Option<Lead>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .leads
            .values()
            .filter(|lead| lead.tenant_id == tenant_id && lead.phone != exclude_phone)
            .filter(|lead| lead.campaign_id.is_some())
            .filter(|lead| {
                lead.correlation_id
                    .as_deref()
                    .is_some_and(|id| id.starts_with(prefix))
            })
            .max_by_key(|lead| lead.updated_at.unwrap_or(lead.first_contact_at))
            .cloned())
    }
}

#[async_trait]
impl RunLogStore for MemoryStore {
    async fn has_label_applied(
        &self,
        tenant_id: &str,
        instance_id: &str,
        phone: &str,
    ) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.run_logs.iter().any(|log| {
            log.tenant_id == tenant_id
                && log.instance_id == instance_id
                && log.phone == phone
                && log.label_applied
        }))
    }

    async fn append_run_log(&self, log: &PipelineRunLog) -> Result<(), StoreError> {
        self.state.lock().await.run_logs.push(log.clone());
        Ok(())
    }
}

#[async_trait]
impl FlowStore for MemoryStore {
    async fn flows_by_trigger(
        &self,
        tenant_id: &str,
        trigger_type: &str,
    ) -> Result<Vec<AutomationFlow>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .flows
            .iter()
            .filter(|flow| {
                flow.tenant_id == tenant_id && flow.trigger_type == trigger_type && flow.active
            })
            .cloned()
            .collect())
    }

    async fn running_sessions(
        &self,
        tenant_id: &str,
        phone: &str,
    ) -> Result<Vec<FlowSession>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .sessions
            .iter()
            .filter(|s| {
                s.tenant_id == tenant_id && s.phone == phone && s.status == SessionStatus::Running
            })
            .cloned()
            .collect())
    }

    async fn pause_session(&self, session_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(session) = state.sessions.iter_mut().find(|s| s.id == session_id) {
            session.status = SessionStatus::Paused;
        }
        state.cancelled_timers.push(session_id.to_string());
        Ok(())
    }
}
