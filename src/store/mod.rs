pub mod memory;
pub mod supabase;

use crate::config::TenantConfig;
use crate::models::{
    AdRecord, LabelCacheEntry, Lead, PipelineRunLog, RecipientRegistryEntry,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryStore;
pub use supabase::SupabaseStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdAccount {
    pub id: String,
    pub access_token: String,
    #[serde(default)]
    pub selected_pixel_id: Option<String>,
    #[serde(default)]
    pub conversions_enabled: bool,
    /// The account the tenant picked as default for reporting.
    #[serde(default)]
    pub selected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisteredPixel {
    pub pixel_id: String,
    pub access_token: String,
    #[serde(default)]
    pub page_id: Option<String>,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationTemplate {
    pub title: String,
    pub body: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutomationFlow {
    pub id: String,
    pub tenant_id: String,
    pub trigger_type: String,
    /// Empty means the flow listens on every instance.
    #[serde(default)]
    pub instance_ids: Vec<String>,
    pub start_node_id: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Paused,
    Finished,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowSession {
    pub id: String,
    pub tenant_id: String,
    pub flow_id: String,
    pub phone: String,
    pub status: SessionStatus,
}

fn default_true() -> bool {
    true
}

#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn tenant_config(&self, tenant_id: &str) -> Result<Option<TenantConfig>, StoreError>;
    async fn recipient_registry(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<RecipientRegistryEntry>, StoreError>;
    async fn ad_accounts(&self, tenant_id: &str) -> Result<Vec<AdAccount>, StoreError>;
    /// Active pixels, any order; callers sort by priority.
    async fn registered_pixels(&self, tenant_id: &str)
    -> Result<Vec<RegisteredPixel>, StoreError>;
    async fn notification_templates(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<NotificationTemplate>, StoreError>;
}

#[async_trait]
pub trait LabelCacheStore: Send + Sync {
    async fn get_label_cache(
        &self,
        tenant_id: &str,
        instance_id: &str,
    ) -> Result<Option<LabelCacheEntry>, StoreError>;
    async fn save_label_cache(&self, entry: &LabelCacheEntry) -> Result<(), StoreError>;
    async fn clear_label_cache(&self, tenant_id: &str, instance_id: &str)
    -> Result<(), StoreError>;
}

#[async_trait]
pub trait AdRecordStore: Send + Sync {
    /// First ad whose post reference contains `fragment` (case-insensitive).
    async fn find_ad_by_post_reference(
        &self,
        tenant_id: &str,
        fragment: &str,
    ) -> Result<Option<AdRecord>, StoreError>;
    /// First ad whose permalink or destination URL contains `fragment`.
    async fn find_ad_by_url_fragment(
        &self,
        tenant_id: &str,
        fragment: &str,
    ) -> Result<Option<AdRecord>, StoreError>;
}

#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn get_lead(&self, tenant_id: &str, phone: &str) -> Result<Option<Lead>, StoreError>;
    async fn save_lead(&self, lead: &Lead) -> Result<(), StoreError>;
    /// Most recent lead of another contact sharing the correlation prefix and
    /// already carrying a campaign.
    async fn find_attributed_lead_by_correlation_prefix(
        &self,
        tenant_id: &str,
        prefix: &str,
        exclude_phone: &str,
    ) -> Result<Option<Lead>, StoreError>;
}

#[async_trait]
pub trait RunLogStore: Send + Sync {
    async fn has_label_applied(
        &self,
        tenant_id: &str,
        instance_id: &str,
        phone: &str,
    ) -> Result<bool, StoreError>;
    async fn append_run_log(&self, log: &PipelineRunLog) -> Result<(), StoreError>;
}

#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn flows_by_trigger(
        &self,
        tenant_id: &str,
        trigger_type: &str,
    ) -> Result<Vec<AutomationFlow>, StoreError>;
    async fn running_sessions(
        &self,
        tenant_id: &str,
        phone: &str,
    ) -> Result<Vec<FlowSession>, StoreError>;
    /// Pauses the session and cancels its pending timers.
    async fn pause_session(&self, session_id: &str) -> Result<(), StoreError>;
}

pub trait Store:
    TenantStore + LabelCacheStore + AdRecordStore + LeadStore + RunLogStore + FlowStore
{
}

impl<T> Store for T where
    T: TenantStore + LabelCacheStore + AdRecordStore + LeadStore + RunLogStore + FlowStore
{
}
