use super::{
    AdAccount, AdRecordStore, AutomationFlow, FlowSession, FlowStore, LabelCacheStore,
    LeadStore, NotificationTemplate, RegisteredPixel, RunLogStore, StoreError, TenantStore,
};
use crate::config::TenantConfig;
use crate::http::build_client;
use crate::models::{AdRecord, LabelCacheEntry, Lead, PipelineRunLog, RecipientRegistryEntry};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use urlencoding::encode;

/// PostgREST-backed store; every table is scoped by `tenant_id`.
#[derive(Debug, Clone)]
pub struct SupabaseStore {
    base_url: String,
    service_key: String,
    http: Client,
}

#[derive(Deserialize)]
struct TenantSettingsRow {
    config: TenantConfig,
}

impl SupabaseStore {
    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
            http: build_client(),
        }
    }

    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self::new(base_url, service_key))
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn select<T: DeserializeOwned>(&self, query: String) -> Result<Vec<T>, StoreError> {
        let url = format!("{}/rest/v1/{query}", self.base_url);
        let response = self
            .authorized(self.http.get(url))
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(StoreError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))
    }

    async fn select_one<T: DeserializeOwned>(&self, query: String) -> Result<Option<T>, StoreError> {
        let mut rows = self.select::<T>(format!("{query}&limit=1")).await?;
        Ok(rows.pop())
    }

    async fn upsert<B: Serialize + ?Sized>(
        &self,
        table: &str,
        on_conflict: Option<&str>,
        body: &B,
    ) -> Result<(), StoreError> {
        let url = match on_conflict {
            Some(columns) => format!("{}/rest/v1/{table}?on_conflict={columns}", self.base_url),
            None => format!("{}/rest/v1/{table}", self.base_url),
        };
        let prefer = if on_conflict.is_some() {
            "resolution=merge-duplicates,return=minimal"
        } else {
            "return=minimal"
        };
        let response = self
            .authorized(self.http.post(url))
            .header("Prefer", prefer)
            .json(body)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn patch(&self, query: String, body: serde_json::Value) -> Result<(), StoreError> {
        let url = format!("{}/rest/v1/{query}", self.base_url);
        let response = self
            .authorized(self.http.patch(url))
            .header("Prefer", "return=minimal")
            .json(&body)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn delete(&self, query: String) -> Result<(), StoreError> {
        let url = format!("{}/rest/v1/{query}", self.base_url);
        let response = self
            .authorized(self.http.delete(url))
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// PostgREST pattern operand: reserved characters dropped, then URL-encoded.
fn pattern(fragment: &str) -> String {
    let cleaned: String = fragment
        .chars()
        .filter(|c| !matches!(c, ',' | '(' | ')' | '*' | '"' | '%'))
        .collect();
    encode(&cleaned).into_owned()
}

#[async_trait]
impl TenantStore for SupabaseStore {
    async fn tenant_config(&self, tenant_id: &str) -> Result<Option<TenantConfig>, StoreError> {
        let row: Option<TenantSettingsRow> = self
            .select_one(format!(
                "tenant_settings?tenant_id=eq.{}&select=config",
                encode(tenant_id)
            ))
            .await?;
        Ok(row.map(|row| row.config))
    }

    async fn recipient_registry(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<RecipientRegistryEntry>, StoreError> {
        self.select(format!(
            "recipient_registry?tenant_id=eq.{}&select=name,tax_id",
            encode(tenant_id)
        ))
        .await
    }

    async fn ad_accounts(&self, tenant_id: &str) -> Result<Vec<AdAccount>, StoreError> {
        self.select(format!(
            "ad_accounts?tenant_id=eq.{}&select=id,access_token,selected_pixel_id,conversions_enabled,selected",
            encode(tenant_id)
        ))
        .await
    }

    async fn registered_pixels(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<RegisteredPixel>, StoreError> {
        self.select(format!(
            "registered_pixels?tenant_id=eq.{}&active=is.true&select=pixel_id,access_token,page_id,priority&order=priority.asc",
            encode(tenant_id)
        ))
        .await
    }

    async fn notification_templates(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<NotificationTemplate>, StoreError> {
        self.select(format!(
            "notification_templates?tenant_id=eq.{}&active=is.true&select=title,body,active",
            encode(tenant_id)
        ))
        .await
    }
}

#[async_trait]
impl LabelCacheStore for SupabaseStore {
    async fn get_label_cache(
        &self,
        tenant_id: &str,
        instance_id: &str,
    ) -> Result<Option<LabelCacheEntry>, StoreError> {
        self.select_one(format!(
            "label_cache?tenant_id=eq.{}&instance_id=eq.{}&select=*",
            encode(tenant_id),
            encode(instance_id)
        ))
        .await
    }

    async fn save_label_cache(&self, entry: &LabelCacheEntry) -> Result<(), StoreError> {
        self.upsert("label_cache", Some("tenant_id,instance_id"), entry)
            .await
    }

    async fn clear_label_cache(
        &self,
        tenant_id: &str,
        instance_id: &str,
    ) -> Result<(), StoreError> {
        self.delete(format!(
            "label_cache?tenant_id=eq.{}&instance_id=eq.{}",
            encode(tenant_id),
            encode(instance_id)
        ))
        .await
    }
}

#[async_trait]
impl AdRecordStore for SupabaseStore {
    async fn find_ad_by_post_reference(
        &self,
        tenant_id: &str,
        fragment: &str,
    ) -> Result<Option<AdRecord>, StoreError> {
        self.select_one(format!(
            "ad_records?tenant_id=eq.{}&post_reference=ilike.*{}*&select=*&order=created_at.desc",
            encode(tenant_id),
            pattern(fragment)
        ))
        .await
    }

    async fn find_ad_by_url_fragment(
        &self,
        tenant_id: &str,
        fragment: &str,
    ) -> Result<Option<AdRecord>, StoreError> {
        let operand = pattern(fragment);
        self.select_one(format!(
            "ad_records?tenant_id=eq.{}&or=(permalink_url.ilike.*{operand}*,destination_url.ilike.*{operand}*)&select=*&order=created_at.desc",
            encode(tenant_id),
        ))
        .await
    }
}

#[async_trait]
impl LeadStore for SupabaseStore {
    async fn get_lead(&self, tenant_id: &str, phone: &str) -> Result<Option<Lead>, StoreError> {
        self.select_one(format!(
            "leads?tenant_id=eq.{}&phone=eq.{}&select=*",
            encode(tenant_id),
            encode(phone)
        ))
        .await
    }

    async fn save_lead(&self, lead: &Lead) -> Result<(), StoreError> {
        self.upsert("leads", Some("tenant_id,phone"), lead).await
    }

    async fn find_attributed_lead_by_correlation_prefix(
        &self,
        tenant_id: &str,
        prefix: &str,
        exclude_phone: &str,
    ) -> Result<Option<Lead>, StoreError> {
        self.select_one(format!(
            "leads?tenant_id=eq.{}&phone=neq.{}&correlation_id=like.{}*&campaign_id=not.is.null&select=*&order=updated_at.desc.nullslast",
            encode(tenant_id),
            encode(exclude_phone),
            pattern(prefix)
        ))
        .await
    }
}

#[derive(Deserialize)]
struct IdRow {
    #[allow(dead_code)]
    id: serde_json::Value,
}

#[async_trait]
impl RunLogStore for SupabaseStore {
    async fn has_label_applied(
        &self,
        tenant_id: &str,
        instance_id: &str,
        phone: &str,
    ) -> Result<bool, StoreError> {
        let row: Option<IdRow> = self
            .select_one(format!(
                "pipeline_run_logs?tenant_id=eq.{}&instance_id=eq.{}&phone=eq.{}&label_applied=is.true&select=id&order=created_at.desc",
                encode(tenant_id),
                encode(instance_id),
                encode(phone)
            ))
            .await?;
        Ok(row.is_some())
    }

    async fn append_run_log(&self, log: &PipelineRunLog) -> Result<(), StoreError> {
        self.upsert("pipeline_run_logs", None, log).await
    }
}

#[async_trait]
impl FlowStore for SupabaseStore {
    async fn flows_by_trigger(
        &self,
        tenant_id: &str,
        trigger_type: &str,
    ) -> Result<Vec<AutomationFlow>, StoreError> {
        self.select(format!(
            "automation_flows?tenant_id=eq.{}&trigger_type=eq.{}&active=is.true&select=*",
            encode(tenant_id),
            encode(trigger_type)
        ))
        .await
    }

    async fn running_sessions(
        &self,
        tenant_id: &str,
        phone: &str,
    ) -> Result<Vec<FlowSession>, StoreError> {
        self.select(format!(
            "automation_sessions?tenant_id=eq.{}&phone=eq.{}&status=eq.running&select=id,tenant_id,flow_id,phone,status",
            encode(tenant_id),
            encode(phone)
        ))
        .await
    }

    async fn pause_session(&self, session_id: &str) -> Result<(), StoreError> {
        self.patch(
            format!("automation_sessions?id=eq.{}", encode(session_id)),
            json!({ "status": "paused" }),
        )
        .await?;
        self.patch(
            format!(
                "automation_timers?session_id=eq.{}&status=eq.pending",
                encode(session_id)
            ),
            json!({ "status": "cancelled" }),
        )
        .await
    }
}
