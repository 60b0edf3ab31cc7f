use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Webhook envelope as delivered by the chat gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(default)]
    pub data: Option<WebhookMessage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookMessage {
    pub key: MessageKey,
    #[serde(default)]
    pub message: Option<MessageContent>,
    #[serde(default)]
    pub context_info: Option<ContextInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    pub id: String,
    #[serde(default)]
    pub remote_jid: Option<String>,
    #[serde(default)]
    pub from_me: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContent {
    #[serde(default)]
    pub image_message: Option<AttachmentDescriptor>,
    #[serde(default)]
    pub document_message: Option<AttachmentDescriptor>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentDescriptor {
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextInfo {
    #[serde(default)]
    pub external_ad_reply: Option<ExternalAdReply>,
    #[serde(default)]
    pub ctwa_clid: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalAdReply {
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub ctwa_clid: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Document,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Document => "document",
        }
    }
}

/// Ad click metadata the gateway attaches to ad-originated chats.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AdContext {
    pub source_url: Option<String>,
    pub source_id: Option<String>,
    pub correlation_id: Option<String>,
    /// `fbclid` query parameter of the ad's landing URL, when it carried one.
    #[serde(default)]
    pub fbclid: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IncomingEvent {
    pub tenant_id: String,
    pub instance_id: String,
    pub message_id: String,
    pub sender_phone: String,
    pub media_kind: MediaKind,
    pub mime_type: Option<String>,
    pub outgoing: bool,
    pub context: Option<AdContext>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AmountSource {
    StructuredField,
    AmountText,
    RawTextScan,
    FollowupModel,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClassificationResult {
    pub is_payment_proof: bool,
    pub confidence: u8,
    pub amount: Option<f64>,
    pub amount_raw_text: Option<String>,
    pub amount_source: Option<AmountSource>,
    pub recipient_name: Option<String>,
    pub recipient_tax_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub model: Option<String>,
}

impl ClassificationResult {
    pub fn not_a_proof(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn is_actionable(&self, threshold: u8) -> bool {
        self.is_payment_proof && self.confidence >= threshold
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecipientRegistryEntry {
    pub name: String,
    #[serde(default)]
    pub tax_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttributionStrategyKind {
    ShortLinkExpansion,
    PostIdentifier,
    NormalizedUrl,
    NumericPrefix,
    ShortCode,
    CorrelationSimilarity,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AttributionMatch {
    pub ad_id: Option<String>,
    pub ad_set_id: Option<String>,
    pub campaign_id: Option<String>,
    pub ad_account_id: Option<String>,
    pub page_id: Option<String>,
    pub strategy: Option<AttributionStrategyKind>,
}

impl AttributionMatch {
    pub fn is_empty(&self) -> bool {
        self.ad_id.is_none() && self.ad_set_id.is_none() && self.campaign_id.is_none()
    }
}

/// Advertisement row synced from the ad platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AdRecord {
    pub ad_id: String,
    #[serde(default)]
    pub ad_set_id: Option<String>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub ad_account_id: Option<String>,
    #[serde(default)]
    pub page_id: Option<String>,
    /// `effective_object_story_id` style reference, e.g. `pageid_postid`.
    #[serde(default)]
    pub post_reference: Option<String>,
    #[serde(default)]
    pub permalink_url: Option<String>,
    #[serde(default)]
    pub destination_url: Option<String>,
}

impl AdRecord {
    pub fn to_match(&self, strategy: AttributionStrategyKind) -> AttributionMatch {
        AttributionMatch {
            ad_id: Some(self.ad_id.clone()),
            ad_set_id: self.ad_set_id.clone(),
            campaign_id: self.campaign_id.clone(),
            ad_account_id: self.ad_account_id.clone(),
            page_id: self.page_id.clone(),
            strategy: Some(strategy),
        }
    }

    pub fn url_fields(&self) -> impl Iterator<Item = &str> {
        [
            self.permalink_url.as_deref(),
            self.destination_url.as_deref(),
        ]
        .into_iter()
        .flatten()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lead {
    pub tenant_id: String,
    pub phone: String,
    pub first_contact_at: DateTime<Utc>,
    #[serde(default)]
    pub purchase_sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub purchase_value: f64,
    #[serde(default)]
    pub ad_id: Option<String>,
    #[serde(default)]
    pub ad_set_id: Option<String>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub ad_account_id: Option<String>,
    #[serde(default)]
    pub page_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabelCacheEntry {
    pub tenant_id: String,
    pub instance_id: String,
    pub label_id: String,
    pub label_name: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPath {
    ReportAll,
    Optimize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchAttempt {
    pub path: DispatchPath,
    pub target_id: String,
    pub pixel_id: Option<String>,
    pub success: bool,
    pub events_received: Option<u32>,
    pub external_error_code: Option<i64>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FraudCheck {
    Skipped,
    Matched { name: String },
    Mismatch {
        recipient_name: Option<String>,
        recipient_tax_id: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LabelOutcome {
    pub applied: bool,
    pub label_id: Option<String>,
    pub self_healed: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChargeOutcome {
    Sent { amount: f64 },
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Queued,
    Skipped { reason: String },
    Failed { error: String },
}

/// One row per processed webhook delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRunLog {
    pub id: Uuid,
    pub tenant_id: String,
    pub instance_id: String,
    pub message_id: String,
    pub phone: String,
    pub media_kind: MediaKind,
    pub classification: Option<ClassificationResult>,
    pub fraud_check: Option<FraudCheck>,
    pub already_labeled: bool,
    pub label_applied: bool,
    pub label: Option<LabelOutcome>,
    pub charge: Option<ChargeOutcome>,
    pub attribution: Option<AttributionMatch>,
    pub lead_updated: bool,
    pub dispatch_attempts: Vec<DispatchAttempt>,
    pub notification: Option<TriggerOutcome>,
    pub automation: Option<TriggerOutcome>,
    pub stages: Vec<StageReport>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PipelineRunLog {
    pub fn new(event: &IncomingEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: event.tenant_id.clone(),
            instance_id: event.instance_id.clone(),
            message_id: event.message_id.clone(),
            phone: event.sender_phone.clone(),
            media_kind: event.media_kind,
            classification: None,
            fraud_check: None,
            already_labeled: false,
            label_applied: false,
            label: None,
            charge: None,
            attribution: None,
            lead_updated: false,
            dispatch_attempts: Vec::new(),
            notification: None,
            automation: None,
            stages: Vec::new(),
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn push_error(&mut self, stage: &str, message: impl AsRef<str>) {
        let entry = format!("{stage}: {}", message.as_ref());
        self.error = Some(match self.error.take() {
            Some(existing) => format!("{existing}; {entry}"),
            None => entry,
        });
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ok,
    Skipped,
    Failed,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub status: StageStatus,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, status: StageStatus, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            status,
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Processed,
    Ignored,
    FraudSuspected,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookAck {
    pub status: AckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<StageReport>,
}

impl WebhookAck {
    pub fn ignored(reason: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Ignored,
            run_id: None,
            reason: Some(reason.into()),
            stages: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
