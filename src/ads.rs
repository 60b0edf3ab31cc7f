use crate::http::build_client;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use sha2::{Digest, Sha256};
use std::env;
use thiserror::Error;

const DEFAULT_GRAPH_BASE: &str = "https://graph.facebook.com";
const DEFAULT_GRAPH_VERSION: &str = "v21.0";

/// Graph subcodes returned when the pixel's page does not own the click id.
const PAGE_MISMATCH_SUBCODES: &[i64] = &[2_804_050, 2_804_019];

#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct AdPlatformError {
    pub message: String,
    pub code: Option<i64>,
    pub subcode: Option<i64>,
}

impl AdPlatformError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            subcode: None,
        }
    }

    /// Expected rejection when the event's page or click id belongs elsewhere.
    pub fn is_page_mismatch(&self) -> bool {
        if self
            .subcode
            .is_some_and(|subcode| PAGE_MISMATCH_SUBCODES.contains(&subcode))
        {
            return true;
        }
        let message = self.message.to_lowercase();
        message.contains("page_id") || message.contains("ctwa_clid")
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Pixel {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventMode {
    BusinessMessaging,
    Website,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct UserData {
    pub ph: Vec<String>,
    pub ctwa_clid: Option<String>,
    pub page_id: Option<String>,
    pub fbc: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CustomData {
    pub currency: String,
    pub value: f64,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct ConversionEvent {
    pub event_name: String,
    pub event_time: i64,
    pub event_id: String,
    pub action_source: String,
    pub messaging_channel: Option<String>,
    pub user_data: UserData,
    pub custom_data: CustomData,
}

pub struct PurchaseDetails<'a> {
    pub event_id: &'a str,
    pub phone: &'a str,
    pub value: f64,
    pub currency: &'a str,
    pub correlation_id: Option<&'a str>,
    pub page_id: Option<&'a str>,
    pub fbclid: Option<&'a str>,
}

impl ConversionEvent {
    pub fn purchase(details: &PurchaseDetails<'_>, mode: EventMode) -> Self {
        let now = Utc::now();
        let correlation = details.correlation_id.map(str::to_string);
        let user_data = match mode {
            EventMode::BusinessMessaging => UserData {
                ph: vec![hash_phone(details.phone)],
                ctwa_clid: correlation,
                page_id: details.page_id.map(str::to_string),
                fbc: None,
            },
            EventMode::Website => UserData {
                ph: vec![hash_phone(details.phone)],
                ctwa_clid: correlation,
                page_id: None,
                fbc: details
                    .fbclid
                    .map(|fbclid| format!("fb.1.{}.{fbclid}", now.timestamp_millis())),
            },
        };
        Self {
            event_name: "Purchase".into(),
            event_time: now.timestamp(),
            event_id: details.event_id.to_string(),
            action_source: match mode {
                EventMode::BusinessMessaging => "business_messaging".into(),
                EventMode::Website => "website".into(),
            },
            messaging_channel: match mode {
                EventMode::BusinessMessaging => Some("whatsapp".into()),
                EventMode::Website => None,
            },
            user_data,
            custom_data: CustomData {
                currency: details.currency.to_string(),
                value: details.value,
            },
        }
    }
}

/// Digits-only phone, SHA-256, lower-case hex.
pub fn hash_phone(phone: &str) -> String {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    format!("{:x}", Sha256::digest(digits.as_bytes()))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversionReceipt {
    pub events_received: u32,
}

#[async_trait]
pub trait AdPlatform: Send + Sync {
    async fn list_pixels(
        &self,
        ad_account_id: &str,
        access_token: &str,
    ) -> Result<Vec<Pixel>, AdPlatformError>;

    async fn send_conversion_event(
        &self,
        pixel_id: &str,
        access_token: &str,
        event: &ConversionEvent,
    ) -> Result<ConversionReceipt, AdPlatformError>;
}

#[derive(Debug, Clone)]
pub struct GraphApi {
    base_url: String,
    version: String,
    http: Client,
}

impl GraphApi {
    pub fn new(base_url: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            version: version.into(),
            http: build_client(),
        }
    }

    pub fn from_env() -> Self {
        let base = env::var("GRAPH_API_BASE").unwrap_or_else(|_| DEFAULT_GRAPH_BASE.into());
        let version =
            env::var("GRAPH_API_VERSION").unwrap_or_else(|_| DEFAULT_GRAPH_VERSION.into());
        Self::new(base, version)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{path}", self.base_url, self.version)
    }
}

#[derive(Deserialize)]
struct GraphErrorEnvelope {
    error: GraphErrorBody,
}

#[derive(Deserialize)]
struct GraphErrorBody {
    message: String,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    error_subcode: Option<i64>,
    #[serde(default)]
    error_user_msg: Option<String>,
}

#[derive(Deserialize)]
struct PixelList {
    #[serde(default)]
    data: Vec<Pixel>,
}

#[derive(Deserialize)]
struct EventsResponse {
    #[serde(default)]
    events_received: u32,
}

async fn graph_error(response: reqwest::Response) -> AdPlatformError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<GraphErrorEnvelope>(&body) {
        Ok(envelope) => {
            let message = match envelope.error.error_user_msg {
                Some(user_msg) => format!("{} ({user_msg})", envelope.error.message),
                None => envelope.error.message,
            };
            AdPlatformError {
                message,
                code: envelope.error.code,
                subcode: envelope.error.error_subcode,
            }
        }
        Err(_) => AdPlatformError::new(format!("HTTP {status}: {body}")),
    }
}

fn account_path(ad_account_id: &str) -> String {
    if ad_account_id.starts_with("act_") {
        ad_account_id.to_string()
    } else {
        format!("act_{ad_account_id}")
    }
}

#[async_trait]
impl AdPlatform for GraphApi {
    async fn list_pixels(
        &self,
        ad_account_id: &str,
        access_token: &str,
    ) -> Result<Vec<Pixel>, AdPlatformError> {
        let response = self
            .http
            .get(self.url(&format!("{}/adspixels", account_path(ad_account_id))))
            .query(&[("fields", "id,name"), ("access_token", access_token)])
            .send()
            .await
            .map_err(|err| AdPlatformError::new(err.to_string()))?;
        if !response.status().is_success() {
            return Err(graph_error(response).await);
        }
        let list: PixelList = response
            .json()
            .await
            .map_err(|err| AdPlatformError::new(err.to_string()))?;
        Ok(list.data)
    }

    async fn send_conversion_event(
        &self,
        pixel_id: &str,
        access_token: &str,
        event: &ConversionEvent,
    ) -> Result<ConversionReceipt, AdPlatformError> {
        let response = self
            .http
            .post(self.url(&format!("{pixel_id}/events")))
            .query(&[("access_token", access_token)])
            .json(&serde_json::json!({ "data": [event] }))
            .send()
            .await
            .map_err(|err| AdPlatformError::new(err.to_string()))?;
        if !response.status().is_success() {
            return Err(graph_error(response).await);
        }
        let parsed: EventsResponse = response
            .json()
            .await
            .map_err(|err| AdPlatformError::new(err.to_string()))?;
        Ok(ConversionReceipt {
            events_received: parsed.events_received,
        })
    }
}
