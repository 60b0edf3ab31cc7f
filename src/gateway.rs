use crate::http::build_client;
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct MediaPayload {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl MediaPayload {
    pub fn is_pdf(&self) -> bool {
        self.mime_type.eq_ignore_ascii_case("application/pdf")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatLabel {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayeeDetails {
    pub pix_key: String,
    pub receiver_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("label does not exist: {0}")]
    LabelNotFound(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

/// Chat platform operations the pipeline depends on.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn download_media(
        &self,
        instance: &str,
        message_id: &str,
    ) -> Result<MediaPayload, GatewayError>;

    async fn list_labels(&self, instance: &str) -> Result<Vec<ChatLabel>, GatewayError>;

    /// Returns the new label id when the platform reports one.
    async fn create_label(&self, instance: &str, name: &str)
    -> Result<Option<String>, GatewayError>;

    async fn apply_label(
        &self,
        instance: &str,
        phone: &str,
        label_id: &str,
    ) -> Result<(), GatewayError>;

    async fn request_payment(
        &self,
        instance: &str,
        phone: &str,
        amount: f64,
        payee: &PayeeDetails,
    ) -> Result<(), GatewayError>;
}

#[derive(Debug, Clone)]
pub struct HttpChatGateway {
    base_url: String,
    api_key: String,
    http: Client,
}

impl HttpChatGateway {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http: build_client(),
        }
    }

    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("CHAT_GATEWAY_URL").ok()?;
        let api_key = std::env::var("CHAT_GATEWAY_KEY").ok()?;
        Some(Self::new(base_url, api_key))
    }

    async fn post(
        &self,
        path: String,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, GatewayError> {
        self.http
            .post(format!("{}{path}", self.base_url))
            .header("apikey", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| GatewayError::Request(err.to_string()))
    }
}

fn is_stale_label_error(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::NOT_FOUND {
        return true;
    }
    let body = body.to_lowercase();
    ["not found", "does not exist", "não existe", "nao existe", "invalid label"]
        .iter()
        .any(|needle| body.contains(needle))
}

#[derive(Deserialize)]
struct Base64Media {
    base64: String,
    #[serde(default)]
    mimetype: Option<String>,
}

#[derive(Deserialize)]
struct RawLabel {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default, alias = "labelId")]
    label_id: Option<serde_json::Value>,
    name: String,
}

impl RawLabel {
    fn into_label(self) -> Option<ChatLabel> {
        let id = self.id.or(self.label_id)?;
        let id = match id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        Some(ChatLabel {
            id,
            name: self.name,
        })
    }
}

#[async_trait]
impl ChatGateway for HttpChatGateway {
    async fn download_media(
        &self,
        instance: &str,
        message_id: &str,
    ) -> Result<MediaPayload, GatewayError> {
        let response = self
            .post(
                format!("/chat/getBase64FromMediaMessage/{instance}"),
                json!({ "message": { "key": { "id": message_id } }, "convertToMp4": false }),
            )
            .await?;
        if !response.status().is_success() {
            return Err(GatewayError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let payload: Base64Media = response
            .json()
            .await
            .map_err(|err| GatewayError::Deserialize(err.to_string()))?;
        let encoded = payload
            .base64
            .split_once("base64,")
            .map(|(_, data)| data)
            .unwrap_or(&payload.base64);
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|err| GatewayError::Deserialize(err.to_string()))?;
        Ok(MediaPayload {
            bytes,
            mime_type: payload
                .mimetype
                .unwrap_or_else(|| "application/octet-stream".into()),
        })
    }

    async fn list_labels(&self, instance: &str) -> Result<Vec<ChatLabel>, GatewayError> {
        let response = self
            .http
            .get(format!("{}/label/findLabels/{instance}", self.base_url))
            .header("apikey", &self.api_key)
            .send()
            .await
            .map_err(|err| GatewayError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(GatewayError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let labels: Vec<RawLabel> = response
            .json()
            .await
            .map_err(|err| GatewayError::Deserialize(err.to_string()))?;
        Ok(labels.into_iter().filter_map(RawLabel::into_label).collect())
    }

    async fn create_label(
        &self,
        instance: &str,
        name: &str,
    ) -> Result<Option<String>, GatewayError> {
        let response = self
            .post(
                format!("/label/createLabel/{instance}"),
                json!({ "name": name, "color": 1 }),
            )
            .await?;
        if !response.status().is_success() {
            return Err(GatewayError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let created: Option<RawLabel> = response.json().await.ok();
        Ok(created.and_then(RawLabel::into_label).map(|label| label.id))
    }

    async fn apply_label(
        &self,
        instance: &str,
        phone: &str,
        label_id: &str,
    ) -> Result<(), GatewayError> {
        let response = self
            .post(
                format!("/label/handleLabel/{instance}"),
                json!({ "number": phone, "labelId": label_id, "action": "add" }),
            )
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if is_stale_label_error(status, &body) {
            Err(GatewayError::LabelNotFound(label_id.to_string()))
        } else {
            Err(GatewayError::Request(format!("HTTP {status}: {body}")))
        }
    }

    async fn request_payment(
        &self,
        instance: &str,
        phone: &str,
        amount: f64,
        payee: &PayeeDetails,
    ) -> Result<(), GatewayError> {
        let response = self
            .post(
                format!("/message/sendPaymentRequest/{instance}"),
                json!({
                    "number": phone,
                    "amount": format!("{amount:.2}"),
                    "pixKey": payee.pix_key,
                    "receiverName": payee.receiver_name,
                    "description": payee.description,
                }),
            )
            .await?;
        if !response.status().is_success() {
            return Err(GatewayError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}
