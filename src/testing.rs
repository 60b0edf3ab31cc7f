//! In-process collaborators for unit and pipeline tests.

use crate::ads::{AdPlatform, AdPlatformError, ConversionEvent, ConversionReceipt, Pixel};
use crate::automation::FlowStart;
use crate::gateway::{ChatGateway, ChatLabel, GatewayError, MediaPayload, PayeeDetails};
use crate::llm::{LlmError, ModelReply, ModelRole, ProofModel};
use crate::notify::Notification;
use crate::outbox::{AutomationEngine, NotificationQueue, OutboxError};
use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, String>>>,
    roles: Mutex<Vec<ModelRole>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Result<String, String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            roles: Mutex::new(Vec::new()),
        }
    }

    pub fn proof(amount: &str) -> Self {
        Self::new(vec![Ok(format!(
            r#"{{"is_payment_proof": true, "confidence": 95, "amount": {amount}, "recipient_name": "Loja Exemplo LTDA", "recipient_tax_id": "12.345.678/0001-90"}}"#
        ))])
    }

    pub fn roles(&self) -> Vec<ModelRole> {
        self.roles.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProofModel for ScriptedModel {
    fn has_credentials(&self) -> bool {
        true
    }

    async fn classify(
        &self,
        _media: &MediaPayload,
        _prompt: &str,
        role: ModelRole,
    ) -> Result<ModelReply, LlmError> {
        self.roles.lock().unwrap().push(role);
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Ok(text)) => Ok(ModelReply {
                text,
                model: format!("scripted-{role:?}").to_lowercase(),
            }),
            Some(Err(err)) => Err(LlmError::Http(err)),
            None => Err(LlmError::InvalidResponse("no scripted reply left".into())),
        }
    }
}

/// Chat gateway whose label state behaves like the real platform: applying an
/// id that is not in the label list fails as stale.
pub struct FakeGateway {
    labels: Mutex<Vec<ChatLabel>>,
    media: Option<MediaPayload>,
    always_stale: bool,
    apply_error: Option<String>,
    apply_delay: Option<Duration>,
    created: Mutex<Vec<String>>,
    applies: Mutex<Vec<String>>,
    payments: Mutex<Vec<(String, f64)>>,
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self {
            labels: Mutex::new(Vec::new()),
            media: Some(MediaPayload {
                bytes: b"\x89PNG proof".to_vec(),
                mime_type: "image/png".into(),
            }),
            always_stale: false,
            apply_error: None,
            apply_delay: None,
            created: Mutex::new(Vec::new()),
            applies: Mutex::new(Vec::new()),
            payments: Mutex::new(Vec::new()),
        }
    }
}

impl FakeGateway {
    pub fn with_label(self, id: &str, name: &str) -> Self {
        self.labels.lock().unwrap().push(ChatLabel {
            id: id.into(),
            name: name.into(),
        });
        self
    }

    pub fn with_media(mut self, media: MediaPayload) -> Self {
        self.media = Some(media);
        self
    }

    pub fn failing_media(mut self) -> Self {
        self.media = None;
        self
    }

    pub fn always_stale(mut self) -> Self {
        self.always_stale = true;
        self
    }

    pub fn failing_apply(mut self, message: &str) -> Self {
        self.apply_error = Some(message.into());
        self
    }

    pub fn slow_apply(mut self, delay: Duration) -> Self {
        self.apply_delay = Some(delay);
        self
    }

    pub fn created_labels(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn apply_calls(&self) -> Vec<String> {
        self.applies.lock().unwrap().clone()
    }

    pub fn payment_requests(&self) -> Vec<(String, f64)> {
        self.payments.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatGateway for FakeGateway {
    async fn download_media(
        &self,
        _instance: &str,
        message_id: &str,
    ) -> Result<MediaPayload, GatewayError> {
        self.media
            .clone()
            .ok_or_else(|| GatewayError::Request(format!("media {message_id} unavailable")))
    }

    async fn list_labels(&self, _instance: &str) -> Result<Vec<ChatLabel>, GatewayError> {
        Ok(self.labels.lock().unwrap().clone())
    }

    async fn create_label(
        &self,
        _instance: &str,
        name: &str,
    ) -> Result<Option<String>, GatewayError> {
        self.created.lock().unwrap().push(name.to_string());
        let mut labels = self.labels.lock().unwrap();
        let id = format!("label-{}", labels.len() + 1);
        labels.push(ChatLabel {
            id: id.clone(),
            name: name.to_string(),
        });
        Ok(Some(id))
    }

    async fn apply_label(
        &self,
        _instance: &str,
        _phone: &str,
        label_id: &str,
    ) -> Result<(), GatewayError> {
        self.applies.lock().unwrap().push(label_id.to_string());
        if let Some(delay) = self.apply_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.apply_error {
            return Err(GatewayError::Request(message.clone()));
        }
        let known = self
            .labels
            .lock()
            .unwrap()
            .iter()
            .any(|label| label.id == label_id);
        if self.always_stale || !known {
            return Err(GatewayError::LabelNotFound(label_id.to_string()));
        }
        Ok(())
    }

    async fn request_payment(
        &self,
        _instance: &str,
        phone: &str,
        amount: f64,
        _payee: &PayeeDetails,
    ) -> Result<(), GatewayError> {
        self.payments
            .lock()
            .unwrap()
            .push((phone.to_string(), amount));
        Ok(())
    }
}

/// Ad platform that accepts every event unless told otherwise.
#[derive(Default)]
pub struct FakeAdPlatform {
    pixels: HashMap<String, Result<Vec<Pixel>, AdPlatformError>>,
    rejections: HashMap<String, AdPlatformError>,
    sent: Mutex<Vec<(String, ConversionEvent)>>,
}

impl FakeAdPlatform {
    pub fn with_pixels(mut self, account: &str, ids: &[&str]) -> Self {
        let pixels = ids
            .iter()
            .map(|id| Pixel {
                id: id.to_string(),
                name: None,
            })
            .collect();
        self.pixels.insert(account.to_string(), Ok(pixels));
        self
    }

    pub fn failing_pixel_lookup(mut self, account: &str, err: AdPlatformError) -> Self {
        self.pixels.insert(account.to_string(), Err(err));
        self
    }

    pub fn rejecting(mut self, pixel: &str, err: AdPlatformError) -> Self {
        self.rejections.insert(pixel.to_string(), err);
        self
    }

    pub fn sent_pixels(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(pixel, _)| pixel.clone())
            .collect()
    }

    pub fn events(&self) -> Vec<(String, ConversionEvent)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl AdPlatform for FakeAdPlatform {
    async fn list_pixels(
        &self,
        ad_account_id: &str,
        _access_token: &str,
    ) -> Result<Vec<Pixel>, AdPlatformError> {
        self.pixels
            .get(ad_account_id)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn send_conversion_event(
        &self,
        pixel_id: &str,
        _access_token: &str,
        event: &ConversionEvent,
    ) -> Result<ConversionReceipt, AdPlatformError> {
        self.sent
            .lock()
            .unwrap()
            .push((pixel_id.to_string(), event.clone()));
        match self.rejections.get(pixel_id) {
            Some(err) => Err(err.clone()),
            None => Ok(ConversionReceipt { events_received: 1 }),
        }
    }
}

/// Records everything the outbox worker delivers.
#[derive(Default)]
pub struct RecordingSink {
    notifications: Mutex<Vec<Notification>>,
    starts: Mutex<Vec<FlowStart>>,
    fail: bool,
}

impl RecordingSink {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn starts(&self) -> Vec<FlowStart> {
        self.starts.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationQueue for RecordingSink {
    async fn enqueue(&self, notification: &Notification) -> Result<(), OutboxError> {
        if self.fail {
            return Err(OutboxError::Request("queue offline".into()));
        }
        self.notifications
            .lock()
            .unwrap()
            .push(notification.clone());
        Ok(())
    }
}

#[async_trait]
impl AutomationEngine for RecordingSink {
    async fn start_session(&self, start: &FlowStart) -> Result<(), OutboxError> {
        if self.fail {
            return Err(OutboxError::Request("engine offline".into()));
        }
        self.starts.lock().unwrap().push(start.clone());
        Ok(())
    }
}
