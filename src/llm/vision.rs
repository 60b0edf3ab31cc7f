use super::{LlmError, ModelReply, ModelRole, ProofModel};
use crate::gateway::MediaPayload;
use crate::http::build_client;
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone)]
pub struct VisionConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub image_model: String,
    pub document_model: String,
    pub extraction_model: String,
}

impl VisionConfig {
    pub fn from_env() -> Self {
        Self {
            api_url: std::env::var("VISION_API_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: std::env::var("VISION_API_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .ok()
                .filter(|key| !key.trim().is_empty()),
            image_model: std::env::var("VISION_IMAGE_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".into()),
            document_model: std::env::var("VISION_DOCUMENT_MODEL")
                .unwrap_or_else(|_| "gpt-4o".into()),
            extraction_model: std::env::var("VALUE_EXTRACTION_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".into()),
        }
    }

    fn model_for(&self, role: ModelRole) -> &str {
        match role {
            ModelRole::ImageProof => &self.image_model,
            ModelRole::DocumentProof => &self.document_model,
            ModelRole::ValueExtraction => &self.extraction_model,
        }
    }
}

/// OpenAI-compatible chat-completions client that attaches media inline.
pub struct VisionClient {
    http: Client,
    config: VisionConfig,
}

impl VisionClient {
    pub fn new(config: VisionConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }
}

fn media_part(media: &MediaPayload) -> Value {
    let data_url = format!(
        "data:{};base64,{}",
        media.mime_type,
        BASE64.encode(&media.bytes)
    );
    if media.is_pdf() {
        json!({
            "type": "file",
            "file": { "filename": "comprovante.pdf", "file_data": data_url },
        })
    } else {
        json!({
            "type": "image_url",
            "image_url": { "url": data_url },
        })
    }
}

#[async_trait]
impl ProofModel for VisionClient {
    fn has_credentials(&self) -> bool {
        self.config.api_key.is_some()
    }

    async fn classify(
        &self,
        media: &MediaPayload,
        prompt: &str,
        role: ModelRole,
    ) -> Result<ModelReply, LlmError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(LlmError::MissingCredentials)?;
        let model = self.config.model_for(role).to_string();
        let body = ChatRequest {
            model: model.clone(),
            temperature: 0.0,
            messages: vec![json!({
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    media_part(media),
                ],
            })],
        };

        let base = self.config.api_url.trim_end_matches('/');
        let response = self
            .http
            .post(format!("{base}/chat/completions"))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::Http(format!("HTTP {}", response.status())));
        }

        let payload: ChatResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;

        let text = payload
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| LlmError::InvalidResponse("missing text".into()))?;

        Ok(ModelReply { text, model })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    temperature: f32,
    messages: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}
