pub mod vision;

use crate::gateway::MediaPayload;
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use vision::{VisionClient, VisionConfig};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing model credentials")]
    MissingCredentials,
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Which configured model a call should go to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    ImageProof,
    DocumentProof,
    ValueExtraction,
}

#[derive(Debug, Clone)]
pub struct ModelReply {
    pub text: String,
    pub model: String,
}

#[async_trait]
pub trait ProofModel: Send + Sync {
    fn has_credentials(&self) -> bool;

    async fn classify(
        &self,
        media: &MediaPayload,
        prompt: &str,
        role: ModelRole,
    ) -> Result<ModelReply, LlmError>;
}
