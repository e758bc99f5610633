use crate::types::{ChatRequest, ChatResponse};
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Service unavailable: {message}")]
    ServiceUnavailable { message: String },

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Authentication failed")]
    Authentication,

    #[error("Unknown error: {message}")]
    Unknown { message: String },
}

pub type ModelResult<T> = Result<T, ModelError>;

/// Incremental text deltas of a streamed completion, ending when the
/// provider signals completion.
pub type ChatStream = BoxStream<'static, ModelResult<String>>;

#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> ModelResult<ChatResponse>;

    fn provider_name(&self) -> &'static str;
}

#[async_trait]
pub trait StreamingModelProvider: ModelProvider {
    async fn chat_stream(&self, request: ChatRequest) -> ModelResult<ChatStream>;
}
