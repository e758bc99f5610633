pub mod config;
pub mod openai;
pub mod provider;
pub mod tokens;
pub mod types;

pub use config::{OpenAiConfig, DEFAULT_MODEL};
pub use openai::OpenAiProvider;
pub use provider::{ChatStream, ModelError, ModelProvider, ModelResult, StreamingModelProvider};
pub use tokens::{heuristic_tokens, TokenEstimator, TokenizerMode};
pub use types::{ChatMessage, ChatRequest, ChatResponse, Choice, FinishReason, MessageRole, Usage};

pub mod prelude {
    pub use crate::config::*;
    pub use crate::openai::*;
    pub use crate::provider::*;
    pub use crate::tokens::*;
    pub use crate::types::*;
}
