//! Narrative history analysis over prepared batches

use crate::batch::LlmBatch;
use crate::error::{HistorianError, HistorianResult};
use model::{
    ChatMessage, ChatRequest, ChatStream, MessageRole, ModelProvider, StreamingModelProvider,
    DEFAULT_MODEL,
};
use std::sync::Arc;
use tracing::{debug, instrument};

pub const DEFAULT_PROMPT: &str = "Please analyze these commits";

const NO_RESPONSE: &str = "No response from AI";

pub const SYSTEM_PROMPT: &str = "You are Smart Git Historian, an AI assistant that explains the evolution of code in plain English.

Your role:
- Act like a senior engineer reviewing commits and PRs.
- Translate raw commit history, diffs, PRs, and issues into clear, structured narratives.

Core objectives:
1. Summarize what changed in each commit, PR, or issue.
2. Explain why it changed, using commit messages, PR descriptions, and linked issues as context.
3. Highlight patterns or repeated changes (e.g., rewrites, recurring bugfixes).
4. Identify risks or fragile areas if the same file has been heavily modified.
5. Write in plain, accessible English so a new developer or PM could understand.

Rules for output:
- Be structured and concise. Avoid rambling.
- When multiple commits are analyzed:
  - Give a high-level evolution summary first.
  - Then, list per-commit insights (commit message + purpose).
- When PRs or issues are present, integrate their context into the explanation.
- If diffs are provided, summarize the essence of the code changes (not every line).
- Use bullet points or sections when helpful.
- Always end with a short overall takeaway: what this means for the stability, purpose, or direction of the code.

Tone:
- Professional, clear, and explanatory.
- No assumptions beyond the given context, but infer intent when obvious.";

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Prior turns forwarded with each request
    pub history_window: usize,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            max_tokens: None,
            history_window: 10,
        }
    }
}

pub struct HistoryAnalyst<P: ?Sized> {
    provider: Arc<P>,
    settings: AnalysisSettings,
}

impl<P: ?Sized> HistoryAnalyst<P> {
    pub fn new(provider: Arc<P>, settings: AnalysisSettings) -> Self {
        Self { provider, settings }
    }

    pub fn settings(&self) -> &AnalysisSettings {
        &self.settings
    }

    /// System instruction, the most recent prior turns and a user turn
    /// carrying the prompt and the pretty-printed batches.
    pub fn build_messages(
        &self,
        history: &[ChatMessage],
        prompt: Option<&str>,
        batches: &[LlmBatch],
    ) -> HistorianResult<Vec<ChatMessage>> {
        if batches.is_empty() {
            return Err(HistorianError::InvalidInput(
                "No commits selected".to_string(),
            ));
        }

        let prior: Vec<&ChatMessage> = history
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .collect();
        let skip = prior.len().saturating_sub(self.settings.history_window);

        let prompt = prompt
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_PROMPT);
        let content = format!(
            "{}\n\nHere are the commits:\n{}",
            prompt,
            serde_json::to_string_pretty(batches)?
        );

        let mut messages = Vec::with_capacity(prior.len() - skip + 2);
        messages.push(ChatMessage::system(SYSTEM_PROMPT));
        messages.extend(prior.into_iter().skip(skip).cloned());
        messages.push(ChatMessage::user(content));
        Ok(messages)
    }

    fn request(&self, messages: Vec<ChatMessage>) -> ChatRequest {
        let request = ChatRequest::new(&self.settings.model, messages)
            .with_temperature(self.settings.temperature);
        match self.settings.max_tokens {
            Some(max_tokens) => request.with_max_tokens(max_tokens),
            None => request,
        }
    }
}

impl<P: ModelProvider + ?Sized> HistoryAnalyst<P> {
    #[instrument(skip(self, history, prompt, batches), fields(batches = batches.len()))]
    pub async fn explain(
        &self,
        history: &[ChatMessage],
        prompt: Option<&str>,
        batches: &[LlmBatch],
    ) -> HistorianResult<String> {
        let messages = self.build_messages(history, prompt, batches)?;
        let response = self.provider.chat(self.request(messages)).await?;
        debug!(provider = self.provider.provider_name(), usage = ?response.usage, "Analysis complete");
        Ok(response.text().unwrap_or(NO_RESPONSE).to_string())
    }
}

impl<P: StreamingModelProvider + ?Sized> HistoryAnalyst<P> {
    /// Streams the analysis as text deltas.
    #[instrument(skip(self, history, prompt, batches), fields(batches = batches.len()))]
    pub async fn explain_stream(
        &self,
        history: &[ChatMessage],
        prompt: Option<&str>,
        batches: &[LlmBatch],
    ) -> HistorianResult<ChatStream> {
        let messages = self.build_messages(history, prompt, batches)?;
        Ok(self.provider.chat_stream(self.request(messages)).await?)
    }
}
