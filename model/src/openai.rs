use crate::config::OpenAiConfig;
use crate::provider::{ChatStream, ModelError, ModelProvider, ModelResult, StreamingModelProvider};
use crate::types::{ChatMessage, ChatRequest, ChatResponse, Choice, FinishReason, Usage};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

/// OpenAI-compatible chat completion request
#[derive(Debug, Serialize)]
struct ApiChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ApiChatResponse {
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiStreamChunk {
    #[serde(default)]
    choices: Vec<ApiStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiStreamChoice {
    #[serde(default)]
    delta: ApiDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ApiDelta {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiProvider {
    http_client: reqwest::Client,
    /// No total deadline; `config.timeout` bounds the connect, the response
    /// head and each gap between body chunks instead.
    stream_client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> ModelResult<Self> {
        config
            .validate()
            .map_err(|msg| ModelError::InvalidConfig { message: msg })?;

        let build_error = |e: reqwest::Error| ModelError::Unknown {
            message: format!("Failed to build HTTP client: {}", e),
        };
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(build_error)?;
        let stream_client = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .build()
            .map_err(build_error)?;

        Ok(Self {
            http_client,
            stream_client,
            config,
        })
    }

    pub fn with_default_config() -> ModelResult<Self> {
        Self::new(OpenAiConfig::default())
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    fn build_request_body<'a>(&'a self, request: &'a ChatRequest, stream: bool) -> ApiChatRequest<'a> {
        let model = if request.model.is_empty() {
            self.config.default_model.as_str()
        } else {
            request.model.as_str()
        };

        ApiChatRequest {
            model,
            messages: &request.messages,
            stream,
            temperature: request
                .temperature
                .unwrap_or(self.config.default_temperature),
            max_tokens: request.max_tokens.or(self.config.default_max_tokens),
        }
    }

    async fn post(&self, request: &ChatRequest, stream: bool) -> ModelResult<reqwest::Response> {
        let body = self.build_request_body(request, stream);
        let client = if stream {
            &self.stream_client
        } else {
            &self.http_client
        };
        let mut builder = client
            .post(self.config.completions_url())
            .json(&body);
        if let Some(api_key) = &self.config.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder.send().await.map_err(Self::handle_http_error)?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(Self::status_error(status, error_text));
        }

        Ok(response)
    }

    fn status_error(status: StatusCode, body: String) -> ModelError {
        match status.as_u16() {
            401 | 403 => ModelError::Authentication,
            429 => ModelError::RateLimit,
            502..=504 => ModelError::ServiceUnavailable {
                message: format!("Completion endpoint returned {}", status),
            },
            _ => ModelError::Unknown {
                message: format!("Completion API returned {}: {}", status, body),
            },
        }
    }

    fn stream_timeout(after: Duration) -> ModelError {
        ModelError::ServiceUnavailable {
            message: format!("No data from completion endpoint for {:?}", after),
        }
    }

    fn handle_http_error(err: reqwest::Error) -> ModelError {
        if err.is_timeout() {
            ModelError::ServiceUnavailable {
                message: "Request timeout".to_string(),
            }
        } else if err.is_connect() {
            ModelError::ServiceUnavailable {
                message: "Cannot connect to completion endpoint".to_string(),
            }
        } else {
            ModelError::Network(err)
        }
    }

    fn convert_finish_reason(reason: Option<String>) -> Option<FinishReason> {
        reason.map(|r| match r.as_str() {
            "length" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        })
    }

    fn parse_response(response: ApiChatResponse) -> ChatResponse {
        let choices = response
            .choices
            .into_iter()
            .map(|choice| Choice {
                message: ChatMessage::assistant(choice.message.content.unwrap_or_default()),
                finish_reason: Self::convert_finish_reason(choice.finish_reason),
            })
            .collect();

        let usage = response.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        ChatResponse { choices, usage }
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    async fn chat(&self, request: ChatRequest) -> ModelResult<ChatResponse> {
        debug!("Starting chat request with model: {}", request.model);

        let response = self.post(&request, false).await?;
        let bytes = response.bytes().await.map_err(ModelError::Network)?;
        let api_response: ApiChatResponse = serde_json::from_slice(&bytes)?;

        info!("Chat request completed successfully");
        Ok(Self::parse_response(api_response))
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}

#[async_trait]
impl StreamingModelProvider for OpenAiProvider {
    async fn chat_stream(&self, request: ChatRequest) -> ModelResult<ChatStream> {
        debug!("Starting streamed chat request with model: {}", request.model);

        let response = tokio::time::timeout(self.config.timeout, self.post(&request, true))
            .await
            .map_err(|_| Self::stream_timeout(self.config.timeout))??;
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();

        let state = SseState {
            body,
            buffer: Vec::new(),
            pending: VecDeque::new(),
            done: false,
            idle_timeout: self.config.timeout,
        };

        Ok(futures::stream::unfold(state, next_delta).boxed())
    }
}

struct SseState {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    done: bool,
    idle_timeout: Duration,
}

async fn next_delta(mut state: SseState) -> Option<(ModelResult<String>, SseState)> {
    loop {
        if let Some(delta) = state.pending.pop_front() {
            return Some((Ok(delta), state));
        }
        if state.done {
            return None;
        }

        let next = match tokio::time::timeout(state.idle_timeout, state.body.next()).await {
            Ok(next) => next,
            Err(_) => {
                state.done = true;
                let err = OpenAiProvider::stream_timeout(state.idle_timeout);
                return Some((Err(err), state));
            }
        };

        match next {
            Some(Ok(chunk)) => {
                state.buffer.extend(chunk.into_iter().filter(|b| *b != b'\r'));
                while let Some(event) = next_sse_event(&mut state.buffer) {
                    if event == "[DONE]" {
                        state.done = true;
                        break;
                    }
                    match serde_json::from_str::<ApiStreamChunk>(&event) {
                        Ok(chunk) => {
                            let delta: String = chunk
                                .choices
                                .into_iter()
                                .filter_map(|choice| choice.delta.content)
                                .collect();
                            if !delta.is_empty() {
                                state.pending.push_back(delta);
                            }
                        }
                        Err(e) => warn!("Skipping malformed stream event: {}", e),
                    }
                }
            }
            Some(Err(e)) => {
                state.done = true;
                return Some((Err(ModelError::Network(e)), state));
            }
            None => state.done = true,
        }
    }
}

/// Pops one complete server-sent event off the buffer and returns its joined
/// `data:` payload. Carriage returns are stripped before buffering.
fn next_sse_event(buffer: &mut Vec<u8>) -> Option<String> {
    loop {
        let idx = buffer.windows(2).position(|w| w == b"\n\n")?;
        let event: Vec<u8> = buffer.drain(..idx + 2).collect();
        let event = String::from_utf8_lossy(&event[..idx]);
        let data: Vec<&str> = event
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(str::trim_start)
            .collect();
        if !data.is_empty() {
            return Some(data.join("\n"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_for(url: String) -> OpenAiProvider {
        let config = OpenAiConfig::default()
            .with_base_url(url)
            .with_api_key("sk-test");
        OpenAiProvider::new(config).unwrap()
    }

    #[test]
    fn test_next_sse_event_splits_events() {
        let mut buffer = b"data: {\"a\":1}\n\n: keep-alive\n\ndata: [DONE]\n\npartial".to_vec();
        assert_eq!(next_sse_event(&mut buffer).as_deref(), Some("{\"a\":1}"));
        assert_eq!(next_sse_event(&mut buffer).as_deref(), Some("[DONE]"));
        assert_eq!(next_sse_event(&mut buffer), None);
        assert_eq!(buffer, b"partial".to_vec());
    }

    #[test]
    fn test_build_request_body_uses_defaults() {
        let provider = OpenAiProvider::with_default_config().unwrap();
        let request = ChatRequest::new("", vec![ChatMessage::user("Hello")]);
        let body = provider.build_request_body(&request, false);
        assert_eq!(body.model, "gpt-4o-mini");
        assert_eq!(body.temperature, 0.7);
        assert!(body.max_tokens.is_none());

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(
            OpenAiProvider::convert_finish_reason(Some("length".to_string())),
            Some(FinishReason::Length)
        );
        assert_eq!(
            OpenAiProvider::convert_finish_reason(Some("stop".to_string())),
            Some(FinishReason::Stop)
        );
        assert_eq!(OpenAiProvider::convert_finish_reason(None), None);
    }

    #[test]
    fn test_provider_rejects_invalid_config() {
        let config = OpenAiConfig::default().with_base_url("localhost");
        assert!(matches!(
            OpenAiProvider::new(config),
            Err(ModelError::InvalidConfig { .. })
        ));
    }

    #[tokio::test]
    async fn test_chat_parses_completion() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .with_status(200)
            .with_body(
                r#"{"choices":[{"message":{"role":"assistant","content":"All good"},"finish_reason":"stop"}],
                    "usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7}}"#,
            )
            .create_async()
            .await;

        let provider = provider_for(server.url());
        let request = ChatRequest::new("gpt-4o-mini", vec![ChatMessage::user("hi")]);
        let response = provider.chat(request).await.unwrap();
        assert_eq!(response.text(), Some("All good"));
        assert_eq!(response.usage.unwrap().total_tokens, 7);
    }

    #[tokio::test]
    async fn test_chat_maps_status_errors() {
        let mut server = mockito::Server::new_async().await;
        let _unauthorized = server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .create_async()
            .await;

        let provider = provider_for(server.url());
        let request = ChatRequest::new("gpt-4o-mini", vec![ChatMessage::user("hi")]);
        let result = provider.chat(request).await;
        assert!(matches!(result, Err(ModelError::Authentication)));
    }

    #[tokio::test]
    async fn test_chat_returns_error_on_invalid_json() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body("not valid json")
            .create_async()
            .await;

        let provider = provider_for(server.url());
        let request = ChatRequest::new("gpt-4o-mini", vec![ChatMessage::user("hi")]);
        let result = provider.chat(request).await;
        assert!(matches!(result, Err(ModelError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_chat_stream_yields_deltas_until_done() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\r\n\r\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        );
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let provider = provider_for(server.url());
        let request = ChatRequest::new("gpt-4o-mini", vec![ChatMessage::user("hi")]);
        let stream = provider.chat_stream(request).await.unwrap();
        let chunks: Vec<String> = stream.map(|chunk| chunk.unwrap()).collect().await;
        assert_eq!(chunks, vec!["Hel".to_string(), "lo".to_string()]);
    }

    /// Serves one SSE response whose events are written `gap` apart.
    async fn spawn_slow_sse_server(events: Vec<&'static str>, gap: Duration) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_lowercase();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text
                        .lines()
                        .find_map(|line| line.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n",
                )
                .await
                .unwrap();
            for event in events {
                tokio::time::sleep(gap).await;
                if socket.write_all(event.as_bytes()).await.is_err() {
                    return;
                }
            }
            let _ = socket.shutdown().await;
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_chat_stream_outlives_total_timeout_when_chunks_keep_coming() {
        let url = spawn_slow_sse_server(
            vec![
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"!\"}}]}\n\n",
                "data: [DONE]\n\n",
            ],
            Duration::from_millis(300),
        )
        .await;

        let config = OpenAiConfig::default()
            .with_base_url(url)
            .with_timeout(Duration::from_millis(500));
        let provider = OpenAiProvider::new(config).unwrap();
        let request = ChatRequest::new("gpt-4o-mini", vec![ChatMessage::user("hi")]);
        let stream = provider.chat_stream(request).await.unwrap();
        let chunks: Vec<String> = stream.map(|chunk| chunk.unwrap()).collect().await;
        assert_eq!(chunks.concat(), "Hello!");
    }

    #[tokio::test]
    async fn test_chat_stream_fails_when_idle_too_long() {
        let url = spawn_slow_sse_server(
            vec!["data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n"],
            Duration::from_millis(600),
        )
        .await;

        let config = OpenAiConfig::default()
            .with_base_url(url)
            .with_timeout(Duration::from_millis(200));
        let provider = OpenAiProvider::new(config).unwrap();
        let request = ChatRequest::new("gpt-4o-mini", vec![ChatMessage::user("hi")]);
        let mut stream = provider.chat_stream(request).await.unwrap();
        assert!(matches!(
            stream.next().await,
            Some(Err(ModelError::ServiceUnavailable { .. }))
        ));
        assert!(stream.next().await.is_none());
    }
}
