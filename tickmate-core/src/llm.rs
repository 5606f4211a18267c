//! OpenAI-compatible chat completion client with function calling.
//!
//! Speaks the `/chat/completions` wire format, so any provider exposing
//! that surface works by pointing `base_url` at it. Transient failures
//! retry with jittered exponential backoff.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::config::OpenAiConfig;
use crate::error::CompletionError;

pub const ROLE_SYSTEM: &str = "system";
pub const ROLE_USER: &str = "user";
pub const ROLE_ASSISTANT: &str = "assistant";
pub const ROLE_TOOL: &str = "tool";

const MAX_RETRIES: usize = 3;
const RETRY_DELAY_MS: u64 = 500;

/// One message in a chat transcript. Tool-call turns have `content: None`
/// and a populated `tool_calls`; tool results carry `tool_call_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(ROLE_SYSTEM, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(ROLE_USER, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(ROLE_ASSISTANT, content)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ROLE_TOOL.to_string(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

/// `arguments` is a JSON-encoded string by wire contract, not an object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// A function the model may call, in the provider's tool schema.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    #[serde(rename = "type")]
    pub spec_type: String,
    pub function: FunctionSpec,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSpec {
    pub fn function(name: &str, description: &str, parameters: Value) -> Self {
        Self {
            spec_type: "function".to_string(),
            function: FunctionSpec {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolSpec]>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[derive(Debug, Clone)]
pub struct CompletionClient {
    http: Client,
    config: OpenAiConfig,
    base_url: String,
}

impl CompletionClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, CompletionError> {
        let base_url = config.base_url.clone();
        Self::with_base_url(config, base_url)
    }

    /// Create a client with a custom base URL (for testing / integration)
    pub fn with_base_url(config: OpenAiConfig, base_url: String) -> Result<Self, CompletionError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            http,
            config,
            base_url,
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// One completion turn. The returned message either carries assistant
    /// text or a batch of tool calls the caller must execute and feed back.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolSpec]>,
    ) -> Result<ChatMessage, CompletionError> {
        let retry_strategy = ExponentialBackoff::from_millis(RETRY_DELAY_MS)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(MAX_RETRIES);

        let result = Retry::spawn(retry_strategy, || self.chat_once(messages, tools)).await;

        match result {
            Ok(message) => Ok(message),
            Err(e) => {
                tracing::error!(
                    attempts = MAX_RETRIES,
                    error = %e,
                    "all completion retry attempts failed"
                );
                Err(CompletionError::RetryExhausted {
                    attempts: MAX_RETRIES,
                })
            }
        }
    }

    async fn chat_once(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolSpec]>,
    ) -> Result<ChatMessage, CompletionError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = CompletionRequest {
            model: &self.config.model,
            messages,
            temperature: self.config.temperature,
            tools,
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorResponse>(&error_body)
                .ok()
                .and_then(|e| e.error)
                .map(|e| e.message)
                .unwrap_or(error_body);

            tracing::error!(code = status.as_u16(), message = %message, "completion API error");
            return Err(CompletionError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let completion: CompletionResponse = response.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or(CompletionError::EmptyResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> OpenAiConfig {
        OpenAiConfig {
            api_key: "test-openai-key".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: String::new(),
            temperature: 0.1,
        }
    }

    #[tokio::test]
    async fn chat_returns_assistant_text() {
        let server = MockServer::start().await;
        let client = CompletionClient::with_base_url(test_config(), server.uri()).unwrap();

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-openai-key"))
            .and(body_partial_json(serde_json::json!({
                "model": "gpt-4o-mini",
                "messages": [{ "role": "user", "content": "hello" }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{
                    "message": { "role": "assistant", "content": "Hi there!" }
                }]
            })))
            .mount(&server)
            .await;

        let reply = client.chat(&[ChatMessage::user("hello")], None).await.unwrap();
        assert_eq!(reply.content.as_deref(), Some("Hi there!"));
        assert!(reply.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn chat_surfaces_tool_calls() {
        let server = MockServer::start().await;
        let client = CompletionClient::with_base_url(test_config(), server.uri()).unwrap();

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": {
                                "name": "get_quote",
                                "arguments": "{\"symbol\":\"RELIANCE\"}"
                            }
                        }]
                    }
                }]
            })))
            .mount(&server)
            .await;

        let tools = vec![ToolSpec::function(
            "get_quote",
            "Get the live price for a symbol",
            serde_json::json!({ "type": "object", "properties": {} }),
        )];
        let reply = client
            .chat(&[ChatMessage::user("price of reliance?")], Some(&tools))
            .await
            .unwrap();
        assert!(reply.content.is_none());
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].function.name, "get_quote");
        assert_eq!(
            reply.tool_calls[0].function.arguments,
            "{\"symbol\":\"RELIANCE\"}"
        );
    }

    #[tokio::test]
    async fn chat_retries_transient_500_then_succeeds() {
        let server = MockServer::start().await;
        let client = CompletionClient::with_base_url(test_config(), server.uri()).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "error": { "message": "overloaded" }
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{
                    "message": { "role": "assistant", "content": "recovered" }
                }]
            })))
            .mount(&server)
            .await;

        let reply = client.chat(&[ChatMessage::user("hi")], None).await.unwrap();
        assert_eq!(reply.content.as_deref(), Some("recovered"));
    }

    #[tokio::test]
    async fn chat_exhausts_retries_on_persistent_failure() {
        let server = MockServer::start().await;
        let client = CompletionClient::with_base_url(test_config(), server.uri()).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "error": { "message": "down" }
            })))
            .mount(&server)
            .await;

        let err = client.chat(&[ChatMessage::user("hi")], None).await.unwrap_err();
        match err {
            CompletionError::RetryExhausted { attempts } => assert_eq!(attempts, MAX_RETRIES),
            other => panic!("expected RetryExhausted, got {other}"),
        }
    }

    #[tokio::test]
    async fn empty_choices_is_an_error() {
        let server = MockServer::start().await;
        let client = CompletionClient::with_base_url(test_config(), server.uri()).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": []
            })))
            .mount(&server)
            .await;

        let err = client.chat(&[ChatMessage::user("hi")], None).await.unwrap_err();
        assert!(matches!(err, CompletionError::RetryExhausted { .. }), "got {err}");
    }

    #[test]
    fn tool_result_message_serializes_with_call_id() {
        let msg = ChatMessage::tool_result("call_1", "{\"ltp\":\"100\"}");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["role"], "tool");
        assert_eq!(value["tool_call_id"], "call_1");
        assert!(value.get("tool_calls").is_none());
    }
}
