//! Anthropic Messages API backend.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role, retry_after,
};
use crate::error::LlmError;

const PROVIDER: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: SecretString,
    model: String,
}

impl AnthropicProvider {
    pub fn new(client: Client, api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            model: model.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    id: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

fn build_body<'a>(model: &'a str, request: &'a CompletionRequest) -> MessagesRequest<'a> {
    // The system prompt travels separately; only user/assistant turns go in
    // `messages`.
    let messages = request
        .messages
        .iter()
        .filter_map(|m| match m.role {
            Role::System => None,
            Role::User => Some(WireMessage {
                role: "user",
                content: &m.content,
            }),
            Role::Assistant => Some(WireMessage {
                role: "assistant",
                content: &m.content,
            }),
        })
        .collect();

    MessagesRequest {
        model,
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        system: request.system_prompt(),
        messages,
        temperature: request.temperature,
    }
}

fn parse_response(response: MessagesResponse) -> CompletionResponse {
    let content = response
        .content
        .iter()
        .filter(|b| b.kind == "text")
        .map(|b| b.text.as_str())
        .collect::<Vec<_>>()
        .join("");

    CompletionResponse {
        content,
        input_tokens: response.usage.input_tokens,
        output_tokens: response.usage.output_tokens,
        finish_reason: match response.stop_reason.as_deref() {
            Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
            Some("max_tokens") => FinishReason::Length,
            _ => FinishReason::Other,
        },
        response_id: response.id,
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = build_body(&self.model, &request);

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.into(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let hint = retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(PROVIDER, status.as_u16(), hint, &text));
        }

        let parsed: MessagesResponse =
            response.json().await.map_err(|e| LlmError::InvalidResponse {
                provider: PROVIDER.into(),
                reason: e.to_string(),
            })?;

        Ok(parse_response(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::ChatMessage;

    #[test]
    fn system_prompt_is_lifted_out_of_messages() {
        let request = CompletionRequest::new(vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("hello"),
        ])
        .with_max_tokens(200);

        let body = serde_json::to_value(build_body("claude-test", &request)).unwrap();
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["max_tokens"], 200);
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn text_blocks_are_concatenated() {
        let raw = serde_json::json!({
            "id": "msg_1",
            "content": [
                {"type": "text", "text": "Hello "},
                {"type": "tool_use", "id": "t"},
                {"type": "text", "text": "there"}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 3}
        });
        let parsed: MessagesResponse = serde_json::from_value(raw).unwrap();
        let response = parse_response(parsed);
        assert_eq!(response.content, "Hello there");
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(response.output_tokens, 3);
        assert_eq!(response.response_id.as_deref(), Some("msg_1"));
    }
}
