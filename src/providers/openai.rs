use crate::agent::conversation::Message;
use crate::providers::traits::{
    ChatRequest as ProviderChatRequest, ChatResponse as ProviderChatResponse, Provider,
    TokenUsage, ToolCall as ProviderToolCall,
};
use crate::tools::ToolSpec;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Client-side request timeout. Long enough for big-context completions,
/// short enough that a wedged connection cannot eat the run's wall clock.
const REQUEST_TIMEOUT_SECS: u64 = 180;

/// OpenAI-compatible chat-completions provider with native tool calling.
/// Covers OpenAI, DeepSeek, and local vLLM endpoints behind one base URL.
pub struct OpenAiCompatProvider {
    base_url: String,
    credential: String,
    client: Client,
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireToolSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolSpec {
    #[serde(rename = "type")]
    kind: String,
    function: WireToolFunctionSpec,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolFunctionSpec {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
    #[serde(default)]
    total_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: Option<String>,
    /// Thinking models may put output here when `content` is empty.
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

impl WireResponseMessage {
    fn effective_content(&self) -> Option<String> {
        match &self.content {
            Some(c) if !c.is_empty() => Some(c.clone()),
            _ => self.reasoning_content.clone(),
        }
    }
}

impl OpenAiCompatProvider {
    /// Defaults to `https://api.openai.com/v1` when `base_url` is `None`.
    pub fn new(base_url: Option<&str>, credential: &str) -> Self {
        Self {
            base_url: base_url
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            credential: credential.to_string(),
            client: Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
        }
    }

    fn convert_tools(tools: &[ToolSpec]) -> Option<Vec<WireToolSpec>> {
        if tools.is_empty() {
            return None;
        }
        Some(
            tools
                .iter()
                .map(|tool| WireToolSpec {
                    kind: "function".to_string(),
                    function: WireToolFunctionSpec {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.parameters.clone(),
                    },
                })
                .collect(),
        )
    }

    fn convert_messages(messages: &[Message]) -> Vec<WireMessage> {
        messages
            .iter()
            .map(|m| match m {
                Message::System { content } => WireMessage {
                    role: "system",
                    content: Some(content.clone()),
                    tool_call_id: None,
                    name: None,
                    tool_calls: None,
                },
                Message::User { content } => WireMessage {
                    role: "user",
                    content: Some(content.clone()),
                    tool_call_id: None,
                    name: None,
                    tool_calls: None,
                },
                Message::Assistant {
                    content,
                    tool_calls,
                } => WireMessage {
                    role: "assistant",
                    content: Some(content.clone()),
                    tool_call_id: None,
                    name: None,
                    tool_calls: if tool_calls.is_empty() {
                        None
                    } else {
                        Some(
                            tool_calls
                                .iter()
                                .map(|tc| WireToolCall {
                                    id: Some(tc.id.clone()),
                                    kind: Some("function".to_string()),
                                    function: WireFunctionCall {
                                        name: tc.name.clone(),
                                        arguments: tc.arguments.clone(),
                                    },
                                })
                                .collect(),
                        )
                    },
                },
                Message::Tool {
                    call_id,
                    name,
                    content,
                } => WireMessage {
                    role: "tool",
                    content: Some(content.clone()),
                    tool_call_id: Some(call_id.clone()),
                    name: Some(name.clone()),
                    tool_calls: None,
                },
            })
            .collect()
    }

    fn parse_response(body: WireResponse) -> anyhow::Result<ProviderChatResponse> {
        let usage = body.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });
        let message = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .context("provider response contained no choices")?;
        let text = message.effective_content();
        let tool_calls = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ProviderToolCall {
                id: tc.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect();
        Ok(ProviderChatResponse {
            text,
            tool_calls,
            usage,
        })
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    async fn chat(&self, request: ProviderChatRequest<'_>) -> anyhow::Result<ProviderChatResponse> {
        let payload = WireRequest {
            model: request.model,
            messages: Self::convert_messages(request.messages),
            tools: Self::convert_tools(request.tools),
            tool_choice: if request.tools.is_empty() {
                None
            } else {
                Some(request.tool_choice.as_wire())
            },
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.credential)
            .json(&payload)
            .send()
            .await
            .context("chat completion request failed")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("failed to read provider response body")?;
        if !status.is_success() {
            // Keep the status code in the message: the retry classifier keys
            // off strings like "429" and "402 Insufficient Balance".
            anyhow::bail!(
                "provider returned {status}: {}",
                crate::util::head_chars(&body, 600)
            );
        }

        let parsed: WireResponse = serde_json::from_str(&body)
            .with_context(|| format!("invalid provider response: {}", crate::util::head_chars(&body, 300)))?;
        Self::parse_response(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ToolCall;

    #[test]
    fn converts_tool_exchange_messages() {
        let messages = vec![
            Message::system("sys"),
            Message::Assistant {
                content: String::new(),
                tool_calls: vec![ToolCall {
                    id: "call_1".into(),
                    name: "read_file".into(),
                    arguments: r#"{"path":"Foo.java"}"#.into(),
                }],
            },
            Message::Tool {
                call_id: "call_1".into(),
                name: "read_file".into(),
                content: r#"{"ok":true}"#.into(),
            },
        ];
        let wire = OpenAiCompatProvider::convert_messages(&messages);
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[1].role, "assistant");
        assert_eq!(wire[1].tool_calls.as_ref().unwrap().len(), 1);
        assert_eq!(wire[2].role, "tool");
        assert_eq!(wire[2].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn assistant_without_calls_serializes_without_tool_calls_field() {
        let wire = OpenAiCompatProvider::convert_messages(&[Message::assistant("done")]);
        assert!(wire[0].tool_calls.is_none());
        let json = serde_json::to_string(&wire[0]).unwrap();
        assert!(!json.contains("tool_calls"));
    }

    #[test]
    fn parse_response_extracts_tool_calls_and_usage() {
        let body: WireResponse = serde_json::from_str(
            r#"{
                "choices": [{"message": {
                    "content": null,
                    "tool_calls": [{"id": "c1", "type": "function",
                        "function": {"name": "search_in_files", "arguments": "{\"query\":\"x\"}"}}]
                }}],
                "usage": {"prompt_tokens": 100, "completion_tokens": 20, "total_tokens": 120}
            }"#,
        )
        .unwrap();
        let parsed = OpenAiCompatProvider::parse_response(body).unwrap();
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "search_in_files");
        assert_eq!(parsed.usage.unwrap().total(), Some(120));
    }

    #[test]
    fn parse_response_generates_missing_call_ids() {
        let body: WireResponse = serde_json::from_str(
            r#"{"choices": [{"message": {
                "tool_calls": [{"function": {"name": "read_file", "arguments": "{}"}}]
            }}]}"#,
        )
        .unwrap();
        let parsed = OpenAiCompatProvider::parse_response(body).unwrap();
        assert!(!parsed.tool_calls[0].id.is_empty());
    }

    #[test]
    fn parse_response_prefers_content_over_reasoning() {
        let body: WireResponse = serde_json::from_str(
            r#"{"choices": [{"message": {"content": "answer", "reasoning_content": "thinking"}}]}"#,
        )
        .unwrap();
        let parsed = OpenAiCompatProvider::parse_response(body).unwrap();
        assert_eq!(parsed.text.as_deref(), Some("answer"));
    }

    #[test]
    fn parse_response_falls_back_to_reasoning_content() {
        let body: WireResponse = serde_json::from_str(
            r#"{"choices": [{"message": {"content": "", "reasoning_content": "thinking"}}]}"#,
        )
        .unwrap();
        let parsed = OpenAiCompatProvider::parse_response(body).unwrap();
        assert_eq!(parsed.text.as_deref(), Some("thinking"));
    }

    #[test]
    fn empty_choices_is_an_error() {
        let body: WireResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(OpenAiCompatProvider::parse_response(body).is_err());
    }
}
