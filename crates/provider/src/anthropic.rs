use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::registry::ModelCapabilities;
use crate::types::*;
use crate::{Provider, ProviderError};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    caps: ModelCapabilities,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>, caps: ModelCapabilities) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            caps,
        }
    }

    fn build_messages(&self, request: &GenerateRequest) -> Vec<serde_json::Value> {
        request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|msg| {
                let content = match &msg.content {
                    MessageContent::Text(text) => json!(text),
                    MessageContent::Parts(parts) => {
                        let blocks: Vec<serde_json::Value> = parts
                            .iter()
                            .map(|p| match p {
                                ContentPart::Text { text } => {
                                    json!({"type": "text", "text": text})
                                }
                                ContentPart::ToolUse { id, name, input } => json!({
                                    "type": "tool_use",
                                    "id": id,
                                    "name": name,
                                    "input": input,
                                }),
                                ContentPart::ToolResult {
                                    tool_use_id,
                                    content,
                                } => json!({
                                    "type": "tool_result",
                                    "tool_use_id": tool_use_id,
                                    "content": content,
                                }),
                            })
                            .collect();
                        json!(blocks)
                    }
                };
                json!({
                    "role": match msg.role {
                        Role::Assistant => "assistant",
                        _ => "user",
                    },
                    "content": content,
                })
            })
            .collect()
    }

    fn build_body(&self, request: &GenerateRequest) -> serde_json::Value {
        let mut body = json!({
            "model": request.model,
            "messages": self.build_messages(request),
            "max_tokens": request.max_tokens.unwrap_or(self.caps.max_tokens),
            "temperature": request.temperature,
        });
        if let Some(system) = &request.system {
            body["system"] = json!(system);
        }
        if let Some(stop) = &request.stop {
            if self.caps.supports_stop {
                body["stop_sequences"] = json!(stop);
            } else {
                tracing::debug!(model = %request.model, "dropping stop sequences, model does not support them");
            }
        }
        if !request.tools.is_empty() {
            if self.caps.supports_tool_calls {
                let tools: Vec<serde_json::Value> = request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect();
                body["tools"] = json!(tools);
            } else {
                tracing::debug!(model = %request.model, "dropping tool definitions, model does not support tool calls");
            }
        }
        body
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn capabilities(&self) -> &ModelCapabilities {
        &self.caps
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<Generation> {
        let body = self.build_body(request);

        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow::Error::new(ProviderError::Timeout(e.to_string()))
                } else {
                    anyhow::Error::new(e)
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let body = resp.text().await.unwrap_or_default();
            return Err(
                ProviderError::from_http(status.as_u16(), body, retry_after.as_deref()).into(),
            );
        }

        let data: serde_json::Value = resp.json().await?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        if let Some(blocks) = data["content"].as_array() {
            for block in blocks {
                match block["type"].as_str() {
                    Some("text") => text.push_str(block["text"].as_str().unwrap_or("")),
                    Some("tool_use") => tool_calls.push(ToolCall {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        arguments: block["input"].clone(),
                    }),
                    _ => {}
                }
            }
        }

        Ok(Generation {
            text,
            tool_calls,
            usage: Some(Usage {
                input_tokens: data["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: data["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
            }),
            finish_reason: data["stop_reason"].as_str().map(String::from),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::capabilities_for;

    #[test]
    fn system_is_a_top_level_field() {
        let provider = AnthropicProvider::new(
            "k".into(),
            None,
            capabilities_for("claude-sonnet-4-20250514"),
        );
        let request = GenerateRequest {
            model: "claude-sonnet-4-20250514".into(),
            messages: vec![Message::user("fix it")],
            system: Some("you are a repair agent".into()),
            tools: vec![],
            stop: None,
            temperature: 0.0,
            max_tokens: None,
        };
        let body = provider.build_body(&request);
        assert_eq!(body["system"], "you are a repair agent");
        assert_eq!(body["messages"][0]["role"], "user");
        // max_tokens is mandatory on this API; filled from the registry.
        assert!(body["max_tokens"].as_u64().unwrap() > 0);
    }

    #[test]
    fn tool_definitions_use_input_schema() {
        let provider = AnthropicProvider::new(
            "k".into(),
            None,
            capabilities_for("claude-sonnet-4-20250514"),
        );
        let request = GenerateRequest {
            model: "claude-sonnet-4-20250514".into(),
            messages: vec![Message::user("go")],
            system: None,
            tools: vec![ToolDefinition {
                name: "read_file".into(),
                description: "read".into(),
                parameters: serde_json::json!({"type": "object"}),
            }],
            stop: None,
            temperature: 0.0,
            max_tokens: Some(1024),
        };
        let body = provider.build_body(&request);
        assert_eq!(body["tools"][0]["name"], "read_file");
        assert!(body["tools"][0]["input_schema"].is_object());
    }
}
