use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::registry::ModelCapabilities;
use crate::types::*;
use crate::{Provider, ProviderError};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAIProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    caps: ModelCapabilities,
}

impl OpenAIProvider {
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
        let mut out = Vec::new();
        if let Some(system) = &request.system {
            out.push(json!({"role": "system", "content": system}));
        }
        for msg in &request.messages {
            match &msg.content {
                MessageContent::Text(text) => {
                    let role = match msg.role {
                        Role::Assistant => "assistant",
                        Role::System => "system",
                        _ => "user",
                    };
                    out.push(json!({"role": role, "content": text}));
                }
                MessageContent::Parts(parts) => {
                    let mut tool_calls = Vec::new();
                    let mut text = String::new();
                    for part in parts {
                        match part {
                            ContentPart::Text { text: t } => text.push_str(t),
                            ContentPart::ToolUse { id, name, input } => tool_calls.push(json!({
                                "id": id,
                                "type": "function",
                                "function": {"name": name, "arguments": input.to_string()},
                            })),
                            ContentPart::ToolResult {
                                tool_use_id,
                                content,
                            } => out.push(json!({
                                "role": "tool",
                                "tool_call_id": tool_use_id,
                                "content": content,
                            })),
                        }
                    }
                    if !tool_calls.is_empty() {
                        let mut m = json!({"role": "assistant", "tool_calls": tool_calls});
                        if !text.is_empty() {
                            m["content"] = json!(text);
                        }
                        out.push(m);
                    } else if !text.is_empty() {
                        out.push(json!({"role": "assistant", "content": text}));
                    }
                }
            }
        }
        out
    }

    fn build_body(&self, request: &GenerateRequest) -> serde_json::Value {
        let mut body = json!({
            "model": request.model,
            "messages": self.build_messages(request),
            "temperature": request.temperature,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(stop) = &request.stop {
            if self.caps.supports_stop {
                body["stop"] = json!(stop);
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
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
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
impl Provider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn capabilities(&self) -> &ModelCapabilities {
        &self.caps
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<Generation> {
        let body = self.build_body(request);

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
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
        let message = &data["choices"][0]["message"];

        let mut tool_calls = Vec::new();
        if let Some(calls) = message["tool_calls"].as_array() {
            for call in calls {
                let arguments_raw = call["function"]["arguments"].as_str().unwrap_or("{}");
                let arguments: serde_json::Value =
                    serde_json::from_str(arguments_raw).unwrap_or(serde_json::Value::Null);
                tool_calls.push(ToolCall {
                    id: call["id"].as_str().unwrap_or_default().to_string(),
                    name: call["function"]["name"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    arguments,
                });
            }
        }

        Ok(Generation {
            text: message["content"].as_str().unwrap_or("").to_string(),
            tool_calls,
            usage: Some(Usage {
                input_tokens: data["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: data["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
            }),
            finish_reason: data["choices"][0]["finish_reason"]
                .as_str()
                .map(String::from),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::capabilities_for;

    fn request_with_stop(model: &str) -> GenerateRequest {
        GenerateRequest {
            model: model.to_string(),
            messages: vec![Message::user("hi")],
            system: Some("sys".to_string()),
            tools: vec![],
            stop: Some(vec!["Observation:".to_string()]),
            temperature: 0.0,
            max_tokens: Some(512),
        }
    }

    #[test]
    fn stop_is_sent_when_supported() {
        let provider =
            OpenAIProvider::new("k".into(), None, capabilities_for("gpt-4.1"));
        let body = provider.build_body(&request_with_stop("gpt-4.1"));
        assert_eq!(body["stop"][0], "Observation:");
    }

    #[test]
    fn stop_is_dropped_when_unsupported() {
        let provider = OpenAIProvider::new("k".into(), None, capabilities_for("o3-mini"));
        let body = provider.build_body(&request_with_stop("o3-mini"));
        assert!(body.get("stop").is_none());
    }

    #[test]
    fn tool_results_become_tool_role_messages() {
        let provider =
            OpenAIProvider::new("k".into(), None, capabilities_for("gpt-4.1"));
        let request = GenerateRequest {
            model: "gpt-4.1".into(),
            messages: vec![
                Message {
                    role: Role::Assistant,
                    content: MessageContent::Parts(vec![ContentPart::ToolUse {
                        id: "call_1".into(),
                        name: "run_tests".into(),
                        input: serde_json::json!({}),
                    }]),
                },
                Message {
                    role: Role::User,
                    content: MessageContent::Parts(vec![ContentPart::ToolResult {
                        tool_use_id: "call_1".into(),
                        content: "{\"failed\": 1}".into(),
                    }]),
                },
            ],
            system: None,
            tools: vec![],
            stop: None,
            temperature: 0.0,
            max_tokens: None,
        };
        let messages = provider.build_messages(&request);
        assert_eq!(messages[0]["role"], "assistant");
        assert_eq!(messages[0]["tool_calls"][0]["id"], "call_1");
        assert_eq!(messages[1]["role"], "tool");
        assert_eq!(messages[1]["tool_call_id"], "call_1");
    }
}
