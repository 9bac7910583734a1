use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use storyloom_core::config::ModelConfig;
use storyloom_core::error::{LoomError, Result};
use storyloom_core::traits::TextGenerator;
use storyloom_core::types::GenerationOptions;

use super::{positive, send_json};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

const JSON_SYSTEM_PROMPT: &str =
    "Respond with a single valid JSON value only. Do not wrap it in prose.";

pub struct AnthropicClient {
    http: Client,
    config: ModelConfig,
}

impl AnthropicClient {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }
}

// Anthropic API request types
#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    messages: Vec<ApiMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'static str>,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

// Anthropic API response types
#[derive(Deserialize, Debug)]
struct MessageResponse {
    #[serde(default)]
    content: Vec<ContentBlockInfo>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum ContentBlockInfo {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

fn extract_text(response: MessageResponse) -> Result<String> {
    let text: String = response
        .content
        .into_iter()
        .filter_map(|block| match block {
            ContentBlockInfo::Text { text } => Some(text),
            ContentBlockInfo::Other => None,
        })
        .collect();
    if text.is_empty() {
        return Err(LoomError::LlmParse(format!(
            "Anthropic response has no text (stop_reason: {})",
            response.stop_reason.as_deref().unwrap_or("none")
        )));
    }
    Ok(text)
}

impl TextGenerator for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn generate_text<'a>(
        &'a self,
        prompt: &'a str,
        options: &'a GenerationOptions,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let api_key = self
                .config
                .api_key
                .as_deref()
                .ok_or_else(|| LoomError::Config("Anthropic API key not set".into()))?;

            let base_url = self
                .config
                .base_url
                .as_deref()
                .unwrap_or(ANTHROPIC_API_URL);

            let model = options.model.as_deref().unwrap_or(&self.config.model_id);
            let body = AnthropicRequest {
                model,
                max_tokens: options.max_tokens.unwrap_or(self.config.max_tokens),
                temperature: positive(options.temperature.unwrap_or(self.config.temperature)),
                messages: vec![ApiMessage {
                    role: "user",
                    content: prompt,
                }],
                system: options.json_output.then_some(JSON_SYSTEM_PROMPT),
            };

            debug!(model, "Anthropic messages request");
            let response: MessageResponse = send_json(
                self.http
                    .post(base_url)
                    .header("x-api-key", api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .header("content-type", "application/json")
                    .json(&body),
            )
            .await?;
            extract_text(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_text_skips_other_blocks() {
        let response: MessageResponse = serde_json::from_value(json!({
            "content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "Hello"}
            ],
            "stop_reason": "end_turn"
        }))
        .unwrap();
        assert_eq!(extract_text(response).unwrap(), "Hello");
    }

    #[test]
    fn test_empty_response_reports_stop_reason() {
        let response: MessageResponse =
            serde_json::from_value(json!({"content": [], "stop_reason": "max_tokens"})).unwrap();
        let err = extract_text(response).unwrap_err();
        assert!(err.to_string().contains("max_tokens"));
    }

    #[tokio::test]
    async fn test_missing_key() {
        let client = AnthropicClient::new(ModelConfig::new("anthropic", "claude-sonnet-4-20250514"));
        let err = client
            .generate_text("hi", &GenerationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LoomError::Config(_)));
    }
}
