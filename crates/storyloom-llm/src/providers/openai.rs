use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use storyloom_core::config::ModelConfig;
use storyloom_core::error::{LoomError, Result};
use storyloom_core::traits::{ImageGenerator, TextGenerator};
use storyloom_core::types::{GeneratedImage, GenerationOptions};

use super::presets::get_preset;
use super::{positive, send_json};

const OPENAI_API_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible client. Works with OpenAI, Ollama, Groq, OpenRouter, etc.
pub struct OpenAiClient {
    http: Client,
    config: ModelConfig,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(config: ModelConfig) -> Self {
        let base_url = config
            .base_url
            .clone()
            .or_else(|| get_preset(&config.provider).map(|p| p.default_base_url.to_string()))
            .unwrap_or_else(|| OPENAI_API_URL.to_string());
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            config,
        }
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.post(format!("{}{}", self.base_url, path));
        if let Some(api_key) = &self.config.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }
        req
    }

    fn model<'a>(&'a self, options: &'a GenerationOptions) -> &'a str {
        options.model.as_deref().unwrap_or(&self.config.model_id)
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<OaiMessage<'a>>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct OaiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    r#type: &'static str,
}

#[derive(Serialize)]
struct ImageRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    size: &'static str,
}

// Response types
#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize, Debug)]
struct ChatChoice {
    message: ChatMessageBody,
}

#[derive(Deserialize, Debug)]
struct ChatMessageBody {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
}

#[derive(Deserialize, Debug)]
struct ImageDatum {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    b64_json: Option<String>,
}

fn extract_text(response: ChatResponse) -> Result<String> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| LoomError::LlmParse("OpenAI response has no message content".into()))
}

fn extract_image(response: ImageResponse) -> Result<GeneratedImage> {
    let datum = response
        .data
        .into_iter()
        .next()
        .ok_or_else(|| LoomError::LlmParse("OpenAI image response is empty".into()))?;
    if let Some(url) = datum.url {
        return Ok(GeneratedImage::Url(url));
    }
    match datum.b64_json {
        Some(b64) => Ok(GeneratedImage::Bytes {
            data: crate::decode_base64(&b64)?,
            mime_type: "image/png".to_string(),
        }),
        None => Err(LoomError::LlmParse(
            "OpenAI image response has neither url nor b64_json".into(),
        )),
    }
}

/// Map an aspect ratio to one of the sizes the images endpoint accepts.
fn image_size(aspect_ratio: Option<&str>) -> &'static str {
    match aspect_ratio {
        Some("16:9") | Some("3:2") | Some("4:3") => "1792x1024",
        Some("9:16") | Some("2:3") | Some("3:4") => "1024x1792",
        _ => "1024x1024",
    }
}

impl TextGenerator for OpenAiClient {
    fn name(&self) -> &str {
        &self.config.provider
    }

    fn generate_text<'a>(
        &'a self,
        prompt: &'a str,
        options: &'a GenerationOptions,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let model = self.model(options);
            let body = ChatRequest {
                model,
                messages: vec![OaiMessage {
                    role: "user",
                    content: prompt,
                }],
                max_tokens: options.max_tokens.unwrap_or(self.config.max_tokens),
                temperature: positive(options.temperature.unwrap_or(self.config.temperature)),
                response_format: options.json_output.then_some(ResponseFormat {
                    r#type: "json_object",
                }),
            };

            debug!(model, prompt_len = prompt.len(), "OpenAI chat completion");
            let response: ChatResponse = send_json(self.post("/chat/completions").json(&body)).await?;
            extract_text(response)
        })
    }
}

impl ImageGenerator for OpenAiClient {
    fn name(&self) -> &str {
        &self.config.provider
    }

    fn generate_image<'a>(
        &'a self,
        prompt: &'a str,
        options: &'a GenerationOptions,
    ) -> BoxFuture<'a, Result<GeneratedImage>> {
        Box::pin(async move {
            let model = self.model(options);
            let body = ImageRequest {
                model,
                prompt,
                n: 1,
                size: image_size(options.aspect_ratio.as_deref()),
            };

            debug!(model, "OpenAI image generation");
            let response: ImageResponse =
                send_json(self.post("/images/generations").json(&body)).await?;
            extract_image(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_base_url_from_preset_and_override() {
        let client = OpenAiClient::new(ModelConfig::new("groq", "llama-3.3-70b"));
        assert_eq!(client.base_url, "https://api.groq.com/openai/v1");

        let mut cfg = ModelConfig::new("openai", "gpt-4o");
        cfg.base_url = Some("http://localhost:9000/v1/".into());
        let client = OpenAiClient::new(cfg);
        assert_eq!(client.base_url, "http://localhost:9000/v1");
    }

    #[test]
    fn test_model_override() {
        let client = OpenAiClient::new(ModelConfig::new("openai", "gpt-4o-mini"));
        let options = GenerationOptions {
            model: Some("gpt-4o".into()),
            ..Default::default()
        };
        assert_eq!(client.model(&options), "gpt-4o");
        assert_eq!(client.model(&GenerationOptions::default()), "gpt-4o-mini");
    }

    #[test]
    fn test_extract_text() {
        let response: ChatResponse = serde_json::from_value(json!({
            "choices": [{"message": {"role": "assistant", "content": "A red bicycle."}}]
        }))
        .unwrap();
        assert_eq!(extract_text(response).unwrap(), "A red bicycle.");

        let empty: ChatResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(matches!(extract_text(empty), Err(LoomError::LlmParse(_))));
    }

    #[test]
    fn test_extract_image_url_and_bytes() {
        let response: ImageResponse =
            serde_json::from_value(json!({"data": [{"url": "https://img/1.png"}]})).unwrap();
        assert_eq!(
            extract_image(response).unwrap(),
            GeneratedImage::Url("https://img/1.png".into())
        );

        // "aGk=" is base64 for "hi"
        let response: ImageResponse =
            serde_json::from_value(json!({"data": [{"b64_json": "aGk="}]})).unwrap();
        match extract_image(response).unwrap() {
            GeneratedImage::Bytes { data, mime_type } => {
                assert_eq!(data, b"hi");
                assert_eq!(mime_type, "image/png");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_image_size() {
        assert_eq!(image_size(Some("16:9")), "1792x1024");
        assert_eq!(image_size(Some("9:16")), "1024x1792");
        assert_eq!(image_size(None), "1024x1024");
    }

    #[test]
    fn test_json_mode_serializes_response_format() {
        let body = ChatRequest {
            model: "gpt-4o",
            messages: vec![OaiMessage {
                role: "user",
                content: "hi",
            }],
            max_tokens: 10,
            temperature: None,
            response_format: Some(ResponseFormat {
                r#type: "json_object",
            }),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["response_format"]["type"], json!("json_object"));
        assert!(value.get("temperature").is_none());
    }
}
