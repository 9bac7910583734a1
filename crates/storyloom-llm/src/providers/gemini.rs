use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use storyloom_core::config::ModelConfig;
use storyloom_core::error::{LoomError, Result};
use storyloom_core::traits::{ImageGenerator, TextGenerator, VideoGenerator};
use storyloom_core::types::{GeneratedImage, GenerationOptions};

use super::{positive, send_json};

const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const VIDEO_POLL_INTERVAL: Duration = Duration::from_secs(10);
const VIDEO_MAX_POLLS: u32 = 60;

/// Google Gemini native API client: text via Gemini, images via Imagen,
/// video via Veo long-running operations.
pub struct GeminiClient {
    http: Client,
    config: ModelConfig,
    base_url: String,
}

impl GeminiClient {
    pub fn new(config: ModelConfig) -> Self {
        let base_url = config
            .base_url
            .as_deref()
            .unwrap_or(GEMINI_API_URL)
            .trim_end_matches('/')
            .to_string();
        Self {
            http: Client::new(),
            config,
            base_url,
        }
    }

    fn api_key(&self) -> Result<&str> {
        self.config
            .api_key
            .as_deref()
            .ok_or_else(|| LoomError::Config("Gemini: api_key is required".into()))
    }

    fn model_url(&self, options: &GenerationOptions, method: &str) -> Result<String> {
        let model = options.model.as_deref().unwrap_or(&self.config.model_id);
        Ok(format!(
            "{}/models/{}:{}?key={}",
            self.base_url,
            model,
            method,
            self.api_key()?
        ))
    }
}

// ── Request types ────────────────────────────────────────────────

#[derive(Serialize)]
struct GenerateContentRequest<'a> {
    contents: Vec<GeminiContent<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent<'a> {
    role: &'static str,
    parts: Vec<GeminiTextPart<'a>>,
}

#[derive(Serialize)]
struct GeminiTextPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

// ── Response types ───────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize, Debug)]
struct GeminiCandidate {
    content: Option<GeminiContentOut>,
}

#[derive(Deserialize, Debug)]
struct GeminiContentOut {
    #[serde(default)]
    parts: Vec<GeminiPartOut>,
}

#[derive(Deserialize, Debug)]
struct GeminiPartOut {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<ImagePrediction>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ImagePrediction {
    bytes_base64_encoded: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Operation {
    name: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<OperationError>,
    #[serde(default)]
    response: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct OperationError {
    #[serde(default)]
    message: String,
}

fn extract_text(response: GenerateContentResponse) -> Result<String> {
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| LoomError::LlmParse("Gemini response has no candidates".into()))?;
    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.is_empty() {
        return Err(LoomError::LlmParse("Gemini response has no text parts".into()));
    }
    Ok(text)
}

fn extract_image(response: PredictResponse) -> Result<GeneratedImage> {
    let prediction = response
        .predictions
        .into_iter()
        .next()
        .ok_or_else(|| LoomError::LlmParse("Imagen returned no predictions".into()))?;
    let b64 = prediction
        .bytes_base64_encoded
        .ok_or_else(|| LoomError::LlmParse("Imagen prediction has no image bytes".into()))?;
    Ok(GeneratedImage::Bytes {
        data: crate::decode_base64(&b64)?,
        mime_type: prediction.mime_type.unwrap_or_else(|| "image/png".to_string()),
    })
}

/// Pull the first video URI out of a finished Veo operation.
fn extract_video_uri(op: &Operation) -> Result<String> {
    if let Some(err) = &op.error {
        return Err(LoomError::LlmRequest(format!(
            "Veo operation {} failed: {}",
            op.name, err.message
        )));
    }
    op.response
        .as_ref()
        .and_then(|r| r.pointer("/generateVideoResponse/generatedSamples/0/video/uri"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| LoomError::LlmParse(format!("Veo operation {} returned no video", op.name)))
}

impl TextGenerator for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate_text<'a>(
        &'a self,
        prompt: &'a str,
        options: &'a GenerationOptions,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let url = self.model_url(options, "generateContent")?;
            let body = GenerateContentRequest {
                contents: vec![GeminiContent {
                    role: "user",
                    parts: vec![GeminiTextPart { text: prompt }],
                }],
                generation_config: GenerationConfig {
                    max_output_tokens: options.max_tokens.unwrap_or(self.config.max_tokens),
                    temperature: positive(options.temperature.unwrap_or(self.config.temperature)),
                    response_mime_type: options.json_output.then_some("application/json"),
                },
            };

            let response: GenerateContentResponse =
                send_json(self.http.post(&url).json(&body)).await?;
            extract_text(response)
        })
    }
}

impl ImageGenerator for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate_image<'a>(
        &'a self,
        prompt: &'a str,
        options: &'a GenerationOptions,
    ) -> BoxFuture<'a, Result<GeneratedImage>> {
        Box::pin(async move {
            let url = self.model_url(options, "predict")?;
            let mut parameters = json!({ "sampleCount": 1 });
            if let Some(ratio) = &options.aspect_ratio {
                parameters["aspectRatio"] = json!(ratio);
            }
            let body = json!({
                "instances": [{ "prompt": prompt }],
                "parameters": parameters,
            });

            let response: PredictResponse = send_json(self.http.post(&url).json(&body)).await?;
            extract_image(response)
        })
    }
}

impl VideoGenerator for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate_video<'a>(
        &'a self,
        prompt: &'a str,
        options: &'a GenerationOptions,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let url = self.model_url(options, "predictLongRunning")?;
            let mut parameters = json!({});
            if let Some(ratio) = &options.aspect_ratio {
                parameters["aspectRatio"] = json!(ratio);
            }
            if let Some(secs) = options.duration_secs {
                parameters["durationSeconds"] = json!(secs);
            }
            let body = json!({
                "instances": [{ "prompt": prompt }],
                "parameters": parameters,
            });

            let mut op: Operation = send_json(self.http.post(&url).json(&body)).await?;
            info!(operation = %op.name, "Veo generation started");

            let mut polls = 0;
            while !op.done {
                if polls >= VIDEO_MAX_POLLS {
                    return Err(LoomError::LlmRequest(format!(
                        "Veo operation {} not done after {} polls",
                        op.name, polls
                    )));
                }
                tokio::time::sleep(VIDEO_POLL_INTERVAL).await;
                polls += 1;
                let poll_url = format!("{}/{}?key={}", self.base_url, op.name, self.api_key()?);
                op = send_json(self.http.get(&poll_url)).await?;
                debug!(operation = %op.name, polls, done = op.done, "Polled Veo operation");
            }

            extract_video_uri(&op)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> GeminiClient {
        GeminiClient::new(ModelConfig::new("gemini", "gemini-2.0-flash").with_api_key("g-key"))
    }

    #[test]
    fn test_model_url_uses_override() {
        let c = client();
        let url = c
            .model_url(
                &GenerationOptions {
                    model: Some("imagen-3.0-generate-002".into()),
                    ..Default::default()
                },
                "predict",
            )
            .unwrap();
        assert_eq!(
            url,
            "https://generativelanguage.googleapis.com/v1beta/models/imagen-3.0-generate-002:predict?key=g-key"
        );
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let c = GeminiClient::new(ModelConfig::new("gemini", "gemini-2.0-flash"));
        assert!(matches!(
            c.model_url(&GenerationOptions::default(), "generateContent"),
            Err(LoomError::Config(_))
        ));
    }

    #[test]
    fn test_extract_text_joins_parts() {
        let response: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "A red "}, {"text": "bicycle."}]}}]
        }))
        .unwrap();
        assert_eq!(extract_text(response).unwrap(), "A red bicycle.");

        let blocked: GenerateContentResponse =
            serde_json::from_value(json!({"candidates": [{}]})).unwrap();
        assert!(extract_text(blocked).is_err());
    }

    #[test]
    fn test_extract_image_bytes() {
        let response: PredictResponse = serde_json::from_value(json!({
            "predictions": [{"bytesBase64Encoded": "aGk=", "mimeType": "image/jpeg"}]
        }))
        .unwrap();
        assert_eq!(
            extract_image(response).unwrap(),
            GeneratedImage::Bytes {
                data: b"hi".to_vec(),
                mime_type: "image/jpeg".into()
            }
        );
    }

    #[test]
    fn test_extract_video_uri() {
        let op: Operation = serde_json::from_value(json!({
            "name": "operations/abc",
            "done": true,
            "response": {"generateVideoResponse": {"generatedSamples": [{"video": {"uri": "https://v/1.mp4"}}]}}
        }))
        .unwrap();
        assert_eq!(extract_video_uri(&op).unwrap(), "https://v/1.mp4");

        let failed: Operation = serde_json::from_value(json!({
            "name": "operations/abc",
            "done": true,
            "error": {"code": 3, "message": "prompt rejected"}
        }))
        .unwrap();
        let err = extract_video_uri(&failed).unwrap_err();
        assert!(err.to_string().contains("prompt rejected"));
    }
}
