pub mod providers;
pub mod retry;

use std::sync::Arc;

use base64::Engine;

use storyloom_core::config::{ModelConfig, ModelsConfig, RetryConfig};
use storyloom_core::error::{LoomError, Result};
use storyloom_core::traits::{ImageGenerator, TextGenerator, VideoGenerator};

pub use providers::anthropic::AnthropicClient;
pub use providers::gemini::GeminiClient;
pub use providers::openai::OpenAiClient;
pub use retry::{RetryingImage, RetryingText, RetryingVideo};

/// Generation capabilities built from the `[models]` config section.
/// A capability is `None` when its section is absent.
#[derive(Default, Clone)]
pub struct Providers {
    pub text: Option<Arc<dyn TextGenerator>>,
    pub image: Option<Arc<dyn ImageGenerator>>,
    pub video: Option<Arc<dyn VideoGenerator>>,
}

/// Create a text client based on the provider name.
pub fn create_text_client(config: &ModelConfig) -> Result<Arc<dyn TextGenerator>> {
    match config.provider.as_str() {
        "anthropic" | "claude" => Ok(Arc::new(AnthropicClient::new(config.clone()))),
        "gemini" | "google" => Ok(Arc::new(GeminiClient::new(config.clone()))),
        // Everything else uses the OpenAI-compatible client
        _ => Ok(Arc::new(OpenAiClient::new(config.clone()))),
    }
}

/// Create an image client. Only providers with an image endpoint qualify.
pub fn create_image_client(config: &ModelConfig) -> Result<Arc<dyn ImageGenerator>> {
    match config.provider.as_str() {
        "gemini" | "google" => Ok(Arc::new(GeminiClient::new(config.clone()))),
        p if providers::presets::get_preset(p).is_some_and(|preset| preset.supports_images) => {
            Ok(Arc::new(OpenAiClient::new(config.clone())))
        }
        // Unknown names with an explicit base URL are treated as OpenAI-compatible.
        p if providers::presets::get_preset(p).is_none() && config.base_url.is_some() => {
            Ok(Arc::new(OpenAiClient::new(config.clone())))
        }
        other => Err(LoomError::UnsupportedProvider(format!(
            "{} does not support image generation",
            other
        ))),
    }
}

/// Create a video client. Only Gemini (Veo) is supported.
pub fn create_video_client(config: &ModelConfig) -> Result<Arc<dyn VideoGenerator>> {
    match config.provider.as_str() {
        "gemini" | "google" => Ok(Arc::new(GeminiClient::new(config.clone()))),
        other => Err(LoomError::UnsupportedProvider(format!(
            "{} does not support video generation",
            other
        ))),
    }
}

/// Build every configured capability, each wrapped with retry (and text
/// fallbacks).
pub fn build_providers(models: &ModelsConfig) -> Result<Providers> {
    let text = match &models.text {
        Some(primary) => {
            let fallbacks = models
                .text_fallbacks
                .iter()
                .map(create_text_client)
                .collect::<Result<Vec<_>>>()?;
            Some(Arc::new(RetryingText::new(
                create_text_client(primary)?,
                fallbacks,
                retry_config(primary),
            )) as Arc<dyn TextGenerator>)
        }
        None => None,
    };

    let image = match &models.image {
        Some(cfg) => Some(Arc::new(RetryingImage::new(
            create_image_client(cfg)?,
            retry_config(cfg),
        )) as Arc<dyn ImageGenerator>),
        None => None,
    };

    let video = match &models.video {
        Some(cfg) => Some(Arc::new(RetryingVideo::new(
            create_video_client(cfg)?,
            retry_config(cfg),
        )) as Arc<dyn VideoGenerator>),
        None => None,
    };

    Ok(Providers { text, image, video })
}

fn retry_config(config: &ModelConfig) -> RetryConfig {
    config.retry.clone().unwrap_or_default()
}

pub(crate) fn decode_base64(data: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| LoomError::LlmParse(format!("invalid base64 payload: {}", e)))
}
