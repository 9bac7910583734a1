pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod presets;

pub use anthropic::AnthropicClient;
pub use gemini::GeminiClient;
pub use openai::OpenAiClient;

use serde::de::DeserializeOwned;

use storyloom_core::error::{LoomError, Result};

/// Send a request and decode a JSON body.
///
/// Non-2xx responses become `LlmRequest("HTTP <status>: <body>")` so the
/// retry layer can classify them by status code.
pub(crate) async fn send_json<T: DeserializeOwned>(req: reqwest::RequestBuilder) -> Result<T> {
    let response = req
        .send()
        .await
        .map_err(|e| LoomError::LlmRequest(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        return Err(LoomError::LlmRequest(format!("HTTP {}: {}", status, body)));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| LoomError::LlmParse(e.to_string()))
}

/// Temperature to send, omitting non-positive values.
pub(crate) fn positive(temperature: f32) -> Option<f32> {
    if temperature > 0.0 {
        Some(temperature)
    } else {
        None
    }
}
