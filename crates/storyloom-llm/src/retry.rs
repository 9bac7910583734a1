use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{info, warn};

use storyloom_core::config::RetryConfig;
use storyloom_core::error::{LoomError, Result};
use storyloom_core::traits::{ImageGenerator, TextGenerator, VideoGenerator};
use storyloom_core::types::{GeneratedImage, GenerationOptions};

/// Whether a provider error is worth repeating the same request for.
pub fn is_retryable(e: &LoomError) -> bool {
    match e {
        LoomError::LlmRequest(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        _ => false,
    }
}

/// Exponential backoff capped at `max_backoff_ms`, with 0.8x to 1.2x jitter.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

/// Run `call` until it succeeds, fails with a non-retryable error, or
/// `max_retries` extra attempts are spent.
async fn with_retry<'a, T>(
    provider: &str,
    config: &RetryConfig,
    mut call: impl FnMut() -> BoxFuture<'a, Result<T>>,
) -> Result<T> {
    let max_retries = config.max_retries;
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if is_retryable(&e) && attempt < max_retries => {
                let backoff = calculate_backoff(attempt, config);
                warn!(
                    provider,
                    attempt = attempt + 1,
                    max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Retrying provider request"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// A text capability that retries failed requests and falls back to
/// alternative providers.
///
/// Fallbacks get a single attempt each. A fallback keeps its own model,
/// so a per-node model override only applies to the primary.
pub struct RetryingText {
    primary: Arc<dyn TextGenerator>,
    fallbacks: Vec<Arc<dyn TextGenerator>>,
    retry_config: RetryConfig,
}

impl RetryingText {
    pub fn new(
        primary: Arc<dyn TextGenerator>,
        fallbacks: Vec<Arc<dyn TextGenerator>>,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            primary,
            fallbacks,
            retry_config,
        }
    }
}

impl TextGenerator for RetryingText {
    fn name(&self) -> &str {
        self.primary.name()
    }

    fn generate_text<'a>(
        &'a self,
        prompt: &'a str,
        options: &'a GenerationOptions,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let primary = self.primary.as_ref();
            let err = match with_retry(primary.name(), &self.retry_config, || {
                primary.generate_text(prompt, options)
            })
            .await
            {
                Ok(text) => return Ok(text),
                Err(e) => e,
            };

            if self.fallbacks.is_empty() {
                return Err(err);
            }
            info!(error = %err, "Primary text provider exhausted, trying fallbacks");

            let fallback_options = GenerationOptions {
                model: None,
                ..options.clone()
            };
            for fallback in &self.fallbacks {
                match fallback.generate_text(prompt, &fallback_options).await {
                    Ok(text) => {
                        info!(provider = fallback.name(), "Fell back to alternative provider");
                        return Ok(text);
                    }
                    Err(e) => {
                        warn!(provider = fallback.name(), error = %e, "Fallback provider also failed");
                    }
                }
            }

            Err(err)
        })
    }
}

/// An image capability that retries failed requests.
pub struct RetryingImage {
    inner: Arc<dyn ImageGenerator>,
    retry_config: RetryConfig,
}

impl RetryingImage {
    pub fn new(inner: Arc<dyn ImageGenerator>, retry_config: RetryConfig) -> Self {
        Self {
            inner,
            retry_config,
        }
    }
}

impl ImageGenerator for RetryingImage {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn generate_image<'a>(
        &'a self,
        prompt: &'a str,
        options: &'a GenerationOptions,
    ) -> BoxFuture<'a, Result<GeneratedImage>> {
        let inner = self.inner.as_ref();
        Box::pin(with_retry(inner.name(), &self.retry_config, move || {
            inner.generate_image(prompt, options)
        }))
    }
}

/// A video capability that retries failed requests.
pub struct RetryingVideo {
    inner: Arc<dyn VideoGenerator>,
    retry_config: RetryConfig,
}

impl RetryingVideo {
    pub fn new(inner: Arc<dyn VideoGenerator>, retry_config: RetryConfig) -> Self {
        Self {
            inner,
            retry_config,
        }
    }
}

impl VideoGenerator for RetryingVideo {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn generate_video<'a>(
        &'a self,
        prompt: &'a str,
        options: &'a GenerationOptions,
    ) -> BoxFuture<'a, Result<String>> {
        let inner = self.inner.as_ref();
        Box::pin(with_retry(inner.name(), &self.retry_config, move || {
            inner.generate_video(prompt, options)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls with `error`, then answers with its name.
    struct Scripted {
        name: &'static str,
        failures: u32,
        error: &'static str,
        calls: AtomicU32,
        models: std::sync::Mutex<Vec<Option<String>>>,
    }

    impl Scripted {
        fn new(name: &'static str, failures: u32, error: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                failures,
                error,
                calls: AtomicU32::new(0),
                models: std::sync::Mutex::new(Vec::new()),
            })
        }
    }

    impl TextGenerator for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn generate_text<'a>(
            &'a self,
            _prompt: &'a str,
            options: &'a GenerationOptions,
        ) -> BoxFuture<'a, Result<String>> {
            Box::pin(async move {
                self.models.lock().unwrap().push(options.model.clone());
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n < self.failures {
                    Err(LoomError::LlmRequest(self.error.to_string()))
                } else {
                    Ok(self.name.to_string())
                }
            })
        }
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[test]
    fn test_is_retryable() {
        assert!(is_retryable(&LoomError::LlmRequest("HTTP 429 Too Many Requests: slow down".into())));
        assert!(is_retryable(&LoomError::LlmRequest("HTTP 503 Service Unavailable: x".into())));
        assert!(is_retryable(&LoomError::LlmRequest("error sending request: connection reset".into())));
        assert!(!is_retryable(&LoomError::LlmRequest("HTTP 400 Bad Request: bad prompt".into())));
        assert!(!is_retryable(&LoomError::LlmParse("HTTP 500".into())));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = RetryConfig {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
        };
        let first = calculate_backoff(0, &config).as_millis();
        assert!((80..=120).contains(&first));
        let third = calculate_backoff(2, &config).as_millis();
        assert!((320..=480).contains(&third));
        let capped = calculate_backoff(20, &config).as_millis();
        assert!(capped <= 1200);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let primary = Scripted::new("primary", 2, "HTTP 503: overloaded");
        let client = RetryingText::new(primary.clone(), vec![], fast_retry(3));
        let out = client
            .generate_text("hi", &GenerationOptions::default())
            .await
            .unwrap();
        assert_eq!(out, "primary");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_goes_straight_to_fallback() {
        let primary = Scripted::new("primary", 10, "HTTP 401: bad key");
        let fallback = Scripted::new("fallback", 0, "");
        let client = RetryingText::new(primary.clone(), vec![fallback.clone() as Arc<dyn TextGenerator>], fast_retry(3));

        let options = GenerationOptions {
            model: Some("gpt-4o".into()),
            ..Default::default()
        };
        let out = client.generate_text("hi", &options).await.unwrap();
        assert_eq!(out, "fallback");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.models.lock().unwrap()[0], None);
    }

    #[tokio::test]
    async fn test_all_failing_returns_primary_error() {
        let primary = Scripted::new("primary", 10, "HTTP 500: boom");
        let fallback = Scripted::new("fallback", 10, "HTTP 400: nope");
        let client = RetryingText::new(primary.clone(), vec![fallback as Arc<dyn TextGenerator>], fast_retry(1));
        let err = client
            .generate_text("hi", &GenerationOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(primary.calls.load(Ordering::SeqCst), 2);
    }
}
