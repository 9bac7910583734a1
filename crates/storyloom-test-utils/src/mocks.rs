use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;
use tokio::sync::Notify;

use storyloom_core::error::{LoomError, Result};
use storyloom_core::traits::{ImageGenerator, MediaUploader, TextGenerator, VideoGenerator};
use storyloom_core::types::{GeneratedImage, GenerationOptions};

enum Reply {
    Text(String),
    Fail(String),
}

/// Scripted text capability.
///
/// The first rule whose needle appears in the prompt decides the reply.
/// Prompts matching no rule are echoed back as `generated: <prompt>`.
#[derive(Default)]
pub struct MockText {
    rules: Vec<(String, Reply)>,
    calls: Mutex<Vec<(String, GenerationOptions)>>,
}

impl MockText {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `text` to prompts containing `needle`.
    pub fn reply_to(mut self, needle: impl Into<String>, text: impl Into<String>) -> Self {
        self.rules.push((needle.into(), Reply::Text(text.into())));
        self
    }

    /// Fail prompts containing `needle` with a provider error.
    pub fn fail_on(mut self, needle: impl Into<String>, message: impl Into<String>) -> Self {
        self.rules.push((needle.into(), Reply::Fail(message.into())));
        self
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
    }

    /// Options received so far, in call order.
    pub fn options(&self) -> Vec<GenerationOptions> {
        self.calls.lock().unwrap().iter().map(|(_, o)| o.clone()).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn respond(&self, prompt: &str, options: &GenerationOptions) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((prompt.to_string(), options.clone()));
        for (needle, reply) in &self.rules {
            if prompt.contains(needle.as_str()) {
                return match reply {
                    Reply::Text(text) => Ok(text.clone()),
                    Reply::Fail(message) => Err(LoomError::LlmRequest(message.clone())),
                };
            }
        }
        Ok(format!("generated: {}", prompt))
    }
}

impl TextGenerator for MockText {
    fn name(&self) -> &str {
        "mock-text"
    }

    fn generate_text<'a>(
        &'a self,
        prompt: &'a str,
        options: &'a GenerationOptions,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move { self.respond(prompt, options) })
    }
}

/// Text capability that parks the call whose prompt contains `needle`
/// until [`GatedText::release`] is called.
pub struct GatedText {
    needle: String,
    started: Notify,
    release: Notify,
    calls: Mutex<Vec<String>>,
}

impl GatedText {
    pub fn new(needle: impl Into<String>) -> Self {
        Self {
            needle: needle.into(),
            started: Notify::new(),
            release: Notify::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Resolves once the gated call has started.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    /// Let the gated call finish.
    pub fn release(&self) {
        self.release.notify_one();
    }

    pub fn prompts(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl TextGenerator for GatedText {
    fn name(&self) -> &str {
        "gated-text"
    }

    fn generate_text<'a>(
        &'a self,
        prompt: &'a str,
        _options: &'a GenerationOptions,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(prompt.to_string());
            if prompt.contains(self.needle.as_str()) {
                self.started.notify_one();
                self.release.notified().await;
            }
            Ok(format!("generated: {}", prompt))
        })
    }
}

/// Image capability returning numbered URLs, or raw bytes when configured.
#[derive(Default)]
pub struct MockImage {
    bytes: Option<(Vec<u8>, String)>,
    calls: Mutex<Vec<String>>,
}

impl MockImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return these bytes instead of a URL.
    pub fn with_bytes(mut self, data: Vec<u8>, mime_type: impl Into<String>) -> Self {
        self.bytes = Some((data, mime_type.into()));
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl ImageGenerator for MockImage {
    fn name(&self) -> &str {
        "mock-image"
    }

    fn generate_image<'a>(
        &'a self,
        prompt: &'a str,
        _options: &'a GenerationOptions,
    ) -> BoxFuture<'a, Result<GeneratedImage>> {
        Box::pin(async move {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(prompt.to_string());
                calls.len()
            };
            Ok(match &self.bytes {
                Some((data, mime_type)) => GeneratedImage::Bytes {
                    data: data.clone(),
                    mime_type: mime_type.clone(),
                },
                None => GeneratedImage::Url(format!("https://img.test/{}.png", n)),
            })
        })
    }
}

/// Video capability returning numbered URLs.
#[derive(Default)]
pub struct MockVideo {
    calls: Mutex<Vec<String>>,
}

impl MockVideo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl VideoGenerator for MockVideo {
    fn name(&self) -> &str {
        "mock-video"
    }

    fn generate_video<'a>(
        &'a self,
        prompt: &'a str,
        _options: &'a GenerationOptions,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(prompt.to_string());
                calls.len()
            };
            Ok(format!("https://video.test/{}.mp4", n))
        })
    }
}

/// Uploader that pretends to store media on a CDN.
#[derive(Default)]
pub struct MockUploader {
    uploads: AtomicUsize,
}

impl MockUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }
}

impl MediaUploader for MockUploader {
    fn upload<'a>(
        &'a self,
        _data: &'a [u8],
        _mime_type: &'a str,
        name_hint: &'a str,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(format!("https://cdn.test/{}", name_hint))
        })
    }
}
