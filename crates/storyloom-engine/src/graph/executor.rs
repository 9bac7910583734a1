use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use storyloom_core::error::{LoomError, Result};
use storyloom_core::traits::{ImageGenerator, MediaUploader, TextGenerator, VideoGenerator};
use storyloom_core::types::{
    ExecutionConfig, GeneratedImage, GenerationOptions, Node, NodeKind, NodeMetadata, OutputMap,
    DEFAULT_OUTPUT,
};

use super::resolve::ResolvedInput;
use super::transform::{apply_transform, combine};

/// Called once per incremental unit a node produces, in order.
pub type ProgressFn<'a> = &'a (dyn Fn(usize, &Value) + Send + Sync);

/// External capabilities available to nodes. A node whose kind needs a
/// capability that is absent fails with `CapabilityUnavailable`.
#[derive(Clone, Default)]
pub struct Capabilities {
    pub text: Option<Arc<dyn TextGenerator>>,
    pub image: Option<Arc<dyn ImageGenerator>>,
    pub video: Option<Arc<dyn VideoGenerator>>,
    pub uploader: Option<Arc<dyn MediaUploader>>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(mut self, text: Arc<dyn TextGenerator>) -> Self {
        self.text = Some(text);
        self
    }

    pub fn with_image(mut self, image: Arc<dyn ImageGenerator>) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_video(mut self, video: Arc<dyn VideoGenerator>) -> Self {
        self.video = Some(video);
        self
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn MediaUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }
}

/// What a node produced.
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub outputs: OutputMap,
    pub metadata: NodeMetadata,
}

/// Runs one node against its resolved input.
///
/// The executor never touches the execution store; recording the outcome is
/// the caller's job. This keeps a single node runnable on its own, which the
/// test-node path relies on.
pub struct NodeExecutor {
    capabilities: Capabilities,
    default_timeout: Duration,
}

impl NodeExecutor {
    pub fn new(capabilities: Capabilities, default_timeout: Duration) -> Self {
        Self {
            capabilities,
            default_timeout,
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub async fn execute(
        &self,
        node: &Node,
        input: &ResolvedInput,
        config: &ExecutionConfig,
        progress: ProgressFn<'_>,
    ) -> Result<NodeOutcome> {
        let start = Instant::now();
        let timeout = config
            .node_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        debug!(node_id = %node.id, kind = node.kind.name(), "Executing node");

        let mut items = None;
        let (value, model) = match &node.kind {
            NodeKind::TextGeneration {
                model,
                temperature,
                max_tokens,
                structured_output,
                ..
            } => {
                let text = self
                    .capabilities
                    .text
                    .as_ref()
                    .ok_or_else(|| LoomError::CapabilityUnavailable("text generation".into()))?;
                let options = GenerationOptions {
                    model: model.clone().or_else(|| config.default_text_model.clone()),
                    temperature: *temperature,
                    max_tokens: *max_tokens,
                    json_output: *structured_output,
                    ..Default::default()
                };
                let prompt = prompt_of(node, input)?;
                let reply = call(&node.id, timeout, text.generate_text(prompt, &options)).await?;

                let value = if *structured_output {
                    parse_structured(&node.id, &reply)?
                } else {
                    Value::String(reply)
                };
                if let Value::Array(list) = &value {
                    for (index, item) in list.iter().enumerate() {
                        progress(index, item);
                    }
                    items = Some(list.len());
                }
                (value, options.model)
            }
            NodeKind::ImageGeneration {
                model,
                aspect_ratio,
                ..
            } => {
                let image = self
                    .capabilities
                    .image
                    .as_ref()
                    .ok_or_else(|| LoomError::CapabilityUnavailable("image generation".into()))?;
                let options = GenerationOptions {
                    model: model.clone().or_else(|| config.default_image_model.clone()),
                    aspect_ratio: aspect_ratio.clone(),
                    ..Default::default()
                };
                let prompt = prompt_of(node, input)?;
                let generated = call(&node.id, timeout, image.generate_image(prompt, &options)).await?;
                let url = self.store_image(&node.id, timeout, generated).await?;
                (Value::String(url), options.model)
            }
            NodeKind::VideoGeneration {
                model,
                duration_secs,
                aspect_ratio,
                ..
            } => {
                let video = self
                    .capabilities
                    .video
                    .as_ref()
                    .ok_or_else(|| LoomError::CapabilityUnavailable("video generation".into()))?;
                let options = GenerationOptions {
                    model: model.clone().or_else(|| config.default_video_model.clone()),
                    duration_secs: *duration_secs,
                    aspect_ratio: aspect_ratio.clone(),
                    ..Default::default()
                };
                let prompt = prompt_of(node, input)?;
                let url = call(&node.id, timeout, video.generate_video(prompt, &options)).await?;
                (Value::String(url), options.model)
            }
            NodeKind::DataTransform { transform } => {
                (apply_transform(&node.id, transform, input)?, None)
            }
            NodeKind::Combine { mode, separator } => {
                (combine(*mode, separator.as_deref(), input), None)
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        debug!(node_id = %node.id, elapsed_ms, "Node produced output");

        Ok(NodeOutcome {
            outputs: build_outputs(&node.outputs, value),
            metadata: NodeMetadata {
                kind: node.kind.name().to_string(),
                model,
                elapsed_ms,
                items,
            },
        })
    }

    /// Turn a generated image into a reference. Raw bytes go through the
    /// uploader when one is configured, otherwise they are inlined as a
    /// `data:` URI.
    async fn store_image(
        &self,
        node_id: &str,
        timeout: Duration,
        image: GeneratedImage,
    ) -> Result<String> {
        match image {
            GeneratedImage::Url(url) => Ok(url),
            GeneratedImage::Bytes { data, mime_type } => match &self.capabilities.uploader {
                Some(uploader) => {
                    let name_hint = format!("{}.{}", node_id, extension_for(&mime_type));
                    call(
                        node_id,
                        timeout,
                        uploader.upload(&data, &mime_type, &name_hint),
                    )
                    .await
                }
                None => Ok(format!(
                    "data:{};base64,{}",
                    mime_type,
                    base64::engine::general_purpose::STANDARD.encode(&data)
                )),
            },
        }
    }
}

/// Await a capability call under the node timeout. Provider errors become
/// `NodeExecution` failures of this node.
async fn call<T>(node_id: &str, timeout: Duration, fut: BoxFuture<'_, Result<T>>) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e @ LoomError::CapabilityUnavailable(_))) => Err(e),
        Ok(Err(e)) => Err(LoomError::NodeExecution {
            node_id: node_id.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Err(LoomError::NodeTimeout {
            node_id: node_id.to_string(),
            timeout_secs: timeout.as_secs(),
        }),
    }
}

fn prompt_of<'a>(node: &Node, input: &'a ResolvedInput) -> Result<&'a str> {
    input.prompt.as_deref().ok_or_else(|| LoomError::NodeExecution {
        node_id: node.id.clone(),
        message: "prompt was not rendered".into(),
    })
}

/// Parse a JSON reply, tolerating a surrounding Markdown code fence.
fn parse_structured(node_id: &str, reply: &str) -> Result<Value> {
    serde_json::from_str(strip_code_fence(reply)).map_err(|e| LoomError::NodeExecution {
        node_id: node_id.to_string(),
        message: format!("structured output is not valid JSON: {}", e),
    })
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    match trimmed.strip_prefix("```") {
        Some(rest) => {
            // Drop the language tag line.
            let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
            body.trim_end().strip_suffix("```").unwrap_or(body).trim()
        }
        None => trimmed,
    }
}

/// `output` always carries the full value. Other declared outputs are read
/// from an object value by key, or get the full value when it is not an object.
fn build_outputs(declared: &[String], value: Value) -> OutputMap {
    let mut outputs = OutputMap::new();
    for name in declared.iter().filter(|n| n.as_str() != DEFAULT_OUTPUT) {
        let extracted = match &value {
            Value::Object(map) => map.get(name).cloned(),
            other => Some(other.clone()),
        };
        if let Some(v) = extracted {
            outputs.insert(name.clone(), v);
        }
    }
    outputs.insert(DEFAULT_OUTPUT.to_string(), value);
    outputs
}

fn extension_for(mime_type: &str) -> &str {
    match mime_type {
        "image/jpeg" => "jpg",
        other => other.rsplit('/').next().unwrap_or("bin"),
    }
}
