use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{FailureKind, LoomError, Result};

/// Pseudo-node id for edges that read from the execution's external input.
pub const EXTERNAL_INPUT: &str = "$input";
/// Output name used when a node declares none.
pub const DEFAULT_OUTPUT: &str = "output";
/// Input slot name used when an edge names none.
pub const DEFAULT_INPUT: &str = "input";

/// Named outputs produced by a node.
pub type OutputMap = Map<String, Value>;

fn default_true() -> bool {
    true
}

fn default_version() -> u32 {
    1
}

fn default_outputs() -> Vec<String> {
    vec![DEFAULT_OUTPUT.to_string()]
}

fn default_output_name() -> String {
    DEFAULT_OUTPUT.to_string()
}

fn default_input_name() -> String {
    DEFAULT_INPUT.to_string()
}

// ── Recipe definition ────────────────────────────────────────────

/// A named, versioned workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub stage_type: Option<String>,
    #[serde(default = "default_version")]
    pub version: u32,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub execution_config: ExecutionConfig,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Recipe {
    /// Create an active recipe with a fresh id.
    pub fn new(name: impl Into<String>, nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            stage_type: None,
            version: 1,
            nodes,
            edges,
            execution_config: ExecutionConfig::default(),
            metadata: Value::Null,
            is_active: true,
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_stage(mut self, stage_type: impl Into<String>) -> Self {
        self.stage_type = Some(stage_type.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Free-form execution settings consumed by the node executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_text_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_image_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_video_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inter_node_delay_ms: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single step in a recipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique identifier within the recipe.
    pub id: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// What the node does, with its typed configuration.
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Declared input slots.
    #[serde(default)]
    pub inputs: Vec<InputSlot>,
    /// Declared output names.
    #[serde(default = "default_outputs")]
    pub outputs: Vec<String>,
    /// Whether this node's outputs belong in the execution result.
    #[serde(default, rename = "final")]
    pub is_final: bool,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            inputs: vec![],
            outputs: default_outputs(),
            is_final: false,
        }
    }

    /// Text generation node with the given prompt template.
    pub fn text(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeKind::TextGeneration {
                prompt: prompt.into(),
                model: None,
                temperature: None,
                max_tokens: None,
                structured_output: false,
            },
        )
    }

    /// Image generation node with the given prompt template.
    pub fn image(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeKind::ImageGeneration {
                prompt: prompt.into(),
                model: None,
                aspect_ratio: None,
            },
        )
    }

    /// Video generation node with the given prompt template.
    pub fn video(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeKind::VideoGeneration {
                prompt: prompt.into(),
                model: None,
                duration_secs: None,
                aspect_ratio: None,
            },
        )
    }

    pub fn transform(id: impl Into<String>, transform: Transform) -> Self {
        Self::new(id, NodeKind::DataTransform { transform })
    }

    pub fn combine(id: impl Into<String>, mode: CombineMode) -> Self {
        Self::new(
            id,
            NodeKind::Combine {
                mode,
                separator: None,
            },
        )
    }

    pub fn with_inputs(mut self, slots: Vec<InputSlot>) -> Self {
        self.inputs = slots;
        self
    }

    pub fn with_outputs(mut self, names: Vec<String>) -> Self {
        self.outputs = names;
        self
    }

    pub fn as_final(mut self) -> Self {
        self.is_final = true;
        self
    }

    /// Request JSON output from a text node. No-op for other kinds.
    pub fn structured(mut self) -> Self {
        if let NodeKind::TextGeneration {
            structured_output, ..
        } = &mut self.kind
        {
            *structured_output = true;
        }
        self
    }
}

/// The fixed set of node kinds, each carrying its own configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum NodeKind {
    TextGeneration {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temperature: Option<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_tokens: Option<u32>,
        #[serde(default)]
        structured_output: bool,
    },
    ImageGeneration {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        aspect_ratio: Option<String>,
    },
    VideoGeneration {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_secs: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        aspect_ratio: Option<String>,
    },
    DataTransform {
        transform: Transform,
    },
    #[serde(alias = "aggregate")]
    Combine {
        #[serde(default)]
        mode: CombineMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        separator: Option<String>,
    },
}

impl NodeKind {
    /// Wire name of this kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TextGeneration { .. } => "text_generation",
            Self::ImageGeneration { .. } => "image_generation",
            Self::VideoGeneration { .. } => "video_generation",
            Self::DataTransform { .. } => "data_transform",
            Self::Combine { .. } => "combine",
        }
    }

    /// The prompt template, for kinds that call a generation capability.
    pub fn prompt(&self) -> Option<&str> {
        match self {
            Self::TextGeneration { prompt, .. }
            | Self::ImageGeneration { prompt, .. }
            | Self::VideoGeneration { prompt, .. } => Some(prompt),
            Self::DataTransform { .. } | Self::Combine { .. } => None,
        }
    }
}

/// A pure data transformation with no external call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Transform {
    /// Shallow-merge object inputs, later slots win.
    Merge,
    /// Concatenate array inputs; scalars are appended as single items.
    Concat,
    /// Select a dotted path from the single input.
    Pick { path: String },
    /// Render a `{placeholder}` template against the inputs.
    Format { template: String },
}

/// How a combine node aggregates its inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineMode {
    /// Object keyed by slot name.
    #[default]
    Object,
    /// Array in slot order.
    Array,
    /// Text values joined with the separator.
    Text,
}

/// A declared input slot on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "InputSlotRepr")]
pub struct InputSlot {
    pub name: String,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum InputSlotRepr {
    Name(String),
    Full {
        name: String,
        #[serde(default = "default_true")]
        required: bool,
        #[serde(default)]
        default: Option<Value>,
    },
}

impl From<InputSlotRepr> for InputSlot {
    fn from(repr: InputSlotRepr) -> Self {
        match repr {
            InputSlotRepr::Name(name) => InputSlot::required(name),
            InputSlotRepr::Full {
                name,
                required,
                default,
            } => InputSlot {
                name,
                required,
                default,
            },
        }
    }
}

impl InputSlot {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            default: None,
        }
    }

    pub fn with_default(name: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            required: true,
            default: Some(default),
        }
    }
}

/// Directed data dependency from an upstream output to a downstream input slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    /// Source node id, or [`EXTERNAL_INPUT`].
    pub from: String,
    /// Output name on the source (field name when reading external input).
    #[serde(default = "default_output_name")]
    pub from_output: String,
    /// Target node id.
    pub to: String,
    /// Input slot on the target.
    #[serde(default = "default_input_name")]
    pub to_input: String,
}

impl Edge {
    /// `from.output -> to.input`
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            from_output: default_output_name(),
            to: to.into(),
            to_input: default_input_name(),
        }
    }

    /// Fully wired edge between named output and input.
    pub fn wired(
        from: impl Into<String>,
        from_output: impl Into<String>,
        to: impl Into<String>,
        to_input: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            from_output: from_output.into(),
            to: to.into(),
            to_input: to_input.into(),
        }
    }

    /// Edge from a field of the external input.
    pub fn external(
        field: impl Into<String>,
        to: impl Into<String>,
        to_input: impl Into<String>,
    ) -> Self {
        Self::wired(EXTERNAL_INPUT, field, to, to_input)
    }

    pub fn is_external(&self) -> bool {
        self.from == EXTERNAL_INPUT
    }
}

/// Filters for listing recipes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeFilter {
    #[serde(default)]
    pub stage_type: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub include_inactive: bool,
}

impl RecipeFilter {
    /// Whether a recipe passes this filter.
    pub fn matches(&self, recipe: &Recipe) -> bool {
        if !self.include_inactive && !recipe.is_active {
            return false;
        }
        if let Some(stage) = &self.stage_type {
            if recipe.stage_type.as_deref() != Some(stage.as_str()) {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            if !recipe.name.to_lowercase().contains(&needle)
                && !recipe.description.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        true
    }
}

// ── Execution records ────────────────────────────────────────────

/// Lifecycle of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Allowed transitions: pending -> running -> {completed, failed, cancelled}.
    /// Pending executions may also fail or be cancelled before the walk starts.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied correlation metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMeta {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub stage_id: Option<String>,
}

/// Failure recorded against an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    #[serde(default)]
    pub node_id: Option<String>,
    pub message: String,
    pub kind: FailureKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRunStatus {
    Running,
    Completed,
    Failed,
}

/// Metadata reported by the node executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetadata {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<usize>,
}

/// Per-node entry in an execution's context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRun {
    pub status: NodeRunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<NodeMetadata>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Execution the output was copied from when resuming.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reused_from: Option<String>,
}

impl NodeRun {
    /// A completed run built from known outputs.
    pub fn completed(output: OutputMap) -> Self {
        let now = Utc::now();
        Self {
            status: NodeRunStatus::Completed,
            output: Some(output),
            error: None,
            error_kind: None,
            metadata: None,
            started_at: now,
            completed_at: Some(now),
            reused_from: None,
        }
    }
}

/// One run of a recipe against a concrete input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub recipe_id: String,
    #[serde(default = "default_version")]
    pub recipe_version: u32,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub execution_context: BTreeMap<String, NodeRun>,
    #[serde(default)]
    pub result: Option<OutputMap>,
    #[serde(flatten)]
    pub meta: ExecutionMeta,
    /// Topological order fixed when the execution was created.
    #[serde(default)]
    pub node_order: Vec<String>,
    #[serde(default)]
    pub current_node_id: Option<String>,
    #[serde(default)]
    pub error: Option<ExecutionError>,
    #[serde(default)]
    pub retry_of: Option<String>,
    #[serde(default)]
    pub resumed_from_node_id: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    /// A fresh `pending` execution of `recipe`.
    pub fn new(recipe: &Recipe, input: Value, meta: ExecutionMeta, node_order: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            recipe_id: recipe.id.clone(),
            recipe_version: recipe.version,
            status: ExecutionStatus::Pending,
            input,
            execution_context: BTreeMap::new(),
            result: None,
            meta,
            node_order,
            current_node_id: None,
            error: None,
            retry_of: None,
            resumed_from_node_id: None,
            cancel_requested: false,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Move to `next`, stamping timestamps. Rejects transitions the lifecycle forbids.
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(LoomError::InvalidState(format!(
                "execution {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        match next {
            ExecutionStatus::Running => self.started_at = Some(now),
            s if s.is_terminal() => {
                self.completed_at = Some(now);
                self.current_node_id = None;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn record_node_started(&mut self, node_id: &str) {
        let now = Utc::now();
        self.current_node_id = Some(node_id.to_string());
        self.updated_at = now;
        self.execution_context.insert(
            node_id.to_string(),
            NodeRun {
                status: NodeRunStatus::Running,
                output: None,
                error: None,
                error_kind: None,
                metadata: None,
                started_at: now,
                completed_at: None,
                reused_from: None,
            },
        );
    }

    pub fn record_node_completed(&mut self, node_id: &str, output: OutputMap, metadata: NodeMetadata) {
        let now = Utc::now();
        self.updated_at = now;
        let run = self
            .execution_context
            .entry(node_id.to_string())
            .or_insert_with(|| NodeRun::completed(OutputMap::new()));
        run.status = NodeRunStatus::Completed;
        run.output = Some(output);
        run.metadata = Some(metadata);
        run.completed_at = Some(now);
    }

    pub fn record_node_failed(&mut self, node_id: &str, error: &LoomError) {
        let now = Utc::now();
        self.updated_at = now;
        let run = self
            .execution_context
            .entry(node_id.to_string())
            .or_insert_with(|| NodeRun::completed(OutputMap::new()));
        run.status = NodeRunStatus::Failed;
        run.output = None;
        run.error = Some(error.to_string());
        run.error_kind = Some(error.failure_kind());
        run.completed_at = Some(now);
    }

    /// Outputs of a node that completed in this execution.
    pub fn node_output(&self, node_id: &str) -> Option<&OutputMap> {
        self.execution_context
            .get(node_id)
            .filter(|run| run.status == NodeRunStatus::Completed)
            .and_then(|run| run.output.as_ref())
    }

    /// The node whose failure ended this execution, if any.
    pub fn failed_node_id(&self) -> Option<&str> {
        self.error.as_ref().and_then(|e| e.node_id.as_deref())
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let start = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some((end - start).num_milliseconds().max(0) as u64)
    }

    /// Derived, read-only progress view.
    pub fn summary(&self) -> ExecutionSummary {
        let completed_node_count = self
            .execution_context
            .values()
            .filter(|r| r.status == NodeRunStatus::Completed)
            .count();
        ExecutionSummary {
            id: self.id.clone(),
            recipe_id: self.recipe_id.clone(),
            status: self.status,
            duration_ms: self.duration_ms(),
            node_count: self.node_order.len(),
            completed_node_count,
            failed_node_id: self.failed_node_id().map(str::to_string),
            current_node_id: self.current_node_id.clone(),
            error: self.error.as_ref().map(|e| e.message.clone()),
            retry_of: self.retry_of.clone(),
            resumed_from_node_id: self.resumed_from_node_id.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Read-only summary of an execution's progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub id: String,
    pub recipe_id: String,
    pub status: ExecutionStatus,
    pub duration_ms: Option<u64>,
    pub node_count: usize,
    pub completed_node_count: usize,
    pub failed_node_id: Option<String>,
    pub current_node_id: Option<String>,
    pub error: Option<String>,
    pub retry_of: Option<String>,
    pub resumed_from_node_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// How a failed execution is retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryMode {
    /// Re-run every node from scratch.
    #[default]
    Full,
    /// Reuse outputs of nodes that completed before the failure.
    Resume,
}

// ── Capability payloads ──────────────────────────────────────────

/// Per-call options passed to a generation capability.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOptions {
    /// Model override; the capability's configured model when `None`.
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Ask the provider for a JSON response.
    pub json_output: bool,
    pub aspect_ratio: Option<String>,
    pub duration_secs: Option<u32>,
}

/// Image returned by an image capability.
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratedImage {
    Url(String),
    Bytes { data: Vec<u8>, mime_type: String },
}

// ── Events ───────────────────────────────────────────────────────

/// Progress event broadcast while an execution runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ExecutionEvent {
    StatusChanged {
        execution_id: String,
        status: ExecutionStatus,
    },
    NodeStarted {
        execution_id: String,
        node_id: String,
    },
    NodeCompleted {
        execution_id: String,
        node_id: String,
        elapsed_ms: u64,
    },
    NodeFailed {
        execution_id: String,
        node_id: String,
        error: String,
    },
    /// One incremental unit emitted by a node (e.g. an item of a list).
    NodeProgress {
        execution_id: String,
        node_id: String,
        index: usize,
        item: Value,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            Self::StatusChanged { execution_id, .. }
            | Self::NodeStarted { execution_id, .. }
            | Self::NodeCompleted { execution_id, .. }
            | Self::NodeFailed { execution_id, .. }
            | Self::NodeProgress { execution_id, .. } => execution_id,
        }
    }

    /// Whether this is the last event an execution will publish.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::StatusChanged { status, .. } if status.is_terminal())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "status_changed",
            Self::NodeStarted { .. } => "node_started",
            Self::NodeCompleted { .. } => "node_completed",
            Self::NodeFailed { .. } => "node_failed",
            Self::NodeProgress { .. } => "node_progress",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_kind_parses_from_tagged_json() {
        let node: Node = serde_json::from_value(json!({
            "id": "gen_text",
            "type": "text_generation",
            "prompt": "Describe {topic}",
            "structuredOutput": true,
            "inputs": ["topic", {"name": "tone", "required": false}],
            "final": true
        }))
        .unwrap();

        assert_eq!(node.id, "gen_text");
        assert!(node.is_final);
        assert_eq!(node.outputs, vec!["output"]);
        assert_eq!(node.inputs.len(), 2);
        assert!(node.inputs[0].required);
        assert!(!node.inputs[1].required);
        match node.kind {
            NodeKind::TextGeneration {
                prompt,
                structured_output,
                ..
            } => {
                assert_eq!(prompt, "Describe {topic}");
                assert!(structured_output);
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_aggregate_alias_and_transform() {
        let node: Node = serde_json::from_value(json!({
            "id": "all",
            "type": "aggregate",
            "mode": "array"
        }))
        .unwrap();
        assert!(matches!(
            node.kind,
            NodeKind::Combine {
                mode: CombineMode::Array,
                ..
            }
        ));

        let node: Node = serde_json::from_value(json!({
            "id": "lead",
            "type": "data_transform",
            "transform": {"op": "pick", "path": "0.name"}
        }))
        .unwrap();
        assert!(matches!(
            node.kind,
            NodeKind::DataTransform {
                transform: Transform::Pick { .. }
            }
        ));
    }

    #[test]
    fn test_unknown_node_type_rejected() {
        let parsed = serde_json::from_value::<Node>(json!({
            "id": "x",
            "type": "teleport",
            "prompt": "?"
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_edge_defaults() {
        let edge: Edge = serde_json::from_value(json!({"from": "a", "to": "b"})).unwrap();
        assert_eq!(edge, Edge::new("a", "b"));
        assert_eq!(edge.from_output, "output");
        assert_eq!(edge.to_input, "input");
        assert!(Edge::external("topic", "a", "topic").is_external());
    }

    #[test]
    fn test_status_transitions() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn test_execution_lifecycle_and_summary() {
        let recipe = Recipe::new(
            "chain",
            vec![Node::text("a", "one"), Node::text("b", "two")],
            vec![Edge::new("a", "b")],
        );
        let mut exec = Execution::new(
            &recipe,
            json!({}),
            ExecutionMeta::default(),
            vec!["a".into(), "b".into()],
        );
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert!(exec.transition(ExecutionStatus::Completed).is_err());

        exec.transition(ExecutionStatus::Running).unwrap();
        exec.record_node_started("a");
        let mut out = OutputMap::new();
        out.insert("output".into(), json!("hello"));
        exec.record_node_completed("a", out, NodeMetadata::default());
        exec.record_node_started("b");

        let summary = exec.summary();
        assert_eq!(summary.node_count, 2);
        assert_eq!(summary.completed_node_count, 1);
        assert_eq!(summary.current_node_id.as_deref(), Some("b"));
        assert_eq!(exec.node_output("a").unwrap()["output"], json!("hello"));
        assert!(exec.node_output("b").is_none());

        exec.record_node_failed(
            "b",
            &LoomError::NodeExecution {
                node_id: "b".into(),
                message: "boom".into(),
            },
        );
        exec.transition(ExecutionStatus::Failed).unwrap();
        assert!(exec.completed_at.is_some());
        assert!(exec.current_node_id.is_none());
        assert_eq!(
            exec.execution_context["b"].error_kind,
            Some(FailureKind::NodeExecution)
        );
    }

    #[test]
    fn test_execution_roundtrips_with_flattened_meta() {
        let recipe = Recipe::new("r", vec![Node::text("a", "x")], vec![]);
        let meta = ExecutionMeta {
            user_id: Some("u1".into()),
            project_id: Some("p1".into()),
            stage_id: None,
        };
        let exec = Execution::new(&recipe, json!({"topic": "t"}), meta, vec!["a".into()]);
        let value = serde_json::to_value(&exec).unwrap();
        assert_eq!(value["userId"], json!("u1"));
        assert_eq!(value["status"], json!("pending"));

        let back: Execution = serde_json::from_value(value).unwrap();
        assert_eq!(back.meta.project_id.as_deref(), Some("p1"));
        assert_eq!(back.recipe_id, recipe.id);
    }

    #[test]
    fn test_recipe_filter() {
        let mut recipe = Recipe::new("Persona Builder", vec![Node::text("a", "x")], vec![])
            .with_stage("persona_generation");
        let filter = RecipeFilter {
            stage_type: Some("persona_generation".into()),
            search: Some("persona".into()),
            include_inactive: false,
        };
        assert!(filter.matches(&recipe));

        recipe.is_active = false;
        assert!(!filter.matches(&recipe));

        let other_stage = RecipeFilter {
            stage_type: Some("storyboard".into()),
            ..Default::default()
        };
        recipe.is_active = true;
        assert!(!other_stage.matches(&recipe));
    }

    #[test]
    fn test_terminal_event() {
        let ev = ExecutionEvent::StatusChanged {
            execution_id: "e1".into(),
            status: ExecutionStatus::Completed,
        };
        assert!(ev.is_terminal());
        assert_eq!(ev.execution_id(), "e1");
        let ev = ExecutionEvent::NodeStarted {
            execution_id: "e1".into(),
            node_id: "a".into(),
        };
        assert!(!ev.is_terminal());
    }
}
