use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoomError {
    // Graph / recipe definition errors
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    // Input resolution errors
    #[error("Missing input for node {node_id}: slot '{slot}' has no value")]
    MissingInput { node_id: String, slot: String },

    #[error("Unresolved template placeholders in node {node_id}: {}", .placeholders.join(", "))]
    TemplateResolution {
        node_id: String,
        placeholders: Vec<String>,
    },

    // Node execution errors
    #[error("Node {node_id} failed: {message}")]
    NodeExecution { node_id: String, message: String },

    #[error("Node {node_id} timed out after {timeout_secs}s")]
    NodeTimeout { node_id: String, timeout_secs: u64 },

    #[error("No {0} capability configured")]
    CapabilityUnavailable(String),

    // Provider errors
    #[error("Provider request failed: {0}")]
    LlmRequest(String),

    #[error("Provider response parse error: {0}")]
    LlmParse(String),

    #[error("Provider not supported: {0}")]
    UnsupportedProvider(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Persistence failed after {attempts} attempts: {message}")]
    Persistence { attempts: u32, message: String },

    // Lookup errors
    #[error("Recipe not found: {0}")]
    RecipeNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Node {node_id} not found in recipe {recipe_id}")]
    NodeNotFound { recipe_id: String, node_id: String },

    // Request / state errors
    #[error("Recipe is inactive: {0}")]
    RecipeInactive(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Category of a recorded execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    MissingInput,
    Template,
    NodeExecution,
    Infrastructure,
    Cancelled,
}

impl LoomError {
    /// How this error is tagged when recorded against an execution.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::InvalidGraph(_)
            | Self::RecipeNotFound(_)
            | Self::NodeNotFound { .. }
            | Self::RecipeInactive(_)
            | Self::InvalidRequest(_) => FailureKind::Validation,
            Self::MissingInput { .. } => FailureKind::MissingInput,
            Self::TemplateResolution { .. } => FailureKind::Template,
            Self::Database(_) | Self::Persistence { .. } | Self::Io(_) => {
                FailureKind::Infrastructure
            }
            _ => FailureKind::NodeExecution,
        }
    }

    /// Whether a storage write that failed with this error is worth repeating.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, LoomError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kinds() {
        assert_eq!(
            LoomError::InvalidGraph("cycle".into()).failure_kind(),
            FailureKind::Validation
        );
        assert_eq!(
            LoomError::MissingInput {
                node_id: "b".into(),
                slot: "input".into()
            }
            .failure_kind(),
            FailureKind::MissingInput
        );
        assert_eq!(
            LoomError::Database("locked".into()).failure_kind(),
            FailureKind::Infrastructure
        );
        assert_eq!(
            LoomError::LlmRequest("HTTP 500".into()).failure_kind(),
            FailureKind::NodeExecution
        );
    }

    #[test]
    fn test_template_error_lists_placeholders() {
        let err = LoomError::TemplateResolution {
            node_id: "gen".into(),
            placeholders: vec!["topic".into(), "tone".into()],
        };
        assert_eq!(
            err.to_string(),
            "Unresolved template placeholders in node gen: topic, tone"
        );
    }
}
