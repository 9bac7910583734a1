use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use storyloom_core::error::{LoomError, Result};
use storyloom_core::types::{Node, OutputMap, Recipe, DEFAULT_OUTPUT};

use crate::graph::{ancestors, resolve_node_input, topological_order, NodeOutcome};
use crate::orchestrator::RecipeOrchestrator;

/// Run one node of a recipe in isolation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestNodeRequest {
    pub node_id: String,
    #[serde(default)]
    pub external_input: Value,
    /// Run the node's ancestors for real instead of using `mock_outputs`.
    #[serde(default)]
    pub execute_dependencies: bool,
    /// Stand-in outputs keyed by upstream node id. Non-object values are
    /// treated as that node's `output`.
    #[serde(default)]
    pub mock_outputs: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestNodeResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_output: Option<OutputMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Nodes that were run, in order. The target comes last.
    pub executed_nodes: Vec<String>,
}

impl TestNodeResult {
    fn failed(error: &LoomError, executed_nodes: Vec<String>) -> Self {
        Self {
            success: false,
            node_output: None,
            error: Some(error.to_string()),
            executed_nodes,
        }
    }
}

impl RecipeOrchestrator {
    /// Run `request.node_id` against real or mocked upstream outputs.
    ///
    /// Nothing is persisted and no events are published. Unknown recipes and
    /// nodes are errors; failures while running nodes are reported in the
    /// result.
    pub async fn test_single_node(&self, recipe_id: &str, request: TestNodeRequest) -> Result<TestNodeResult> {
        let recipe = self
            .inner
            .recipes
            .get_recipe(recipe_id)
            .await?
            .ok_or_else(|| LoomError::RecipeNotFound(recipe_id.to_string()))?;
        let target = recipe
            .node(&request.node_id)
            .ok_or_else(|| LoomError::NodeNotFound {
                recipe_id: recipe_id.to_string(),
                node_id: request.node_id.clone(),
            })?;
        let order = topological_order(&recipe.nodes, &recipe.edges)?;

        let mut outputs: HashMap<String, OutputMap> = HashMap::new();
        let mut executed = Vec::new();

        if request.execute_dependencies {
            let upstream = ancestors(&target.id, &recipe.edges);
            for id in order.iter().filter(|id| upstream.contains(*id)) {
                let Some(node) = recipe.node(id) else { continue };
                executed.push(id.clone());
                match self.run_isolated(&recipe, node, &outputs, &request.external_input).await {
                    Ok(outcome) => {
                        outputs.insert(id.clone(), outcome.outputs);
                    }
                    Err(e) => {
                        debug!(recipe_id, node_id = %id, error = %e, "Dependency failed during node test");
                        return Ok(TestNodeResult::failed(&e, executed));
                    }
                }
            }
        } else {
            for (id, value) in request.mock_outputs {
                outputs.insert(id, mock_output(value));
            }
        }

        executed.push(target.id.clone());
        let result = match self
            .run_isolated(&recipe, target, &outputs, &request.external_input)
            .await
        {
            Ok(outcome) => TestNodeResult {
                success: true,
                node_output: Some(outcome.outputs),
                error: None,
                executed_nodes: executed,
            },
            Err(e) => TestNodeResult::failed(&e, executed),
        };

        info!(
            recipe_id,
            node_id = %target.id,
            success = result.success,
            "Node test finished"
        );
        Ok(result)
    }

    async fn run_isolated(
        &self,
        recipe: &Recipe,
        node: &Node,
        outputs: &HashMap<String, OutputMap>,
        external: &Value,
    ) -> Result<NodeOutcome> {
        let input = resolve_node_input(node, &recipe.edges, outputs, external)?;
        self.inner
            .executor
            .execute(node, &input, &recipe.execution_config, &|_, _| {})
            .await
    }
}

fn mock_output(value: Value) -> OutputMap {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = OutputMap::new();
            map.insert(DEFAULT_OUTPUT.to_string(), other);
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mock_output_wraps_scalars() {
        assert_eq!(mock_output(json!("text"))["output"], json!("text"));
        let obj = mock_output(json!({"output": "x", "title": "T"}));
        assert_eq!(obj["title"], json!("T"));
    }

    #[test]
    fn test_request_defaults() {
        let req: TestNodeRequest = serde_json::from_value(json!({"nodeId": "b"})).unwrap();
        assert!(!req.execute_dependencies);
        assert!(req.mock_outputs.is_empty());
        assert_eq!(req.external_input, Value::Null);
    }
}
