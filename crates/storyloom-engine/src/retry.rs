use std::collections::BTreeMap;

use tracing::info;

use storyloom_core::error::{LoomError, Result};
use storyloom_core::types::{Execution, ExecutionStatus, NodeRun, Recipe, RetryMode};

use crate::graph::topological_order;
use crate::orchestrator::{ExecutionHandle, RecipeOrchestrator};

impl RecipeOrchestrator {
    /// Start a new execution for a failed one, with the same recipe, input
    /// and metadata. The new execution records `retry_of`.
    ///
    /// `RetryMode::Resume` reuses the outputs of nodes that completed before
    /// the failure and records `resumed_from_node_id`. It only applies when
    /// the recipe version is unchanged since the failed run; otherwise the
    /// retry runs every node again.
    pub async fn retry_execution(&self, execution_id: &str, mode: RetryMode) -> Result<ExecutionHandle> {
        let failed = self.get_execution(execution_id).await?;
        if failed.status != ExecutionStatus::Failed {
            return Err(LoomError::InvalidState(format!(
                "only failed executions can be retried, {} is {}",
                execution_id, failed.status
            )));
        }

        let recipe = self.load_runnable(&failed.recipe_id).await?;
        let order = topological_order(&recipe.nodes, &recipe.edges)?;
        let mut execution = Execution::new(&recipe, failed.input.clone(), failed.meta.clone(), order);
        execution.retry_of = Some(failed.id.clone());

        if mode == RetryMode::Resume {
            match reusable_runs(&recipe, &failed) {
                Some((resume_from, runs)) => {
                    info!(
                        execution_id = %failed.id,
                        resume_from = %resume_from,
                        reused = runs.len(),
                        "Resuming failed execution"
                    );
                    execution.execution_context = runs;
                    execution.resumed_from_node_id = Some(resume_from);
                }
                None => {
                    info!(
                        execution_id = %failed.id,
                        "Cannot resume, falling back to a full re-run"
                    );
                }
            }
        }

        self.launch(recipe, execution).await
    }
}

/// Completed runs preceding the failed node, marked as copied from `failed`.
///
/// `None` when the recipe changed since the failed run or the failure is not
/// tied to a node of the current definition.
fn reusable_runs(recipe: &Recipe, failed: &Execution) -> Option<(String, BTreeMap<String, NodeRun>)> {
    if recipe.version != failed.recipe_version {
        return None;
    }
    let failed_node = failed.failed_node_id()?;
    recipe.node(failed_node)?;
    let position = failed.node_order.iter().position(|id| id == failed_node)?;

    let runs = failed.node_order[..position]
        .iter()
        .filter_map(|id| {
            let output = failed.node_output(id)?.clone();
            let mut run = failed.execution_context.get(id)?.clone();
            run.output = Some(output);
            run.reused_from = Some(failed.id.clone());
            Some((id.clone(), run))
        })
        .collect();

    Some((failed_node.to_string(), runs))
}
