use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use storyloom_core::config::{EngineConfig, RetryConfig};
use storyloom_core::error::{FailureKind, LoomError, Result};
use storyloom_core::event::EventBus;
use storyloom_core::traits::{ExecutionStore, RecipeStore};
use storyloom_core::types::{
    Execution, ExecutionError, ExecutionEvent, ExecutionMeta, ExecutionStatus, ExecutionSummary,
    Node, OutputMap, Recipe,
};

use crate::graph::{resolve_node_input, topological_order, Capabilities, NodeExecutor, NodeOutcome};
use crate::persist::persist_with_retry;
use crate::run_log::RunLogger;

/// Everything the orchestrator needs, supplied by the caller.
pub struct OrchestratorBuilder {
    pub recipes: Arc<dyn RecipeStore>,
    pub executions: Arc<dyn ExecutionStore>,
    pub capabilities: Capabilities,
    pub event_bus: Arc<EventBus>,
    /// Directory for per-execution JSONL logs. No run logs when `None`.
    pub log_dir: Option<PathBuf>,
}

impl OrchestratorBuilder {
    pub fn build(self, config: &EngineConfig) -> RecipeOrchestrator {
        RecipeOrchestrator {
            inner: Arc::new(Inner {
                recipes: self.recipes,
                executions: self.executions,
                executor: NodeExecutor::new(
                    self.capabilities,
                    Duration::from_secs(config.node_timeout_secs),
                ),
                event_bus: self.event_bus,
                inter_node_delay: Duration::from_millis(config.inter_node_delay_ms),
                history_limit: config.history_limit,
                persistence_retry: config.persistence_retry.clone(),
                log_dir: self.log_dir,
                running: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// Runs recipes as executions.
///
/// Each execution is walked by its own task, one node at a time in the
/// topological order fixed at creation. The persisted execution document is
/// written before every state change is announced, and that task is its only
/// writer while it runs. Cancellation is cooperative: it is observed between
/// nodes and never interrupts a node in flight.
#[derive(Clone)]
pub struct RecipeOrchestrator {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) recipes: Arc<dyn RecipeStore>,
    pub(crate) executions: Arc<dyn ExecutionStore>,
    pub(crate) executor: NodeExecutor,
    event_bus: Arc<EventBus>,
    inter_node_delay: Duration,
    history_limit: usize,
    persistence_retry: RetryConfig,
    log_dir: Option<PathBuf>,
    /// Executions walked by this process.
    running: Mutex<HashMap<String, RunControl>>,
}

/// Shared between an execution's walk and `cancel`.
#[derive(Clone)]
pub(crate) struct RunControl {
    token: CancellationToken,
    /// Held around every write of the execution document, so a cancel
    /// request and the walk never persist stale copies over each other.
    writes: Arc<Mutex<()>>,
}

impl RunControl {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            writes: Arc::new(Mutex::new(())),
        }
    }
}

/// A started execution.
pub struct ExecutionHandle {
    pub execution_id: String,
    join: JoinHandle<Result<Execution>>,
}

impl ExecutionHandle {
    /// Wait for the walk to finish and return the final execution.
    ///
    /// Node failures and cancellation are part of the returned execution;
    /// only infrastructure failures come back as `Err`.
    pub async fn wait(self) -> Result<Execution> {
        self.join
            .await
            .map_err(|e| LoomError::InvalidState(format!("execution task failed: {}", e)))?
    }
}

impl RecipeOrchestrator {
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.inner.event_bus
    }

    /// Create an execution of `recipe_id` and start walking it.
    pub async fn start(
        &self,
        recipe_id: &str,
        input: Value,
        meta: ExecutionMeta,
    ) -> Result<ExecutionHandle> {
        let recipe = self.load_runnable(recipe_id).await?;
        // Re-checked here in case the stored definition changed since it was validated.
        let order = topological_order(&recipe.nodes, &recipe.edges)?;
        let execution = Execution::new(&recipe, input, meta, order);
        self.launch(recipe, execution).await
    }

    /// Start an execution and return its id without waiting.
    pub async fn execute(&self, recipe_id: &str, input: Value, meta: ExecutionMeta) -> Result<String> {
        Ok(self.start(recipe_id, input, meta).await?.execution_id)
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<Execution> {
        self.inner
            .executions
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| LoomError::ExecutionNotFound(execution_id.to_string()))
    }

    pub async fn get_summary(&self, execution_id: &str) -> Result<ExecutionSummary> {
        Ok(self.get_execution(execution_id).await?.summary())
    }

    /// Past executions of a recipe, newest first.
    pub async fn history(&self, recipe_id: &str, limit: Option<usize>) -> Result<Vec<Execution>> {
        let limit = limit.unwrap_or(self.inner.history_limit);
        self.inner.executions.list_executions(recipe_id, limit).await
    }

    pub async fn is_running(&self, execution_id: &str) -> bool {
        self.inner.running.lock().await.contains_key(execution_id)
    }

    /// Request cancellation.
    ///
    /// For an execution walked by this process the request is persisted
    /// immediately and the walk stops at its next node boundary, including
    /// the one after its last node. A node already in flight still finishes.
    /// A pending or running execution nobody is walking (left over from a
    /// restart) is marked cancelled directly. Terminal executions are
    /// rejected with `InvalidState`.
    pub async fn cancel(&self, execution_id: &str) -> Result<Execution> {
        let control = self.inner.running.lock().await.get(execution_id).cloned();
        if let Some(control) = control {
            let _writes = control.writes.lock().await;
            let mut execution = self.get_execution(execution_id).await?;
            if execution.status.is_terminal() {
                return Err(LoomError::InvalidState(format!(
                    "execution {} is already {}",
                    execution_id, execution.status
                )));
            }

            control.token.cancel();
            execution.cancel_requested = true;
            execution.updated_at = Utc::now();
            persist_with_retry(
                self.inner.executions.as_ref(),
                &execution,
                &self.inner.persistence_retry,
            )
            .await?;
            info!(execution_id, "Cancellation requested");
            return Ok(execution);
        }

        let mut execution = self.get_execution(execution_id).await?;
        if execution.status.is_terminal() {
            return Err(LoomError::InvalidState(format!(
                "execution {} is already {}",
                execution_id, execution.status
            )));
        }

        warn!(execution_id, status = %execution.status, "Cancelling orphaned execution");
        execution.cancel_requested = true;
        execution.error = Some(cancelled_error());
        execution.transition(ExecutionStatus::Cancelled)?;
        persist_with_retry(
            self.inner.executions.as_ref(),
            &execution,
            &self.inner.persistence_retry,
        )
        .await?;
        self.inner.publish_status(&execution);
        Ok(execution)
    }

    pub(crate) async fn load_runnable(&self, recipe_id: &str) -> Result<Recipe> {
        let recipe = self
            .inner
            .recipes
            .get_recipe(recipe_id)
            .await?
            .ok_or_else(|| LoomError::RecipeNotFound(recipe_id.to_string()))?;
        if !recipe.is_active {
            return Err(LoomError::RecipeInactive(recipe_id.to_string()));
        }
        Ok(recipe)
    }

    /// Persist a new `pending` execution and spawn its walk.
    pub(crate) async fn launch(&self, recipe: Recipe, execution: Execution) -> Result<ExecutionHandle> {
        let execution_id = execution.id.clone();

        // Registered before the first write so a concurrent cancel never
        // mistakes this execution for an orphan.
        let control = RunControl::new();
        self.inner
            .running
            .lock()
            .await
            .insert(execution_id.clone(), control.clone());

        if let Err(e) = persist_with_retry(
            self.inner.executions.as_ref(),
            &execution,
            &self.inner.persistence_retry,
        )
        .await
        {
            self.inner.unregister(&execution_id).await;
            return Err(e);
        }

        info!(
            execution_id = %execution_id,
            recipe_id = %recipe.id,
            nodes = execution.node_order.len(),
            retry_of = execution.retry_of.as_deref().unwrap_or(""),
            "Execution created"
        );

        if let Some(dir) = &self.inner.log_dir {
            let rx = self.inner.event_bus.subscribe();
            tokio::spawn(RunLogger::new(dir.clone()).run(rx, execution_id.clone()));
        }

        let inner = self.inner.clone();
        let join = tokio::spawn(async move {
            let id = execution.id.clone();
            let result = inner.walk(recipe, execution, control).await;
            inner.unregister(&id).await;
            result
        });

        Ok(ExecutionHandle { execution_id, join })
    }
}

impl Inner {
    async fn unregister(&self, execution_id: &str) {
        self.running.lock().await.remove(execution_id);
    }

    fn publish_status(&self, execution: &Execution) {
        self.event_bus.publish(ExecutionEvent::StatusChanged {
            execution_id: execution.id.clone(),
            status: execution.status,
        });
    }

    async fn save(&self, execution: &mut Execution, control: &RunControl) -> Result<()> {
        let _writes = control.writes.lock().await;
        self.persist(execution, &control.token).await
    }

    /// Write without taking the write lock; the caller holds it.
    async fn persist(&self, execution: &mut Execution, token: &CancellationToken) -> Result<()> {
        execution.cancel_requested = execution.cancel_requested || token.is_cancelled();
        persist_with_retry(self.executions.as_ref(), execution, &self.persistence_retry).await
    }

    async fn walk(
        &self,
        recipe: Recipe,
        mut execution: Execution,
        control: RunControl,
    ) -> Result<Execution> {
        match self.drive(&recipe, &mut execution, &control).await {
            Ok(()) => Ok(execution),
            Err(e) => {
                error!(execution_id = %execution.id, error = %e, "Execution aborted");
                self.record_infrastructure_failure(&mut execution, &e).await;
                Err(e)
            }
        }
    }

    /// Walk every node. Node failures and cancellation end the walk with
    /// `Ok`; an `Err` means execution state could not be persisted.
    async fn drive(
        &self,
        recipe: &Recipe,
        execution: &mut Execution,
        control: &RunControl,
    ) -> Result<()> {
        let token = &control.token;
        execution.transition(ExecutionStatus::Running)?;
        self.save(execution, control).await?;
        self.publish_status(execution);
        info!(execution_id = %execution.id, recipe_id = %recipe.id, "Execution started");

        let delay = recipe
            .execution_config
            .inter_node_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(self.inter_node_delay);

        let order = execution.node_order.clone();
        let mut ran_any = false;
        for node_id in &order {
            if token.is_cancelled() {
                return self.finish_cancelled(execution, control).await;
            }
            if execution.node_output(node_id).is_some() {
                debug!(execution_id = %execution.id, node_id = %node_id, "Reusing output from earlier run");
                continue;
            }

            if ran_any && !delay.is_zero() {
                tokio::select! {
                    _ = token.cancelled() => {
                        return self.finish_cancelled(execution, control).await;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            ran_any = true;

            execution.record_node_started(node_id);
            self.save(execution, control).await?;
            self.event_bus.publish(ExecutionEvent::NodeStarted {
                execution_id: execution.id.clone(),
                node_id: node_id.clone(),
            });

            let result = match recipe.node(node_id) {
                Some(node) => self.run_node(recipe, node, execution).await,
                None => Err(LoomError::NodeNotFound {
                    recipe_id: recipe.id.clone(),
                    node_id: node_id.clone(),
                }),
            };

            match result {
                Ok(outcome) => {
                    let elapsed_ms = outcome.metadata.elapsed_ms;
                    execution.record_node_completed(node_id, outcome.outputs, outcome.metadata);
                    self.save(execution, control).await?;
                    self.event_bus.publish(ExecutionEvent::NodeCompleted {
                        execution_id: execution.id.clone(),
                        node_id: node_id.clone(),
                        elapsed_ms,
                    });
                    info!(execution_id = %execution.id, node_id = %node_id, elapsed_ms, "Node completed");
                }
                Err(e) => return self.finish_failed(execution, control, node_id, e).await,
            }
        }

        // The boundary after the last node. Checked under the write lock so a
        // cancel either lands before completion or sees it.
        let writes = control.writes.lock().await;
        if token.is_cancelled() {
            drop(writes);
            return self.finish_cancelled(execution, control).await;
        }
        execution.result = Some(aggregate_result(recipe, execution));
        execution.transition(ExecutionStatus::Completed)?;
        self.persist(execution, token).await?;
        drop(writes);
        self.publish_status(execution);
        info!(
            execution_id = %execution.id,
            duration_ms = execution.duration_ms().unwrap_or(0),
            "Execution completed"
        );
        Ok(())
    }

    async fn run_node(&self, recipe: &Recipe, node: &Node, execution: &Execution) -> Result<NodeOutcome> {
        let input = resolve_node_input(node, &recipe.edges, execution, &execution.input)?;

        let bus = self.event_bus.clone();
        let execution_id = execution.id.clone();
        let node_id = node.id.clone();
        let progress = move |index: usize, item: &Value| {
            bus.publish(ExecutionEvent::NodeProgress {
                execution_id: execution_id.clone(),
                node_id: node_id.clone(),
                index,
                item: item.clone(),
            });
        };

        self.executor
            .execute(node, &input, &recipe.execution_config, &progress)
            .await
    }

    async fn finish_failed(
        &self,
        execution: &mut Execution,
        control: &RunControl,
        node_id: &str,
        error: LoomError,
    ) -> Result<()> {
        warn!(execution_id = %execution.id, node_id, error = %error, "Node failed, halting execution");
        execution.record_node_failed(node_id, &error);
        execution.error = Some(ExecutionError {
            node_id: Some(node_id.to_string()),
            message: error.to_string(),
            kind: error.failure_kind(),
        });
        execution.transition(ExecutionStatus::Failed)?;
        self.save(execution, control).await?;
        self.event_bus.publish(ExecutionEvent::NodeFailed {
            execution_id: execution.id.clone(),
            node_id: node_id.to_string(),
            error: error.to_string(),
        });
        self.publish_status(execution);
        Ok(())
    }

    async fn finish_cancelled(&self, execution: &mut Execution, control: &RunControl) -> Result<()> {
        execution.error = Some(cancelled_error());
        execution.transition(ExecutionStatus::Cancelled)?;
        self.save(execution, control).await?;
        self.publish_status(execution);
        info!(execution_id = %execution.id, "Execution cancelled");
        Ok(())
    }

    /// One best-effort write tagging the execution as an infrastructure
    /// failure. The status is forced since the in-memory record may already
    /// be terminal when its final write is the one that failed.
    async fn record_infrastructure_failure(&self, execution: &mut Execution, error: &LoomError) {
        let now = Utc::now();
        execution.error = Some(ExecutionError {
            node_id: execution.current_node_id.clone(),
            message: error.to_string(),
            kind: FailureKind::Infrastructure,
        });
        execution.status = ExecutionStatus::Failed;
        execution.current_node_id = None;
        execution.completed_at = Some(now);
        execution.updated_at = now;

        if let Err(e) = self.executions.put_execution(execution).await {
            error!(execution_id = %execution.id, error = %e, "Could not record infrastructure failure");
        }
        self.publish_status(execution);
    }
}

fn cancelled_error() -> ExecutionError {
    ExecutionError {
        node_id: None,
        message: "cancelled by request".to_string(),
        kind: FailureKind::Cancelled,
    }
}

/// Outputs of the nodes marked final, keyed by node id. When no node is
/// marked final every completed node contributes.
fn aggregate_result(recipe: &Recipe, execution: &Execution) -> OutputMap {
    let finals: Vec<&str> = recipe
        .nodes
        .iter()
        .filter(|n| n.is_final)
        .map(|n| n.id.as_str())
        .collect();
    let selected: Vec<&str> = if finals.is_empty() {
        execution.node_order.iter().map(String::as_str).collect()
    } else {
        finals
    };

    selected
        .into_iter()
        .filter_map(|id| {
            execution
                .node_output(id)
                .map(|out| (id.to_string(), Value::Object(out.clone())))
        })
        .collect()
}
