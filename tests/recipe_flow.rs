use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use storyloom_core::config::{EngineConfig, RetryConfig};
use storyloom_core::error::{FailureKind, LoomError};
use storyloom_core::event::EventBus;
use storyloom_core::traits::{ExecutionStore, RecipeStore};
use storyloom_core::types::{ExecutionMeta, ExecutionStatus, NodeRunStatus, RetryMode};
use storyloom_engine::seed::{PERSONA_RECIPE_ID, STORYBOARD_RECIPE_ID};
use storyloom_engine::{Actor, Capabilities, OrchestratorBuilder, RecipeOrchestrator, RecipeService, TestNodeRequest};
use storyloom_test_utils::fixtures::{bicycle_input, bicycle_recipe, fan_in, four_step_chain, linear_chain};
use storyloom_test_utils::{temp_workspace, FlakyStore, GatedText, MemoryStore, MockImage, MockText};

fn engine_config() -> EngineConfig {
    EngineConfig {
        inter_node_delay_ms: 0,
        persistence_retry: RetryConfig {
            max_retries: 1,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        },
        ..Default::default()
    }
}

fn orchestrator<S>(store: Arc<S>, capabilities: Capabilities, log_dir: Option<PathBuf>) -> RecipeOrchestrator
where
    S: RecipeStore + ExecutionStore,
{
    OrchestratorBuilder {
        recipes: store.clone(),
        executions: store,
        capabilities,
        event_bus: Arc::new(EventBus::default()),
        log_dir,
    }
    .build(&engine_config())
}

#[tokio::test]
async fn test_cancel_takes_effect_at_next_node_boundary() {
    let store = Arc::new(MemoryStore::new());
    store.put_recipe(&four_step_chain()).await.unwrap();
    let text = Arc::new(GatedText::new("step two"));
    let orch = orchestrator(store.clone(), Capabilities::new().with_text(text.clone()), None);

    let handle = orch
        .start("four-steps", json!({}), ExecutionMeta::default())
        .await
        .unwrap();
    let id = handle.execution_id.clone();

    text.wait_started().await;
    let requested = orch.cancel(&id).await.unwrap();
    assert!(requested.cancel_requested);

    // Visible to pollers while the node is still in flight.
    let in_flight = orch.get_execution(&id).await.unwrap();
    assert!(in_flight.cancel_requested);
    assert_eq!(in_flight.status, ExecutionStatus::Running);
    assert_eq!(in_flight.current_node_id.as_deref(), Some("s2"));
    text.release();

    let execution = handle.wait().await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert_eq!(execution.execution_context["s1"].status, NodeRunStatus::Completed);
    assert_eq!(execution.execution_context["s2"].status, NodeRunStatus::Completed);
    assert!(!execution.execution_context.contains_key("s3"));
    assert!(!execution.execution_context.contains_key("s4"));
    assert_eq!(text.prompts().len(), 2);

    let stored = store.execution(&id).unwrap();
    assert_eq!(stored.status, ExecutionStatus::Cancelled);
    assert!(stored.cancel_requested);
    assert!(!orch.is_running(&id).await);
}

#[tokio::test]
async fn test_cancel_during_last_node_ends_cancelled() {
    let store = Arc::new(MemoryStore::new());
    store.put_recipe(&four_step_chain()).await.unwrap();
    let text = Arc::new(GatedText::new("step four"));
    let orch = orchestrator(store.clone(), Capabilities::new().with_text(text.clone()), None);

    let handle = orch
        .start("four-steps", json!({}), ExecutionMeta::default())
        .await
        .unwrap();
    let id = handle.execution_id.clone();

    text.wait_started().await;
    let requested = orch.cancel(&id).await.unwrap();
    assert!(requested.cancel_requested);
    assert!(store.execution(&id).unwrap().cancel_requested);
    text.release();

    let execution = handle.wait().await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert_eq!(execution.execution_context["s4"].status, NodeRunStatus::Completed);
    assert!(execution.result.is_none());
    assert_eq!(execution.error.unwrap().kind, FailureKind::Cancelled);

    let stored = store.execution(&id).unwrap();
    assert_eq!(stored.status, ExecutionStatus::Cancelled);
    assert!(stored.cancel_requested);

    assert!(matches!(
        orch.cancel(&id).await,
        Err(LoomError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_node_with_mocks_runs_only_target() {
    let store = Arc::new(MemoryStore::new());
    store.put_recipe(&fan_in()).await.unwrap();
    let text = Arc::new(MockText::new());
    let orch = orchestrator(store.clone(), Capabilities::new().with_text(text.clone()), None);

    let mut mocks = HashMap::new();
    mocks.insert("a".to_string(), json!("L"));
    mocks.insert("b".to_string(), json!({"output": "R"}));
    let result = orch
        .test_single_node(
            "fan-in",
            TestNodeRequest {
                node_id: "c".into(),
                mock_outputs: mocks,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.executed_nodes, vec!["c"]);
    assert_eq!(result.node_output.unwrap()["output"], json!({"left": "L", "right": "R"}));
    assert_eq!(text.call_count(), 0);
    assert_eq!(store.execution_writes(), 0);
}

#[tokio::test]
async fn test_node_with_dependencies_skips_unrelated_nodes() {
    let store = Arc::new(MemoryStore::new());
    store.put_recipe(&linear_chain()).await.unwrap();
    let text = Arc::new(MockText::new());
    let orch = orchestrator(store, Capabilities::new().with_text(text.clone()), None);

    let result = orch
        .test_single_node(
            "linear-chain",
            TestNodeRequest {
                node_id: "b".into(),
                external_input: json!({"topic": "tea"}),
                execute_dependencies: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.executed_nodes, vec!["a", "b"]);
    assert_eq!(
        text.prompts(),
        vec![
            "Step A about tea".to_string(),
            "Step B after generated: Step A about tea".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_node_reports_dependency_failure() {
    let store = Arc::new(MemoryStore::new());
    store.put_recipe(&linear_chain()).await.unwrap();
    let text = Arc::new(MockText::new().fail_on("Step A", "HTTP 500: upstream"));
    let orch = orchestrator(store, Capabilities::new().with_text(text), None);

    let result = orch
        .test_single_node(
            "linear-chain",
            TestNodeRequest {
                node_id: "c".into(),
                external_input: json!({"topic": "tea"}),
                execute_dependencies: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.executed_nodes, vec!["a"]);
    assert!(result.error.unwrap().contains("upstream"));

    let missing = orch
        .test_single_node(
            "linear-chain",
            TestNodeRequest {
                node_id: "zzz".into(),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(missing, Err(LoomError::NodeNotFound { .. })));
}

#[tokio::test]
async fn test_transient_write_failures_are_retried() {
    let store = Arc::new(FlakyStore::new());
    store.put_recipe(&bicycle_recipe()).await.unwrap();
    let orch = orchestrator(
        store.clone(),
        Capabilities::new()
            .with_text(Arc::new(MockText::new()))
            .with_image(Arc::new(MockImage::new())),
        None,
    );

    store.fail_next_writes(1);
    let execution = orch
        .start("bicycle", bicycle_input(), ExecutionMeta::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(store.failed_writes(), 1);
    assert_eq!(
        store.inner().execution(&execution.id).unwrap().status,
        ExecutionStatus::Completed
    );
}

#[tokio::test]
async fn test_exhausted_write_retries_fail_as_infrastructure() {
    let store = Arc::new(FlakyStore::new());
    store.put_recipe(&four_step_chain()).await.unwrap();
    let text = Arc::new(GatedText::new("step two"));
    let orch = orchestrator(store.clone(), Capabilities::new().with_text(text.clone()), None);

    let handle = orch
        .start("four-steps", json!({}), ExecutionMeta::default())
        .await
        .unwrap();
    let id = handle.execution_id.clone();

    text.wait_started().await;
    // Both attempts at recording s2's completion fail; the failure record itself lands.
    store.fail_next_writes(2);
    text.release();

    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, LoomError::Persistence { attempts: 2, .. }));

    let stored = store.inner().execution(&id).unwrap();
    assert_eq!(stored.status, ExecutionStatus::Failed);
    assert_eq!(stored.error.unwrap().kind, FailureKind::Infrastructure);
}

#[tokio::test]
async fn test_resume_retry_reuses_completed_nodes() {
    let store = Arc::new(MemoryStore::new());
    store.put_recipe(&linear_chain()).await.unwrap();

    let failing = Arc::new(MockText::new().fail_on("Step B", "HTTP 503: overloaded"));
    let first = orchestrator(store.clone(), Capabilities::new().with_text(failing), None);
    let failed = first
        .start("linear-chain", json!({"topic": "tea"}), ExecutionMeta::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(failed.status, ExecutionStatus::Failed);

    let healthy = Arc::new(MockText::new());
    let second = orchestrator(store.clone(), Capabilities::new().with_text(healthy.clone()), None);
    let resumed = second
        .retry_execution(&failed.id, RetryMode::Resume)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(resumed.status, ExecutionStatus::Completed);
    assert_ne!(resumed.id, failed.id);
    assert_eq!(resumed.retry_of.as_deref(), Some(failed.id.as_str()));
    assert_eq!(resumed.resumed_from_node_id.as_deref(), Some("b"));
    assert_eq!(
        resumed.execution_context["a"].reused_from.as_deref(),
        Some(failed.id.as_str())
    );
    assert_eq!(healthy.call_count(), 2);

    let full = second
        .retry_execution(&failed.id, RetryMode::Full)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(full.status, ExecutionStatus::Completed);
    assert!(full.resumed_from_node_id.is_none());
    assert_eq!(healthy.call_count(), 5);

    assert!(matches!(
        second.retry_execution(&full.id, RetryMode::Full).await,
        Err(LoomError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_run_log_written_for_execution() {
    let dir = temp_workspace();
    let store = Arc::new(MemoryStore::new());
    store.put_recipe(&bicycle_recipe()).await.unwrap();
    let orch = orchestrator(
        store,
        Capabilities::new()
            .with_text(Arc::new(MockText::new()))
            .with_image(Arc::new(MockImage::new())),
        Some(dir.path().to_path_buf()),
    );

    let execution = orch
        .start("bicycle", bicycle_input(), ExecutionMeta::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let path = dir.path().join(format!("{}.jsonl", execution.id));
    let mut content = String::new();
    for _ in 0..100 {
        content = std::fs::read_to_string(&path).unwrap_or_default();
        if content.contains("\"completed\"") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let events: Vec<String> = content
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["event_type"].to_string())
        .collect();
    assert_eq!(events.first().map(String::as_str), Some("\"status_changed\""));
    assert!(events.iter().any(|e| e == "\"node_completed\""));
    assert!(content.contains("\"completed\""));
}

#[tokio::test]
async fn test_seeded_recipes_run() {
    let store = Arc::new(MemoryStore::new());
    let service = RecipeService::new(store.clone());
    service.seed(&Actor::admin("root")).await.unwrap();

    let text = Arc::new(
        MockText::new()
            .reply_to(
                "customer personas",
                r#"[{"name": "Ada", "age": 34}, {"name": "Lin", "age": 51}]"#,
            )
            .reply_to(
                "scenes",
                r#"[{"title": "Dawn", "description": "Opening shot"}, {"title": "Dusk", "description": "Closing shot"}]"#,
            ),
    );
    let image = Arc::new(MockImage::new());
    let orch = orchestrator(
        store,
        Capabilities::new().with_text(text.clone()).with_image(image.clone()),
        None,
    );

    let personas = orch
        .start(PERSONA_RECIPE_ID, json!({"product": "a smart kettle"}), ExecutionMeta::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(personas.status, ExecutionStatus::Completed);
    let result = personas.result.unwrap();
    assert_eq!(result["lead"]["output"]["name"], json!("Ada"));
    assert_eq!(result["personas"]["output"].as_array().unwrap().len(), 2);
    assert!(text.prompts()[1].contains("Create 3 distinct"));

    let board = orch
        .start(STORYBOARD_RECIPE_ID, json!({"story": "A day at sea"}), ExecutionMeta::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(board.status, ExecutionStatus::Completed);
    assert_eq!(
        image.prompts(),
        vec!["Cinematic key visual, storyboard style: Opening shot".to_string()]
    );
    let output = &board.result.unwrap()["board"]["output"];
    assert_eq!(output["scenes"].as_array().unwrap().len(), 2);
    assert!(output["key_visual"].as_str().unwrap().starts_with("https://img.test/"));
}
