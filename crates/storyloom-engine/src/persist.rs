use std::time::Duration;

use tracing::warn;

use storyloom_core::config::RetryConfig;
use storyloom_core::error::{LoomError, Result};
use storyloom_core::traits::ExecutionStore;
use storyloom_core::types::Execution;

/// Write the execution document, retrying transient storage errors.
///
/// Makes at most `1 + max_retries` attempts. Non-transient errors fail
/// immediately. When attempts run out the result is `LoomError::Persistence`.
pub async fn persist_with_retry(
    store: &dyn ExecutionStore,
    execution: &Execution,
    config: &RetryConfig,
) -> Result<()> {
    let mut attempt = 0u32;
    loop {
        match store.put_execution(execution).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                let backoff = backoff_for(attempt, config);
                warn!(
                    execution_id = %execution.id,
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Execution write failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(LoomError::Persistence {
                    attempts: attempt + 1,
                    message: e.to_string(),
                })
            }
        }
    }
}

/// Exponential backoff capped at `max_backoff_ms`, with 0.8x to 1.2x jitter.
fn backoff_for(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use storyloom_core::types::{ExecutionMeta, Node, Recipe};
    use storyloom_test_utils::FlakyStore;

    fn fast(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    fn execution() -> Execution {
        let recipe = Recipe::new("r", vec![Node::text("a", "x")], vec![]);
        Execution::new(&recipe, json!({}), ExecutionMeta::default(), vec!["a".into()])
    }

    #[tokio::test]
    async fn test_recovers_from_transient_failures() {
        let store = FlakyStore::new();
        store.fail_next_writes(2);
        let exec = execution();
        persist_with_retry(&store, &exec, &fast(3)).await.unwrap();
        assert_eq!(store.failed_writes(), 2);
        assert!(store.inner().execution(&exec.id).is_some());
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let store = FlakyStore::new();
        store.fail_all_writes(true);
        let err = persist_with_retry(&store, &execution(), &fast(2))
            .await
            .unwrap_err();
        match err {
            LoomError::Persistence { attempts, message } => {
                assert_eq!(attempts, 3);
                assert!(message.contains("disk I/O error"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(store.failed_writes(), 3);
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig {
            max_retries: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 1000,
        };
        assert!(backoff_for(0, &config).as_millis() <= 240);
        assert!(backoff_for(10, &config).as_millis() <= 1200);
    }
}
