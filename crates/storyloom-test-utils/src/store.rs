use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;

use storyloom_core::error::{LoomError, Result};
use storyloom_core::traits::{ExecutionStore, RecipeStore};
use storyloom_core::types::{Execution, Recipe, RecipeFilter};

/// In-memory document store.
#[derive(Default)]
pub struct MemoryStore {
    recipes: Mutex<HashMap<String, Recipe>>,
    executions: Mutex<HashMap<String, Execution>>,
    execution_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of execution documents written so far.
    pub fn execution_writes(&self) -> usize {
        self.execution_writes.load(Ordering::SeqCst)
    }

    pub fn execution(&self, id: &str) -> Option<Execution> {
        self.executions.lock().unwrap().get(id).cloned()
    }
}

impl RecipeStore for MemoryStore {
    fn get_recipe(&self, id: &str) -> BoxFuture<'_, Result<Option<Recipe>>> {
        let found = self.recipes.lock().unwrap().get(id).cloned();
        Box::pin(async move { Ok(found) })
    }

    fn put_recipe(&self, recipe: &Recipe) -> BoxFuture<'_, Result<()>> {
        self.recipes
            .lock()
            .unwrap()
            .insert(recipe.id.clone(), recipe.clone());
        Box::pin(async { Ok(()) })
    }

    fn delete_recipe(&self, id: &str) -> BoxFuture<'_, Result<bool>> {
        let existed = self.recipes.lock().unwrap().remove(id).is_some();
        Box::pin(async move { Ok(existed) })
    }

    fn list_recipes(&self, filter: &RecipeFilter) -> BoxFuture<'_, Result<Vec<Recipe>>> {
        let mut found: Vec<Recipe> = self
            .recipes
            .lock()
            .unwrap()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Box::pin(async move { Ok(found) })
    }
}

impl ExecutionStore for MemoryStore {
    fn get_execution(&self, id: &str) -> BoxFuture<'_, Result<Option<Execution>>> {
        let found = self.execution(id);
        Box::pin(async move { Ok(found) })
    }

    fn put_execution(&self, execution: &Execution) -> BoxFuture<'_, Result<()>> {
        self.execution_writes.fetch_add(1, Ordering::SeqCst);
        self.executions
            .lock()
            .unwrap()
            .insert(execution.id.clone(), execution.clone());
        Box::pin(async { Ok(()) })
    }

    fn list_executions(
        &self,
        recipe_id: &str,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Execution>>> {
        let mut found: Vec<Execution> = self
            .executions
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.recipe_id == recipe_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found.truncate(limit);
        Box::pin(async move { Ok(found) })
    }
}

/// Memory store whose execution writes can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failures_left: AtomicU32,
    always_fail: AtomicBool,
    failed_writes: AtomicU32,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` execution writes.
    pub fn fail_next_writes(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Fail every execution write from now on.
    pub fn fail_all_writes(&self, fail: bool) {
        self.always_fail.store(fail, Ordering::SeqCst);
    }

    pub fn failed_writes(&self) -> u32 {
        self.failed_writes.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    fn should_fail(&self) -> bool {
        if self.always_fail.load(Ordering::SeqCst) {
            return true;
        }
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl RecipeStore for FlakyStore {
    fn get_recipe(&self, id: &str) -> BoxFuture<'_, Result<Option<Recipe>>> {
        self.inner.get_recipe(id)
    }

    fn put_recipe(&self, recipe: &Recipe) -> BoxFuture<'_, Result<()>> {
        self.inner.put_recipe(recipe)
    }

    fn delete_recipe(&self, id: &str) -> BoxFuture<'_, Result<bool>> {
        self.inner.delete_recipe(id)
    }

    fn list_recipes(&self, filter: &RecipeFilter) -> BoxFuture<'_, Result<Vec<Recipe>>> {
        self.inner.list_recipes(filter)
    }
}

impl ExecutionStore for FlakyStore {
    fn get_execution(&self, id: &str) -> BoxFuture<'_, Result<Option<Execution>>> {
        self.inner.get_execution(id)
    }

    fn put_execution(&self, execution: &Execution) -> BoxFuture<'_, Result<()>> {
        if self.should_fail() {
            self.failed_writes.fetch_add(1, Ordering::SeqCst);
            return Box::pin(async { Err(LoomError::Database("disk I/O error".into())) });
        }
        self.inner.put_execution(execution)
    }

    fn list_executions(
        &self,
        recipe_id: &str,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Execution>>> {
        self.inner.list_executions(recipe_id, limit)
    }
}
