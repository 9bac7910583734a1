use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use storyloom_core::error::{LoomError, Result};
use storyloom_core::traits::{ExecutionStore, RecipeStore};
use storyloom_core::types::{Execution, Recipe, RecipeFilter};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS recipes (
    id TEXT PRIMARY KEY,
    stage_type TEXT,
    is_active INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    doc TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_recipes_stage ON recipes(stage_type);

CREATE TABLE IF NOT EXISTS executions (
    id TEXT PRIMARY KEY,
    recipe_id TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    doc TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_executions_recipe
    ON executions(recipe_id, created_at);
";

fn db_err(e: impl std::fmt::Display) -> LoomError {
    LoomError::Database(e.to_string())
}

/// SQLite-backed store holding recipes and executions as JSON documents.
///
/// A few fields are mirrored into columns so history and stage queries
/// don't have to parse every document.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LoomError::Database(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().map_err(db_err)?;
        f(&conn)
    }
}

impl RecipeStore for SqliteStore {
    fn get_recipe(&self, id: &str) -> BoxFuture<'_, Result<Option<Recipe>>> {
        let id = id.to_string();

        Box::pin(async move {
            let doc: Option<String> = self.with_conn(|conn| {
                conn.query_row("SELECT doc FROM recipes WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(db_err)
            })?;
            match doc {
                Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
                None => Ok(None),
            }
        })
    }

    fn put_recipe(&self, recipe: &Recipe) -> BoxFuture<'_, Result<()>> {
        let doc = serde_json::to_string(recipe);
        let id = recipe.id.clone();
        let stage_type = recipe.stage_type.clone();
        let is_active = recipe.is_active;
        let created_at = recipe.created_at.to_rfc3339();

        Box::pin(async move {
            let doc = doc?;
            self.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO recipes (id, stage_type, is_active, created_at, doc)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(id) DO UPDATE SET
                        stage_type = excluded.stage_type,
                        is_active = excluded.is_active,
                        doc = excluded.doc",
                    params![id, stage_type, is_active, created_at, doc],
                )
                .map_err(db_err)?;
                Ok(())
            })
        })
    }

    fn delete_recipe(&self, id: &str) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();

        Box::pin(async move {
            self.with_conn(|conn| {
                let removed = conn
                    .execute("DELETE FROM recipes WHERE id = ?1", params![id])
                    .map_err(db_err)?;
                Ok(removed > 0)
            })
        })
    }

    fn list_recipes(&self, filter: &RecipeFilter) -> BoxFuture<'_, Result<Vec<Recipe>>> {
        let filter = filter.clone();

        Box::pin(async move {
            let docs: Vec<String> = self.with_conn(|conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT doc FROM recipes
                         WHERE (?1 IS NULL OR stage_type = ?1)
                           AND (?2 OR is_active = 1)
                         ORDER BY created_at ASC, id ASC",
                    )
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![filter.stage_type, filter.include_inactive], |row| {
                        row.get(0)
                    })
                    .map_err(db_err)?;
                rows.collect::<std::result::Result<Vec<String>, _>>()
                    .map_err(db_err)
            })?;

            let mut recipes = Vec::with_capacity(docs.len());
            for doc in docs {
                let recipe: Recipe = serde_json::from_str(&doc)?;
                // Search runs over the parsed document.
                if filter.matches(&recipe) {
                    recipes.push(recipe);
                }
            }
            Ok(recipes)
        })
    }
}

impl ExecutionStore for SqliteStore {
    fn get_execution(&self, id: &str) -> BoxFuture<'_, Result<Option<Execution>>> {
        let id = id.to_string();

        Box::pin(async move {
            let doc: Option<String> = self.with_conn(|conn| {
                conn.query_row(
                    "SELECT doc FROM executions WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)
            })?;
            match doc {
                Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
                None => Ok(None),
            }
        })
    }

    fn put_execution(&self, execution: &Execution) -> BoxFuture<'_, Result<()>> {
        let doc = serde_json::to_string(execution);
        let id = execution.id.clone();
        let recipe_id = execution.recipe_id.clone();
        let status = execution.status.as_str();
        let created_at = execution.created_at.to_rfc3339();

        Box::pin(async move {
            let doc = doc?;
            self.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO executions (id, recipe_id, status, created_at, doc)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(id) DO UPDATE SET
                        status = excluded.status,
                        doc = excluded.doc",
                    params![id, recipe_id, status, created_at, doc],
                )
                .map_err(db_err)?;
                Ok(())
            })
        })
    }

    fn list_executions(
        &self,
        recipe_id: &str,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Execution>>> {
        let recipe_id = recipe_id.to_string();

        Box::pin(async move {
            let docs: Vec<String> = self.with_conn(|conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT doc FROM executions
                         WHERE recipe_id = ?1
                         ORDER BY created_at DESC, rowid DESC
                         LIMIT ?2",
                    )
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![recipe_id, limit as i64], |row| row.get(0))
                    .map_err(db_err)?;
                rows.collect::<std::result::Result<Vec<String>, _>>()
                    .map_err(db_err)
            })?;

            docs.iter()
                .map(|doc| serde_json::from_str(doc).map_err(LoomError::from))
                .collect()
        })
    }
}
