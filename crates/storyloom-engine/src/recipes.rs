use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use storyloom_core::error::{LoomError, Result};
use storyloom_core::traits::RecipeStore;
use storyloom_core::types::{Edge, ExecutionConfig, Node, Recipe, RecipeFilter};

use crate::graph::validate_dag;
use crate::seed::builtin_recipes;

/// Who is acting on a recipe.
#[derive(Debug, Clone, Default)]
pub struct Actor {
    pub user_id: Option<String>,
    pub is_admin: bool,
}

impl Actor {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            is_admin: false,
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            is_admin: true,
        }
    }

    /// Owners and admins may change a recipe. Recipes without an owner are
    /// admin-only.
    fn may_modify(&self, recipe: &Recipe) -> bool {
        self.is_admin
            || matches!(
                (&self.user_id, &recipe.created_by),
                (Some(user), Some(owner)) if user == owner
            )
    }
}

/// Body of a create request. Fields are optional so missing ones can be
/// reported as request errors rather than parse failures.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRecipe {
    pub name: Option<String>,
    pub description: Option<String>,
    pub stage_type: Option<String>,
    pub nodes: Option<Vec<Node>>,
    pub edges: Option<Vec<Edge>>,
    pub execution_config: Option<ExecutionConfig>,
    pub metadata: Option<Value>,
}

/// Partial update. Absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub stage_type: Option<String>,
    pub nodes: Option<Vec<Node>>,
    pub edges: Option<Vec<Edge>>,
    pub execution_config: Option<ExecutionConfig>,
    pub metadata: Option<Value>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SeedReport {
    pub created: Vec<String>,
    pub skipped: Vec<String>,
}

/// Create, update, delete and query recipe definitions.
///
/// Every definition that reaches the store has passed DAG validation.
#[derive(Clone)]
pub struct RecipeService {
    store: Arc<dyn RecipeStore>,
}

impl RecipeService {
    pub fn new(store: Arc<dyn RecipeStore>) -> Self {
        Self { store }
    }

    pub async fn create(&self, request: CreateRecipe, actor: &Actor) -> Result<Recipe> {
        let name = request
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| LoomError::InvalidRequest("name is required".into()))?;
        let nodes = request
            .nodes
            .filter(|n| !n.is_empty())
            .ok_or_else(|| LoomError::InvalidRequest("nodes must be a non-empty array".into()))?;
        let edges = request
            .edges
            .ok_or_else(|| LoomError::InvalidRequest("edges must be an array".into()))?;

        validate_dag(&nodes, &edges)?;

        let mut recipe = Recipe::new(name, nodes, edges).with_id(Uuid::new_v4().to_string());
        recipe.description = request.description.unwrap_or_default();
        recipe.stage_type = request.stage_type;
        recipe.execution_config = request.execution_config.unwrap_or_default();
        recipe.metadata = request.metadata.unwrap_or(Value::Null);
        recipe.created_by = actor.user_id.clone();

        self.store.put_recipe(&recipe).await?;
        info!(recipe_id = %recipe.id, name = %recipe.name, nodes = recipe.nodes.len(), "Recipe created");
        Ok(recipe)
    }

    /// Apply `patch`. A patch touching nodes or edges re-validates the merged
    /// graph and bumps the version.
    pub async fn update(&self, id: &str, patch: RecipePatch, actor: &Actor) -> Result<Recipe> {
        let mut recipe = self.get(id).await?;
        self.authorize(&recipe, actor)?;

        let structural = patch.nodes.is_some() || patch.edges.is_some();
        if let Some(nodes) = patch.nodes {
            recipe.nodes = nodes;
        }
        if let Some(edges) = patch.edges {
            recipe.edges = edges;
        }
        if structural {
            validate_dag(&recipe.nodes, &recipe.edges)?;
            recipe.version += 1;
        }

        if let Some(name) = patch.name {
            if name.trim().is_empty() {
                return Err(LoomError::InvalidRequest("name cannot be empty".into()));
            }
            recipe.name = name;
        }
        if let Some(description) = patch.description {
            recipe.description = description;
        }
        if let Some(stage_type) = patch.stage_type {
            recipe.stage_type = Some(stage_type);
        }
        if let Some(config) = patch.execution_config {
            recipe.execution_config = config;
        }
        if let Some(metadata) = patch.metadata {
            recipe.metadata = metadata;
        }
        if let Some(active) = patch.is_active {
            recipe.is_active = active;
        }
        recipe.updated_at = Utc::now();

        self.store.put_recipe(&recipe).await?;
        info!(recipe_id = %recipe.id, version = recipe.version, "Recipe updated");
        Ok(recipe)
    }

    /// Deactivate a recipe, or remove it when `hard`. Executions are kept.
    pub async fn delete(&self, id: &str, hard: bool, actor: &Actor) -> Result<()> {
        let mut recipe = self.get(id).await?;
        self.authorize(&recipe, actor)?;

        if hard {
            self.store.delete_recipe(id).await?;
            info!(recipe_id = id, "Recipe deleted");
        } else {
            recipe.is_active = false;
            recipe.updated_at = Utc::now();
            self.store.put_recipe(&recipe).await?;
            info!(recipe_id = id, "Recipe deactivated");
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Recipe> {
        self.store
            .get_recipe(id)
            .await?
            .ok_or_else(|| LoomError::RecipeNotFound(id.to_string()))
    }

    pub async fn list(&self, filter: &RecipeFilter) -> Result<Vec<Recipe>> {
        self.store.list_recipes(filter).await
    }

    /// Active recipes tagged for a pipeline stage.
    pub async fn by_stage(&self, stage_type: &str) -> Result<Vec<Recipe>> {
        let filter = RecipeFilter {
            stage_type: Some(stage_type.to_string()),
            ..Default::default()
        };
        self.store.list_recipes(&filter).await
    }

    /// Install the built-in recipes that are not stored yet.
    pub async fn seed(&self, actor: &Actor) -> Result<SeedReport> {
        let mut report = SeedReport::default();
        for mut recipe in builtin_recipes() {
            if self.store.get_recipe(&recipe.id).await?.is_some() {
                report.skipped.push(recipe.id);
                continue;
            }
            recipe.created_by = actor.user_id.clone();
            self.store.put_recipe(&recipe).await?;
            report.created.push(recipe.id);
        }
        info!(
            created = report.created.len(),
            skipped = report.skipped.len(),
            "Seeded built-in recipes"
        );
        Ok(report)
    }

    fn authorize(&self, recipe: &Recipe, actor: &Actor) -> Result<()> {
        if actor.may_modify(recipe) {
            Ok(())
        } else {
            Err(LoomError::Forbidden(format!(
                "only the owner or an admin may modify recipe {}",
                recipe.id
            )))
        }
    }
}
