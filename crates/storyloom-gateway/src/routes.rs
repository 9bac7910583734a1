use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::Json;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use storyloom_core::types::{
    Execution, ExecutionEvent, ExecutionMeta, ExecutionSummary, Recipe, RecipeFilter, RetryMode,
};
use storyloom_engine::{CreateRecipe, RecipePatch, SeedReport, TestNodeRequest};

use crate::error::{ApiError, ApiResult};
use crate::middleware::Authenticated;
use crate::state::AppState;

type Body<T> = Result<Json<T>, JsonRejection>;

// GET /api/health, no auth required
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Recipes ─────────────────────────────────────────────────────

// GET /api/recipes?stageType=&search=&includeInactive=
pub async fn list_recipes(
    auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Query(filter): Query<RecipeFilter>,
) -> ApiResult<Json<Value>> {
    auth.require_viewer()?;
    let recipes = state.recipes.list(&filter).await?;
    Ok(Json(json!({ "recipes": recipes })))
}

// GET /api/recipes/{recipe_id}
pub async fn get_recipe(
    auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(recipe_id): Path<String>,
) -> ApiResult<Json<Recipe>> {
    auth.require_viewer()?;
    Ok(Json(state.recipes.get(&recipe_id).await?))
}

// POST /api/recipes
pub async fn create_recipe(
    auth: Authenticated,
    State(state): State<Arc<AppState>>,
    body: Body<CreateRecipe>,
) -> ApiResult<(StatusCode, Json<Recipe>)> {
    auth.require_operator()?;
    let Json(request) = body?;
    let recipe = state.recipes.create(request, &auth.0.actor()).await?;
    Ok((StatusCode::CREATED, Json(recipe)))
}

// PUT /api/recipes/{recipe_id}
pub async fn update_recipe(
    auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(recipe_id): Path<String>,
    body: Body<RecipePatch>,
) -> ApiResult<Json<Recipe>> {
    auth.require_operator()?;
    let Json(patch) = body?;
    let recipe = state
        .recipes
        .update(&recipe_id, patch, &auth.0.actor())
        .await?;
    Ok(Json(recipe))
}

#[derive(Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub hard: bool,
}

// DELETE /api/recipes/{recipe_id}?hard=true
pub async fn delete_recipe(
    auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(recipe_id): Path<String>,
    Query(q): Query<DeleteQuery>,
) -> ApiResult<Json<Value>> {
    auth.require_operator()?;
    state
        .recipes
        .delete(&recipe_id, q.hard, &auth.0.actor())
        .await?;
    Ok(Json(json!({ "deleted": recipe_id, "hard": q.hard })))
}

// GET /api/recipes/stage/{stage_type}
pub async fn recipes_by_stage(
    auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(stage_type): Path<String>,
) -> ApiResult<Json<Value>> {
    auth.require_viewer()?;
    let recipes = state.recipes.by_stage(&stage_type).await?;
    Ok(Json(json!({ "recipes": recipes })))
}

// POST /api/recipes/seed/initial
pub async fn seed_recipes(
    auth: Authenticated,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<SeedReport>> {
    auth.require_operator()?;
    Ok(Json(state.recipes.seed(&auth.0.actor()).await?))
}

// ── Executions ──────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteBody {
    pub input: Option<Value>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub stage_id: Option<String>,
}

// POST /api/recipes/{recipe_id}/execute
pub async fn execute_recipe(
    auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(recipe_id): Path<String>,
    body: Body<ExecuteBody>,
) -> ApiResult<Json<Value>> {
    auth.require_operator()?;
    let Json(body) = body?;
    let input = body
        .input
        .ok_or_else(|| ApiError::BadRequest("input is required".into()))?;

    let meta = ExecutionMeta {
        user_id: Some(auth.0.name.clone()),
        project_id: body.project_id,
        stage_id: body.stage_id,
    };
    let execution_id = state.orchestrator.execute(&recipe_id, input, meta).await?;
    info!(recipe_id = %recipe_id, execution_id = %execution_id, user = %auth.0.name, "Execution requested");
    Ok(Json(json!({ "executionId": execution_id })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestNodeBody {
    pub node_id: Option<String>,
    pub external_input: Option<Value>,
    #[serde(default)]
    pub execute_dependencies: bool,
    #[serde(default)]
    pub mock_outputs: HashMap<String, Value>,
}

// POST /api/recipes/{recipe_id}/test-node
pub async fn test_node(
    auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(recipe_id): Path<String>,
    body: Body<TestNodeBody>,
) -> ApiResult<Json<Value>> {
    auth.require_operator()?;
    let Json(body) = body?;
    let node_id = body
        .node_id
        .ok_or_else(|| ApiError::BadRequest("nodeId is required".into()))?;
    let external_input = body
        .external_input
        .ok_or_else(|| ApiError::BadRequest("externalInput is required".into()))?;

    let result = state
        .orchestrator
        .test_single_node(
            &recipe_id,
            TestNodeRequest {
                node_id,
                external_input,
                execute_dependencies: body.execute_dependencies,
                mock_outputs: body.mock_outputs,
            },
        )
        .await?;
    Ok(Json(json!({ "success": result.success, "result": result })))
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

// GET /api/recipes/{recipe_id}/executions and /history
pub async fn recipe_executions(
    auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(recipe_id): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    auth.require_viewer()?;
    let executions = state.orchestrator.history(&recipe_id, q.limit).await?;
    Ok(Json(json!({ "executions": executions })))
}

// GET /api/recipes/executions/{execution_id}
pub async fn get_execution(
    auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<Execution>> {
    auth.require_viewer()?;
    Ok(Json(state.orchestrator.get_execution(&execution_id).await?))
}

// GET /api/recipes/executions/{execution_id}/summary
pub async fn execution_summary(
    auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<ExecutionSummary>> {
    auth.require_viewer()?;
    Ok(Json(state.orchestrator.get_summary(&execution_id).await?))
}

// POST /api/recipes/executions/{execution_id}/cancel
pub async fn cancel_execution(
    auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<Execution>> {
    auth.require_operator()?;
    Ok(Json(state.orchestrator.cancel(&execution_id).await?))
}

#[derive(Deserialize, Default)]
pub struct RetryBody {
    #[serde(default)]
    pub mode: RetryMode,
}

// POST /api/recipes/executions/{execution_id}/retry, body optional
pub async fn retry_execution(
    auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    auth.require_operator()?;
    let body: RetryBody = if body.is_empty() {
        RetryBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };

    let handle = state
        .orchestrator
        .retry_execution(&execution_id, body.mode)
        .await?;
    info!(
        execution_id = %execution_id,
        new_execution_id = %handle.execution_id,
        mode = ?body.mode,
        "Retry requested"
    );
    Ok(Json(json!({ "executionId": handle.execution_id })))
}

type EventStream = BoxStream<'static, Result<Event, Infallible>>;

// GET /api/recipes/executions/{execution_id}/events
pub async fn execution_events(
    auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> ApiResult<Sse<KeepAliveStream<EventStream>>> {
    auth.require_viewer()?;

    // Subscribe before reading the record so the terminal event cannot slip
    // between the two.
    let rx = state.orchestrator.event_bus().subscribe();
    let execution = state.orchestrator.get_execution(&execution_id).await?;

    let events = if execution.status.is_terminal() {
        let event = ExecutionEvent::StatusChanged {
            execution_id: execution.id.clone(),
            status: execution.status,
        };
        stream::once(async move { Ok::<_, Infallible>(to_sse(&event)) }).boxed()
    } else {
        debug!(execution_id = %execution_id, "SSE subscriber attached");
        follow(rx, execution_id).boxed()
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Events for one execution, ending after its terminal status event.
fn follow(
    rx: broadcast::Receiver<ExecutionEvent>,
    execution_id: String,
) -> impl futures::Stream<Item = Result<Event, Infallible>> {
    stream::unfold(Some(rx), move |rx| {
        let execution_id = execution_id.clone();
        async move {
            let mut rx = rx?;
            loop {
                match rx.recv().await {
                    Ok(event) if event.execution_id() == execution_id => {
                        let next = if event.is_terminal() { None } else { Some(rx) };
                        return Some((Ok::<_, Infallible>(to_sse(&event)), next));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(execution_id = %execution_id, skipped = n, "SSE stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }
    })
}

fn to_sse(event: &ExecutionEvent) -> Event {
    Event::default()
        .event(event.name())
        .data(serde_json::to_string(event).unwrap_or_default())
}
