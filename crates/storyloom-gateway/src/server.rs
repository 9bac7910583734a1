use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use storyloom_core::config::GatewayConfig;
use storyloom_engine::{RecipeOrchestrator, RecipeService};

use crate::routes;
use crate::state::AppState;

/// HTTP gateway for recipes and executions, built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    orchestrator: RecipeOrchestrator,
    recipes: RecipeService,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, orchestrator: RecipeOrchestrator, recipes: RecipeService) -> Self {
        Self {
            config,
            orchestrator,
            recipes,
        }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            orchestrator: self.orchestrator.clone(),
            recipes: self.recipes.clone(),
        });
        let app = build_router(state);

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}

/// All routes, with permissive CORS.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        // Recipes
        .route("/api/recipes", get(routes::list_recipes).post(routes::create_recipe))
        .route("/api/recipes/seed/initial", post(routes::seed_recipes))
        .route("/api/recipes/stage/{stage_type}", get(routes::recipes_by_stage))
        .route(
            "/api/recipes/{recipe_id}",
            get(routes::get_recipe)
                .put(routes::update_recipe)
                .delete(routes::delete_recipe),
        )
        .route("/api/recipes/{recipe_id}/execute", post(routes::execute_recipe))
        .route("/api/recipes/{recipe_id}/test-node", post(routes::test_node))
        .route("/api/recipes/{recipe_id}/executions", get(routes::recipe_executions))
        .route("/api/recipes/{recipe_id}/history", get(routes::recipe_executions))
        // Executions
        .route("/api/recipes/executions/{execution_id}", get(routes::get_execution))
        .route(
            "/api/recipes/executions/{execution_id}/summary",
            get(routes::execution_summary),
        )
        .route(
            "/api/recipes/executions/{execution_id}/events",
            get(routes::execution_events),
        )
        .route(
            "/api/recipes/executions/{execution_id}/cancel",
            post(routes::cancel_execution),
        )
        .route(
            "/api/recipes/executions/{execution_id}/retry",
            post(routes::retry_execution),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}
