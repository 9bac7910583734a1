use storyloom_core::config::GatewayConfig;
use storyloom_engine::{RecipeOrchestrator, RecipeService};

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub orchestrator: RecipeOrchestrator,
    pub recipes: RecipeService,
}
