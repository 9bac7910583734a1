pub mod graph;
pub mod orchestrator;
pub mod persist;
pub mod recipes;
pub mod retry;
pub mod run_log;
pub mod seed;
pub mod test_node;

pub use graph::{topological_order, validate_dag, Capabilities, NodeExecutor};
pub use orchestrator::{ExecutionHandle, OrchestratorBuilder, RecipeOrchestrator};
pub use persist::persist_with_retry;
pub use recipes::{Actor, CreateRecipe, RecipePatch, RecipeService, SeedReport};
pub use run_log::RunLogger;
pub use seed::builtin_recipes;
pub use test_node::{TestNodeRequest, TestNodeResult};
