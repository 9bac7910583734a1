mod auth;
mod error;
mod middleware;
mod routes;
mod server;
mod state;

pub use error::{ApiError, ApiResult};
pub use server::{build_router, GatewayServer};
pub use state::AppState;
