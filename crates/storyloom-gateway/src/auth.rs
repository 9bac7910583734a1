use storyloom_core::config::{ApiKeyRole, GatewayConfig};
use storyloom_engine::Actor;

/// Result of a successful authentication.
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub name: String,
    pub role: ApiKeyRole,
}

impl AuthResult {
    /// The caller as seen by the recipe service. The key name is the user id.
    pub fn actor(&self) -> Actor {
        Actor {
            user_id: Some(self.name.clone()),
            is_admin: self.role == ApiKeyRole::Admin,
        }
    }
}

/// Bearer (or `?token=`) -> api_keys -> legacy token -> anonymous.
///
/// Returns `None` on auth failure.
pub fn validate_auth(config: &GatewayConfig, bearer: Option<&str>) -> Option<AuthResult> {
    if let Some(bearer_val) = bearer {
        for ak in &config.api_keys {
            if ak.key == bearer_val {
                return Some(AuthResult {
                    name: ak.name.clone(),
                    role: ak.role.clone(),
                });
            }
        }
        if config.token.as_deref() == Some(bearer_val) {
            return Some(AuthResult {
                name: "legacy-token".into(),
                role: ApiKeyRole::Admin,
            });
        }
        return None;
    }

    // No credentials offered: only allowed when nothing is configured.
    if config.api_keys.is_empty() && config.token.is_none() {
        Some(AuthResult {
            name: "anonymous".into(),
            role: ApiKeyRole::Admin,
        })
    } else {
        None
    }
}

/// Extract token from the query string (?token=...). Used by SSE clients
/// that cannot set headers.
pub fn extract_token_from_query(query: &str) -> Option<&str> {
    for pair in query.split('&') {
        if let Some(val) = pair.strip_prefix("token=") {
            return Some(val);
        }
    }
    None
}

/// Check if a role has at least viewer-level access.
pub fn has_viewer_access(role: &ApiKeyRole) -> bool {
    matches!(role, ApiKeyRole::Viewer | ApiKeyRole::Operator | ApiKeyRole::Admin)
}

/// Check if a role has at least operator-level access.
pub fn has_operator_access(role: &ApiKeyRole) -> bool {
    matches!(role, ApiKeyRole::Operator | ApiKeyRole::Admin)
}
