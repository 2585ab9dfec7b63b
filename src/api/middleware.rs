//! API key authentication for the admin surface.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::config::ServerConfig;

/// Security settings for the HTTP API.
#[derive(Clone, Debug, Default)]
pub struct SecurityConfig {
    /// Bearer token required on every lease route. No auth when unset.
    pub api_key: Option<String>,
    /// Allowed CORS origins. Any origin when unset.
    pub cors_origins: Option<Vec<String>>,
}

impl SecurityConfig {
    /// Build from the server section of the config file.
    pub fn from_server_config(server: &ServerConfig) -> Self {
        Self {
            api_key: server.api_key.clone(),
            cors_origins: server.cors_origins.clone(),
        }
    }

    /// Create a config with no authentication (for local development/testing).
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Create a config with authentication enabled.
    pub fn with_api_key(key: impl Into<String>) -> Self {
        Self {
            api_key: Some(key.into()),
            cors_origins: None,
        }
    }

    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }
}

/// Authentication middleware that checks for a valid API key.
pub async fn auth_middleware(
    State(config): State<SecurityConfig>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected_key) = &config.api_key else {
        return Ok(next.run(request).await);
    };

    let auth_header = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok());

    match auth_header.map(|h| h.strip_prefix("Bearer ")) {
        Some(Some(token)) if token == expected_key => Ok(next.run(request).await),
        Some(Some(_)) => {
            tracing::warn!("Invalid API key provided");
            Err(StatusCode::UNAUTHORIZED)
        }
        Some(None) => {
            tracing::warn!("Invalid Authorization header format");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            tracing::warn!("Missing Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
