//! Bearer-token authentication.
//!
//! Tokens come from configuration and map to a [`Principal`]. Authorization
//! itself happens in the service; this layer only establishes identity.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use std::collections::HashMap;

use spend_recon_core::{AuthConfig, Principal, ReconError};

use crate::response::ApiError;
use crate::server::AppState;

/// Principals by token.
#[derive(Debug, Clone, Default)]
pub struct TokenRegistry {
    principals: HashMap<String, Principal>,
}

impl TokenRegistry {
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        let principals = config
            .tokens
            .iter()
            .map(|t| {
                let mut principal = Principal::new(t.user_id.clone(), t.role);
                principal.operator_id = t.operator_id;
                (t.token.clone(), principal)
            })
            .collect();
        Self { principals }
    }

    #[must_use]
    pub fn resolve(&self, token: &str) -> Option<&Principal> {
        self.principals.get(token)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.principals.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.principals.is_empty()
    }
}

/// The caller, resolved from `Authorization: Bearer <token>`.
#[derive(Debug, Clone)]
pub struct Authenticated(pub Principal);

#[async_trait]
impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ApiError(ReconError::Unauthorized))?;

        match state.tokens.resolve(token) {
            Some(principal) => Ok(Self(principal.clone())),
            None => {
                tracing::warn!(path = %parts.uri.path(), "Unknown bearer token");
                Err(ApiError(ReconError::Unauthorized))
            }
        }
    }
}
