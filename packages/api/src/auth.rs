// ABOUTME: Bearer authentication for users and for registered compute targets
// ABOUTME: Only token digests are compared; a failed check has no side effects

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use hatchery_core::utils::hash_token;
use hatchery_core::{ComputeTarget, TargetKind};
use std::collections::HashMap;
use tracing::warn;

/// Resolves a user bearer token to a user id
pub trait UserAuthenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Option<String>;
}

/// Fixed token table loaded from configuration
pub struct StaticUserTokens {
    by_digest: HashMap<String, String>,
}

impl StaticUserTokens {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self {
            by_digest: tokens
                .into_iter()
                .map(|(token, user)| (hash_token(&token), user))
                .collect(),
        }
    }
}

impl UserAuthenticator for StaticUserTokens {
    fn authenticate(&self, token: &str) -> Option<String> {
        self.by_digest.get(&hash_token(token)).cloned()
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Authenticated end user
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: String,
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(ApiError::Unauthorized)?;
        state
            .users
            .authenticate(token)
            .map(|id| CurrentUser { id })
            .ok_or_else(|| {
                warn!(path = %parts.uri.path(), "Invalid user token");
                ApiError::Unauthorized
            })
    }
}

/// Check that the request carries the bearer secret of registered target `target_id`
pub async fn authorize_agent(
    state: &AppState,
    headers: &HeaderMap,
    target_id: &str,
) -> Result<ComputeTarget, ApiError> {
    let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
    // Unknown targets answer like bad tokens so ids cannot be enumerated
    let target = match state.store.get_target(target_id).await {
        Ok(target) => target,
        Err(e) if e.is_not_found() => return Err(ApiError::Unauthorized),
        Err(e) => return Err(e.into()),
    };

    let expected = target.agent_token_hash.as_deref();
    if target.kind() != TargetKind::Registered || expected != Some(hash_token(token).as_str()) {
        warn!(target_id = %target_id, "Rejected agent credentials");
        return Err(ApiError::Unauthorized);
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer hat_abc"));
        assert_eq!(bearer_token(&headers), Some("hat_abc"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_static_tokens() {
        let users = StaticUserTokens::new(HashMap::from([(
            "tok-alice".to_string(),
            "alice".to_string(),
        )]));
        assert_eq!(users.authenticate("tok-alice").as_deref(), Some("alice"));
        assert_eq!(users.authenticate("tok-mallory"), None);
    }
}
