//! Caller identity for HTTP handlers and live subscriptions.

use a6hub_core::error::CoreError;
use a6hub_core::types::DbId;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;

use crate::auth::jwt::{validate_token, JwtConfig};
use crate::error::AppError;
use crate::state::AppState;

/// The caller behind a valid `Authorization: Bearer <jwt>` header.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: DbId,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)?;
        let user_id = authenticate(token, &state.config.jwt)?;
        Ok(AuthUser { user_id })
    }
}

/// Resolve a raw token to the user id it was issued for.
///
/// Shared by the header extractor and the `?token=` query of the
/// subscription endpoint.
pub fn authenticate(token: &str, jwt: &JwtConfig) -> Result<DbId, CoreError> {
    validate_token(token, jwt)
        .map(|claims| claims.sub)
        .map_err(|_| CoreError::Unauthorized("Invalid or expired token".into()))
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, CoreError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| CoreError::Unauthorized("Missing Authorization header".into()))?;

    value
        .to_str()
        .ok()
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            CoreError::Unauthorized("Invalid Authorization format. Expected: Bearer <token>".into())
        })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use axum::http::HeaderValue;

    use super::*;
    use crate::auth::jwt::generate_access_token;

    fn headers(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn bearer_prefix_is_required() {
        assert_eq!(bearer_token(&headers("Bearer abc")).unwrap(), "abc");
        assert_matches!(
            bearer_token(&headers("Basic abc")),
            Err(CoreError::Unauthorized(_))
        );
        assert_matches!(
            bearer_token(&headers("Bearer ")),
            Err(CoreError::Unauthorized(_))
        );
        assert_matches!(
            bearer_token(&HeaderMap::new()),
            Err(CoreError::Unauthorized(msg)) if msg.contains("Missing")
        );
    }

    #[test]
    fn token_resolves_to_its_subject() {
        let jwt = JwtConfig {
            secret: "middleware-test-secret-long-enough".into(),
        };
        let token = generate_access_token(7, 60, &jwt).unwrap();
        assert_eq!(authenticate(&token, &jwt).unwrap(), 7);
        assert_matches!(authenticate("nope", &jwt), Err(CoreError::Unauthorized(_)));
    }
}
