//! Bearer-token authentication.

use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use serde::Deserialize;
use tracing::debug;

use carechat_store::User;

use crate::api::AppState;
use crate::error::ServerError;

/// The user behind the request's bearer token.
pub struct AuthUser(pub User);

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        // Browsers cannot set headers on a WebSocket handshake, so `?token=`
        // is accepted as well.
        let token = bearer_token(&parts.headers)
            .or_else(|| {
                Query::<TokenQuery>::try_from_uri(&parts.uri)
                    .ok()
                    .and_then(|Query(q)| q.token)
            })
            .ok_or(ServerError::Unauthorized)?;

        let user = state.db.lock().await.user_for_token(&token)?;
        match user {
            Some(user) => Ok(AuthUser(user)),
            None => {
                debug!("Rejected unknown bearer token");
                Err(ServerError::Unauthorized)
            }
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_prefix_is_required() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc123"));

        headers.insert(AUTHORIZATION, "abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, "Bearer   ".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
