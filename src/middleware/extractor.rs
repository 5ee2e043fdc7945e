use axum::extract::{FromRef, FromRequestParts};
use axum::http::header;
use axum::http::request::Parts;

use super::config::EdgeGateConfig;
use super::error::GateRejection;
use crate::cookies::auth_cookie_from_header;
use crate::token::{self, UnverifiedClaims};
use crate::types::UserId;

/// Signed-in user as seen by the edge: the mirrored access token and its claims.
///
/// The claims are unverified. Use them to render, never to authorize; the API checks
/// the token on every call. Rejects with a redirect to login.
///
/// # Example
///
/// ```rust,ignore
/// async fn dashboard(session: MirroredSession) -> impl IntoResponse {
///     format!("Hello, {}", session.claims.email().unwrap_or("there"))
/// }
/// ```
#[derive(Debug, Clone)]
pub struct MirroredSession {
    pub access_token: String,
    pub claims: UnverifiedClaims,
}

impl MirroredSession {
    /// The `sub` claim as a user id, when it is a UUID.
    #[must_use]
    pub fn user_id(&self) -> Option<UserId> {
        self.claims
            .subject()
            .and_then(|sub| sub.parse().ok())
            .map(UserId)
    }
}

impl<S> FromRequestParts<S> for MirroredSession
where
    S: Send + Sync,
    EdgeGateConfig: FromRef<S>,
{
    type Rejection = GateRejection;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let config = EdgeGateConfig::from_ref(state);
        let path = parts
            .uri
            .path_and_query()
            .map_or_else(|| parts.uri.path().to_string(), |pq| pq.as_str().to_string());
        let login_required = || GateRejection::LoginRequired(config.routes().login_redirect(&path));

        // HTTP/2 clients may split cookies over several headers
        let access_token = parts
            .headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(|value| auth_cookie_from_header(value, config.cookie_name()))
            .filter(|t| token::is_token_valid(t))
            .ok_or_else(login_required)?;
        let claims = token::decode_claims(&access_token).ok_or_else(login_required)?;

        Ok(Self {
            access_token,
            claims,
        })
    }
}
