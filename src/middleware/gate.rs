use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use axum_extra::extract::CookieJar;
use time::OffsetDateTime;

use super::config::EdgeGateConfig;
use crate::guard::{RouteKind, redirect_param};
use crate::token;

/// What the edge gate does with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Pass,
    /// Protected route without a usable token.
    RedirectToLogin(String),
    /// Login or registration page while already signed in.
    RedirectAway(String),
}

/// Gate decision for `path_and_query` given the mirrored token, at `now`.
///
/// Tokens are decoded, not verified, and any expired or malformed token counts as no
/// token at all.
#[must_use]
pub fn evaluate(
    config: &EdgeGateConfig,
    path_and_query: &str,
    token: Option<&str>,
    now: OffsetDateTime,
) -> GateOutcome {
    let routes = config.routes();
    let signed_in = token.is_some_and(|t| {
        token::inspect_at(t, now, time::Duration::ZERO).is_usable()
    });

    match routes.classify(path_and_query) {
        RouteKind::Protected if !signed_in => {
            GateOutcome::RedirectToLogin(routes.login_redirect(path_and_query))
        }
        RouteKind::Auth if signed_in => GateOutcome::RedirectAway(
            routes.post_login_target(redirect_param(path_and_query).as_deref()),
        ),
        _ => GateOutcome::Pass,
    }
}

/// Axum middleware applying [`evaluate`] to every request.
///
/// Mount with `axum::middleware::from_fn_with_state(config, edge_gate)`.
pub async fn edge_gate(
    State(config): State<EdgeGateConfig>,
    jar: CookieJar,
    request: Request,
    next: Next,
) -> Response {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map_or_else(|| request.uri().path().to_string(), |pq| pq.as_str().to_string());
    let token = jar.get(config.cookie_name()).map(|c| c.value().to_string());

    match evaluate(&config, &path_and_query, token.as_deref(), OffsetDateTime::now_utc()) {
        GateOutcome::Pass => next.run(request).await,
        GateOutcome::RedirectToLogin(target) => {
            tracing::debug!(path = %path_and_query, had_token = token.is_some(), "Edge gate: login required");
            Redirect::temporary(&target).into_response()
        }
        GateOutcome::RedirectAway(target) => {
            tracing::debug!(path = %path_and_query, target = %target, "Edge gate: already signed in");
            Redirect::temporary(&target).into_response()
        }
    }
}
