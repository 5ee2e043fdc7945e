use axum::response::{IntoResponse, Redirect, Response};

/// Rejection of the [`MirroredSession`](super::MirroredSession) extractor.
#[derive(Debug, thiserror::Error)]
pub enum GateRejection {
    /// No usable token cookie; carries the login URL to send the user to.
    #[error("Login required")]
    LoginRequired(String),
}

impl IntoResponse for GateRejection {
    fn into_response(self) -> Response {
        match self {
            Self::LoginRequired(login_url) => Redirect::temporary(&login_url).into_response(),
        }
    }
}
