use std::future::Future;

use crate::error::Error;
use crate::types::{
    ActiveSession, LoginRequest, PasswordChange, ProfileUpdate, RegisterRequest, SecurityInfo,
    SessionId, TokenResponse, UserProfile,
};

/// The auth endpoints the session manager talks to.
///
/// [`ApiClient`](crate::ApiClient) implements this over HTTP. Tests and embedders can
/// provide their own implementation.
///
/// # Example
///
/// ```rust,ignore
/// impl AuthBackend for CountingBackend {
///     async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, Error> {
///         self.calls.fetch_add(1, Ordering::SeqCst);
///         self.inner.refresh(refresh_token).await
///     }
///     // ...
/// }
/// ```
pub trait AuthBackend: Send + Sync + 'static {
    /// `POST /auth/login`.
    fn login(
        &self,
        request: &LoginRequest,
    ) -> impl Future<Output = Result<TokenResponse, Error>> + Send;

    /// `POST /auth/register`. Returns the new user; no tokens are issued.
    fn register(
        &self,
        request: &RegisterRequest,
    ) -> impl Future<Output = Result<UserProfile, Error>> + Send;

    /// `POST /auth/refresh`. The old refresh token is revoked by the server.
    fn refresh(
        &self,
        refresh_token: &str,
    ) -> impl Future<Output = Result<TokenResponse, Error>> + Send;

    /// `POST /auth/logout`. Revokes `refresh_token` server side.
    fn logout(
        &self,
        access_token: &str,
        refresh_token: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// `POST /auth/logout-all`. Revokes every refresh token of the user.
    fn logout_all(&self, access_token: &str) -> impl Future<Output = Result<(), Error>> + Send;

    /// `POST /auth/change-password`. The server revokes all refresh tokens on success.
    fn change_password(
        &self,
        access_token: &str,
        change: &PasswordChange,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// `GET /auth/me`.
    fn current_user(
        &self,
        access_token: &str,
    ) -> impl Future<Output = Result<UserProfile, Error>> + Send;

    /// `PATCH /auth/me`.
    fn update_user(
        &self,
        access_token: &str,
        update: &ProfileUpdate,
    ) -> impl Future<Output = Result<UserProfile, Error>> + Send;

    /// `GET /auth/sessions`. Live refresh tokens of the user, newest first.
    fn sessions(
        &self,
        access_token: &str,
    ) -> impl Future<Output = Result<Vec<ActiveSession>, Error>> + Send;

    /// `DELETE /auth/sessions/{id}`. Unknown or already revoked ids answer 404.
    fn revoke_session(
        &self,
        access_token: &str,
        session: SessionId,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// `GET /auth/security`.
    fn security_info(
        &self,
        access_token: &str,
    ) -> impl Future<Output = Result<SecurityInfo, Error>> + Send;
}
