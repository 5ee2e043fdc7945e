use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::backend::AuthBackend;
use crate::config::SessionConfig;
use crate::error::Error;
use crate::types::{
    ActiveSession, LoginRequest, PasswordChange, ProfileUpdate, RegisterRequest, SecurityInfo,
    SessionId, TokenResponse, UserProfile,
};

#[derive(Serialize)]
struct RefreshTokenBody<'a> {
    refresh_token: &'a str,
}

/// HTTP client for the laptop API's `/auth` endpoints.
#[derive(Debug, Clone)]
pub struct ApiClient {
    config: SessionConfig,
    http: reqwest::Client,
}

impl ApiClient {
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    async fn post_json<B, T>(
        &self,
        path: &str,
        operation: &'static str,
        bearer: Option<&str>,
        body: &B,
    ) -> Result<T, Error>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut request = self.http.post(self.config.endpoint(path)?).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = Self::ensure_success(request.send().await?, operation).await?;
        response.json::<T>().await.map_err(Into::into)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        operation: &'static str,
        bearer: &str,
    ) -> Result<T, Error> {
        let response = self
            .http
            .get(self.config.endpoint(path)?)
            .bearer_auth(bearer)
            .send()
            .await?;
        let response = Self::ensure_success(response, operation).await?;
        response.json::<T>().await.map_err(Into::into)
    }

    async fn post_discard<B: Serialize + ?Sized>(
        &self,
        path: &str,
        operation: &'static str,
        bearer: &str,
        body: Option<&B>,
    ) -> Result<(), Error> {
        let mut request = self.http.post(self.config.endpoint(path)?).bearer_auth(bearer);
        if let Some(body) = body {
            request = request.json(body);
        }
        Self::ensure_success(request.send().await?, operation).await?;
        Ok(())
    }

    /// Checks HTTP response status; returns the response on success or an error with details.
    async fn ensure_success(
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<reqwest::Response, Error> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(Error::Api {
            operation,
            status: Some(status),
            detail: error_detail(&body),
        })
    }
}

/// FastAPI wraps messages as `{"detail": "..."}`; fall back to the raw body.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| match v.get("detail") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
            None => v.get("message").and_then(|m| m.as_str()).map(str::to_string),
        })
        .unwrap_or_else(|| body.to_string())
}

impl AuthBackend for ApiClient {
    async fn login(&self, request: &LoginRequest) -> Result<TokenResponse, Error> {
        self.post_json("auth/login", "login", None, request).await
    }

    async fn register(&self, request: &RegisterRequest) -> Result<UserProfile, Error> {
        self.post_json("auth/register", "registration", None, request)
            .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, Error> {
        self.post_json(
            "auth/refresh",
            "token refresh",
            None,
            &RefreshTokenBody { refresh_token },
        )
        .await
    }

    async fn logout(&self, access_token: &str, refresh_token: &str) -> Result<(), Error> {
        self.post_discard(
            "auth/logout",
            "logout",
            access_token,
            Some(&RefreshTokenBody { refresh_token }),
        )
        .await
    }

    async fn logout_all(&self, access_token: &str) -> Result<(), Error> {
        self.post_discard::<()>("auth/logout-all", "logout of all sessions", access_token, None)
            .await
    }

    async fn change_password(
        &self,
        access_token: &str,
        change: &PasswordChange,
    ) -> Result<(), Error> {
        self.post_discard("auth/change-password", "password change", access_token, Some(change))
            .await
    }

    async fn current_user(&self, access_token: &str) -> Result<UserProfile, Error> {
        self.get_json("auth/me", "profile request", access_token).await
    }

    async fn update_user(
        &self,
        access_token: &str,
        update: &ProfileUpdate,
    ) -> Result<UserProfile, Error> {
        let response = self
            .http
            .patch(self.config.endpoint("auth/me")?)
            .bearer_auth(access_token)
            .json(update)
            .send()
            .await?;
        let response = Self::ensure_success(response, "profile update").await?;
        response.json::<UserProfile>().await.map_err(Into::into)
    }

    async fn sessions(&self, access_token: &str) -> Result<Vec<ActiveSession>, Error> {
        self.get_json("auth/sessions", "session listing", access_token)
            .await
    }

    async fn revoke_session(&self, access_token: &str, session: SessionId) -> Result<(), Error> {
        let url = self.config.endpoint(&format!("auth/sessions/{session}"))?;
        let response = self.http.delete(url).bearer_auth(access_token).send().await?;
        Self::ensure_success(response, "session revocation").await?;
        Ok(())
    }

    async fn security_info(&self, access_token: &str) -> Result<SecurityInfo, Error> {
        self.get_json("auth/security", "security overview", access_token)
            .await
    }
}
