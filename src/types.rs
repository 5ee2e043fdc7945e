use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Backend user identifier (the access token `sub` claim).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

/// Cached snapshot of the signed-in user's profile.
///
/// Returned by login, refresh, `GET /auth/me` and `PATCH /auth/me`. The backend stays
/// authoritative; this copy may be refetched at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct UserProfile {
    pub id: UserId,
    pub email: String,
    pub username: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub is_active: bool,
    pub is_verified: bool,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(with = "timestamp")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "timestamp::option")]
    pub last_login_at: Option<OffsetDateTime>,
    #[serde(default, with = "timestamp::option")]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(default, with = "timestamp::option")]
    pub email_verified_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferences: Option<serde_json::Value>,
}

fn default_timezone() -> String {
    "UTC".into()
}

impl UserProfile {
    /// Create a profile with the required fields; everything optional starts empty.
    #[must_use]
    pub fn new(id: UserId, email: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id,
            email: email.into(),
            username: username.into(),
            full_name: None,
            bio: None,
            timezone: default_timezone(),
            is_active: true,
            is_verified: false,
            avatar_url: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
            last_login_at: None,
            updated_at: None,
            email_verified_at: None,
            preferences: None,
        }
    }

    #[must_use]
    pub fn with_full_name(mut self, name: impl Into<String>) -> Self {
        self.full_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_created_at(mut self, at: OffsetDateTime) -> Self {
        self.created_at = at;
        self
    }

    /// Name to show in the UI: full name when set, username otherwise.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.full_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.username)
    }
}

/// Token pair issued by `POST /auth/login` and `POST /auth/refresh`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
    pub user: UserProfile,
}

fn default_token_type() -> String {
    "bearer".into()
}

impl TokenResponse {
    #[must_use]
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_in: u64,
        user: UserProfile,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            token_type: default_token_type(),
            expires_in,
            user,
        }
    }
}

/// Body of `POST /auth/login`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub remember_me: bool,
}

impl LoginRequest {
    /// The backend stores emails lowercased.
    #[must_use]
    pub fn new(email: &str, password: impl Into<String>, remember_me: bool) -> Self {
        Self {
            email: email.trim().to_lowercase(),
            password: password.into(),
            remember_me,
        }
    }
}

/// Body of `POST /auth/register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    pub timezone: String,
    pub password: String,
    pub password_confirm: String,
}

impl RegisterRequest {
    #[must_use]
    pub fn new(email: &str, username: &str, password: impl Into<String>) -> Self {
        let password = password.into();
        Self {
            email: email.trim().to_lowercase(),
            username: username.trim().to_lowercase(),
            full_name: None,
            bio: None,
            timezone: default_timezone(),
            password_confirm: password.clone(),
            password,
        }
    }

    #[must_use]
    pub fn with_full_name(mut self, name: impl Into<String>) -> Self {
        self.full_name = Some(name.into());
        self
    }
}

/// Body of `PATCH /auth/me`. Unset fields are left untouched by the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Body of `POST /auth/change-password`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordChange {
    pub current_password: String,
    pub new_password: String,
    pub new_password_confirm: String,
}

impl PasswordChange {
    #[must_use]
    pub fn new(current: impl Into<String>, new: impl Into<String>) -> Self {
        let new = new.into();
        Self {
            current_password: current.into(),
            new_password_confirm: new.clone(),
            new_password: new,
        }
    }
}

/// Server-side session identifier (one live refresh token).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

/// Entry of `GET /auth/sessions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ActiveSession {
    pub id: SessionId,
    #[serde(with = "timestamp")]
    pub created_at: OffsetDateTime,
    #[serde(with = "timestamp")]
    pub expires_at: OffsetDateTime,
    #[serde(default)]
    pub device_info: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    /// Always `false` on the current backend.
    #[serde(default)]
    pub is_current: bool,
}

impl ActiveSession {
    #[must_use]
    pub fn new(id: SessionId, created_at: OffsetDateTime, expires_at: OffsetDateTime) -> Self {
        Self {
            id,
            created_at,
            expires_at,
            device_info: None,
            ip_address: None,
            is_current: false,
        }
    }

    #[must_use]
    pub fn with_device(mut self, device_info: impl Into<String>, ip_address: impl Into<String>) -> Self {
        self.device_info = Some(device_info.into());
        self.ip_address = Some(ip_address.into());
        self
    }
}

/// One row of the login audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct LoginAttempt {
    pub id: Uuid,
    pub email: String,
    pub ip_address: String,
    #[serde(default)]
    pub user_agent: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(with = "timestamp")]
    pub created_at: OffsetDateTime,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
}

/// Account security overview from `GET /auth/security`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct SecurityInfo {
    pub failed_login_attempts: u32,
    #[serde(default, with = "timestamp::option")]
    pub locked_until: Option<OffsetDateTime>,
    #[serde(with = "timestamp")]
    pub password_changed_at: OffsetDateTime,
    #[serde(default, with = "timestamp::option")]
    pub last_login_at: Option<OffsetDateTime>,
    /// Most recent first, at most ten.
    #[serde(default)]
    pub recent_login_attempts: Vec<LoginAttempt>,
    /// Number of unrevoked, unexpired refresh tokens.
    pub active_sessions: u32,
}

impl SecurityInfo {
    #[must_use]
    pub fn new(password_changed_at: OffsetDateTime, active_sessions: u32) -> Self {
        Self {
            failed_login_attempts: 0,
            locked_until: None,
            password_changed_at,
            last_login_at: None,
            recent_login_attempts: Vec::new(),
            active_sessions,
        }
    }

    /// Whether the account is locked out of password logins at `now`.
    #[must_use]
    pub fn is_locked_at(&self, now: OffsetDateTime) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }
}

/// Serde adapter for backend timestamps.
///
/// Writes RFC 3339. Reads RFC 3339 and also the naive ISO-8601 form the backend emits
/// for UTC datetimes (`2024-05-01T12:30:00.123456`), which is taken as UTC.
pub mod timestamp {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::format_description::well_known::{Iso8601, Rfc3339};
    use time::{OffsetDateTime, PrimitiveDateTime};

    pub fn parse(s: &str) -> Option<OffsetDateTime> {
        OffsetDateTime::parse(s, &Rfc3339)
            .ok()
            .or_else(|| {
                PrimitiveDateTime::parse(s, &Iso8601::DEFAULT)
                    .ok()
                    .map(PrimitiveDateTime::assume_utc)
            })
    }

    pub fn format(at: OffsetDateTime) -> String {
        at.format(&Rfc3339).unwrap_or_else(|_| at.unix_timestamp().to_string())
    }

    pub fn serialize<S: Serializer>(at: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*at))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<OffsetDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use time::OffsetDateTime;

        pub fn serialize<S: Serializer>(
            at: &Option<OffsetDateTime>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match at {
                Some(at) => super::serialize(at, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<OffsetDateTime>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(raw) => super::parse(&raw).map(Some).ok_or_else(|| {
                    serde::de::Error::custom(format!("invalid timestamp: {raw}"))
                }),
                None => Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const BACKEND_USER: &str = r#"{
        "email": "ada@example.com",
        "username": "ada",
        "full_name": "Ada Lovelace",
        "bio": null,
        "timezone": "Europe/London",
        "id": "5b0c3c1e-8f4e-4c1b-9c55-2f1d1f7f6a10",
        "is_active": true,
        "is_verified": false,
        "created_at": "2024-05-01T12:30:00.123456",
        "last_login_at": null,
        "avatar_url": null
    }"#;

    #[test]
    fn parses_backend_user_with_naive_timestamps() {
        let user: UserProfile = serde_json::from_str(BACKEND_USER).unwrap();
        assert_eq!(user.username, "ada");
        assert_eq!(user.timezone, "Europe/London");
        assert_eq!(user.created_at, datetime!(2024-05-01 12:30:00.123456 UTC));
        assert!(user.last_login_at.is_none());
        assert!(user.updated_at.is_none());
        assert_eq!(user.display_name(), "Ada Lovelace");
    }

    #[test]
    fn cached_user_survives_reserialization() {
        let user: UserProfile = serde_json::from_str(BACKEND_USER).unwrap();
        let cached = serde_json::to_string(&user).unwrap();
        let restored: UserProfile = serde_json::from_str(&cached).unwrap();
        assert_eq!(restored, user);
    }

    #[test]
    fn rfc3339_timestamps_with_offset() {
        assert_eq!(
            timestamp::parse("2024-05-01T14:30:00+02:00"),
            Some(datetime!(2024-05-01 12:30:00 UTC))
        );
        assert!(timestamp::parse("yesterday").is_none());
    }

    #[test]
    fn display_name_falls_back_to_username() {
        let user = UserProfile::new(UserId(Uuid::nil()), "b@example.com", "bob");
        assert_eq!(user.display_name(), "bob");
        let blank = user.with_full_name("  ");
        assert_eq!(blank.display_name(), "bob");
    }

    #[test]
    fn login_request_lowercases_email() {
        let req = LoginRequest::new(" Ada@Example.COM ", "pw", true);
        assert_eq!(req.email, "ada@example.com");
        assert!(req.remember_me);
    }

    #[test]
    fn profile_update_skips_unset_fields() {
        let update = ProfileUpdate {
            bio: Some("likes thin-and-light".into()),
            ..ProfileUpdate::default()
        };
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            serde_json::json!({ "bio": "likes thin-and-light" })
        );
    }

    #[test]
    fn parses_security_overview() {
        let json = r#"{
            "failed_login_attempts": 2,
            "locked_until": "2025-03-01T12:15:00",
            "password_changed_at": "2024-05-01T12:30:00",
            "last_login_at": null,
            "recent_login_attempts": [{
                "id": "0f8b5f6e-2a43-4b8e-9d0c-3c1d2e4f5a6b",
                "email": "ada@example.com",
                "ip_address": "203.0.113.7",
                "user_agent": "Mozilla/5.0",
                "success": false,
                "failure_reason": "Invalid password",
                "created_at": "2025-03-01T12:00:00",
                "country": null,
                "city": null
            }],
            "active_sessions": 3
        }"#;
        let info: SecurityInfo = serde_json::from_str(json).unwrap();

        assert_eq!(info.active_sessions, 3);
        assert_eq!(info.recent_login_attempts.len(), 1);
        assert!(!info.recent_login_attempts[0].success);
        assert!(info.is_locked_at(datetime!(2025-03-01 12:10:00 UTC)));
        assert!(!info.is_locked_at(datetime!(2025-03-01 12:20:00 UTC)));
    }

    #[test]
    fn parses_session_listing() {
        let json = r#"[{
            "id": "7d9e2c4a-1b3f-4e5d-8a6b-9c0d1e2f3a4b",
            "created_at": "2025-03-01T08:00:00",
            "expires_at": "2025-03-08T08:00:00",
            "device_info": null,
            "ip_address": "198.51.100.4",
            "is_current": false
        }]"#;
        let sessions: Vec<ActiveSession> = serde_json::from_str(json).unwrap();

        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id.to_string(), "7d9e2c4a-1b3f-4e5d-8a6b-9c0d1e2f3a4b");
        assert_eq!(sessions[0].expires_at - sessions[0].created_at, time::Duration::days(7));
        assert_eq!(sessions[0].ip_address.as_deref(), Some("198.51.100.4"));
    }

    #[test]
    fn token_response_defaults_token_type() {
        let json = format!(
            r#"{{"access_token":"a","refresh_token":"r","expires_in":1800,"user":{BACKEND_USER}}}"#
        );
        let resp: TokenResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(resp.token_type, "bearer");
        assert_eq!(resp.expires_in, 1800);
    }
}
