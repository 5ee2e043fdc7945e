//! Credential store: the single authoritative session record for one client context.

use std::sync::Mutex;

use time::OffsetDateTime;

use crate::cookies::CookieMirror;
use crate::store::{SessionStore, StoreError};
use crate::types::{TokenResponse, UserProfile, timestamp};

pub(crate) const ACCESS_TOKEN_KEY: &str = "access_token";
pub(crate) const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub(crate) const USER_KEY: &str = "user";
pub(crate) const REMEMBER_ME_KEY: &str = "remember_me";
pub(crate) const LAST_ACTIVITY_KEY: &str = "last_activity";

const SESSION_KEYS: [&str; 5] = [
    ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
    USER_KEY,
    REMEMBER_ME_KEY,
    LAST_ACTIVITY_KEY,
];

/// Client-side view of an authenticated (or half-authenticated) session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user: Option<UserProfile>,
    pub remember_me: bool,
    pub last_activity: Option<OffsetDateTime>,
}

impl SessionRecord {
    /// Record for a fresh login or refresh response.
    #[must_use]
    pub fn from_tokens(tokens: TokenResponse, remember_me: bool, now: OffsetDateTime) -> Self {
        Self {
            access_token: Some(tokens.access_token),
            refresh_token: Some(tokens.refresh_token),
            user: Some(tokens.user),
            remember_me,
            last_activity: Some(now),
        }
    }

    /// Record holding only the user, as left behind by registration.
    #[must_use]
    pub fn user_only(user: UserProfile) -> Self {
        Self {
            access_token: None,
            refresh_token: None,
            user: Some(user),
            remember_me: false,
            last_activity: None,
        }
    }

    /// A record without an access token is not a login, whatever else it holds.
    #[must_use]
    pub fn has_access_token(&self) -> bool {
        self.access_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// Which backend a session lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Durable,
    Ephemeral,
}

impl StoreKind {
    #[must_use]
    pub fn for_remember_me(remember_me: bool) -> Self {
        if remember_me { Self::Durable } else { Self::Ephemeral }
    }

    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Durable => Self::Ephemeral,
            Self::Ephemeral => Self::Durable,
        }
    }
}

/// Monotonic counter bumped whenever the session is replaced or cleared.
///
/// Work that started against an older session carries the old value and is refused
/// on commit.
pub type Generation = u64;

/// Persists the [`SessionRecord`] in exactly one of two stores, chosen by `remember_me`.
pub struct CredentialStore<D, E> {
    durable: D,
    ephemeral: E,
    cookies: CookieMirror,
    // Serializes writers and carries the clear generation.
    generation: Mutex<Generation>,
}

impl<D: SessionStore, E: SessionStore> CredentialStore<D, E> {
    pub fn new(durable: D, ephemeral: E, cookies: CookieMirror) -> Self {
        Self {
            durable,
            ephemeral,
            cookies,
            generation: Mutex::new(0),
        }
    }

    pub fn durable(&self) -> &D {
        &self.durable
    }

    pub fn ephemeral(&self) -> &E {
        &self.ephemeral
    }

    pub fn cookies(&self) -> &CookieMirror {
        &self.cookies
    }

    fn backend(&self, kind: StoreKind) -> &dyn SessionStore {
        match kind {
            StoreKind::Durable => &self.durable,
            StoreKind::Ephemeral => &self.ephemeral,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Generation>, StoreError> {
        self.generation.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Current session generation.
    pub fn generation(&self) -> Generation {
        self.generation
            .lock()
            .map_or_else(|poisoned| *poisoned.into_inner(), |g| *g)
    }

    /// Replace the stored session.
    ///
    /// All fields go to the durable store when `remember_me` is set, to the ephemeral
    /// store otherwise, and every session key is removed from the other store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a backend write fails.
    pub fn save(&self, session: &SessionRecord, remember_me: bool) -> Result<(), StoreError> {
        let mut guard = self.lock()?;
        *guard = guard.wrapping_add(1);
        self.write(session, remember_me)
    }

    /// Like [`save`](Self::save), but only if the session was neither cleared nor
    /// replaced since `generation` was observed.
    ///
    /// Returns `false` without writing when another writer won the race.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a backend write fails.
    pub fn save_if_current(
        &self,
        generation: Generation,
        session: &SessionRecord,
        remember_me: bool,
    ) -> Result<bool, StoreError> {
        let mut guard = self.lock()?;
        if *guard != generation {
            return Ok(false);
        }
        *guard = guard.wrapping_add(1);
        self.write(session, remember_me)?;
        Ok(true)
    }

    fn write(&self, session: &SessionRecord, remember_me: bool) -> Result<(), StoreError> {
        let kind = StoreKind::for_remember_me(remember_me);
        let (target, other) = (self.backend(kind), self.backend(kind.other()));

        for key in SESSION_KEYS {
            other.remove(key)?;
        }

        put(target, ACCESS_TOKEN_KEY, session.access_token.as_deref())?;
        put(target, REFRESH_TOKEN_KEY, session.refresh_token.as_deref())?;
        let user = session
            .user
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(StoreError::Format)?;
        put(target, USER_KEY, user.as_deref())?;
        target.set(REMEMBER_ME_KEY, if remember_me { "true" } else { "false" })?;
        let last_activity = session.last_activity.map(timestamp::format);
        put(target, LAST_ACTIVITY_KEY, last_activity.as_deref())?;

        match session.access_token.as_deref() {
            Some(token) if !token.is_empty() => self.cookies.mirror(token, remember_me),
            _ => self.cookies.expire(),
        }
        Ok(())
    }

    /// Which store currently holds the session, durable first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a backend read fails.
    pub fn active_kind(&self) -> Result<Option<StoreKind>, StoreError> {
        let _guard = self.lock()?;
        self.locate()
    }

    // Callers hold the generation lock.
    fn locate(&self) -> Result<Option<StoreKind>, StoreError> {
        for kind in [StoreKind::Durable, StoreKind::Ephemeral] {
            let backend = self.backend(kind);
            for key in SESSION_KEYS {
                if backend.get(key)?.is_some() {
                    return Ok(Some(kind));
                }
            }
        }
        Ok(None)
    }

    /// Read the session, durable store first, falling back to the ephemeral one.
    ///
    /// All fields come from the same store and the same write: a concurrent `save` or
    /// `clear` is observed entirely or not at all. An unparseable cached user is purged
    /// and read as absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a backend read fails.
    pub fn read(&self) -> Result<Option<SessionRecord>, StoreError> {
        let _guard = self.lock()?;
        let Some(kind) = self.locate()? else {
            return Ok(None);
        };
        let backend = self.backend(kind);

        let user = match backend.get(USER_KEY)? {
            Some(raw) => match serde_json::from_str::<UserProfile>(&raw) {
                Ok(user) => Some(user),
                Err(e) => {
                    tracing::warn!(error = %e, store = ?kind, "Purging unreadable cached user");
                    backend.remove(USER_KEY)?;
                    None
                }
            },
            None => None,
        };

        let remember_me = match backend.get(REMEMBER_ME_KEY)?.as_deref() {
            Some(flag) => flag == "true",
            None => kind == StoreKind::Durable,
        };
        let last_activity = backend
            .get(LAST_ACTIVITY_KEY)?
            .and_then(|raw| timestamp::parse(&raw));

        Ok(Some(SessionRecord {
            access_token: backend.get(ACCESS_TOKEN_KEY)?.filter(|t| !t.is_empty()),
            refresh_token: backend.get(REFRESH_TOKEN_KEY)?.filter(|t| !t.is_empty()),
            user,
            remember_me,
            last_activity,
        }))
    }

    /// Replace the cached user in whichever store holds the session.
    ///
    /// Returns `false` when there is no session to update.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a backend read or write fails.
    pub fn update_user(&self, user: &UserProfile) -> Result<bool, StoreError> {
        let _guard = self.lock()?;
        let Some(kind) = self.locate()? else {
            return Ok(false);
        };
        let raw = serde_json::to_string(user)?;
        self.backend(kind).set(USER_KEY, &raw)?;
        Ok(true)
    }

    /// Record `at` as the last user interaction, in whichever store holds the session.
    ///
    /// Returns `false` when there is no session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a backend read or write fails.
    pub fn touch(&self, at: OffsetDateTime) -> Result<bool, StoreError> {
        let _guard = self.lock()?;
        let Some(kind) = self.locate()? else {
            return Ok(false);
        };
        self.backend(kind)
            .set(LAST_ACTIVITY_KEY, &timestamp::format(at))?;
        Ok(true)
    }

    /// Like [`clear`](Self::clear), but only if the session is still the one observed
    /// at `generation`. Returns whether it cleared.
    ///
    /// # Errors
    ///
    /// Returns the first [`StoreError`] raised by a backend.
    pub fn clear_if_current(&self, generation: Generation) -> Result<bool, StoreError> {
        let mut guard = self.lock()?;
        if *guard != generation {
            return Ok(false);
        }
        *guard = guard.wrapping_add(1);
        self.remove_all()?;
        Ok(true)
    }

    /// Remove every session field from both stores and expire the cookie mirror.
    ///
    /// Always attempts every removal; the first error, if any, is returned afterwards.
    /// Invalidates all in-flight work holding an older [`Generation`]. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the first [`StoreError`] raised by a backend.
    pub fn clear(&self) -> Result<(), StoreError> {
        let mut guard = self.generation.lock().unwrap_or_else(|poisoned| {
            self.generation.clear_poison();
            poisoned.into_inner()
        });
        *guard = guard.wrapping_add(1);
        self.remove_all()
    }

    fn remove_all(&self) -> Result<(), StoreError> {
        let mut first_error = None;
        for kind in [StoreKind::Durable, StoreKind::Ephemeral] {
            let backend = self.backend(kind);
            for key in SESSION_KEYS {
                if let Err(e) = backend.remove(key) {
                    tracing::warn!(error = %e, key, store = ?kind, "Failed to remove session field");
                    first_error.get_or_insert(e);
                }
            }
        }
        self.cookies.expire();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn put(store: &dyn SessionStore, key: &str, value: Option<&str>) -> Result<(), StoreError> {
    match value {
        Some(value) => store.set(key, value),
        None => store.remove(key),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::cookies::AUTH_COOKIE_NAME;
    use crate::store::MemoryStore;
    use crate::types::UserId;
    use time::macros::datetime;

    pub(crate) type MemoryCredentials = CredentialStore<MemoryStore, MemoryStore>;

    pub(crate) fn memory_credentials() -> MemoryCredentials {
        CredentialStore::new(
            MemoryStore::new(),
            MemoryStore::new(),
            CookieMirror::new(AUTH_COOKIE_NAME, false),
        )
    }

    pub(crate) fn sample_user() -> UserProfile {
        UserProfile::new(
            UserId(uuid::Uuid::from_u128(0x5b0c3c1e_8f4e_4c1b_9c55_2f1d1f7f6a10)),
            "ada@example.com",
            "ada",
        )
        .with_full_name("Ada Lovelace")
        .with_created_at(datetime!(2024-05-01 12:30:00 UTC))
    }

    pub(crate) fn sample_record(access_token: &str, remember_me: bool) -> SessionRecord {
        SessionRecord {
            access_token: Some(access_token.to_string()),
            refresh_token: Some("refresh-1".to_string()),
            user: Some(sample_user()),
            remember_me,
            last_activity: Some(datetime!(2025-03-01 12:00:00 UTC)),
        }
    }
}
