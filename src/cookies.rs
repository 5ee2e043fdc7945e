use std::sync::Mutex;

use cookie::{Cookie, SameSite};
use time::{Duration, OffsetDateTime};

/// Cookie mirroring the access token for pre-render route gating.
pub const AUTH_COOKIE_NAME: &str = "auth_token";

/// Lifetime of a remembered mirror cookie. Otherwise it is a session cookie.
pub const REMEMBERED_COOKIE_TTL: Duration = Duration::days(7);

/// Create the access token mirror cookie.
pub fn auth_cookie(name: &str, access_token: &str, remember_me: bool, secure: bool) -> Cookie<'static> {
    let builder = Cookie::build((name.to_string(), access_token.to_string()))
        .secure(secure)
        .same_site(SameSite::Lax)
        .path("/");

    if remember_me {
        builder.max_age(REMEMBERED_COOKIE_TTL).build()
    } else {
        builder.build()
    }
}

/// Create removal cookies for every attribute variant the mirror may have been set with.
///
/// Browsers key cookies on name, domain and path only, but older writers set the mirror
/// with different `SameSite` policies, and some clients refuse a removal whose
/// attributes disagree with the stored cookie. One removal per variant covers them all.
pub fn clear_auth_cookies(name: &str) -> Vec<Cookie<'static>> {
    [None, Some(SameSite::Lax), Some(SameSite::Strict), Some(SameSite::None)]
        .into_iter()
        .map(|same_site| {
            let mut builder = Cookie::build((name.to_string(), ""))
                .path("/")
                .max_age(Duration::ZERO)
                .expires(OffsetDateTime::UNIX_EPOCH);
            if let Some(same_site) = same_site {
                builder = builder.same_site(same_site);
            }
            // SameSite=None is only honored on secure cookies.
            if same_site == Some(SameSite::None) {
                builder = builder.secure(true);
            }
            builder.build()
        })
        .collect()
}

/// Read the mirror cookie from a raw `Cookie` request header.
pub fn auth_cookie_from_header(header: &str, name: &str) -> Option<String> {
    Cookie::split_parse(header)
        .filter_map(Result::ok)
        .find(|c| c.name() == name)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Default)]
struct MirrorState {
    value: Option<String>,
    pending: Vec<Cookie<'static>>,
}

/// Cookie copy of the access token, kept alongside the primary session store.
///
/// Only the edge gate reads it. Each change replaces the pending `Set-Cookie` values,
/// which the host drains with [`take_pending`](Self::take_pending) and forwards to the
/// browser. Only the latest state is ever pending.
#[derive(Debug)]
pub struct CookieMirror {
    name: String,
    secure: bool,
    state: Mutex<MirrorState>,
}

impl CookieMirror {
    #[must_use]
    pub fn new(name: impl Into<String>, secure: bool) -> Self {
        Self {
            name: name.into(),
            secure,
            state: Mutex::new(MirrorState::default()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current mirrored token, if any.
    #[must_use]
    pub fn value(&self) -> Option<String> {
        self.state.lock().ok().and_then(|s| s.value.clone())
    }

    pub(crate) fn mirror(&self, access_token: &str, remember_me: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.value = Some(access_token.to_string());
            state.pending = vec![auth_cookie(&self.name, access_token, remember_me, self.secure)];
        }
    }

    pub(crate) fn expire(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.value = None;
            state.pending = clear_auth_cookies(&self.name);
        }
    }

    /// Drain the cookies describing the latest change, if not drained yet.
    pub fn take_pending(&self) -> Vec<Cookie<'static>> {
        self.state
            .lock()
            .map(|mut s| std::mem::take(&mut s.pending))
            .unwrap_or_default()
    }
}
