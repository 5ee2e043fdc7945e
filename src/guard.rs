//! Route gating: which routes need a session, and the client-side guard state machine.

use tokio::sync::watch;

/// Lifecycle state of the client-side route guard.
///
/// ```text
/// Uninitialized -> Loading -> Authenticated | Unauthenticated
/// Authenticated -> Refreshing -> Authenticated | LoggedOut
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    /// Not mounted yet; render a placeholder so server and client output agree.
    Uninitialized,
    /// Reading the stored session or refetching the user.
    Loading,
    Authenticated,
    Unauthenticated,
    /// Access token is being renewed; protected content is blocked meanwhile.
    Refreshing,
    /// The session ended (logout, refresh failure, inactivity).
    LoggedOut,
}

impl GuardState {
    /// Whether the state machine allows moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: GuardState) -> bool {
        use GuardState::*;
        matches!(
            (self, next),
            (Uninitialized, Loading)
                | (Loading, Authenticated | Unauthenticated)
                | (Authenticated, Refreshing | LoggedOut | Loading)
                | (Refreshing, Authenticated | LoggedOut)
                // a new login starts a fresh session instance
                | (Unauthenticated | LoggedOut, Loading)
                | (Unauthenticated, Authenticated)
                | (LoggedOut, Authenticated)
                // logout is always reachable
                | (Loading | Unauthenticated, LoggedOut)
        )
    }
}

/// Route classification used by both the edge gate and the client guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// Requires a session.
    Protected,
    /// Login or registration; a live session is bounced away from these.
    Auth,
    Public,
}

/// Route tables and redirect targets.
#[derive(Debug, Clone)]
pub struct RouteRules {
    protected_prefixes: Vec<String>,
    auth_routes: Vec<String>,
    login_path: String,
    default_route: String,
}

impl Default for RouteRules {
    fn default() -> Self {
        Self {
            protected_prefixes: vec!["/dashboard".into(), "/profile".into(), "/settings".into()],
            auth_routes: vec!["/login".into(), "/register".into()],
            login_path: "/login".into(),
            default_route: "/dashboard".into(),
        }
    }
}

impl RouteRules {
    #[must_use]
    pub fn with_protected_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protected_prefixes = prefixes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_auth_routes<I, S>(mut self, routes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.auth_routes = routes.into_iter().map(Into::into).collect();
        self
    }

    /// Override the login route. It is also treated as an auth route.
    #[must_use]
    pub fn with_login_path(mut self, path: impl Into<String>) -> Self {
        self.login_path = path.into();
        if !self.auth_routes.contains(&self.login_path) {
            self.auth_routes.push(self.login_path.clone());
        }
        self
    }

    #[must_use]
    pub fn with_default_route(mut self, path: impl Into<String>) -> Self {
        self.default_route = path.into();
        self
    }

    #[must_use]
    pub fn login_path(&self) -> &str {
        &self.login_path
    }

    #[must_use]
    pub fn default_route(&self) -> &str {
        &self.default_route
    }

    #[must_use]
    pub fn classify(&self, path: &str) -> RouteKind {
        let path = strip_query(path);
        if self.auth_routes.iter().any(|r| matches_prefix(path, r)) {
            RouteKind::Auth
        } else if self.protected_prefixes.iter().any(|p| matches_prefix(path, p)) {
            RouteKind::Protected
        } else {
            RouteKind::Public
        }
    }

    #[must_use]
    pub fn is_protected(&self, path: &str) -> bool {
        self.classify(path) == RouteKind::Protected
    }

    /// Login URL carrying `return_to` as the `redirect` query parameter.
    #[must_use]
    pub fn login_redirect(&self, return_to: &str) -> String {
        // keep path separators readable in the address bar
        let encoded = urlencoding::encode(return_to).replace("%2F", "/");
        format!("{}?redirect={encoded}", self.login_path)
    }

    /// Where to go after a successful login.
    ///
    /// Only local absolute paths are honored; anything else (absent, another origin,
    /// protocol-relative, or an auth route) lands on the default route.
    #[must_use]
    pub fn post_login_target(&self, redirect: Option<&str>) -> String {
        redirect
            .map(str::trim)
            .filter(|r| is_local_path(r))
            .filter(|r| self.classify(r) != RouteKind::Auth)
            .map_or_else(|| self.default_route.clone(), str::to_string)
    }
}

fn strip_query(path: &str) -> &str {
    path.split(['?', '#']).next().unwrap_or(path)
}

fn matches_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return path.starts_with('/');
    }
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

fn is_local_path(path: &str) -> bool {
    path.starts_with('/') && !path.starts_with("//") && !path.contains('\\') && !path.contains("://")
}

/// What the guard wants rendered for a navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    /// Auth state not known yet: show the loading placeholder.
    Placeholder,
    Render,
    /// Show the "refreshing" indicator instead of protected content.
    Refreshing,
    /// Send the user to this login URL (carrying the original path).
    RedirectToLogin(String),
    Redirect(String),
}

/// Pure guard decision for `path` in `state`.
#[must_use]
pub fn decide(rules: &RouteRules, state: GuardState, path: &str) -> GuardDecision {
    let kind = rules.classify(path);
    match (state, kind) {
        (_, RouteKind::Public) => GuardDecision::Render,
        (GuardState::Uninitialized | GuardState::Loading, _) => GuardDecision::Placeholder,
        (GuardState::Authenticated, RouteKind::Protected) => GuardDecision::Render,
        (GuardState::Authenticated, RouteKind::Auth) => {
            GuardDecision::Redirect(rules.post_login_target(redirect_param(path).as_deref()))
        }
        (GuardState::Refreshing, RouteKind::Protected) => GuardDecision::Refreshing,
        (GuardState::Refreshing, RouteKind::Auth) => GuardDecision::Placeholder,
        (GuardState::Unauthenticated | GuardState::LoggedOut, RouteKind::Protected) => {
            GuardDecision::RedirectToLogin(rules.login_redirect(path))
        }
        (GuardState::Unauthenticated | GuardState::LoggedOut, RouteKind::Auth) => {
            GuardDecision::Render
        }
    }
}

/// Value of the `redirect` query parameter in `path`, if any.
#[must_use]
pub fn redirect_param(path: &str) -> Option<String> {
    let (_, query) = path.split_once('?')?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "redirect")
        .map(|(_, v)| v.into_owned())
}

/// Observable guard state with transition checking.
#[derive(Debug)]
pub struct GuardMachine {
    tx: watch::Sender<GuardState>,
}

impl GuardMachine {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(GuardState::Uninitialized);
        Self { tx }
    }

    #[must_use]
    pub fn state(&self) -> GuardState {
        *self.tx.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<GuardState> {
        self.tx.subscribe()
    }

    /// Move to `next`. Illegal transitions are logged and ignored; returns whether the
    /// state changed.
    pub fn transition(&self, next: GuardState) -> bool {
        let mut applied = false;
        self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(next) {
                tracing::warn!(from = ?*current, to = ?next, "Ignoring illegal guard transition");
                return false;
            }
            tracing::debug!(from = ?*current, to = ?next, "Guard transition");
            *current = next;
            applied = true;
            true
        });
        applied
    }

    /// Move to `next` through `Loading` when a direct transition is not allowed.
    pub(crate) fn settle(&self, next: GuardState) {
        if !self.transition(next) && self.state() != next {
            self.transition(GuardState::Loading);
            self.transition(next);
        }
    }
}

impl Default for GuardMachine {
    fn default() -> Self {
        Self::new()
    }
}
