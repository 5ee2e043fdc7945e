use url::Url;

use crate::activity::DEFAULT_TOUCH_THROTTLE;
use crate::cookies::AUTH_COOKIE_NAME;
use crate::error::Error;
use crate::guard::RouteRules;
use crate::token::REFRESH_HORIZON;

/// Default period of the background validity check.
pub const DEFAULT_REFRESH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// Session manager configuration.
///
/// The API base URL is the only required field and is a constructor parameter.
///
/// ```rust,ignore
/// use laptop_accounts::SessionConfig;
///
/// let config = SessionConfig::new("https://api.example.com/api/v1/".parse()?)
///     .with_secure_cookies(false)
///     .with_protected_prefixes(["/dashboard", "/compare"]);
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SessionConfig {
    pub(crate) api_base: Url,
    pub(crate) cookie_name: String,
    pub(crate) secure_cookies: bool,
    pub(crate) refresh_interval: std::time::Duration,
    pub(crate) refresh_horizon: time::Duration,
    pub(crate) touch_throttle: time::Duration,
    pub(crate) routes: RouteRules,
}

impl SessionConfig {
    /// `api_base` is the prefix under which `auth/login`, `auth/refresh`, ... live.
    /// A missing trailing slash is added so relative joins keep the last path segment.
    #[must_use]
    pub fn new(mut api_base: Url) -> Self {
        if !api_base.path().ends_with('/') {
            let path = format!("{}/", api_base.path());
            api_base.set_path(&path);
        }
        Self {
            api_base,
            cookie_name: AUTH_COOKIE_NAME.into(),
            secure_cookies: true,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            refresh_horizon: REFRESH_HORIZON,
            touch_throttle: DEFAULT_TOUCH_THROTTLE,
            routes: RouteRules::default(),
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `LAPTOP_API_URL`: API base URL, e.g. `https://api.example.com/api/v1/`
    ///
    /// # Optional env vars
    /// - `LAPTOP_AUTH_COOKIE`: Name of the token mirror cookie (default `auth_token`)
    /// - `LAPTOP_SECURE_COOKIES`: `"0"` or `"false"` to drop the `Secure` attribute
    /// - `LAPTOP_REFRESH_INTERVAL_SECS`: Background check period (default 60)
    /// - `LAPTOP_LOGIN_PATH`: Login route (default `/login`)
    /// - `LAPTOP_DEFAULT_ROUTE`: Landing route after login (default `/dashboard`)
    /// - `LAPTOP_PROTECTED_PREFIXES`: Comma-separated protected route prefixes
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the API URL is missing or a value is invalid.
    pub fn from_env() -> Result<Self, Error> {
        let api_url = std::env::var("LAPTOP_API_URL")
            .map_err(|_| Error::Config("LAPTOP_API_URL is required".into()))?;
        let api_base: Url = api_url
            .parse()
            .map_err(|e| Error::Config(format!("LAPTOP_API_URL: {e}")))?;

        let mut config = Self::new(api_base);

        if let Ok(name) = std::env::var("LAPTOP_AUTH_COOKIE") {
            config = config.with_cookie_name(name);
        }
        if let Ok(flag) = std::env::var("LAPTOP_SECURE_COOKIES") {
            config = config.with_secure_cookies(!matches!(flag.as_str(), "0" | "false"));
        }
        if let Ok(secs) = std::env::var("LAPTOP_REFRESH_INTERVAL_SECS") {
            let secs: u64 = secs
                .parse()
                .map_err(|e| Error::Config(format!("LAPTOP_REFRESH_INTERVAL_SECS: {e}")))?;
            if secs == 0 {
                return Err(Error::Config(
                    "LAPTOP_REFRESH_INTERVAL_SECS must be positive".into(),
                ));
            }
            config = config.with_refresh_interval(std::time::Duration::from_secs(secs));
        }
        if let Ok(path) = std::env::var("LAPTOP_LOGIN_PATH") {
            config.routes = config.routes.with_login_path(require_path("LAPTOP_LOGIN_PATH", path)?);
        }
        if let Ok(path) = std::env::var("LAPTOP_DEFAULT_ROUTE") {
            config.routes =
                config.routes.with_default_route(require_path("LAPTOP_DEFAULT_ROUTE", path)?);
        }
        if let Ok(prefixes) = std::env::var("LAPTOP_PROTECTED_PREFIXES") {
            let prefixes = prefixes
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| require_path("LAPTOP_PROTECTED_PREFIXES", p.to_string()))
                .collect::<Result<Vec<_>, _>>()?;
            config = config.with_protected_prefixes(prefixes);
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_cookie_name(mut self, name: impl Into<String>) -> Self {
        self.cookie_name = name.into();
        self
    }

    #[must_use]
    pub fn with_secure_cookies(mut self, secure: bool) -> Self {
        self.secure_cookies = secure;
        self
    }

    #[must_use]
    pub fn with_refresh_interval(mut self, interval: std::time::Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    #[must_use]
    pub fn with_refresh_horizon(mut self, horizon: time::Duration) -> Self {
        self.refresh_horizon = horizon;
        self
    }

    #[must_use]
    pub fn with_touch_throttle(mut self, throttle: time::Duration) -> Self {
        self.touch_throttle = throttle;
        self
    }

    #[must_use]
    pub fn with_routes(mut self, routes: RouteRules) -> Self {
        self.routes = routes;
        self
    }

    #[must_use]
    pub fn with_protected_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routes = self.routes.with_protected_prefixes(prefixes);
        self
    }

    #[must_use]
    pub fn api_base(&self) -> &Url {
        &self.api_base
    }

    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    #[must_use]
    pub fn secure_cookies(&self) -> bool {
        self.secure_cookies
    }

    #[must_use]
    pub fn refresh_interval(&self) -> std::time::Duration {
        self.refresh_interval
    }

    #[must_use]
    pub fn refresh_horizon(&self) -> time::Duration {
        self.refresh_horizon
    }

    #[must_use]
    pub fn touch_throttle(&self) -> time::Duration {
        self.touch_throttle
    }

    #[must_use]
    pub fn routes(&self) -> &RouteRules {
        &self.routes
    }

    /// Resolve an API path such as `auth/refresh` against the base URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the joined URL is invalid.
    pub fn endpoint(&self, path: &str) -> Result<Url, Error> {
        self.api_base
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::Config(format!("endpoint {path}: {e}")))
    }
}

fn require_path(var: &str, path: String) -> Result<String, Error> {
    if path.starts_with('/') {
        Ok(path)
    } else {
        Err(Error::Config(format!("{var}: `{path}` must start with '/'")))
    }
}
