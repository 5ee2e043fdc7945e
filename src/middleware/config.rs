use std::sync::Arc;

use crate::config::SessionConfig;
use crate::error::Error;
use crate::guard::RouteRules;

/// Edge gate settings: the mirror cookie name and the route tables.
///
/// Build it from the same [`SessionConfig`] the client uses so both sides agree on
/// which routes are protected.
#[derive(Debug, Clone)]
pub struct EdgeGateConfig {
    pub(super) cookie_name: Arc<str>,
    pub(super) routes: Arc<RouteRules>,
}

impl EdgeGateConfig {
    #[must_use]
    pub fn new(cookie_name: impl Into<String>, routes: RouteRules) -> Self {
        Self {
            cookie_name: Arc::from(cookie_name.into()),
            routes: Arc::new(routes),
        }
    }

    /// Create config from the `LAPTOP_*` environment variables.
    ///
    /// # Errors
    ///
    /// See [`SessionConfig::from_env`].
    pub fn from_env() -> Result<Self, Error> {
        SessionConfig::from_env().map(|config| Self::from(&config))
    }

    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    #[must_use]
    pub fn routes(&self) -> &RouteRules {
        &self.routes
    }
}

impl From<&SessionConfig> for EdgeGateConfig {
    fn from(config: &SessionConfig) -> Self {
        Self::new(config.cookie_name(), config.routes().clone())
    }
}
