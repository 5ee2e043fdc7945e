use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The auth API answered with a non-success status.
    #[error("{operation} failed{}: {detail}", status_suffix(.status))]
    Api {
        operation: &'static str,
        status: Option<u16>,
        detail: String,
    },
    #[cfg(feature = "client")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Session store error: {0}")]
    Store(#[from] StoreError),
    /// No usable session for an operation that needs one.
    #[error("Not authenticated")]
    Unauthenticated,
    /// The local session was cleared while the operation was in flight.
    #[error("Session was cleared")]
    SessionCleared,
    #[error("Configuration error: {0}")]
    Config(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl Error {
    /// HTTP status returned by the API, if this error came from one.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => *status,
            #[cfg(feature = "client")]
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
