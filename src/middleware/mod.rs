//! Edge gate for Axum: cookie-based route gating that runs before any page renders.
//!
//! The gate only sees the cookie mirror of the access token, so it is conservative:
//! an expired token is treated as absent even when a refresh would succeed. The
//! client-side [`SessionManager`](crate::SessionManager) takes over after the page loads.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use laptop_accounts::SessionConfig;
//! use laptop_accounts::middleware::{EdgeGateConfig, edge_gate};
//!
//! let gate = EdgeGateConfig::from(&SessionConfig::from_env()?);
//!
//! let app = axum::Router::new()
//!     .route("/dashboard", get(dashboard))
//!     .layer(axum::middleware::from_fn_with_state(gate, edge_gate));
//! ```

mod config;
mod error;
mod extractor;
mod gate;

pub use config::EdgeGateConfig;
pub use error::GateRejection;
pub use extractor::MirroredSession;
pub use gate::{GateOutcome, edge_gate, evaluate};
