#![doc = include_str!("../README.md")]

pub mod activity;
pub mod backend;
#[cfg(feature = "client")]
pub mod client;
pub mod config;
pub mod cookies;
pub mod credentials;
pub mod error;
pub mod guard;
pub mod manager;
#[cfg(feature = "middleware")]
pub mod middleware;
pub mod refresh;
pub mod store;
pub mod token;
pub mod types;

// Re-exports for convenient access
pub use activity::{ActivityTracker, InteractionKind, is_within_inactivity_window};
pub use backend::AuthBackend;
#[cfg(feature = "client")]
pub use client::ApiClient;
pub use config::SessionConfig;
pub use credentials::{CredentialStore, SessionRecord, StoreKind};
pub use error::Error;
pub use guard::{GuardDecision, GuardState, RouteKind, RouteRules};
pub use manager::SessionManager;
pub use refresh::{RefreshCoordinator, RefreshOutcome, should_refresh};
pub use store::{FileStore, MemoryStore, SessionStore, StoreError};
pub use token::{TokenStatus, UnverifiedClaims, decode_claims, is_token_expired, is_token_valid, needs_refresh};
pub use types::{
    ActiveSession, LoginAttempt, LoginRequest, PasswordChange, ProfileUpdate, RegisterRequest,
    SecurityInfo, SessionId, TokenResponse, UserId, UserProfile,
};
