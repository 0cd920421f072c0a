//! Backend credential lifecycle and user lookup caching.
//!
//! Everything here talks to the ticketing backend only through the
//! [`Authenticator`] and [`UserDirectory`] seams, so it can be driven by stubs
//! in tests.

pub mod clock;
pub mod credentials;
pub mod error;
pub mod sensitive;
pub mod token;
pub mod user_cache;

use async_trait::async_trait;

pub use clock::{Clock, ManualClock, SystemClock};
pub use credentials::{
    CredentialConfig, CredentialManager, CredentialState, CredentialStatus, ScheduleInfo,
    TokenInfo,
};
pub use error::{AuthError, CredentialError, LookupError, TokenRecordError};
pub use sensitive::Sensitive;
pub use token::{RefreshSchedule, TokenRecord};
pub use user_cache::{CacheStats, UserCache, UserCacheConfig, WarmReport};

/// Obtains a fresh backend token. Slow (tens of seconds on a cold backend).
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self) -> Result<TokenRecord, AuthError>;
}

/// Looks up a single user record by email.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn fetch_user_by_email(&self, email: &str) -> Result<serde_json::Value, LookupError>;
}
