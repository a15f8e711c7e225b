//! Authentication module for managing the session token lifecycle.
//!
//! This module provides:
//! - `SessionManager`: login/register/logout, single-flight token refresh,
//!   and the request interceptors that attach and renew bearer tokens
//! - `TokenVault`: both-or-neither persistence of the token pair
//! - `SecureStorage` backends: OS keychain, JSON file, and in-memory
//! - `AuthError`: the error taxonomy surfaced to UI code
//!
//! Tokens are persisted under the `accessToken` and `refreshToken` keys.

pub mod credentials;
pub mod error;
pub mod session;
pub mod store;
pub mod vault;

#[cfg(test)]
pub(crate) mod testing;

pub use credentials::KeyringStorage;
pub use error::{AuthError, FieldErrors};
pub use session::{AuthStatus, SessionEvent, SessionInfo, SessionManager, StartupCheck};
pub use store::{FileStorage, MemoryStorage, SecureStorage, StorageError};
pub use vault::{TokenPair, TokenVault, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
