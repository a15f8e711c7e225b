//! medcart core library.
//!
//! Client-side building blocks for the medcart pharmacy storefront:
//!
//! - `auth`: the session manager that owns the access/refresh token pair,
//!   persists it, and refreshes it transparently on 401 responses
//! - `api`: request/response values, the HTTP transport, and the typed
//!   storefront client (products, branches, orders, profile)
//! - `models`: wire payloads returned by the storefront API
//! - `config`: application configuration

pub mod api;
pub mod auth;
pub mod config;
pub mod models;

pub use api::{ApiClient, ApiError, ApiRequest, ApiResponse, HttpTransport, Transport};
pub use auth::{AuthError, AuthStatus, SessionEvent, SessionInfo, SessionManager, StartupCheck};
pub use config::Config;
