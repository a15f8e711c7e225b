//! REST API layer for the medcart storefront service.
//!
//! This module provides:
//! - `ApiRequest` / `ApiResponse`: plain request and response values that the
//!   session manager can inspect, authorize and replay
//! - `Transport` and its `reqwest` implementation `HttpTransport`
//! - `ApiClient`: typed calls for products, branches, profile and orders
//!
//! Every call goes through `SessionManager::send`, which attaches the bearer
//! token and transparently refreshes it on a 401.

pub mod client;
pub mod error;
pub mod request;
pub mod transport;

pub use client::ApiClient;
pub use error::ApiError;
pub use request::{ApiRequest, ApiResponse};
pub use transport::{HttpTransport, Transport, TransportError};
