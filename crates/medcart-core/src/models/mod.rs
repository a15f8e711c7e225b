//! Data models for storefront API payloads.
//!
//! - `UserProfile`, `Registration`, `ProfileUpdate`: account data
//! - `Product`, `Branch`: catalog and pharmacy locations
//! - `Order`, `OrderItem`, `NewOrder`: checkout
//! - `Page`: the paginated envelope used by list endpoints

pub mod order;
pub mod product;
pub mod user;

use serde::{Deserialize, Deserializer, Serialize};

pub use order::{NewOrder, NewOrderItem, Order, OrderItem};
pub use product::{Branch, Product};
pub use user::{ProfileUpdate, Registration, UserProfile};

/// Paginated list envelope (`count`, `next`, `previous`, `results`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub previous: Option<String>,
    pub results: Vec<T>,
}

impl<T> Page<T> {
    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }
}

/// Decimal fields arrive either as JSON numbers or as strings like `"12000.00"`.
pub(crate) fn decimal<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Treat empty strings the same as missing values.
pub(crate) fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().map(|v| !v.trim().is_empty()).unwrap_or(false)
}
