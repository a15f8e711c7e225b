use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::decimal;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub product_id: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(deserialize_with = "decimal")]
    pub price: f64,
    #[serde(default, deserialize_with = "decimal")]
    pub quantity: f64,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub prescription: Option<String>,
    #[serde(default)]
    pub class_level: Option<i32>,
    #[serde(default)]
    pub need_approval: bool,
    #[serde(default)]
    pub expiration_date: Option<NaiveDate>,
}

impl Product {
    pub fn in_stock(&self) -> bool {
        self.quantity > 0.0
    }
}

/// A pharmacy branch orders can be picked up from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub branch_id: String,
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub province: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}
