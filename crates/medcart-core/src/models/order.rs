use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::decimal;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub prescription: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub items: Vec<OrderItem>,
}

impl Order {
    pub fn total(&self) -> f64 {
        self.items.iter().map(OrderItem::subtotal).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    #[serde(default)]
    pub order_item_id: Option<String>,
    pub product: String,
    pub quantity: u32,
    #[serde(deserialize_with = "decimal")]
    pub price: f64,
}

impl OrderItem {
    pub fn subtotal(&self) -> f64 {
        self.price * f64::from(self.quantity)
    }
}

/// Checkout payload.
#[derive(Debug, Clone, Serialize)]
pub struct NewOrder {
    pub branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prescription: Option<String>,
    pub items: Vec<NewOrderItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewOrderItem {
    pub product: String,
    pub quantity: u32,
}

impl NewOrder {
    pub fn new(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            prescription: None,
            items: Vec::new(),
        }
    }

    /// Add a line, merging quantities for a product already in the order.
    pub fn add_item(mut self, product: impl Into<String>, quantity: u32) -> Self {
        let product = product.into();
        match self.items.iter_mut().find(|item| item.product == product) {
            Some(item) => item.quantity += quantity,
            None => self.items.push(NewOrderItem { product, quantity }),
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.items.iter().all(|item| item.quantity == 0)
    }
}
