use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::non_empty;

/// The signed-in user as returned by the profile endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct UserProfile {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub current_address: Option<String>,
    #[serde(default)]
    pub province: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub preferred_theme: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub birth_date: Option<NaiveDate>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl UserProfile {
    /// "First Last", falling back to the username or email.
    pub fn display_name(&self) -> String {
        let full = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if !full.is_empty() {
            return full;
        }
        self.username
            .clone()
            .or_else(|| self.email.clone())
            .unwrap_or_else(|| "Unknown user".to_string())
    }
}

/// Account creation form. Optional fields are left out of the payload when empty.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Registration {
    pub username: String,
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub role: String,
    #[serde(skip_serializing_if = "is_blank")]
    pub phone_number: Option<String>,
    #[serde(skip_serializing_if = "is_blank")]
    pub current_address: Option<String>,
    #[serde(skip_serializing_if = "is_blank")]
    pub province: Option<String>,
    #[serde(skip_serializing_if = "is_blank")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "is_blank")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "is_blank")]
    pub preferred_theme: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<NaiveDate>,
}

/// Default role for accounts created from the storefront
pub const CUSTOMER_ROLE: &str = "customer";

impl Registration {
    pub fn new(
        username: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
            password: password.into(),
            role: CUSTOMER_ROLE.to_string(),
            ..Default::default()
        }
    }

    /// Names of required fields that are blank.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        [
            ("username", &self.username),
            ("email", &self.email),
            ("password", &self.password),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect()
    }
}

/// Partial profile update (PATCH). Only set fields are sent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "is_blank")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "is_blank")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "is_blank")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "is_blank")]
    pub phone_number: Option<String>,
    #[serde(skip_serializing_if = "is_blank")]
    pub current_address: Option<String>,
    #[serde(skip_serializing_if = "is_blank")]
    pub province: Option<String>,
    #[serde(skip_serializing_if = "is_blank")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "is_blank")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "is_blank")]
    pub preferred_theme: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        serde_json::to_value(self)
            .map(|v| v.as_object().map(|o| o.is_empty()).unwrap_or(true))
            .unwrap_or(true)
    }
}

fn is_blank(value: &Option<String>) -> bool {
    !non_empty(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_skips_blank_optionals() {
        let mut form = Registration::new("alice", "alice@example.com", "pw");
        form.city = Some("  ".to_string());
        form.province = Some("Hanoi".to_string());

        let value = serde_json::to_value(&form).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj["role"], "customer");
        assert_eq!(obj["province"], "Hanoi");
        assert!(!obj.contains_key("city"));
        assert!(!obj.contains_key("birth_date"));
    }

    #[test]
    fn test_registration_missing_fields() {
        let form = Registration::new("alice", "", " ");
        assert_eq!(form.missing_fields(), vec!["email", "password"]);
    }

    #[test]
    fn test_profile_display_name_fallbacks() {
        let profile: UserProfile =
            serde_json::from_str(r#"{"first_name": "Alice", "last_name": "Nguyen"}"#).unwrap();
        assert_eq!(profile.display_name(), "Alice Nguyen");

        let profile: UserProfile = serde_json::from_str(r#"{"email": "a@example.com"}"#).unwrap();
        assert_eq!(profile.display_name(), "a@example.com");
    }

    #[test]
    fn test_profile_update_is_empty() {
        assert!(ProfileUpdate::default().is_empty());
        let update = ProfileUpdate {
            city: Some("Da Nang".to_string()),
            ..Default::default()
        };
        assert!(!update.is_empty());
    }
}
