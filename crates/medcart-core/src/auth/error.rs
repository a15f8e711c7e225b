use std::collections::BTreeMap;

use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

use crate::api::TransportError;

use super::store::StorageError;

/// Field name -> validation messages, as reported by the server.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

/// Maximum length for server messages carried inside errors
const MAX_REASON_LENGTH: usize = 200;

/// Keys the server uses for a single top-level reason.
const REASON_KEYS: [&str; 3] = ["error", "detail", "message"];

/// Key used for validation errors that are not tied to a field.
const NON_FIELD_KEY: &str = "non_field_errors";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Validation failed: {}", describe_fields(.0))]
    ValidationError(FieldErrors),

    #[error("Session expired - please log in again")]
    SessionExpired,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Unable to reach server: {0}")]
    NetworkUnavailable(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Token storage failure: {0}")]
    StorageFailure(String),
}

impl AuthError {
    /// Errors the user can retry without the session being affected.
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::NetworkUnavailable(_) | AuthError::ServerError(_))
    }

    /// Build a validation error for a single field.
    pub fn field(name: &str, message: &str) -> Self {
        let mut fields = FieldErrors::new();
        fields.insert(name.to_string(), vec![message.to_string()]);
        AuthError::ValidationError(fields)
    }

    /// Classify a rejected credential exchange (login, register, refresh).
    ///
    /// `fallback` is used when the server gave no readable reason.
    pub fn from_rejection(status: StatusCode, body: &str, fallback: &str) -> Self {
        let message = ServerMessage::parse(body);
        match status.as_u16() {
            429 => AuthError::ServerError("Rate limited - please wait before retrying".to_string()),
            500..=599 => AuthError::ServerError(
                message.reason.unwrap_or_else(|| status.to_string()),
            ),
            400 if !message.fields.is_empty() => AuthError::ValidationError(message.fields),
            _ => AuthError::InvalidCredentials(
                message.summary().unwrap_or_else(|| fallback.to_string()),
            ),
        }
    }
}

impl From<TransportError> for AuthError {
    fn from(err: TransportError) -> Self {
        AuthError::NetworkUnavailable(err.to_string())
    }
}

impl From<StorageError> for AuthError {
    fn from(err: StorageError) -> Self {
        AuthError::StorageFailure(err.to_string())
    }
}

fn describe_fields(fields: &FieldErrors) -> String {
    fields
        .iter()
        .map(|(field, messages)| format!("{}: {}", field, messages.join(" ")))
        .collect::<Vec<_>>()
        .join("; ")
}

/// A server error payload normalized into a reason and per-field messages.
///
/// The storefront API answers failures with a bare string, an object with
/// `error`/`detail`/`message`, DRF-style `{"field": ["msg"]}` maps, or plain
/// text. Everything is flattened here so no raw payload travels further.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerMessage {
    pub reason: Option<String>,
    pub fields: FieldErrors,
}

impl ServerMessage {
    pub fn parse(body: &str) -> Self {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return Self::default();
        }

        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(map)) => {
                let mut parsed = Self::default();
                for (key, value) in map {
                    let messages = flatten_messages(&value);
                    if messages.is_empty() {
                        continue;
                    }
                    if REASON_KEYS.contains(&key.as_str()) || key == NON_FIELD_KEY {
                        if parsed.reason.is_none() {
                            parsed.reason = Some(truncate(&messages.join(" ")));
                        }
                    } else {
                        parsed.fields.insert(key, messages);
                    }
                }
                parsed
            }
            Ok(other) => {
                let messages = flatten_messages(&other);
                Self {
                    reason: (!messages.is_empty()).then(|| truncate(&messages.join(" "))),
                    fields: FieldErrors::new(),
                }
            }
            Err(_) => Self {
                reason: Some(truncate(trimmed)),
                fields: FieldErrors::new(),
            },
        }
    }

    /// Best single-line description: the reason, else the field messages.
    pub fn summary(&self) -> Option<String> {
        self.reason.clone().or_else(|| {
            (!self.fields.is_empty()).then(|| describe_fields(&self.fields))
        })
    }
}

fn flatten_messages(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
        Value::Array(items) => items.iter().flat_map(flatten_messages).collect(),
        Value::Number(n) => vec![n.to_string()],
        Value::Bool(b) => vec![b.to_string()],
        _ => Vec::new(),
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_REASON_LENGTH {
        text.to_string()
    } else {
        let cut: String = text.chars().take(MAX_REASON_LENGTH).collect();
        format!("{}...", cut)
    }
}

// ============================================================================
// Tests
// ============================================================================
