//! The identity a session is bound to, as loaded from the store.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::cache::CacheKeys;
use crate::connections::store::StoreRow;
use crate::error::BoardError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Account {
    #[serde(rename = "UUID")]
    pub id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub validated: bool,
    pub notification_flags: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modification_date: Option<String>,
}

impl Account {
    /// Normalized form of an email address used as a cache key.
    pub fn email_key(email: &str) -> String {
        email.trim().to_lowercase()
    }

    /// Builds an account from a row with the columns `uuid`, `email`,
    /// `first_name`, `last_name`, `password_hash`, `validated`,
    /// `notification_flags` and optionally `creation_date`/`modification_date`.
    pub fn from_row(row: &StoreRow) -> Result<Self, BoardError> {
        Ok(Self {
            id: text_column(row, "uuid")?,
            email: text_column(row, "email")?,
            first_name: text_column(row, "first_name").unwrap_or_default(),
            last_name: text_column(row, "last_name").unwrap_or_default(),
            password_hash: text_column(row, "password_hash")?,
            validated: row.get("validated").and_then(Value::as_bool).unwrap_or(false),
            notification_flags: row
                .get("notification_flags")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            creation_date: text_column(row, "creation_date").ok(),
            modification_date: text_column(row, "modification_date").ok(),
        })
    }

    /// Client-facing view; never includes the password hash.
    pub fn public_view(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl CacheKeys for Account {
    fn primary_key(&self) -> String {
        self.id.clone()
    }

    fn secondary_key(&self) -> Option<String> {
        Some(Self::email_key(&self.email))
    }
}

fn text_column(row: &StoreRow, column: &str) -> Result<String, BoardError> {
    row.get(column)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BoardError::Integrity(format!("account row is missing column '{}'", column)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row() -> StoreRow {
        json!({
            "uuid": "9a4c1f52-7d1b-4c1e-9c0a-4c3f0b1d2e3f",
            "email": "Ann@Example.com",
            "first_name": "Ann",
            "last_name": "Lee",
            "password_hash": "abc",
            "validated": true,
            "notification_flags": 5
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn test_from_row_and_keys() {
        let account = Account::from_row(&row()).unwrap();
        assert_eq!(account.primary_key(), "9a4c1f52-7d1b-4c1e-9c0a-4c3f0b1d2e3f");
        assert_eq!(account.secondary_key().as_deref(), Some("ann@example.com"));
        assert_eq!(account.notification_flags, 5);
        assert!(account.creation_date.is_none());
    }

    #[test]
    fn test_public_view_hides_password() {
        let view = Account::from_row(&row()).unwrap().public_view();
        assert_eq!(view["Email"], json!("Ann@Example.com"));
        assert_eq!(view["UUID"], json!("9a4c1f52-7d1b-4c1e-9c0a-4c3f0b1d2e3f"));
        assert!(view.get("PasswordHash").is_none());
    }

    #[test]
    fn test_missing_required_column_is_integrity_error() {
        let mut row = row();
        row.remove("uuid");
        assert!(matches!(Account::from_row(&row), Err(BoardError::Integrity(_))));
    }
}
