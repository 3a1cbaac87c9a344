use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use time::serde::rfc3339;
use time::{Date, OffsetDateTime};

use crate::ValidationError;

/// API key identifying a client application.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ApplicationKey(Box<str>);

impl ApplicationKey {
    pub const LEN: usize = 40;

    pub fn new(key: &str) -> Result<Self, ValidationError> {
        if key.len() == Self::LEN && key.bytes().all(|byte| byte.is_ascii_alphanumeric()) {
            Ok(Self(Box::from(key)))
        } else {
            Err(ValidationError::ApplicationKey(key.to_owned()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ApplicationKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ApplicationKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<ApplicationKey> for String {
    fn from(key: ApplicationKey) -> Self {
        key.0.into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub key: ApplicationKey,
    pub name: String,
    pub status: ApplicationStatus,
    pub permission: Permission,
    pub allowance: Allowance,
    pub created: Date,
    /// Last time the record was synced. The store overwrites it with the write time.
    #[serde(with = "rfc3339")]
    pub updated: OffsetDateTime,
}

/// Ordered from least to most usable: revoked < disabled < enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationStatus {
    Revoked,
    Disabled,
    Enabled,
}

impl ApplicationStatus {
    pub fn raw(self) -> i64 {
        match self {
            Self::Revoked => -1,
            Self::Disabled => 0,
            Self::Enabled => 1,
        }
    }

    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            -1 => Some(Self::Revoked),
            0 => Some(Self::Disabled),
            1 => Some(Self::Enabled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub access_to_equity_prices: bool,
    pub are_quote_orders_allowed: bool,
}

/// Request-rate limits granted to an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allowance {
    /// Requests per minute across every account using the application.
    pub overall_requests: u32,
    /// Requests per minute for a single account.
    pub account_requests: u32,
    /// Trading requests per minute for a single account.
    pub trading_requests: u32,
    /// Historical price points per week.
    pub historical_data_points: u32,
    pub concurrent_subscriptions: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_must_be_forty_alphanumerics() {
        assert!(ApplicationKey::new(&"a1".repeat(20)).is_ok());
        assert!(ApplicationKey::new(&"a".repeat(39)).is_err());
        assert!(ApplicationKey::new(&format!("{}-", "a".repeat(39))).is_err());
    }

    #[test]
    fn status_order_matches_raw_order() {
        let statuses = [
            ApplicationStatus::Revoked,
            ApplicationStatus::Disabled,
            ApplicationStatus::Enabled,
        ];
        for pair in statuses.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].raw() < pair[1].raw());
        }
        for status in statuses {
            assert_eq!(ApplicationStatus::from_raw(status.raw()), Some(status));
        }
        assert_eq!(ApplicationStatus::from_raw(2), None);
    }

    #[test]
    fn status_uses_wire_names() {
        let status: ApplicationStatus = serde_json::from_str(r#""REVOKED""#).unwrap();
        assert_eq!(status, ApplicationStatus::Revoked);
    }
}
