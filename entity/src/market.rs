use std::{
    borrow::Borrow,
    fmt::{self, Display, Formatter},
    ops::Deref,
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Identifier of a tradeable instrument, e.g. `CS.D.EURUSD.MINI.IP`.
///
/// The character set is restricted to `[A-Z0-9._-]`, which is what makes it safe to splice
/// into a quoted SQL identifier. SQLite identifiers ignore case, so lowercase letters would let
/// two epics share one price table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Epic(Box<str>);

impl Epic {
    pub const MIN_LEN: usize = 6;
    pub const MAX_LEN: usize = 30;

    pub fn new(epic: &str) -> Result<Self, ValidationError> {
        let len_ok = (Self::MIN_LEN..=Self::MAX_LEN).contains(&epic.len());
        let chars_ok = epic.bytes().all(|byte| {
            byte.is_ascii_uppercase()
                || byte.is_ascii_digit()
                || matches!(byte, b'.' | b'_' | b'-')
        });

        if len_ok && chars_ok {
            Ok(Self(Box::from(epic)))
        } else {
            Err(ValidationError::Epic(epic.to_owned()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for Epic {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Epic {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Display for Epic {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Epic {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Epic {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Epic> for String {
    fn from(epic: Epic) -> Self {
        epic.0.into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Market {
    pub epic: Epic,
    #[serde(default)]
    pub kind: Option<MarketKind>,
}

impl Market {
    pub fn new(epic: Epic, kind: Option<MarketKind>) -> Self {
        Self { epic, kind }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketKind {
    Currencies(CurrencyMarket),
    Indices,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrencyMarket {
    Forex,
}

// Codes are grouped by family in blocks of 100 so new sub-kinds don't renumber existing rows
const CURRENCIES_BASE: i64 = 100;
const INDICES_BASE: i64 = 200;

impl MarketKind {
    /// Integer persisted in the `Markets.type` column.
    pub fn code(self) -> i64 {
        match self {
            Self::Currencies(CurrencyMarket::Forex) => CURRENCIES_BASE,
            Self::Indices => INDICES_BASE,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            CURRENCIES_BASE => Some(Self::Currencies(CurrencyMarket::Forex)),
            INDICES_BASE => Some(Self::Indices),
            _ => None,
        }
    }
}
