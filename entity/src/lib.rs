mod app;
mod market;
mod price;
mod rate;

pub use app::*;
pub use market::*;
pub use price::*;
pub use rate::*;

use thiserror::Error;

/// A value handed to one of the validating constructors didn't have the expected shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid epic {0:?}: expected 6 to 30 characters from [A-Za-z0-9._-]")]
    Epic(String),
    #[error("invalid application key {0:?}: expected 40 alphanumeric characters")]
    ApplicationKey(String),
    #[error("invalid currency code {0:?}: expected 3 uppercase ASCII letters")]
    Currency(String),
}
