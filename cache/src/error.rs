use std::borrow::Cow;

use thiserror::Error;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Everything that can go wrong while talking to the store.
///
/// All variants are recoverable from the caller's point of view. The two conditions that leave
/// the store in an indeterminate state (a failed `COMMIT`/`ROLLBACK` and a connection that
/// refuses to close) never surface here; they abort the process.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A statement failed to prepare.
    #[error("failed to compile statement: {message}")]
    Compilation {
        message: Cow<'static, str>,
        #[source]
        source: Option<sqlx::Error>,
    },
    /// Stepping through the rows of a query failed, or a row couldn't be decoded.
    #[error("query failed: {message}")]
    Query {
        message: Cow<'static, str>,
        #[source]
        source: Option<sqlx::Error>,
    },
    /// An insert, update or schema change failed.
    #[error("storage failed: {message}")]
    Storage {
        message: Cow<'static, str>,
        #[source]
        source: Option<sqlx::Error>,
    },
    /// The caller's arguments violate a precondition.
    #[error("invalid request: {0}")]
    InvalidRequest(Cow<'static, str>),
    /// The store's content or schema isn't what this binary expects.
    #[error("invalid response: {0}")]
    InvalidResponse(Cow<'static, str>),
    /// The channel went away before the operation could deliver a result.
    #[error("session expired: the store channel was closed")]
    SessionExpired,
}

impl StoreError {
    pub fn invalid_request(message: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn invalid_response(message: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidResponse(message.into())
    }

    /// Adapter for `map_err` on statement preparation.
    pub fn compilation(
        message: impl Into<Cow<'static, str>>,
    ) -> impl FnOnce(sqlx::Error) -> Self {
        let message = message.into();
        move |error| Self::Compilation {
            message,
            source: Some(error),
        }
    }

    /// Adapter for `map_err` on row fetching and decoding.
    pub fn query(message: impl Into<Cow<'static, str>>) -> impl FnOnce(sqlx::Error) -> Self {
        let message = message.into();
        move |error| Self::Query {
            message,
            source: Some(error),
        }
    }

    /// Adapter for `map_err` on writes.
    pub fn storage(message: impl Into<Cow<'static, str>>) -> impl FnOnce(sqlx::Error) -> Self {
        let message = message.into();
        move |error| Self::Storage {
            message,
            source: Some(error),
        }
    }

    /// Whether the error stems from caller misuse rather than the store itself.
    pub fn is_invalid_request(&self) -> bool {
        matches!(self, Self::InvalidRequest(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failed_invariant() {
        let error = StoreError::invalid_request("market CS.D.EURUSD.MINI.IP is not registered");
        assert_eq!(
            error.to_string(),
            "invalid request: market CS.D.EURUSD.MINI.IP is not registered"
        );
        assert!(error.is_invalid_request());

        let error = StoreError::query("reading Apps")(sqlx::Error::RowNotFound);
        assert_eq!(error.to_string(), "query failed: reading Apps");
        assert!(std::error::Error::source(&error).is_some());
    }
}
