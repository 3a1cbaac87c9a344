//! Small helpers shared by every table module: statement preparation, positional decoding,
//! catalog lookups, date-range filters and the fixed-point price encoding.

use common::util;
use rust_decimal::{prelude::ToPrimitive, Decimal};
use sqlx::{
    query::Query,
    sqlite::{Sqlite, SqliteArguments, SqliteConnection, SqliteRow, SqliteStatement},
    Decode, Executor, Row, Type,
};
use time::{Date, Duration, OffsetDateTime};

use crate::error::{Result, StoreError};

/// Number of fractional digits kept for bid/ask values.
pub const PRICE_SCALE: u32 = 5;

const SCALE_FACTOR: Decimal = Decimal::from_parts(100_000, 0, 0, false, 0);

/// Scales `value` by 10⁵ into the integer stored on disk.
///
/// Digits beyond the fifth fractional one are truncated and out-of-range values saturate at the
/// `i32` bounds. Both losses are part of the on-disk format.
pub fn encode_price(value: Decimal) -> i32 {
    let scaled = value
        .checked_mul(SCALE_FACTOR)
        .and_then(|scaled| scaled.trunc().to_i64());

    match scaled {
        Some(raw) => raw.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32,
        None if value.is_sign_negative() => i32::MIN,
        None => i32::MAX,
    }
}

/// Inverse of [`encode_price`].
pub fn decode_price(raw: i64) -> Decimal {
    Decimal::new(raw, PRICE_SCALE)
}

pub(crate) async fn prepare<'q>(
    connection: &mut SqliteConnection,
    sql: &'q str,
) -> Result<SqliteStatement<'q>> {
    (&mut *connection)
        .prepare(sql)
        .await
        .map_err(StoreError::compilation(format!("failed to prepare `{sql}`")))
}

/// Reads the column at `index`, the layout being fixed by each table's `SELECT` list.
pub(crate) fn column<'r, T>(row: &'r SqliteRow, index: usize) -> Result<T>
where
    T: Decode<'r, Sqlite> + Type<Sqlite>,
{
    row.try_get(index)
        .map_err(StoreError::query(format!("failed to decode column {index}")))
}

pub(crate) async fn table_exists(connection: &mut SqliteConnection, table: &str) -> Result<bool> {
    sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
    )
    .bind(table)
    .fetch_one(&mut *connection)
    .await
    .map_err(StoreError::query(format!(
        "failed to look up table {table} in the catalog"
    )))
}

pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn format_datetime(datetime: OffsetDateTime) -> Result<String> {
    util::format_datetime(datetime).map_err(|error| {
        StoreError::invalid_request(format!("failed to format {datetime}: {error}"))
    })
}

pub(crate) fn parse_datetime(text: &str) -> Result<OffsetDateTime> {
    util::parse_datetime(text).map_err(|error| {
        StoreError::invalid_response(format!("stored timestamp {text:?} is malformed: {error}"))
    })
}

pub(crate) fn format_date(date: Date) -> Result<String> {
    util::format_date(date)
        .map_err(|error| StoreError::invalid_request(format!("failed to format {date}: {error}")))
}

pub(crate) fn parse_date(text: &str) -> Result<Date> {
    util::parse_date(text).map_err(|error| {
        StoreError::invalid_response(format!("stored date {text:?} is malformed: {error}"))
    })
}

/// Rejects instants later than now; `what` names the offending field in the error.
pub(crate) fn ensure_not_future(datetime: OffsetDateTime, what: &str) -> Result<()> {
    if datetime > OffsetDateTime::now_utc() {
        Err(StoreError::invalid_request(format!(
            "{what} {datetime} is in the future"
        )))
    } else {
        Ok(())
    }
}

/// Narrows `[from, to]` to the whole seconds timestamps are stored at: `from` rounds up and `to`
/// rounds down. `None` when no whole second falls inside the range.
pub(crate) fn whole_seconds(
    from: Option<OffsetDateTime>,
    to: Option<OffsetDateTime>,
) -> Result<Option<(Option<OffsetDateTime>, Option<OffsetDateTime>)>> {
    if let (Some(from), Some(to)) = (from, to) {
        if from > to {
            return Err(StoreError::invalid_request(format!(
                "from date {from} is after to date {to}"
            )));
        }
    }

    let from = from.map(ceil_to_second).transpose()?;
    let to = to.map(floor_to_second).transpose()?;

    match (from, to) {
        (Some(from), Some(to)) if from > to => Ok(None),
        bounds => Ok(Some(bounds)),
    }
}

fn floor_to_second(datetime: OffsetDateTime) -> Result<OffsetDateTime> {
    datetime.replace_nanosecond(0).map_err(|error| {
        StoreError::invalid_request(format!("failed to truncate {datetime}: {error}"))
    })
}

fn ceil_to_second(datetime: OffsetDateTime) -> Result<OffsetDateTime> {
    if datetime.nanosecond() == 0 {
        return Ok(datetime);
    }

    floor_to_second(datetime)?
        .checked_add(Duration::SECOND)
        .ok_or_else(|| StoreError::invalid_request(format!("{datetime} is out of range")))
}

/// Accumulates `WHERE` clauses together with their text arguments.
#[derive(Debug, Default)]
pub(crate) struct Filter {
    clauses: Vec<String>,
    arguments: Vec<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equals(mut self, column: &str, value: String) -> Self {
        self.clauses.push(format!("{column} = ?"));
        self.arguments.push(value);
        self
    }

    /// Both bounds give `BETWEEN`, a single one `>=` or `<=`, none no clause at all.
    pub fn range<D, F>(mut self, column: &str, from: Option<D>, to: Option<D>, format: F) -> Result<Self>
    where
        D: PartialOrd + Copy + std::fmt::Display,
        F: Fn(D) -> Result<String>,
    {
        match (from, to) {
            (Some(from), Some(to)) => {
                if from > to {
                    return Err(StoreError::invalid_request(format!(
                        "from date {from} is after to date {to}"
                    )));
                }
                self.clauses.push(format!("{column} BETWEEN ? AND ?"));
                self.arguments.push(format(from)?);
                self.arguments.push(format(to)?);
            }
            (Some(from), None) => {
                self.clauses.push(format!("{column} >= ?"));
                self.arguments.push(format(from)?);
            }
            (None, Some(to)) => {
                self.clauses.push(format!("{column} <= ?"));
                self.arguments.push(format(to)?);
            }
            (None, None) => (),
        }

        Ok(self)
    }

    /// Empty, or ` WHERE ...` with a leading space.
    pub fn where_clause(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    pub fn bind<'q>(
        self,
        mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        for argument in self.arguments {
            query = query.bind(argument);
        }
        query
    }
}
