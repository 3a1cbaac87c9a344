//! Interest rates per currency and day, kept in `InterestRates`.

use std::str::FromStr;

use entity::{Currency, InterestRate};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Statement;
use time::{Date, OffsetDateTime};

use crate::channel::Channel;
use crate::error::{Result, StoreError};
use crate::sql::{self, column, Filter};

pub const TABLE: &str = "InterestRates";

// Rates are kept as decimal text so no precision is lost
pub(crate) const CREATE_TABLE: &str = "
    CREATE TABLE InterestRates (
        date     TEXT NOT NULL CHECK( date IS date(date) ),
        currency TEXT NOT NULL CHECK( length(currency) = 3 AND upper(currency) = currency ),
        rate     TEXT NOT NULL CHECK( length(rate) > 0 ),
        PRIMARY KEY(date, currency)
    ) WITHOUT ROWID
";

const UPSERT: &str = "
    INSERT INTO InterestRates (date, currency, rate) VALUES (?, ?, ?)
    ON CONFLICT(date, currency) DO UPDATE SET rate = excluded.rate
";

/// Rates with `from <= date <= to`, optionally restricted to one currency, ordered by date and
/// then currency.
pub async fn get(
    connection: &mut SqliteConnection,
    currency: Option<Currency>,
    from: Option<Date>,
    to: Option<Date>,
) -> Result<Vec<InterestRate>> {
    let mut filter = Filter::new();
    if let Some(currency) = currency {
        filter = filter.equals("currency", currency.as_str().to_owned());
    }
    let filter = filter.range("date", from, to, sql::format_date)?;

    let sql = format!(
        "SELECT date, currency, rate FROM InterestRates{} ORDER BY date ASC, currency ASC",
        filter.where_clause()
    );

    filter
        .bind(sqlx::query(&sql))
        .fetch_all(&mut *connection)
        .await
        .map_err(StoreError::query("failed to read the stored interest rates"))?
        .iter()
        .map(decode)
        .collect()
}

pub async fn get_on(
    connection: &mut SqliteConnection,
    date: Date,
    currency: Currency,
) -> Result<Option<InterestRate>> {
    let statement = sql::prepare(
        connection,
        "SELECT date, currency, rate FROM InterestRates WHERE date = ? AND currency = ?",
    )
    .await?;

    statement
        .query()
        .bind(sql::format_date(date)?)
        .bind(currency.as_str().to_owned())
        .fetch_optional(&mut *connection)
        .await
        .map_err(StoreError::query(format!(
            "failed to read the {currency} rate on {date}"
        )))?
        .as_ref()
        .map(decode)
        .transpose()
}

pub async fn count(connection: &mut SqliteConnection) -> Result<u64> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM InterestRates")
        .fetch_one(&mut *connection)
        .await
        .map_err(StoreError::query("failed to count the stored interest rates"))?;

    u64::try_from(count).map_err(|_| StoreError::invalid_response("negative interest rate count"))
}

pub async fn update(connection: &mut SqliteConnection, rates: &[InterestRate]) -> Result<()> {
    let today = OffsetDateTime::now_utc().date();
    let statement = sql::prepare(connection, UPSERT).await?;

    for rate in rates {
        if rate.date > today {
            return Err(StoreError::invalid_request(format!(
                "{} rate dated {} is in the future",
                rate.currency, rate.date
            )));
        }

        statement
            .query()
            .bind(sql::format_date(rate.date)?)
            .bind(rate.currency.as_str().to_owned())
            .bind(rate.rate.normalize().to_string())
            .execute(&mut *connection)
            .await
            .map_err(StoreError::storage(format!(
                "failed to upsert the {} rate on {}",
                rate.currency, rate.date
            )))?;
    }

    Ok(())
}

fn decode(row: &SqliteRow) -> Result<InterestRate> {
    let currency: String = column(row, 1)?;
    let currency =
        Currency::new(&currency).map_err(|error| StoreError::invalid_response(error.to_string()))?;

    let rate: String = column(row, 2)?;
    let rate = Decimal::from_str(&rate).map_err(|error| {
        StoreError::invalid_response(format!(
            "stored {currency} rate {rate:?} is malformed: {error}"
        ))
    })?;

    Ok(InterestRate {
        date: sql::parse_date(&column::<String>(row, 0)?)?,
        currency,
        rate,
    })
}

/// Interest rates, scheduled through the store channel.
pub struct Rates<'s> {
    pub(crate) channel: &'s Channel,
}

impl Rates<'_> {
    pub async fn get(
        &self,
        currency: Option<Currency>,
        from: Option<Date>,
        to: Option<Date>,
    ) -> Result<Vec<InterestRate>> {
        self.channel
            .read(move |connection| Box::pin(get(connection, currency, from, to)))
            .await
    }

    pub async fn get_on(&self, date: Date, currency: Currency) -> Result<Option<InterestRate>> {
        self.channel
            .read(move |connection| Box::pin(get_on(connection, date, currency)))
            .await
    }

    pub async fn count(&self) -> Result<u64> {
        self.channel
            .read(|connection| Box::pin(count(connection)))
            .await
    }

    pub async fn update(&self, rates: Vec<InterestRate>) -> Result<()> {
        self.channel
            .write(move |connection| Box::pin(async move { update(connection, &rates).await }))
            .await
    }
}
