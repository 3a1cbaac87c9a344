//! Historical prices, one `Price_<epic>` table per instrument.
//!
//! Tables are created lazily by the first write for an instrument, and only once the instrument
//! is registered in `Markets`. Reads against an instrument without a table see no rows.

use entity::{Epic, Point, Price};
use log::debug;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Statement;
use time::OffsetDateTime;

use crate::channel::Channel;
use crate::error::{Result, StoreError};
use crate::markets;
use crate::sql::{self, column, decode_price, encode_price, Filter};

pub const TABLE_PREFIX: &str = "Price_";

const COLUMNS: &str =
    "date, openBid, openAsk, closeBid, closeAsk, lowBid, lowAsk, highBid, highAsk, volume";

pub fn table_name(epic: &Epic) -> String {
    format!("{TABLE_PREFIX}{epic}")
}

fn create_table(table: &str) -> String {
    format!(
        "
        CREATE TABLE IF NOT EXISTS {} (
            date     TEXT    NOT NULL CHECK( date IS datetime(date) ),
            openBid  INTEGER NOT NULL,
            openAsk  INTEGER NOT NULL,
            closeBid INTEGER NOT NULL,
            closeAsk INTEGER NOT NULL,
            lowBid   INTEGER NOT NULL,
            lowAsk   INTEGER NOT NULL,
            highBid  INTEGER NOT NULL,
            highAsk  INTEGER NOT NULL,
            volume   INTEGER NOT NULL CHECK( volume >= 0 ),
            PRIMARY KEY(date)
        ) WITHOUT ROWID
        ",
        sql::quote_identifier(table)
    )
}

fn upsert(table: &str) -> String {
    format!(
        "
        INSERT INTO {} ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(date) DO UPDATE SET
            openBid = excluded.openBid,
            openAsk = excluded.openAsk,
            closeBid = excluded.closeBid,
            closeAsk = excluded.closeAsk,
            lowBid = excluded.lowBid,
            lowAsk = excluded.lowAsk,
            highBid = excluded.highBid,
            highAsk = excluded.highAsk,
            volume = excluded.volume
        ",
        sql::quote_identifier(table)
    )
}

/// Prices of `epic` with `from <= date <= to`, oldest first. Either bound may be left open.
pub async fn get(
    connection: &mut SqliteConnection,
    epic: &Epic,
    from: Option<OffsetDateTime>,
    to: Option<OffsetDateTime>,
) -> Result<Vec<Price>> {
    let Some((from, to)) = sql::whole_seconds(from, to)? else {
        return Ok(Vec::new());
    };
    let filter = Filter::new().range("date", from, to, sql::format_datetime)?;

    let table = table_name(epic);
    if !sql::table_exists(connection, &table).await? {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT {COLUMNS} FROM {}{} ORDER BY date ASC",
        sql::quote_identifier(&table),
        filter.where_clause()
    );

    filter
        .bind(sqlx::query(&sql))
        .fetch_all(&mut *connection)
        .await
        .map_err(StoreError::query(format!("failed to read prices of {epic}")))?
        .iter()
        .map(decode)
        .collect()
}

pub async fn count(connection: &mut SqliteConnection, epic: &Epic) -> Result<u64> {
    let table = table_name(epic);
    if !sql::table_exists(connection, &table).await? {
        return Ok(0);
    }

    let sql = format!("SELECT COUNT(*) FROM {}", sql::quote_identifier(&table));
    let count = sqlx::query_scalar::<_, i64>(&sql)
        .fetch_one(&mut *connection)
        .await
        .map_err(StoreError::query(format!("failed to count prices of {epic}")))?;

    u64::try_from(count).map_err(|_| StoreError::invalid_response("negative price count"))
}

/// The oldest stored price of `epic`.
pub async fn first(connection: &mut SqliteConnection, epic: &Epic) -> Result<Option<Price>> {
    edge(connection, epic, "ASC").await
}

/// The most recent stored price of `epic`.
pub async fn last(connection: &mut SqliteConnection, epic: &Epic) -> Result<Option<Price>> {
    edge(connection, epic, "DESC").await
}

async fn edge(
    connection: &mut SqliteConnection,
    epic: &Epic,
    order: &'static str,
) -> Result<Option<Price>> {
    let table = table_name(epic);
    if !sql::table_exists(connection, &table).await? {
        return Ok(None);
    }

    let sql = format!(
        "SELECT {COLUMNS} FROM {} ORDER BY date {order} LIMIT 1",
        sql::quote_identifier(&table)
    );

    sqlx::query(&sql)
        .fetch_optional(&mut *connection)
        .await
        .map_err(StoreError::query(format!("failed to read prices of {epic}")))?
        .as_ref()
        .map(decode)
        .transpose()
}

/// Instruments that have a price table, sorted.
pub async fn epics(connection: &mut SqliteConnection) -> Result<Vec<Epic>> {
    let tables = sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND substr(name, 1, ?) = ?
         ORDER BY name",
    )
    .bind(TABLE_PREFIX.len() as i64)
    .bind(TABLE_PREFIX)
    .fetch_all(&mut *connection)
    .await
    .map_err(StoreError::query("failed to list the price tables"))?;

    tables
        .iter()
        .filter_map(|table| table.strip_prefix(TABLE_PREFIX))
        .map(|epic| {
            Epic::new(epic).map_err(|error| {
                StoreError::invalid_response(format!("unexpected price table: {error}"))
            })
        })
        .collect()
}

/// Upserts `prices` for `epic`, creating its table first if needed.
///
/// Fails without touching the store if the market isn't registered or a price is dated in the
/// future. An empty batch leaves the store as it is. Timestamps are stored to the second; prices
/// within the same second overwrite each other.
pub async fn update(
    connection: &mut SqliteConnection,
    epic: &Epic,
    prices: &[Price],
) -> Result<()> {
    if !markets::contains(connection, epic).await? {
        return Err(StoreError::invalid_request(format!(
            "market {epic} is not registered"
        )));
    }

    if prices.is_empty() {
        return Ok(());
    }

    let mut rows = Vec::with_capacity(prices.len());
    for price in prices {
        sql::ensure_not_future(price.date, "price date")?;
        let volume = i64::try_from(price.volume).map_err(|_| {
            StoreError::invalid_request(format!(
                "volume {} of {epic} at {} doesn't fit the store",
                price.volume, price.date
            ))
        })?;
        rows.push((sql::format_datetime(price.date)?, price, volume));
    }

    let table = table_name(epic);
    if !sql::table_exists(connection, &table).await? {
        debug!("Creating price table for {epic}");
        sqlx::query(&create_table(&table))
            .persistent(false)
            .execute(&mut *connection)
            .await
            .map_err(StoreError::storage(format!(
                "failed to create the price table of {epic}"
            )))?;
    }

    let sql = upsert(&table);
    let statement = sql::prepare(connection, &sql).await?;

    for (date, price, volume) in rows {
        statement
            .query()
            .bind(date)
            .bind(encode_price(price.open.bid))
            .bind(encode_price(price.open.ask))
            .bind(encode_price(price.close.bid))
            .bind(encode_price(price.close.ask))
            .bind(encode_price(price.lowest.bid))
            .bind(encode_price(price.lowest.ask))
            .bind(encode_price(price.highest.bid))
            .bind(encode_price(price.highest.ask))
            .bind(volume)
            .execute(&mut *connection)
            .await
            .map_err(StoreError::storage(format!(
                "failed to upsert the price of {epic} at {}",
                price.date
            )))?;
    }

    Ok(())
}

fn decode(row: &SqliteRow) -> Result<Price> {
    let point = |bid: usize, ask: usize| -> Result<Point> {
        Ok(Point::new(
            decode_price(column(row, bid)?),
            decode_price(column(row, ask)?),
        ))
    };

    let volume: i64 = column(row, 9)?;

    Ok(Price {
        date: sql::parse_datetime(&column::<String>(row, 0)?)?,
        open: point(1, 2)?,
        close: point(3, 4)?,
        lowest: point(5, 6)?,
        highest: point(7, 8)?,
        volume: u64::try_from(volume)
            .map_err(|_| StoreError::invalid_response(format!("negative volume {volume}")))?,
    })
}

/// Per-instrument price history, scheduled through the store channel.
pub struct Prices<'s> {
    pub(crate) channel: &'s Channel,
}

impl Prices<'_> {
    pub async fn get(
        &self,
        epic: &Epic,
        from: Option<OffsetDateTime>,
        to: Option<OffsetDateTime>,
    ) -> Result<Vec<Price>> {
        let epic = epic.clone();
        self.channel
            .read(move |connection| {
                Box::pin(async move { get(connection, &epic, from, to).await })
            })
            .await
    }

    pub async fn count(&self, epic: &Epic) -> Result<u64> {
        let epic = epic.clone();
        self.channel
            .read(move |connection| Box::pin(async move { count(connection, &epic).await }))
            .await
    }

    pub async fn first(&self, epic: &Epic) -> Result<Option<Price>> {
        let epic = epic.clone();
        self.channel
            .read(move |connection| Box::pin(async move { first(connection, &epic).await }))
            .await
    }

    pub async fn last(&self, epic: &Epic) -> Result<Option<Price>> {
        let epic = epic.clone();
        self.channel
            .read(move |connection| Box::pin(async move { last(connection, &epic).await }))
            .await
    }

    pub async fn epics(&self) -> Result<Vec<Epic>> {
        self.channel
            .read(|connection| Box::pin(epics(connection)))
            .await
    }

    pub async fn update(&self, epic: &Epic, prices: Vec<Price>) -> Result<()> {
        let epic = epic.clone();
        self.channel
            .write(move |connection| {
                Box::pin(async move { update(connection, &epic, &prices).await })
            })
            .await
    }
}
