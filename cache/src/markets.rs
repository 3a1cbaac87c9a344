//! The `Markets` table: one row per tradeable instrument. A market must be registered here before
//! any price history for it can be stored.

use entity::{Epic, Market, MarketKind};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Statement;

use crate::channel::Channel;
use crate::error::{Result, StoreError};
use crate::sql::{self, column};

pub const TABLE: &str = "Markets";

pub(crate) const CREATE_TABLE: &str = "
    CREATE TABLE Markets (
        epic TEXT    NOT NULL CHECK( length(epic) BETWEEN 6 AND 30 AND upper(epic) = epic ),
        type INTEGER          CHECK( type IS NULL OR type > 0 ),
        PRIMARY KEY(epic)
    ) WITHOUT ROWID
";

const UPSERT: &str = "
    INSERT INTO Markets (epic, type) VALUES (?, ?)
    ON CONFLICT(epic) DO UPDATE SET type = excluded.type
";

pub async fn get_all(connection: &mut SqliteConnection) -> Result<Vec<Market>> {
    let statement =
        sql::prepare(connection, "SELECT epic, type FROM Markets ORDER BY epic ASC").await?;

    statement
        .query()
        .fetch_all(&mut *connection)
        .await
        .map_err(StoreError::query("failed to read the stored markets"))?
        .iter()
        .map(decode)
        .collect()
}

pub async fn get(connection: &mut SqliteConnection, epic: &Epic) -> Result<Option<Market>> {
    let statement =
        sql::prepare(connection, "SELECT epic, type FROM Markets WHERE epic = ?").await?;

    statement
        .query()
        .bind(epic.as_str().to_owned())
        .fetch_optional(&mut *connection)
        .await
        .map_err(StoreError::query(format!("failed to read market {epic}")))?
        .as_ref()
        .map(decode)
        .transpose()
}

/// Markets whose epic is in `epics`. Epics that aren't registered are skipped.
pub async fn get_many(connection: &mut SqliteConnection, epics: &[Epic]) -> Result<Vec<Market>> {
    if epics.is_empty() {
        return Err(StoreError::invalid_request(
            "at least one epic is needed to search for markets",
        ));
    }

    let placeholders = vec!["?"; epics.len()].join(", ");
    let sql = format!(
        "SELECT epic, type FROM Markets WHERE epic IN ({placeholders}) ORDER BY epic ASC"
    );

    let mut query = sqlx::query(&sql);
    for epic in epics {
        query = query.bind(epic.as_str().to_owned());
    }

    query
        .fetch_all(&mut *connection)
        .await
        .map_err(StoreError::query("failed to search for markets"))?
        .iter()
        .map(decode)
        .collect()
}

pub async fn count(connection: &mut SqliteConnection) -> Result<u64> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM Markets")
        .fetch_one(&mut *connection)
        .await
        .map_err(StoreError::query("failed to count the stored markets"))?;

    u64::try_from(count).map_err(|_| StoreError::invalid_response("negative market count"))
}

pub async fn contains(connection: &mut SqliteConnection, epic: &Epic) -> Result<bool> {
    sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM Markets WHERE epic = ?)")
        .bind(epic.as_str().to_owned())
        .fetch_one(&mut *connection)
        .await
        .map_err(StoreError::query(format!("failed to look up market {epic}")))
}

pub async fn update(connection: &mut SqliteConnection, markets: &[Market]) -> Result<()> {
    let statement = sql::prepare(connection, UPSERT).await?;

    for market in markets {
        statement
            .query()
            .bind(market.epic.as_str().to_owned())
            .bind(market.kind.map(MarketKind::code))
            .execute(&mut *connection)
            .await
            .map_err(StoreError::storage(format!(
                "failed to upsert market {}",
                market.epic
            )))?;
    }

    Ok(())
}

fn decode(row: &SqliteRow) -> Result<Market> {
    let epic: String = column(row, 0)?;
    let epic = Epic::new(&epic).map_err(|error| StoreError::invalid_response(error.to_string()))?;

    let kind = match column::<Option<i64>>(row, 1)? {
        None => None,
        Some(code) => Some(MarketKind::from_code(code).ok_or_else(|| {
            StoreError::invalid_response(format!("market {epic} has unknown type {code}"))
        })?),
    };

    Ok(Market::new(epic, kind))
}

/// Markets, scheduled through the store channel.
pub struct Markets<'s> {
    pub(crate) channel: &'s Channel,
}

impl Markets<'_> {
    pub async fn get_all(&self) -> Result<Vec<Market>> {
        self.channel
            .read(|connection| Box::pin(get_all(connection)))
            .await
    }

    pub async fn get(&self, epic: &Epic) -> Result<Option<Market>> {
        let epic = epic.clone();
        self.channel
            .read(move |connection| Box::pin(async move { get(connection, &epic).await }))
            .await
    }

    pub async fn get_many(&self, epics: Vec<Epic>) -> Result<Vec<Market>> {
        self.channel
            .read(move |connection| Box::pin(async move { get_many(connection, &epics).await }))
            .await
    }

    pub async fn count(&self) -> Result<u64> {
        self.channel
            .read(|connection| Box::pin(count(connection)))
            .await
    }

    pub async fn contains(&self, epic: &Epic) -> Result<bool> {
        let epic = epic.clone();
        self.channel
            .read(move |connection| Box::pin(async move { contains(connection, &epic).await }))
            .await
    }

    pub async fn update(&self, markets: Vec<Market>) -> Result<()> {
        self.channel
            .write(move |connection| Box::pin(async move { update(connection, &markets).await }))
            .await
    }
}
