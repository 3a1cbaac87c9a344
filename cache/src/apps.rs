//! The `Apps` table: one row per API client application.

use entity::{Allowance, Application, ApplicationKey, ApplicationStatus, Permission};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Statement;
use time::OffsetDateTime;

use crate::channel::Channel;
use crate::error::{Result, StoreError};
use crate::sql::{self, column};

pub const TABLE: &str = "Apps";

pub(crate) const CREATE_TABLE: &str = "
    CREATE TABLE Apps (
        key           TEXT    NOT NULL CHECK( length(key) = 40 ),
        name          TEXT    NOT NULL CHECK( length(name) > 0 ),
        status        INTEGER NOT NULL CHECK( status BETWEEN -1 AND 1 ),
        equities      INTEGER NOT NULL CHECK( equities BETWEEN 0 AND 1 ),
        quotes        INTEGER NOT NULL CHECK( quotes BETWEEN 0 AND 1 ),
        overallReqs   INTEGER NOT NULL CHECK( overallReqs >= 0 ),
        accountReqs   INTEGER NOT NULL CHECK( accountReqs >= 0 ),
        tradingReqs   INTEGER NOT NULL CHECK( tradingReqs >= 0 ),
        historicData  INTEGER NOT NULL CHECK( historicData >= 0 ),
        subscriptions INTEGER NOT NULL CHECK( subscriptions >= 0 ),
        created       TEXT    NOT NULL CHECK( created IS date(created) ),
        updated       TEXT    NOT NULL CHECK( updated IS datetime(updated) ),
        PRIMARY KEY(key)
    ) WITHOUT ROWID
";

const COLUMNS: &str = "key, name, status, equities, quotes, overallReqs, accountReqs, \
                       tradingReqs, historicData, subscriptions, created, updated";

const UPSERT: &str = "
    INSERT INTO Apps (key, name, status, equities, quotes, overallReqs, accountReqs,
                      tradingReqs, historicData, subscriptions, created, updated)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(key) DO UPDATE SET
        name = excluded.name,
        status = excluded.status,
        equities = excluded.equities,
        quotes = excluded.quotes,
        overallReqs = excluded.overallReqs,
        accountReqs = excluded.accountReqs,
        tradingReqs = excluded.tradingReqs,
        historicData = excluded.historicData,
        subscriptions = excluded.subscriptions,
        created = excluded.created,
        updated = excluded.updated
";

pub async fn get_all(connection: &mut SqliteConnection) -> Result<Vec<Application>> {
    let sql = format!("SELECT {COLUMNS} FROM Apps ORDER BY key ASC");
    let statement = sql::prepare(connection, &sql).await?;

    statement
        .query()
        .fetch_all(&mut *connection)
        .await
        .map_err(StoreError::query("failed to read the stored applications"))?
        .iter()
        .map(decode)
        .collect()
}

/// The application with the given key, if stored.
pub async fn get(
    connection: &mut SqliteConnection,
    key: &ApplicationKey,
) -> Result<Option<Application>> {
    let sql = format!("SELECT {COLUMNS} FROM Apps WHERE key = ?");
    let statement = sql::prepare(connection, &sql).await?;

    statement
        .query()
        .bind(key.as_str().to_owned())
        .fetch_optional(&mut *connection)
        .await
        .map_err(StoreError::query(format!("failed to read application {key}")))?
        .as_ref()
        .map(decode)
        .transpose()
}

pub async fn count(connection: &mut SqliteConnection) -> Result<u64> {
    let statement = sql::prepare(connection, "SELECT COUNT(*) FROM Apps").await?;
    let count = statement
        .query_scalar::<i64>()
        .fetch_one(&mut *connection)
        .await
        .map_err(StoreError::query("failed to count the stored applications"))?;

    u64::try_from(count).map_err(|_| StoreError::invalid_response("negative application count"))
}

/// Upserts every application. The `updated` column is stamped with the time of the write.
pub async fn update(connection: &mut SqliteConnection, apps: &[Application]) -> Result<()> {
    let now = OffsetDateTime::now_utc();
    let updated = sql::format_datetime(now)?;
    let statement = sql::prepare(connection, UPSERT).await?;

    for app in apps {
        if app.created > now.date() {
            return Err(StoreError::invalid_request(format!(
                "application {} was created on {}, which is in the future",
                app.key, app.created
            )));
        }

        statement
            .query()
            .bind(app.key.as_str().to_owned())
            .bind(app.name.clone())
            .bind(app.status.raw())
            .bind(app.permission.access_to_equity_prices)
            .bind(app.permission.are_quote_orders_allowed)
            .bind(i64::from(app.allowance.overall_requests))
            .bind(i64::from(app.allowance.account_requests))
            .bind(i64::from(app.allowance.trading_requests))
            .bind(i64::from(app.allowance.historical_data_points))
            .bind(i64::from(app.allowance.concurrent_subscriptions))
            .bind(sql::format_date(app.created)?)
            .bind(updated.clone())
            .execute(&mut *connection)
            .await
            .map_err(StoreError::storage(format!(
                "failed to upsert application {}",
                app.key
            )))?;
    }

    Ok(())
}

fn decode(row: &SqliteRow) -> Result<Application> {
    let key: String = column(row, 0)?;
    let key = ApplicationKey::new(&key)
        .map_err(|error| StoreError::invalid_response(error.to_string()))?;

    let raw_status: i64 = column(row, 2)?;
    let status = ApplicationStatus::from_raw(raw_status).ok_or_else(|| {
        StoreError::invalid_response(format!(
            "application {key} has unknown status {raw_status}"
        ))
    })?;

    let allowance = |index: usize| -> Result<u32> {
        let value: i64 = column(row, index)?;
        u32::try_from(value).map_err(|_| {
            StoreError::invalid_response(format!(
                "application {key} has out-of-range allowance {value}"
            ))
        })
    };

    Ok(Application {
        name: column(row, 1)?,
        status,
        permission: Permission {
            access_to_equity_prices: column(row, 3)?,
            are_quote_orders_allowed: column(row, 4)?,
        },
        allowance: Allowance {
            overall_requests: allowance(5)?,
            account_requests: allowance(6)?,
            trading_requests: allowance(7)?,
            historical_data_points: allowance(8)?,
            concurrent_subscriptions: allowance(9)?,
        },
        created: sql::parse_date(&column::<String>(row, 10)?)?,
        updated: sql::parse_datetime(&column::<String>(row, 11)?)?,
        key,
    })
}

/// Applications, scheduled through the store channel.
pub struct Applications<'s> {
    pub(crate) channel: &'s Channel,
}

impl Applications<'_> {
    pub async fn get_all(&self) -> Result<Vec<Application>> {
        self.channel
            .read(|connection| Box::pin(get_all(connection)))
            .await
    }

    pub async fn get(&self, key: &ApplicationKey) -> Result<Option<Application>> {
        let key = key.clone();
        self.channel
            .read(move |connection| {
                Box::pin(async move { get(connection, &key).await })
            })
            .await
    }

    pub async fn count(&self) -> Result<u64> {
        self.channel
            .read(|connection| Box::pin(count(connection)))
            .await
    }

    pub async fn update(&self, apps: Vec<Application>) -> Result<()> {
        self.channel
            .write(move |connection| {
                Box::pin(async move { update(connection, &apps).await })
            })
            .await
    }
}
