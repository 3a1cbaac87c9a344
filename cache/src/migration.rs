//! Forward-only schema evolution.
//!
//! The schema version lives in `PRAGMA user_version` and the application tag in
//! `PRAGMA application_id`, both inside the store file. Every step runs in its own exclusive
//! transaction and bumps `user_version` as its last statement, so a failed step leaves the store
//! exactly at the previous version.

use std::fmt::{self, Display, Formatter};

use log::{debug, info};
use sqlx::sqlite::SqliteConnection;

use crate::channel::Channel;
use crate::error::{Result, StoreError};
use crate::{apps, markets, rates};

/// Tag written to `PRAGMA application_id` by the first migration ("IGCA").
pub const APPLICATION_ID: i64 = 0x4947_4341;

/// Every schema the store has ever had, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SchemaVersion {
    /// A store nothing has been written to.
    V0,
    /// Application tag, `Apps` and `Markets`.
    V1,
    /// `InterestRates`.
    V2,
}

impl SchemaVersion {
    pub const LATEST: Self = Self::V2;

    pub fn raw(self) -> i64 {
        match self {
            Self::V0 => 0,
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }

    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(Self::V0),
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            _ => None,
        }
    }

    pub fn next(self) -> Option<Self> {
        Self::from_raw(self.raw() + 1)
    }

    fn previous(self) -> Option<Self> {
        Self::from_raw(self.raw() - 1)
    }

    /// DDL run by the step that reaches this version.
    fn statements(self) -> &'static [&'static str] {
        match self {
            Self::V0 => &[],
            Self::V1 => &[apps::CREATE_TABLE, markets::CREATE_TABLE],
            Self::V2 => &[rates::CREATE_TABLE],
        }
    }
}

impl Display for SchemaVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.raw())
    }
}

/// Reads the persisted version, checking that the store belongs to this application.
pub async fn current_version(channel: &Channel) -> Result<SchemaVersion> {
    channel
        .read(|connection| Box::pin(persisted_version(connection)))
        .await
}

/// Walks the store up to `target` one step at a time. Returns the version the store ends at.
///
/// A store already past `target` is left untouched and the call fails; there are no
/// down-migrations.
pub async fn migrate(channel: &Channel, target: SchemaVersion) -> Result<SchemaVersion> {
    let mut version = current_version(channel).await?;

    if version > target {
        return Err(StoreError::invalid_request(format!(
            "cannot migrate the store down from {version} to {target}"
        )));
    }

    if version == target {
        debug!("Store schema already at {target}");
        return Ok(version);
    }

    while version < target {
        let Some(step) = version.next() else {
            break;
        };

        let applied = channel
            .write(move |connection| Box::pin(apply_step(connection, step)))
            .await?;

        if applied {
            info!("Migrated store schema from {version} to {step}");
        } else {
            debug!("Store schema step to {step} was applied concurrently");
        }
        version = step;
    }

    Ok(version)
}

pub async fn migrate_to_latest(channel: &Channel) -> Result<SchemaVersion> {
    migrate(channel, SchemaVersion::LATEST).await
}

async fn read_pragma(connection: &mut SqliteConnection, pragma: &str) -> Result<i64> {
    sqlx::query_scalar::<_, i64>(&format!("PRAGMA {pragma}"))
        .fetch_one(&mut *connection)
        .await
        .map_err(StoreError::query(format!("failed to read PRAGMA {pragma}")))
}

async fn persisted_version(connection: &mut SqliteConnection) -> Result<SchemaVersion> {
    let raw = read_pragma(connection, "user_version").await?;
    let tag = read_pragma(connection, "application_id").await?;

    let version = SchemaVersion::from_raw(raw).ok_or_else(|| {
        StoreError::invalid_response(format!(
            "store schema version {raw} is newer than the latest supported {}",
            SchemaVersion::LATEST
        ))
    })?;

    match (tag, version) {
        (APPLICATION_ID, _) => Ok(version),
        (0, SchemaVersion::V0) => Ok(version),
        (0, _) => Err(StoreError::invalid_response(format!(
            "store is at schema {version} but carries no application tag"
        ))),
        (other, _) => Err(StoreError::invalid_response(format!(
            "store belongs to another application (application_id {other:#x})"
        ))),
    }
}

/// Applies the step reaching `step`. Returns `false` when the store already got there.
async fn apply_step(connection: &mut SqliteConnection, step: SchemaVersion) -> Result<bool> {
    let persisted = persisted_version(connection).await?;
    if persisted >= step {
        return Ok(false);
    }

    if Some(persisted) != step.previous() {
        return Err(StoreError::invalid_response(format!(
            "store is at {persisted}, which can't step to {step}"
        )));
    }

    if step == SchemaVersion::V1 {
        execute(connection, &format!("PRAGMA application_id = {APPLICATION_ID}")).await?;
    }

    for statement in step.statements() {
        execute(connection, statement).await?;
    }

    // Must stay last: the version only moves once the whole step went through
    execute(connection, &format!("PRAGMA user_version = {}", step.raw())).await?;
    Ok(true)
}

async fn execute(connection: &mut SqliteConnection, statement: &str) -> Result<()> {
    sqlx::query(statement)
        .persistent(false)
        .execute(&mut *connection)
        .await
        .map_err(StoreError::storage(format!(
            "migration statement failed: {}",
            statement.trim()
        )))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_step_in_order() {
        assert_eq!(SchemaVersion::V0.next(), Some(SchemaVersion::V1));
        assert_eq!(SchemaVersion::V1.next(), Some(SchemaVersion::V2));
        assert_eq!(SchemaVersion::LATEST.next(), None);
        assert_eq!(SchemaVersion::V0.previous(), None);
        assert!(SchemaVersion::V0 < SchemaVersion::LATEST);
    }

    #[test]
    fn raw_values_round_trip() {
        for raw in 0..=SchemaVersion::LATEST.raw() {
            assert_eq!(SchemaVersion::from_raw(raw).map(SchemaVersion::raw), Some(raw));
        }
        assert_eq!(SchemaVersion::from_raw(-1), None);
        assert_eq!(SchemaVersion::from_raw(SchemaVersion::LATEST.raw() + 1), None);
    }

    #[test]
    fn only_later_steps_create_tables() {
        assert!(SchemaVersion::V0.statements().is_empty());
        assert!(SchemaVersion::V1.statements()[0].contains("CREATE TABLE Apps"));
        assert!(SchemaVersion::V2.statements()[0].contains("CREATE TABLE InterestRates"));
    }
}
