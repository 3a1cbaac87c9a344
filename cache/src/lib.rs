//! Local SQLite cache for IG trading data.
//!
//! [`Store`] is the entry point: it opens a [`Channel`], brings the schema up to date and hands
//! out typed views over each table. Every operation runs on the channel's single worker, in
//! submission order.

pub mod apps;
pub mod channel;
pub mod error;
pub mod ingest;
pub mod markets;
pub mod migration;
pub mod prices;
pub mod rates;
mod sql;

pub use apps::Applications;
pub use channel::{Channel, Location, Pending};
pub use error::{Result, StoreError};
pub use markets::Markets;
pub use migration::SchemaVersion;
pub use prices::Prices;
pub use rates::Rates;
pub use sql::{decode_price, encode_price, PRICE_SCALE};

use common::config::StoreConfig;
use log::info;

/// An open, fully migrated store.
#[derive(Clone)]
pub struct Store {
    channel: Channel,
}

impl Store {
    /// Opens the store at `location` and migrates it to the latest schema. A store that can't be
    /// migrated is closed again before the error is returned.
    pub async fn open(location: Location) -> Result<Self> {
        let channel = Channel::open(location).await?;

        match migration::migrate_to_latest(&channel).await {
            Ok(version) => {
                info!("Store schema is at {version}");
                Ok(Self { channel })
            }
            Err(error) => {
                channel.close().await;
                Err(error)
            }
        }
    }

    pub async fn open_with(config: &StoreConfig) -> Result<Self> {
        Self::open(Location::from_config(config)?).await
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn applications(&self) -> Applications<'_> {
        Applications {
            channel: &self.channel,
        }
    }

    pub fn markets(&self) -> Markets<'_> {
        Markets {
            channel: &self.channel,
        }
    }

    pub fn prices(&self) -> Prices<'_> {
        Prices {
            channel: &self.channel,
        }
    }

    pub fn rates(&self) -> Rates<'_> {
        Rates {
            channel: &self.channel,
        }
    }

    pub async fn vacuum(&self) -> Result<()> {
        self.channel.vacuum().await
    }

    pub async fn optimize(&self) -> Result<()> {
        self.channel.optimize().await
    }

    /// Closes the store once queued operations have finished. Other clones stop working.
    pub async fn close(self) {
        self.channel.close().await
    }
}
