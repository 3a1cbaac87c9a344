mod logging;

use anyhow::Context;
use cache::Store;
use common::config::Config;
use log::{error, info};
use std::panic::{self, AssertUnwindSafe};
use tokio::runtime::Builder;

fn main() {
    if let Err(error) = setup_and_launch() {
        println!("{error:?}");
    }
}

fn setup_and_launch() -> Result<(), anyhow::Error> {
    Config::init().context("Failed to initialize config")?;
    let config = Config::get();

    logging::init_logger(&config.log_directory, config.log_level_filter)
        .context("Failed to initialize logger")?;

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        Builder::new_current_thread()
            .enable_time()
            .build()
            .context("Failed to launch runtime")
            .and_then(|rt| rt.block_on(launch(config)))
    }));

    match result {
        // Success
        Ok(Ok(())) => (),
        // Regular error which was bubbled up to us
        Ok(Err(error)) => error!("Caught error: {error:?}"),
        // We caught a panic
        Err(panic) => {
            let message = panic
                .downcast_ref::<String>()
                .map(|string| &**string)
                .or_else(|| panic.downcast_ref::<&'static str>().copied());

            match message {
                Some(message) => error!("Caught panic: {message}"),
                None => error!("Caught panic; unable to extract associated message"),
            }
        }
    }

    logging::cleanup(&config.log_directory);
    Ok(())
}

/// Opens and migrates the configured store, runs the maintenance passes and reports what it
/// holds.
async fn launch(config: &Config) -> anyhow::Result<()> {
    let store = Store::open_with(&config.store)
        .await
        .with_context(|| format!("Failed to open store at {}", config.store.location))?;

    store.optimize().await.context("Failed to optimize store")?;
    if config.maintenance.vacuum_on_start {
        store.vacuum().await.context("Failed to vacuum store")?;
        info!("Vacuumed store");
    }

    let applications = store.applications().count().await?;
    let markets = store.markets().count().await?;
    let rates = store.rates().count().await?;
    info!("Store holds {applications} applications, {markets} markets and {rates} interest rates");

    for epic in store.prices().epics().await? {
        let count = store.prices().count(&epic).await?;
        match (store.prices().first(&epic).await?, store.prices().last(&epic).await?) {
            (Some(first), Some(last)) => {
                info!("{epic}: {count} prices from {} to {}", first.date, last.date)
            }
            _ => info!("{epic}: no prices"),
        }
    }

    store.close().await;
    Ok(())
}
