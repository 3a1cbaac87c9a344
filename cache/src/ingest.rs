//! Feeds records produced elsewhere (completed API fetches, streamed price ticks) into the store.

use std::{fmt::Debug, marker::PhantomData};

use entity::{Application, Epic, InterestRate, Market, Price};
use log::{debug, error, info, warn};
use tokio::sync::mpsc::{channel, Receiver, Sender};

use crate::error::Result;
use crate::Store;

const EVENT_BUFFER: usize = 16;

pub struct EventReceiver {
    rx: Receiver<CacheEvent>,
    tx: Sender<CacheEvent>,
}

impl EventReceiver {
    pub fn new() -> Self {
        let (tx, rx) = channel(EVENT_BUFFER);

        Self { rx, tx }
    }

    pub fn new_emitter<T: Into<CacheEvent> + Debug>(&self) -> EventEmitter<T> {
        EventEmitter {
            tx: self.tx.clone(),
            _marker: PhantomData,
        }
    }
}

impl Default for EventReceiver {
    fn default() -> Self {
        Self::new()
    }
}

pub struct EventEmitter<T> {
    tx: Sender<CacheEvent>,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for EventEmitter<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Into<CacheEvent> + Debug> EventEmitter<T> {
    /// Waits for room in the buffer, which applies back-pressure when the store falls behind.
    pub async fn emit(&self, event: T) {
        if let Err(error) = self.tx.send(event.into()).await {
            warn!("Failed to emit cache event: {:?}", error.0);
        }
    }
}

#[derive(Debug, Clone)]
pub enum CacheEvent {
    Applications(Vec<Application>),
    Markets(Vec<Market>),
    Prices { epic: Epic, prices: Vec<Price> },
    Rates(Vec<InterestRate>),
    /// A single price pushed by the streaming connection.
    Tick { epic: Epic, price: Price },
}

impl CacheEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Applications(_) => "applications",
            Self::Markets(_) => "markets",
            Self::Prices { .. } => "prices",
            Self::Rates(_) => "interest rates",
            Self::Tick { .. } => "price tick",
        }
    }
}

impl From<Vec<Application>> for CacheEvent {
    fn from(apps: Vec<Application>) -> Self {
        Self::Applications(apps)
    }
}

impl From<Vec<Market>> for CacheEvent {
    fn from(markets: Vec<Market>) -> Self {
        Self::Markets(markets)
    }
}

impl From<Vec<InterestRate>> for CacheEvent {
    fn from(rates: Vec<InterestRate>) -> Self {
        Self::Rates(rates)
    }
}

impl From<(Epic, Price)> for CacheEvent {
    fn from((epic, price): (Epic, Price)) -> Self {
        Self::Tick { epic, price }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub applied: usize,
    pub failed: usize,
}

/// Upserts events in arrival order until every emitter is dropped. A failed event is logged
/// and skipped.
pub async fn run_task(store: Store, receiver: EventReceiver) -> IngestSummary {
    let EventReceiver { mut rx, tx } = receiver;
    // Only emitters may keep the task alive
    drop(tx);

    let mut summary = IngestSummary::default();
    while let Some(event) = rx.recv().await {
        let kind = event.kind();
        match apply(&store, event).await {
            Ok(()) => {
                debug!("Stored {kind}");
                summary.applied += 1;
            }
            Err(error) => {
                error!("Failed to store {kind}: {error}");
                summary.failed += 1;
            }
        }
    }

    info!(
        "Ingest finished: {} events applied, {} failed",
        summary.applied, summary.failed
    );
    summary
}

async fn apply(store: &Store, event: CacheEvent) -> Result<()> {
    match event {
        CacheEvent::Applications(apps) => store.applications().update(apps).await,
        CacheEvent::Markets(markets) => store.markets().update(markets).await,
        CacheEvent::Prices { epic, prices } => store.prices().update(&epic, prices).await,
        CacheEvent::Rates(rates) => store.rates().update(rates).await,
        CacheEvent::Tick { epic, price } => store.prices().update(&epic, vec![price]).await,
    }
}
