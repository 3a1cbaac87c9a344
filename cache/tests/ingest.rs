use cache::ingest::{self, CacheEvent, EventReceiver, IngestSummary};
use cache::{Location, Store};
use entity::{Epic, Market, MarketKind, Point, Price};
use rust_decimal_macros::dec;
use time::macros::datetime;
use time::Duration;

fn tick(date: time::OffsetDateTime) -> Price {
    let point = Point::new(dec!(17480.2), dec!(17481.4));
    Price {
        date,
        open: point,
        close: point,
        lowest: point,
        highest: point,
        volume: 0,
    }
}

#[tokio::test]
async fn events_are_applied_in_order_and_failures_skipped() {
    let store = Store::open(Location::Memory).await.unwrap();
    let dax = Epic::new("IX.D.DAX.IFD.IP").unwrap();
    let unknown = Epic::new("IX.D.FTSE.IFD.IP").unwrap();
    let t = datetime!(2024-03-01 09:30 UTC);

    let receiver = EventReceiver::new();
    let markets = receiver.new_emitter::<Vec<Market>>();
    let ticks = receiver.new_emitter::<(Epic, Price)>();
    let batches = receiver.new_emitter::<CacheEvent>();
    let task = tokio::spawn(ingest::run_task(store.clone(), receiver));

    markets
        .emit(vec![Market::new(dax.clone(), Some(MarketKind::Indices))])
        .await;
    batches
        .emit(CacheEvent::Prices {
            epic: dax.clone(),
            prices: vec![tick(t), tick(t + Duration::seconds(1))],
        })
        .await;
    ticks.emit((dax.clone(), tick(t + Duration::seconds(2)))).await;
    ticks.emit((unknown.clone(), tick(t))).await;
    drop((markets, ticks, batches));

    let summary = task.await.unwrap();
    assert_eq!(
        summary,
        IngestSummary {
            applied: 3,
            failed: 1
        }
    );

    assert_eq!(store.prices().count(&dax).await.unwrap(), 3);
    assert_eq!(store.prices().count(&unknown).await.unwrap(), 0);
    assert_eq!(store.prices().epics().await.unwrap(), [dax]);

    store.close().await;
}

#[tokio::test]
async fn the_task_ends_without_emitters() {
    let store = Store::open(Location::Memory).await.unwrap();

    let summary = ingest::run_task(store.clone(), EventReceiver::new()).await;
    assert_eq!(summary, IngestSummary::default());

    store.close().await;
}
