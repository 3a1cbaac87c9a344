use cache::{Location, Store, StoreError};
use entity::{
    Allowance, Application, ApplicationKey, ApplicationStatus, CurrencyMarket, Currency, Epic,
    InterestRate, Market, MarketKind, Permission, Point, Price,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use time::macros::{date, datetime};
use time::{Duration, OffsetDateTime};

const EURUSD: &str = "CS.D.EURUSD.MINI.IP";
const DAX: &str = "IX.D.DAX.IFD.IP";

async fn open() -> Store {
    Store::open(Location::Memory).await.unwrap()
}

fn epic(name: &str) -> Epic {
    Epic::new(name).unwrap()
}

fn forex(name: &str) -> Market {
    Market::new(epic(name), Some(MarketKind::Currencies(CurrencyMarket::Forex)))
}

fn price(date: OffsetDateTime, bid: Decimal) -> Price {
    let point = Point::new(bid, bid + dec!(0.00010));
    Price {
        date,
        open: point,
        close: point,
        lowest: Point::new(bid - dec!(0.00100), bid - dec!(0.00090)),
        highest: Point::new(bid + dec!(0.00100), bid + dec!(0.00110)),
        volume: 1_250,
    }
}

fn application(key: char, name: &str) -> Application {
    Application {
        key: ApplicationKey::new(&key.to_string().repeat(40)).unwrap(),
        name: name.to_owned(),
        status: ApplicationStatus::Enabled,
        permission: Permission {
            access_to_equity_prices: true,
            are_quote_orders_allowed: false,
        },
        allowance: Allowance {
            overall_requests: 60,
            account_requests: 30,
            trading_requests: 100,
            historical_data_points: 10_000,
            concurrent_subscriptions: 40,
        },
        created: date!(2019 - 05 - 14),
        updated: datetime!(2020-01-01 0:00 UTC),
    }
}

fn rate(date: time::Date, currency: &str, value: Decimal) -> InterestRate {
    InterestRate {
        date,
        currency: Currency::new(currency).unwrap(),
        rate: value,
    }
}

#[tokio::test]
async fn range_queries_over_a_registered_market() {
    let store = open().await;
    let epic = epic(EURUSD);
    let t = datetime!(2024-03-01 09:30 UTC);

    store.markets().update(vec![forex(EURUSD)]).await.unwrap();
    store
        .prices()
        .update(
            &epic,
            vec![
                price(t, dec!(1.08001)),
                price(t + Duration::minutes(1), dec!(1.08002)),
                price(t + Duration::minutes(2), dec!(1.08003)),
            ],
        )
        .await
        .unwrap();

    let prices = store
        .prices()
        .get(&epic, Some(t), Some(t + Duration::minutes(1)))
        .await
        .unwrap();
    assert_eq!(prices.len(), 2);
    assert_eq!(prices[0].date, t);
    assert_eq!(prices[1].date, t + Duration::minutes(1));
    assert_eq!(prices[0], price(t, dec!(1.08001)));
    assert_eq!(store.prices().count(&epic).await.unwrap(), 3);

    store.close().await;
}

#[tokio::test]
async fn open_bounds_match_everything_on_that_side() {
    let store = open().await;
    let epic = epic(EURUSD);
    let t = datetime!(2024-03-01 09:30 UTC);
    let dates: Vec<_> = (0..5).map(|minute| t + Duration::minutes(minute)).collect();

    store.markets().update(vec![forex(EURUSD)]).await.unwrap();
    // Inserted out of order on purpose
    let rows = dates.iter().rev().map(|date| price(*date, dec!(1.1))).collect();
    store.prices().update(&epic, rows).await.unwrap();

    let all = store.prices().get(&epic, None, None).await.unwrap();
    assert_eq!(all.iter().map(|price| price.date).collect::<Vec<_>>(), dates);

    let since = store.prices().get(&epic, Some(dates[3]), None).await.unwrap();
    assert_eq!(since.len(), 2);
    assert_eq!(since[0].date, dates[3]);

    let until = store.prices().get(&epic, None, Some(dates[1])).await.unwrap();
    assert_eq!(until.len(), 2);
    assert_eq!(until[1].date, dates[1]);

    let from_earliest = store.prices().get(&epic, Some(dates[0]), Some(dates[2])).await.unwrap();
    let unbounded = store.prices().get(&epic, None, Some(dates[2])).await.unwrap();
    assert_eq!(from_earliest, unbounded);

    let error = store
        .prices()
        .get(&epic, Some(dates[2]), Some(dates[1]))
        .await
        .unwrap_err();
    assert!(error.is_invalid_request());
    assert!(error.to_string().contains("after to date"));

    store.close().await;
}

#[tokio::test]
async fn instruments_without_history_read_as_empty() {
    let store = open().await;
    let epic = epic(DAX);

    assert!(store.prices().get(&epic, None, None).await.unwrap().is_empty());
    assert_eq!(store.prices().count(&epic).await.unwrap(), 0);
    assert_eq!(store.prices().first(&epic).await.unwrap(), None);
    assert_eq!(store.prices().last(&epic).await.unwrap(), None);

    store.close().await;
}

#[tokio::test]
async fn prices_need_a_registered_market() {
    let store = open().await;
    let epic = epic(DAX);
    let t = datetime!(2024-03-01 09:30 UTC);

    let error = store
        .prices()
        .update(&epic, vec![price(t, dec!(17500.5))])
        .await
        .unwrap_err();
    assert!(error.is_invalid_request());
    assert!(error.to_string().contains("not registered"));

    let tables = store.channel().tables().await.unwrap();
    assert!(!tables.iter().any(|table| table.starts_with("Price_")));
    assert!(store.prices().epics().await.unwrap().is_empty());

    store.close().await;
}

#[tokio::test]
async fn future_prices_are_rejected_before_any_table_exists() {
    let store = open().await;
    let epic = epic(EURUSD);
    let tomorrow = OffsetDateTime::now_utc() + Duration::days(1);

    store.markets().update(vec![forex(EURUSD)]).await.unwrap();
    let error = store
        .prices()
        .update(&epic, vec![price(tomorrow, dec!(1.1))])
        .await
        .unwrap_err();
    assert!(error.is_invalid_request());
    assert!(error.to_string().contains("in the future"));
    assert!(store.prices().epics().await.unwrap().is_empty());

    store.close().await;
}

#[tokio::test]
async fn price_upserts_overwrite_by_date() {
    let store = open().await;
    let epic = epic(EURUSD);
    let t = datetime!(2024-03-01 09:30 UTC);

    store.markets().update(vec![forex(EURUSD)]).await.unwrap();
    for _ in 0..2 {
        store
            .prices()
            .update(&epic, vec![price(t, dec!(1.1))])
            .await
            .unwrap();
    }
    assert_eq!(store.prices().count(&epic).await.unwrap(), 1);

    store
        .prices()
        .update(&epic, vec![price(t, dec!(1.2))])
        .await
        .unwrap();
    let stored = store.prices().get(&epic, None, None).await.unwrap();
    assert_eq!(stored, [price(t, dec!(1.2))]);

    store.close().await;
}

#[tokio::test]
async fn prices_are_kept_to_five_decimals() {
    let store = open().await;
    let epic = epic(EURUSD);
    let t = datetime!(2024-03-01 09:30 UTC);

    store.markets().update(vec![forex(EURUSD)]).await.unwrap();
    let mut precise = price(t, dec!(1.1));
    precise.close = Point::new(dec!(1.123456789), dec!(1.987654321));
    store.prices().update(&epic, vec![precise]).await.unwrap();

    let stored = store.prices().last(&epic).await.unwrap().unwrap();
    assert_eq!(stored.close, Point::new(dec!(1.12345), dec!(1.98765)));

    store.close().await;
}

#[tokio::test]
async fn first_and_last_bracket_the_history() {
    let store = open().await;
    let t = datetime!(2024-03-01 09:30 UTC);

    store
        .markets()
        .update(vec![forex(EURUSD), forex("CS.D.GBPUSD.MINI.IP")])
        .await
        .unwrap();
    store
        .prices()
        .update(
            &epic(EURUSD),
            vec![
                price(t + Duration::hours(1), dec!(1.2)),
                price(t, dec!(1.1)),
            ],
        )
        .await
        .unwrap();

    let first = store.prices().first(&epic(EURUSD)).await.unwrap().unwrap();
    let last = store.prices().last(&epic(EURUSD)).await.unwrap().unwrap();
    assert_eq!(first.date, t);
    assert_eq!(last.date, t + Duration::hours(1));

    assert_eq!(store.prices().epics().await.unwrap(), [epic(EURUSD)]);

    store.close().await;
}

#[tokio::test]
async fn sub_second_bounds_never_widen_the_range() {
    let store = open().await;
    let epic = epic(EURUSD);
    let t = datetime!(2024-03-01 09:30 UTC);
    let half = Duration::milliseconds(500);

    store.markets().update(vec![forex(EURUSD)]).await.unwrap();
    store
        .prices()
        .update(
            &epic,
            vec![
                price(t, dec!(1.1)),
                price(t + Duration::SECOND, dec!(1.2)),
                price(t + Duration::seconds(2), dec!(1.3)),
            ],
        )
        .await
        .unwrap();

    let dates = |prices: Vec<Price>| {
        prices
            .into_iter()
            .map(|price| price.date)
            .collect::<Vec<_>>()
    };

    let after = store.prices().get(&epic, Some(t + half), None).await.unwrap();
    assert_eq!(dates(after), [t + Duration::SECOND, t + Duration::seconds(2)]);

    let before = store.prices().get(&epic, None, Some(t + half)).await.unwrap();
    assert_eq!(dates(before), [t]);

    let between = store
        .prices()
        .get(&epic, Some(t + half), Some(t + Duration::SECOND + half))
        .await
        .unwrap();
    assert_eq!(dates(between), [t + Duration::SECOND]);

    let inside_one_second = store
        .prices()
        .get(&epic, Some(t + Duration::milliseconds(100)), Some(t + half))
        .await
        .unwrap();
    assert!(inside_one_second.is_empty());

    store.close().await;
}

#[tokio::test]
async fn empty_price_batches_create_no_table() {
    let store = open().await;
    let epic = epic(EURUSD);

    store.markets().update(vec![forex(EURUSD)]).await.unwrap();
    store.prices().update(&epic, Vec::new()).await.unwrap();

    assert!(store.prices().epics().await.unwrap().is_empty());
    assert_eq!(store.prices().count(&epic).await.unwrap(), 0);

    store.close().await;
}

#[tokio::test]
async fn markets_only_hold_uppercase_epics() {
    let store = open().await;

    let inserted = store
        .channel()
        .write(|connection| {
            Box::pin(async move {
                sqlx::query("INSERT INTO Markets (epic) VALUES ('cs.d.eurusd.mini.ip')")
                    .execute(connection)
                    .await
                    .map_err(StoreError::storage("failed to insert a lowercase epic"))?;
                Ok(())
            })
        })
        .await;
    assert!(matches!(inserted, Err(StoreError::Storage { .. })));
    assert_eq!(store.markets().count().await.unwrap(), 0);

    store.close().await;
}

#[tokio::test]
async fn markets_round_trip_their_kind() {
    let store = open().await;
    let dax = Market::new(epic(DAX), Some(MarketKind::Indices));
    let unknown = Market::new(epic("KA.D.VOD.CASH.IP"), None);

    store
        .markets()
        .update(vec![forex(EURUSD), dax.clone(), unknown.clone()])
        .await
        .unwrap();

    assert_eq!(store.markets().count().await.unwrap(), 3);
    assert_eq!(store.markets().get(&epic(DAX)).await.unwrap(), Some(dax.clone()));
    assert_eq!(
        store.markets().get(&epic("KA.D.VOD.CASH.IP")).await.unwrap(),
        Some(unknown)
    );
    assert!(store.markets().contains(&epic(EURUSD)).await.unwrap());
    assert!(!store.markets().contains(&epic("CS.D.USDJPY.MINI.IP")).await.unwrap());

    let found = store
        .markets()
        .get_many(vec![epic(DAX), epic("CS.D.USDJPY.MINI.IP")])
        .await
        .unwrap();
    assert_eq!(found, [dax]);

    store.close().await;
}

#[tokio::test]
async fn market_upserts_replace_the_kind() {
    let store = open().await;

    store.markets().update(vec![forex(EURUSD)]).await.unwrap();
    store.markets().update(vec![forex(EURUSD)]).await.unwrap();
    store
        .markets()
        .update(vec![Market::new(epic(EURUSD), None)])
        .await
        .unwrap();

    assert_eq!(
        store.markets().get_all().await.unwrap(),
        [Market::new(epic(EURUSD), None)]
    );

    store.close().await;
}

#[tokio::test]
async fn empty_market_searches_are_invalid() {
    let store = open().await;

    let error = store.markets().get_many(Vec::new()).await.unwrap_err();
    assert!(error.is_invalid_request());

    store.close().await;
}

#[tokio::test]
async fn applications_are_upserted_wholesale() {
    let store = open().await;
    let demo = application('a', "demo");
    let live = application('b', "live");

    store
        .applications()
        .update(vec![demo.clone(), live.clone()])
        .await
        .unwrap();
    store.applications().update(vec![demo.clone()]).await.unwrap();
    assert_eq!(store.applications().count().await.unwrap(), 2);

    let mut revoked = demo.clone();
    revoked.status = ApplicationStatus::Revoked;
    revoked.allowance.overall_requests = 0;
    store.applications().update(vec![revoked.clone()]).await.unwrap();

    let stored = store.applications().get(&demo.key).await.unwrap().unwrap();
    assert_eq!(
        stored,
        Application {
            updated: stored.updated,
            ..revoked
        }
    );
    assert!(stored.updated > datetime!(2020-01-01 0:00 UTC));

    let all = store.applications().get_all().await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[1].key, live.key);

    store.close().await;
}

#[tokio::test]
async fn applications_created_in_the_future_are_rejected() {
    let store = open().await;
    let mut app = application('c', "later");
    app.created = (OffsetDateTime::now_utc() + Duration::days(2)).date();

    let error = store.applications().update(vec![app]).await.unwrap_err();
    assert!(error.is_invalid_request());
    assert_eq!(store.applications().count().await.unwrap(), 0);

    store.close().await;
}

#[tokio::test]
async fn missing_applications_are_none() {
    let store = open().await;
    let key = ApplicationKey::new(&"z".repeat(40)).unwrap();

    assert_eq!(store.applications().get(&key).await.unwrap(), None);

    store.close().await;
}

#[tokio::test]
async fn rates_filter_by_currency_and_date() {
    let store = open().await;

    store
        .rates()
        .update(vec![
            rate(date!(2024 - 01 - 02), "EUR", dec!(4.50)),
            rate(date!(2024 - 01 - 02), "USD", dec!(5.50)),
            rate(date!(2024 - 01 - 03), "EUR", dec!(4.25)),
            rate(date!(2024 - 01 - 04), "USD", dec!(5.25)),
        ])
        .await
        .unwrap();
    assert_eq!(store.rates().count().await.unwrap(), 4);

    let eur = Currency::new("EUR").unwrap();
    let euro_rates = store.rates().get(Some(eur), None, None).await.unwrap();
    assert_eq!(
        euro_rates,
        [
            rate(date!(2024 - 01 - 02), "EUR", dec!(4.50)),
            rate(date!(2024 - 01 - 03), "EUR", dec!(4.25)),
        ]
    );

    let window = store
        .rates()
        .get(None, Some(date!(2024 - 01 - 03)), Some(date!(2024 - 01 - 04)))
        .await
        .unwrap();
    assert_eq!(window.len(), 2);

    let first_day = store
        .rates()
        .get(None, None, Some(date!(2024 - 01 - 02)))
        .await
        .unwrap();
    assert_eq!(
        first_day.iter().map(|rate| rate.currency.as_str()).collect::<Vec<_>>(),
        ["EUR", "USD"]
    );

    assert_eq!(
        store.rates().get_on(date!(2024 - 01 - 04), eur).await.unwrap(),
        None
    );

    store.close().await;
}

#[tokio::test]
async fn rate_upserts_overwrite_the_value() {
    let store = open().await;
    let eur = Currency::new("EUR").unwrap();

    store
        .rates()
        .update(vec![rate(date!(2024 - 01 - 02), "EUR", dec!(4.50))])
        .await
        .unwrap();
    store
        .rates()
        .update(vec![rate(date!(2024 - 01 - 02), "EUR", dec!(4.125))])
        .await
        .unwrap();

    assert_eq!(store.rates().count().await.unwrap(), 1);
    assert_eq!(
        store.rates().get_on(date!(2024 - 01 - 02), eur).await.unwrap(),
        Some(rate(date!(2024 - 01 - 02), "EUR", dec!(4.125)))
    );

    store.close().await;
}

#[tokio::test]
async fn future_rates_are_rejected() {
    let store = open().await;
    let next_week = (OffsetDateTime::now_utc() + Duration::days(7)).date();

    let error = store
        .rates()
        .update(vec![rate(next_week, "USD", dec!(5))])
        .await
        .unwrap_err();
    assert!(matches!(error, StoreError::InvalidRequest(_)));

    store.close().await;
}

#[tokio::test]
async fn maintenance_keeps_the_data() {
    let store = open().await;
    store.markets().update(vec![forex(EURUSD)]).await.unwrap();

    store.optimize().await.unwrap();
    store.vacuum().await.unwrap();

    assert_eq!(store.markets().count().await.unwrap(), 1);
    store.close().await;
}
