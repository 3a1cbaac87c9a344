use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::serde::rfc3339;
use time::OffsetDateTime;

/// A bid/ask pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    #[serde(with = "rust_decimal::serde::float")]
    pub bid: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub ask: Decimal,
}

impl Point {
    pub fn new(bid: Decimal, ask: Decimal) -> Self {
        Self { bid, ask }
    }

    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }

    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }
}

/// One OHLC snapshot of an instrument. The store keeps one row per distinct `date`, to the
/// second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Price {
    #[serde(with = "rfc3339")]
    pub date: OffsetDateTime,
    pub open: Point,
    pub close: Point,
    pub lowest: Point,
    pub highest: Point,
    pub volume: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn point_helpers() {
        let point = Point::new(dec!(1.10450), dec!(1.10460));
        assert_eq!(point.mid(), dec!(1.10455));
        assert_eq!(point.spread(), dec!(0.0001));
    }
}
