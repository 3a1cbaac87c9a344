use log::LevelFilter;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use time::{
    error::{Format, Parse},
    format_description::{self, FormatItem},
    Date, OffsetDateTime, PrimitiveDateTime, UtcOffset,
};

pub static TIME_FORMAT: Lazy<Vec<FormatItem<'static>>> = Lazy::new(|| {
    format_description::parse("[hour repr:24]:[minute]:[second]")
        .expect("Invalid time format description")
});

pub static DATE_FORMAT: Lazy<Vec<FormatItem<'static>>> =
    Lazy::new(|| format_description::parse("[year]-[month]-[day]").expect("Invalid date format"));

// Same shape as SQLite's `datetime()` output, so stored values compare lexicographically
pub static DATETIME_FORMAT: Lazy<Vec<FormatItem<'static>>> = Lazy::new(|| {
    format_description::parse("[year]-[month]-[day] [hour repr:24]:[minute]:[second]")
        .expect("Invalid datetime format description")
});

/// Formats an instant as UTC `yyyy-MM-dd HH:mm:ss`. Sub-second precision is dropped.
pub fn format_datetime(datetime: OffsetDateTime) -> Result<String, Format> {
    datetime.to_offset(UtcOffset::UTC).format(&*DATETIME_FORMAT)
}

/// Parses a UTC `yyyy-MM-dd HH:mm:ss` string.
pub fn parse_datetime(text: &str) -> Result<OffsetDateTime, Parse> {
    PrimitiveDateTime::parse(text, &*DATETIME_FORMAT).map(PrimitiveDateTime::assume_utc)
}

pub fn format_date(date: Date) -> Result<String, Format> {
    date.format(&*DATE_FORMAT)
}

pub fn parse_date(text: &str) -> Result<Date, Parse> {
    Date::parse(text, &*DATE_FORMAT)
}

#[derive(Serialize, Deserialize)]
#[serde(remote = "LevelFilter")]
pub enum SerdeLevelFilter {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}
