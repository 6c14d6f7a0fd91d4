//! Timestamp helpers pinned to the UTC+8 display zone.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};

/// Layout used for every human-readable timestamp the service emits.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const DISPLAY_OFFSET_SECS: i32 = 8 * 3600;

/// The fixed display zone, independent of the host's configured time zone.
pub fn local_zone() -> FixedOffset {
    FixedOffset::east_opt(DISPLAY_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

pub fn format_local(instant: DateTime<Utc>) -> String {
    instant
        .with_timezone(&local_zone())
        .format(TIMESTAMP_FORMAT)
        .to_string()
}

pub fn now_local() -> String {
    format_local(Utc::now())
}

/// Parses a timestamp previously rendered by [`format_local`].
pub fn parse_local(value: &str) -> Option<DateTime<FixedOffset>> {
    let naive = NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT).ok()?;
    local_zone().from_local_datetime(&naive).single()
}
