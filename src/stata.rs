//! Stata `%tc` timestamp encoding: milliseconds since 1960-01-01 00:00:00
//! UTC. The 1960 epoch and the Jakarta offset live only here.

use chrono::{DateTime, FixedOffset, NaiveDateTime};

/// Seconds between 1960-01-01 and 1970-01-01.
const STATA_EPOCH_OFFSET_SECONDS: i64 = 315_619_200;

/// Jakarta is UTC+07:00 year-round, no DST.
const JAKARTA_OFFSET_SECONDS: i32 = 7 * 3600;

/// Unix seconds for a Jakarta wall-clock datetime.
pub fn unix_seconds(dt: NaiveDateTime) -> i64 {
    let offset = FixedOffset::east_opt(JAKARTA_OFFSET_SECONDS).unwrap();
    dt.and_local_timezone(offset).unwrap().timestamp()
}

/// Encode unix seconds as Stata `%tc` milliseconds.
pub fn encode(unix_seconds: i64) -> i64 {
    (unix_seconds + STATA_EPOCH_OFFSET_SECONDS) * 1000
}

/// Decode Stata `%tc` milliseconds back to unix seconds.
pub fn decode(stata_ms: i64) -> i64 {
    stata_ms / 1000 - STATA_EPOCH_OFFSET_SECONDS
}

/// Stata `%tc` value for a Jakarta wall-clock datetime.
pub fn encode_datetime(dt: NaiveDateTime) -> i64 {
    encode(unix_seconds(dt))
}

/// Internal slot key (minutes of naive wall-clock time since the unix epoch)
/// for a datetime. Lossless on the 30/60-minute grid.
pub fn slot_minutes(dt: NaiveDateTime) -> i64 {
    dt.and_utc().timestamp() / 60
}

/// Inverse of [`slot_minutes`].
pub fn slot_to_datetime(slot_min: i64) -> NaiveDateTime {
    DateTime::from_timestamp(slot_min * 60, 0)
        .expect("slot minutes out of range")
        .naive_utc()
}
