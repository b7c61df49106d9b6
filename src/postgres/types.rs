use chrono::{DateTime, Utc};

/// Seconds between the Unix epoch and the PostgreSQL epoch (2000-01-01T00:00:00Z).
pub const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

const MICROS_PER_SECOND: i64 = 1_000_000;
const NANOS_PER_MICRO: i64 = 1_000;

pub const PG_EPOCH_OFFSET_MICROS: i64 = PG_EPOCH_OFFSET_SECS * MICROS_PER_SECOND;

/// Converts a protocol timestamp (microseconds since 2000-01-01) to wall-clock time.
///
/// Returns `None` when the value does not fit chrono's representable range.
pub fn pg_time_to_datetime(ts: u64) -> Option<DateTime<Utc>> {
    let micros = i64::try_from(ts).ok()?.checked_add(PG_EPOCH_OFFSET_MICROS)?;
    let secs = micros.div_euclid(MICROS_PER_SECOND);
    let nanos = micros.rem_euclid(MICROS_PER_SECOND) * NANOS_PER_MICRO;
    DateTime::from_timestamp(secs, nanos as u32)
}

/// Converts wall-clock time to a protocol timestamp.
pub fn datetime_to_pg_time(time: DateTime<Utc>) -> i64 {
    time.timestamp_micros() - PG_EPOCH_OFFSET_MICROS
}

pub fn now_pg_micros() -> i64 {
    datetime_to_pg_time(Utc::now())
}
