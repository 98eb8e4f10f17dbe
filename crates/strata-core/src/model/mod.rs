//! Domain model for the task hierarchy.

pub mod task;

use chrono::{DateTime, Utc};

pub use task::{
    ActivityEntry, ChecklistItem, Level, NewTask, ParseEnumError, Priority, Status, Task,
    TaskChanges,
};

/// Current time truncated to microseconds, the precision shared by task
/// documents and index rows.
#[must_use]
pub fn now() -> DateTime<Utc> {
    from_micros(Utc::now().timestamp_micros())
}

/// Convert a microsecond Unix timestamp back into a UTC datetime.
///
/// Out-of-range values clamp to the Unix epoch.
#[must_use]
pub fn from_micros(us: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us).unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_has_microsecond_precision() {
        let ts = now();
        assert_eq!(from_micros(ts.timestamp_micros()), ts);
    }
}
