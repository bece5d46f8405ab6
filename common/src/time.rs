//! Time utilities for the ledger.

use chrono::{DateTime, Utc};

/// A timestamp with timezone (always UTC).
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Check whether `ts` lies inside the optional, inclusive `[from, to]` window.
pub fn within(ts: Timestamp, from: Option<Timestamp>, to: Option<Timestamp>) -> bool {
    from.map_or(true, |from| ts >= from) && to.map_or(true, |to| ts <= to)
}
