//! Persistence layer
//!
//! Owns the SQLite pool and schema. Storage types for sequences and
//! enrollments live next to their domain types and borrow the pool from here.

pub mod database;

pub use database::Database;

use chrono::{DateTime, TimeZone, Utc};

/// Timestamps are stored as epoch milliseconds so range predicates compare numerically
pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
