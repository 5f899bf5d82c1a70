//! Conversions between the wire `google.protobuf.Timestamp` and `chrono`,
//! used everywhere the scheduler/reconciler compare ages against now.

use chrono::{DateTime, Utc};
use prost_types::Timestamp;

pub fn to_chrono(ts: &Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.seconds, ts.nanos.max(0) as u32).unwrap_or_else(Utc::now)
}

pub fn seconds_since(ts: &Timestamp) -> i64 {
    (Utc::now() - to_chrono(ts)).num_seconds()
}
