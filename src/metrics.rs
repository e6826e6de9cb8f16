//! Metrics collection
//!
//! Thin wrappers over the `metrics` facade. Without an installed recorder
//! every call is a no-op, so the library never requires one.

use metrics::{counter, histogram};
use std::time::Duration;

/// Total operations, labelled by collection, operation and status
pub const OPERATIONS_TOTAL: &str = "highlight_store_operations_total";
/// Operation latency histogram
pub const OPERATION_DURATION: &str = "highlight_store_operation_duration_seconds";
/// Conversation cascade deletes, labelled by status
pub const CASCADE_DELETES_TOTAL: &str = "highlight_store_cascade_deletes_total";
/// Store open attempts, labelled by status
pub const OPENS_TOTAL: &str = "highlight_store_opens_total";

const fn status(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "error"
    }
}

/// Record one operation-layer verb.
pub fn record_operation(collection: &str, operation: &'static str, duration: Duration, success: bool) {
    counter!(
        OPERATIONS_TOTAL,
        "collection" => collection.to_string(),
        "operation" => operation,
        "status" => status(success)
    )
    .increment(1);
    histogram!(
        OPERATION_DURATION,
        "collection" => collection.to_string(),
        "operation" => operation
    )
    .record(duration.as_secs_f64());
}

/// Record a conversation cascade delete.
pub fn record_cascade(success: bool) {
    counter!(CASCADE_DELETES_TOTAL, "status" => status(success)).increment(1);
}

/// Record a store open attempt.
pub fn record_open(success: bool) {
    counter!(OPENS_TOTAL, "status" => status(success)).increment(1);
}
