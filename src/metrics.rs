//! Driver metrics.
//!
//! Defines metric name constants and records them through the `metrics`
//! facade.  No recorder is installed here: a host application that wants
//! the numbers installs one (e.g. a Prometheus exporter) before building
//! its drivers.  Without a recorder every call is a no-op.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Duration;

// -- Metric name constants ----------------------------------------------------

/// Total driver operations (counter). Labels: disk, operation, status.
pub const OPERATIONS_TOTAL: &str = "bleepdisk_operations_total";

/// Driver operation duration in seconds (histogram). Labels: disk, operation.
pub const OPERATION_DURATION_SECONDS: &str = "bleepdisk_operation_duration_seconds";

/// Status label for a successful operation.
pub const STATUS_OK: &str = "ok";

/// Status label for a lookup that found nothing.
pub const STATUS_NOT_FOUND: &str = "not_found";

/// Status label for a failure collapsed into a sentinel value.
pub const STATUS_ERROR: &str = "error";

/// Register metric descriptions with the global recorder. Call once after
/// installing it.
pub fn describe_metrics() {
    describe_counter!(OPERATIONS_TOTAL, "Total storage driver operations");
    describe_histogram!(
        OPERATION_DURATION_SECONDS,
        "Storage driver operation duration in seconds"
    );
}

/// Record one finished driver operation.
pub fn record_operation(
    disk: &str,
    operation: &'static str,
    status: &'static str,
    elapsed: Duration,
) {
    counter!(
        OPERATIONS_TOTAL,
        "disk" => disk.to_string(),
        "operation" => operation,
        "status" => status
    )
    .increment(1);
    histogram!(
        OPERATION_DURATION_SECONDS,
        "disk" => disk.to_string(),
        "operation" => operation
    )
    .record(elapsed.as_secs_f64());
}

// -- Tests --------------------------------------------------------------------
