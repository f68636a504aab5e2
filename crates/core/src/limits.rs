//! Engine-wide constants and capacity limits.

use std::time::Duration;

/// Largest per-class object counter; above this, id allocation fails.
pub const MAX_OBJECT_COUNTER: u64 = (1u64 << crate::types::COUNTER_BITS) - 1;

/// Handle-range chunk handed out by class-storage scans for batch jobs.
pub const SCAN_CHUNK: usize = 128;

/// Number of shards in the string/blob pools and locker read sides.
pub const POOL_SHARDS: usize = 16;

/// Number of slots in the per-version reader bitmap.
pub const READER_SLOTS: u32 = 64;

/// Initial retry backoff for transient errors.
pub const RETRY_BACKOFF_INITIAL: Duration = Duration::from_millis(2);

/// Retry backoff cap for transient errors.
pub const RETRY_BACKOFF_CAP: Duration = Duration::from_millis(200);

/// Maximum automatic retries of a transaction closure.
pub const MAX_RETRIES: u32 = 16;

/// Over-allocation factor when sizing a new index from class object counts.
pub const INDEX_CAPACITY_FACTOR: f64 = 1.2;
