//! Engine tunables.

use time::Duration;

/// Configuration of the metadata engine.
#[derive(Debug, Clone)]
pub struct MetaConfig {
    /// Derive auto-assigned versions from the transaction timestamp when it
    /// exceeds the highest existing version.
    pub timestamp_versioning: bool,
    /// Deadline applied to pending objects that do not override it.
    pub default_zombie_deadline: Duration,
    /// Rows per reaper batch.
    pub zombie_batch_size: usize,
    /// Rows fetched per listing round trip.
    pub list_page_size: usize,
    /// Segments fetched per loop-scan round trip.
    pub scan_batch_size: usize,
    /// Maximum part number accepted on `BeginSegment`.
    pub max_parts: u32,
    /// Maximum segments a copy or move source may carry.
    pub copy_segment_limit: i32,
    /// Maximum items in one bulk delete request.
    pub bulk_delete_limit: usize,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            timestamp_versioning: true,
            default_zombie_deadline: Duration::hours(24),
            zombie_batch_size: 100,
            list_page_size: 1000,
            scan_batch_size: 2500,
            max_parts: 10_000,
            copy_segment_limit: 10_000,
            bulk_delete_limit: 1000,
        }
    }
}

impl MetaConfig {
    /// Production defaults.
    pub fn production() -> Self {
        Self::default()
    }

    /// Small batches and sequential versions, for deterministic tests.
    pub fn testing() -> Self {
        Self {
            timestamp_versioning: false,
            default_zombie_deadline: Duration::hours(24),
            zombie_batch_size: 32,
            list_page_size: 50,
            scan_batch_size: 100,
            max_parts: 10_000,
            copy_segment_limit: 10_000,
            bulk_delete_limit: 1000,
        }
    }
}
