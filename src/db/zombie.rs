//! The zombie reaper: batch deletion of pending objects whose deadline
//! elapsed without a commit.

use serde::Serialize;
use tracing::{debug, info};

use crate::ctx::Ctx;
use crate::db::MetaDb;
use crate::error::Result;
use crate::types::Timestamp;

/// Reaps pending objects whose zombie deadline has passed.
#[derive(Clone, Debug, Default)]
pub struct DeleteZombieObjects {
    /// Deadline cutoff; absent means the back end's current time.
    pub deadline_before: Option<Timestamp>,
    /// Rows per batch; zero uses the configured batch size.
    pub batch_size: usize,
}

/// Report of one reaper run.
#[derive(Copy, Clone, Debug, Default, Serialize)]
pub struct ZombieReport {
    /// Pending objects removed.
    pub objects_deleted: u64,
    /// Segments removed with them.
    pub segments_deleted: u64,
}

impl MetaDb {
    /// Runs the reaper across every registered back end.
    ///
    /// Candidates are selected outside the deletion transaction, so each
    /// delete re-checks the status and deadline row-side: a pending object
    /// that commits between selection and deletion is skipped.
    pub fn delete_zombie_objects(&self, ctx: &Ctx, req: DeleteZombieObjects) -> Result<ZombieReport> {
        let batch = if req.batch_size == 0 {
            self.config().zombie_batch_size
        } else {
            req.batch_size
        };
        let mut report = ZombieReport::default();

        for adapter in self.router().adapters() {
            let cutoff = match req.deadline_before {
                Some(cutoff) => cutoff,
                None => adapter.now(ctx)?,
            };
            loop {
                ctx.check()?;
                let candidates = adapter.zombie_candidates(ctx, cutoff, batch)?;
                if candidates.is_empty() {
                    break;
                }
                let exhausted = candidates.len() < batch;

                let mut tx = adapter.begin(ctx)?;
                let mut objects = 0u64;
                let mut segments = 0u64;
                for candidate in &candidates {
                    if tx.delete_zombie(ctx, candidate, cutoff)? {
                        objects += 1;
                        segments += tx.delete_segments(ctx, candidate.stream_id)?;
                    }
                }
                tx.commit(ctx)?;
                report.objects_deleted += objects;
                report.segments_deleted += segments;
                debug!(objects, segments, "zombie.batch");

                if exhausted {
                    break;
                }
            }
        }

        info!(
            objects = report.objects_deleted,
            segments = report.segments_deleted,
            "zombie.run"
        );
        Ok(report)
    }
}
