//! Background segment scan.

use time::Duration;

use crate::backend::LoopQuery;
use crate::ctx::Ctx;
use crate::db::MetaDb;
use crate::error::{Error, Result};
use crate::model::LoopSegmentEntry;
use crate::types::{ProjectId, StreamId};

/// Streams every segment in `(stream_id, position)` order for background
/// consumers (repair, audit, accounting).
#[derive(Clone, Debug, Default)]
pub struct IterateLoopSegments {
    /// Routes the scan to a pinned project's back end; absent scans the
    /// default back end.
    pub project_id: Option<ProjectId>,
    /// Inclusive lower stream bound.
    pub stream_range_start: Option<StreamId>,
    /// Exclusive upper stream bound.
    pub stream_range_end: Option<StreamId>,
    /// Rows per round trip; zero uses the configured batch size.
    pub batch_size: usize,
    /// Staleness allowance for back ends that can serve historical reads,
    /// keeping scanners out of the way of commits.
    pub as_of_system_interval: Option<Duration>,
}

impl MetaDb {
    /// Invokes `visit` for every segment in scan order.
    ///
    /// The scan pages through the back end; the context is checked between
    /// pages, and an error from `visit` aborts the scan.
    pub fn iterate_loop_segments<F>(
        &self,
        ctx: &Ctx,
        req: IterateLoopSegments,
        mut visit: F,
    ) -> Result<u64>
    where
        F: FnMut(LoopSegmentEntry) -> Result<()>,
    {
        if let (Some(start), Some(end)) = (req.stream_range_start, req.stream_range_end) {
            if start >= end {
                return Err(Error::InvalidRequest("empty stream range".into()));
            }
        }
        let adapter = match req.project_id {
            Some(project_id) => self.adapter_for(project_id),
            None => self.router().authoritative(),
        };
        let batch = if req.batch_size == 0 {
            self.config().scan_batch_size
        } else {
            req.batch_size
        };

        let mut seen = 0u64;
        let mut cursor = None;
        loop {
            ctx.check()?;
            let page = adapter.loop_segments_page(
                ctx,
                &LoopQuery {
                    start_stream: req.stream_range_start,
                    end_stream: req.stream_range_end,
                    cursor,
                    batch,
                    as_of_interval: req.as_of_system_interval,
                },
            )?;
            let exhausted = page.len() < batch;
            for entry in page {
                cursor = Some((entry.stream_id, entry.position));
                seen += 1;
                visit(entry)?;
            }
            if exhausted {
                return Ok(seen);
            }
        }
    }
}
