//! The metadata engine facade.
//!
//! [`MetaDb`] owns the adapter router, the alias cache, and the engine
//! configuration. The operation surface is split across the submodules the
//! way the lifecycle splits: begin, segment commit, object commit, reads,
//! deletes, copy/move, listing, background scans, Object Lock, and the
//! zombie reaper.

use std::sync::Arc;

use crate::alias::{AliasCache, AliasPieces, Pieces};
use crate::backend::{Adapter, Router};
use crate::config::MetaConfig;
use crate::ctx::Ctx;
use crate::error::{Error, Result};
use crate::model::{Object, Segment};
use crate::types::{NodeAlias, NodeId, ObjectLocation, ObjectStatus, ProjectId};

mod begin;
mod commit;
mod copy;
mod delete;
mod get;
mod list;
mod lock;
mod precommit;
mod scan;
mod segment;
mod zombie;

pub use begin::{BeginObjectExactVersion, BeginObjectNextVersion, BeginSegment};
pub use commit::CommitObject;
pub use copy::{BeginCopyInfo, BeginCopyObject, CopySegmentKey, FinishCopyObject, FinishMoveObject};
pub use delete::{
    DeleteObjectExactVersion, DeleteObjectLastCommitted, DeleteObjectResult, DeleteObjects,
    DeleteObjectsItem, DeleteObjectsItemResult, DeleteObjectsStatus, DeletePendingObject,
};
pub use get::{GetObjectExactVersion, GetObjectLastCommitted};
pub use list::{
    IteratePendingObjectsByKey, ListCursor, ListObjects, ListObjectsResult, PendingObjectsPage,
};
pub use lock::{
    GetObjectLegalHold, GetObjectRetention, SetObjectLegalHold, SetObjectRetention,
};
pub use scan::IterateLoopSegments;
pub use segment::{
    CommitInlineSegment, CommitSegment, GetLatestObjectLastSegment, GetSegmentByOffset,
    GetSegmentByPosition, ListSegments, SegmentsPage,
};
pub use zombie::{DeleteZombieObjects, ZombieReport};

/// The object-and-segment metadata engine.
pub struct MetaDb {
    router: Router,
    aliases: AliasCache,
    config: MetaConfig,
}

impl MetaDb {
    /// Builds an engine over a router of adapters.
    pub fn new(router: Router, config: MetaConfig) -> Self {
        MetaDb {
            router,
            aliases: AliasCache::new(0),
            config,
        }
    }

    /// Convenience constructor over one adapter.
    pub fn single(adapter: Arc<dyn Adapter>, config: MetaConfig) -> Result<Self> {
        Ok(Self::new(Router::new(vec![adapter], &[])?, config))
    }

    /// The engine configuration.
    pub fn config(&self) -> &MetaConfig {
        &self.config
    }

    /// The adapter router.
    pub fn router(&self) -> &Router {
        &self.router
    }

    pub(crate) fn adapter_for(&self, project_id: ProjectId) -> &Arc<dyn Adapter> {
        self.router.choose(project_id)
    }

    /// Returns the alias of every node, creating missing assignments on the
    /// authoritative back end. Idempotent; output order matches input order.
    pub fn ensure_node_aliases(&self, ctx: &Ctx, nodes: &[NodeId]) -> Result<Vec<NodeAlias>> {
        ctx.check()?;
        let pairs = self
            .aliases
            .ensure(ctx, self.router.authoritative().as_ref(), nodes)?;
        Ok(pairs.into_iter().map(|(_, alias)| alias).collect())
    }

    /// Preloads the alias cache from the authoritative back end.
    pub fn warm_alias_cache(&self, ctx: &Ctx) -> Result<usize> {
        let pairs = self.router.authoritative().scan_node_aliases(ctx)?;
        self.aliases.warm(&pairs);
        Ok(pairs.len())
    }

    /// Compresses a piece list for a segment stored under `project_id`.
    ///
    /// Assignments come from the authoritative back end; when the project is
    /// pinned elsewhere the pairs are mirrored so the aliases resolve on the
    /// back end that stores the segment.
    pub(crate) fn pieces_for_project(
        &self,
        ctx: &Ctx,
        project_id: ProjectId,
        pieces: &Pieces,
    ) -> Result<AliasPieces> {
        let authoritative = self.router.authoritative().as_ref();
        let alias_pieces = self.aliases.pieces_to_aliases(ctx, authoritative, pieces)?;
        if !self.router.routes_to_authoritative(project_id) {
            let pairs: Vec<(NodeId, NodeAlias)> = pieces
                .iter()
                .zip(alias_pieces.0.iter())
                .map(|(piece, alias_piece)| (piece.storage_node, alias_piece.alias))
                .collect();
            self.router.choose(project_id).mirror_node_aliases(ctx, &pairs)?;
        }
        Ok(alias_pieces)
    }

    /// Expands the stored piece list of `segment` in place.
    pub(crate) fn resolve_segment_pieces(
        &self,
        ctx: &Ctx,
        project_id: ProjectId,
        segment: &mut Segment,
    ) -> Result<()> {
        if segment.alias_pieces.is_empty() {
            return Ok(());
        }
        let source = self.adapter_for(project_id).as_ref();
        segment.pieces = self
            .aliases
            .aliases_to_pieces(ctx, source, &segment.alias_pieces)?;
        Ok(())
    }

    /// Reads the last committed object at `location`, mapping delete markers
    /// and expired rows to `ObjectNotFound`.
    pub(crate) fn last_committed(&self, ctx: &Ctx, location: &ObjectLocation) -> Result<Object> {
        location.verify()?;
        let adapter = self.adapter_for(location.project_id);
        let now = adapter.now(ctx)?;
        let object = adapter
            .get_object_highest_visible(ctx, location, now)?
            .ok_or(Error::ObjectNotFound)?;
        if object.status.is_delete_marker() {
            return Err(Error::ObjectNotFound);
        }
        debug_assert!(matches!(
            object.status,
            ObjectStatus::CommittedUnversioned | ObjectStatus::CommittedVersioned
        ));
        Ok(object)
    }
}

impl std::fmt::Debug for MetaDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaDb")
            .field("router", &self.router)
            .field("aliases", &self.aliases)
            .finish()
    }
}
