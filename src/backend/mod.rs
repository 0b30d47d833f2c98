//! Back-end abstraction over a transactional relational store.
//!
//! The engine never writes SQL; it calls typed accessors on [`Adapter`] (for
//! snapshot reads outside a transaction) and [`AdapterTx`] (for everything
//! that must observe and mutate one consistent snapshot). Several adapters
//! may be registered at once; [`Router`] picks one per project. The first
//! registered adapter is the authoritative source for node aliases.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use time::Duration;

use crate::ctx::Ctx;
use crate::error::{Error, Result};
use crate::model::{LoopSegmentEntry, Object, ObjectEntry, Segment};
use crate::types::{
    NodeAlias, NodeId, ObjectKey, ObjectLocation, ObjectStatus, ObjectStream, ProjectId,
    SegmentPosition, StreamId, Timestamp, Version,
};

pub mod sqlite;

pub use sqlite::SqliteAdapter;

/// Field projection and probe selection for one precommit call.
#[derive(Copy, Clone, Debug, Default)]
pub struct PrecommitOptions {
    /// Require the pending object named by the query's claim; its absence is
    /// `ObjectNotFound`.
    pub pending: bool,
    /// Verify the pending object's existence without fetching the row.
    pub exclude_pending_object: bool,
    /// Skip the expiry column of the pending row.
    pub exclude_pending_expires: bool,
    /// Skip the encrypted user data columns of the pending row.
    pub exclude_pending_user_data: bool,
    /// Fetch the pending object's segments, ordered by position.
    pub with_segments: bool,
    /// Fetch the unversioned sibling (displacement planning).
    pub unversioned: bool,
    /// Fetch the unversioned sibling as a full row (deletion planning).
    pub full_unversioned: bool,
    /// Fetch the status of the highest-versioned visible sibling.
    pub highest_visible: bool,
}

/// Addresses one precommit probe.
#[derive(Clone, Debug)]
pub struct PrecommitQuery {
    /// Location whose visible state the enclosing write may change.
    pub location: ObjectLocation,
    /// `(version, stream)` of the pending object, when `pending` is set.
    pub claim: Option<(Version, StreamId)>,
    /// Probe selection.
    pub opts: PrecommitOptions,
}

/// Size triple of one pending segment, as precommit reports it.
#[derive(Copy, Clone, Debug)]
pub struct PendingSegment {
    /// Address within the stream.
    pub position: SegmentPosition,
    /// Stored ciphertext size.
    pub encrypted_size: i32,
    /// Offset within the object's plaintext.
    pub plain_offset: i64,
    /// User-visible size.
    pub plain_size: i32,
    /// Whether the segment carries its own expiry.
    pub has_expiry: bool,
}

/// Everything one write needs to know about its location, observed under a
/// single snapshot.
#[derive(Clone, Debug, Default)]
pub struct PrecommitInfo {
    /// The transaction time encoded as a version.
    pub timestamp_version: Version,
    /// Highest version present at the location, any status.
    pub highest_version: Option<Version>,
    /// The claimed pending object, unless excluded by projection.
    pub pending: Option<Object>,
    /// The pending object's segments, when requested.
    pub segments: Vec<PendingSegment>,
    /// Status of the highest-versioned visible sibling, when requested.
    pub highest_visible_status: Option<ObjectStatus>,
    /// The unversioned sibling, when requested.
    pub unversioned: Option<Object>,
}

impl PrecommitInfo {
    /// The version to assign to an auto-versioned commit or delete marker.
    ///
    /// The timestamp version wins whenever it is enabled and ahead of the
    /// highest existing version, keeping assignments monotonic across clock
    /// adjustments.
    pub fn assign_version(&self, timestamp_versioning: bool) -> Version {
        let next = self
            .highest_version
            .map(|version| version.next())
            .unwrap_or(Version(1));
        if timestamp_versioning && self.timestamp_version > next {
            self.timestamp_version
        } else {
            next
        }
    }
}

/// One page request of the object listing.
#[derive(Clone, Debug)]
pub struct ListQuery {
    /// Project to list in.
    pub project_id: ProjectId,
    /// Bucket to list in.
    pub bucket_name: String,
    /// List pending objects instead of committed ones.
    pub pending: bool,
    /// Exclusive `(key, version)` cursor; a zero version skips every version
    /// of the cursor key.
    pub cursor: Option<(ObjectKey, Version)>,
    /// Inclusive lower bound on keys, used to resume past a collapsed prefix.
    pub min_key: Option<ObjectKey>,
    /// Restrict keys to this prefix.
    pub prefix: Option<ObjectKey>,
    /// Maximum rows returned.
    pub limit: usize,
    /// Fetch encrypted user data columns.
    pub include_user_data: bool,
    /// Expiry filter boundary.
    pub now: Timestamp,
}

/// One page request of the background segment scan.
#[derive(Clone, Debug, Default)]
pub struct LoopQuery {
    /// Inclusive lower stream bound.
    pub start_stream: Option<StreamId>,
    /// Exclusive upper stream bound.
    pub end_stream: Option<StreamId>,
    /// Exclusive `(stream, position)` cursor.
    pub cursor: Option<(StreamId, SegmentPosition)>,
    /// Maximum rows returned.
    pub batch: usize,
    /// Staleness allowance for back ends with time-travel reads; adapters
    /// without them ignore it.
    pub as_of_interval: Option<Duration>,
}

/// A transactional relational back end.
pub trait Adapter: Send + Sync {
    /// Back-end class name, used by pinning configuration.
    fn class(&self) -> &'static str;

    /// Current time consistent with the back end's commit timestamps.
    fn now(&self, ctx: &Ctx) -> Result<Timestamp>;

    /// Opens a transaction with serializable semantics.
    fn begin<'a>(&'a self, ctx: &Ctx) -> Result<Box<dyn AdapterTx + 'a>>;

    /// Reads one object row by exact version, any status.
    fn get_object_exact(
        &self,
        ctx: &Ctx,
        location: &ObjectLocation,
        version: Version,
    ) -> Result<Option<Object>>;

    /// Reads the highest-versioned visible row (committed or marker) that
    /// has not expired by `now`.
    fn get_object_highest_visible(
        &self,
        ctx: &Ctx,
        location: &ObjectLocation,
        now: Timestamp,
    ) -> Result<Option<Object>>;

    /// Reads the pending row addressed by `(location, version, stream)`.
    fn get_pending_object(&self, ctx: &Ctx, stream: &ObjectStream) -> Result<Option<Object>>;

    /// Pending rows at one exact key, ordered by `(version, stream_id)`.
    fn list_pending_by_key(
        &self,
        ctx: &Ctx,
        location: &ObjectLocation,
        cursor: Option<(Version, StreamId)>,
        limit: usize,
    ) -> Result<Vec<Object>>;

    /// Reads one segment row.
    fn get_segment(
        &self,
        ctx: &Ctx,
        stream_id: StreamId,
        position: SegmentPosition,
    ) -> Result<Option<Segment>>;

    /// The segment covering `plain_offset`, if any.
    fn segment_by_offset(
        &self,
        ctx: &Ctx,
        stream_id: StreamId,
        plain_offset: i64,
    ) -> Result<Option<Segment>>;

    /// The highest-positioned segment of a stream.
    fn last_segment(&self, ctx: &Ctx, stream_id: StreamId) -> Result<Option<Segment>>;

    /// Segment rows after `cursor`, ordered by position.
    fn list_segments(
        &self,
        ctx: &Ctx,
        stream_id: StreamId,
        cursor: Option<SegmentPosition>,
        limit: usize,
    ) -> Result<Vec<Segment>>;

    /// One raw listing page; prefix collapse happens above the adapter.
    fn list_objects_page(&self, ctx: &Ctx, query: &ListQuery) -> Result<Vec<ObjectEntry>>;

    /// One page of the background segment scan.
    fn loop_segments_page(&self, ctx: &Ctx, query: &LoopQuery) -> Result<Vec<LoopSegmentEntry>>;

    /// Pending rows whose zombie deadline elapsed before `cutoff`.
    fn zombie_candidates(
        &self,
        ctx: &Ctx,
        cutoff: Timestamp,
        limit: usize,
    ) -> Result<Vec<ObjectStream>>;

    /// Returns the alias of every node, creating missing entries under a
    /// conflict-tolerant upsert. Output order matches input order.
    fn ensure_node_aliases(
        &self,
        ctx: &Ctx,
        nodes: &[NodeId],
    ) -> Result<Vec<(NodeId, NodeAlias)>>;

    /// Copies authoritative alias assignments into this back end.
    fn mirror_node_aliases(&self, ctx: &Ctx, pairs: &[(NodeId, NodeAlias)]) -> Result<()>;

    /// Resolves aliases back to node identities. Unknown aliases are simply
    /// absent from the result.
    fn node_ids_for(&self, ctx: &Ctx, aliases: &[NodeAlias]) -> Result<Vec<(NodeAlias, NodeId)>>;

    /// Every alias pair this back end knows, for cache warm-up.
    fn scan_node_aliases(&self, ctx: &Ctx) -> Result<Vec<(NodeId, NodeAlias)>>;

    /// Bulk object insert for tests and loaders; no lifecycle checks.
    fn batch_insert_objects(&self, ctx: &Ctx, objects: &[Object]) -> Result<()>;

    /// Bulk segment insert for tests and loaders; no lifecycle checks.
    fn batch_insert_segments(&self, ctx: &Ctx, segments: &[Segment]) -> Result<()>;
}

/// One open transaction. Dropping the handle rolls back.
pub trait AdapterTx {
    /// The transaction's timestamp, fixed at begin.
    fn tx_now(&self) -> Timestamp;

    /// The precommit probe: one round trip, one snapshot.
    fn precommit(&mut self, ctx: &Ctx, query: &PrecommitQuery) -> Result<PrecommitInfo>;

    /// Reads one object row by exact version, any status.
    fn get_object_exact(
        &mut self,
        ctx: &Ctx,
        location: &ObjectLocation,
        version: Version,
    ) -> Result<Option<Object>>;

    /// Reads the highest-versioned visible row that has not expired.
    fn get_object_highest_visible(
        &mut self,
        ctx: &Ctx,
        location: &ObjectLocation,
    ) -> Result<Option<Object>>;

    /// Reads the pending row addressed by `(location, version, stream)`.
    fn get_pending_object(&mut self, ctx: &Ctx, stream: &ObjectStream) -> Result<Option<Object>>;

    /// Inserts an object row. Key collisions surface as `Conflict`.
    fn insert_object(&mut self, ctx: &Ctx, object: &Object) -> Result<()>;

    /// Rewrites the pending row at `from` in place with `to`'s fields.
    /// Returns false when the pending row is gone.
    fn promote_object(&mut self, ctx: &Ctx, from: &ObjectStream, to: &Object) -> Result<bool>;

    /// Deletes the exact row `(location, version, stream)`.
    fn delete_object_row(&mut self, ctx: &Ctx, stream: &ObjectStream) -> Result<bool>;

    /// Deletes a pending row only while it is still a zombie: the status and
    /// deadline are re-checked row-side so a racing commit wins.
    fn delete_zombie(&mut self, ctx: &Ctx, stream: &ObjectStream, cutoff: Timestamp)
        -> Result<bool>;

    /// Inserts one segment row.
    fn insert_segment(&mut self, ctx: &Ctx, segment: &Segment) -> Result<()>;

    /// Inserts many segment rows.
    fn insert_segments(&mut self, ctx: &Ctx, segments: &[Segment]) -> Result<()>;

    /// Deletes every segment of a stream, returning the count.
    fn delete_segments(&mut self, ctx: &Ctx, stream_id: StreamId) -> Result<u64>;

    /// Reads every segment of a stream, ordered by position.
    fn fetch_segments(&mut self, ctx: &Ctx, stream_id: StreamId) -> Result<Vec<Segment>>;

    /// True when any segment of the stream carries its own expiry.
    fn any_segment_with_expiry(&mut self, ctx: &Ctx, stream_id: StreamId) -> Result<bool>;

    /// Overwrites the Object Lock columns of one committed row.
    fn update_object_lock(
        &mut self,
        ctx: &Ctx,
        location: &ObjectLocation,
        version: Version,
        lock: crate::types::LockInfo,
    ) -> Result<bool>;

    /// Commits the transaction.
    fn commit(self: Box<Self>, ctx: &Ctx) -> Result<()>;

    /// Rolls back explicitly. Dropping the handle has the same effect.
    fn rollback(self: Box<Self>) -> Result<()>;
}

/// Time source for an adapter. Production uses the system clock; tests pin
/// it so retention expiry is deterministic.
#[derive(Clone)]
pub struct Clock {
    pinned: Option<Arc<Mutex<Timestamp>>>,
}

impl Clock {
    /// The system clock.
    pub fn system() -> Self {
        Clock { pinned: None }
    }

    /// A clock frozen at `start` until moved with [`set`](Self::set) or
    /// [`advance`](Self::advance).
    pub fn pinned(start: Timestamp) -> Self {
        Clock {
            pinned: Some(Arc::new(Mutex::new(start))),
        }
    }

    /// The current instant.
    pub fn now(&self) -> Timestamp {
        match &self.pinned {
            Some(cell) => *cell.lock(),
            None => Timestamp::now(),
        }
    }

    /// Moves a pinned clock; no effect on the system clock.
    pub fn set(&self, now: Timestamp) {
        if let Some(cell) = &self.pinned {
            *cell.lock() = now;
        }
    }

    /// Advances a pinned clock; no effect on the system clock.
    pub fn advance(&self, by: Duration) {
        if let Some(cell) = &self.pinned {
            let mut cell = cell.lock();
            *cell = cell.saturating_add(by);
        }
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.pinned {
            Some(cell) => write!(f, "Clock::pinned({})", *cell.lock()),
            None => f.write_str("Clock::system"),
        }
    }
}

/// Routes projects to registered adapters.
///
/// The first adapter is the default and the authoritative alias source.
/// Pins name an adapter class; every pinned project routes to the first
/// adapter of that class.
pub struct Router {
    adapters: Vec<Arc<dyn Adapter>>,
    pins: FxHashMap<ProjectId, usize>,
}

impl Router {
    /// Builds a router. Fails when no adapter is given or a pin names an
    /// unregistered class.
    pub fn new(adapters: Vec<Arc<dyn Adapter>>, pins: &[(ProjectId, &str)]) -> Result<Self> {
        if adapters.is_empty() {
            return Err(Error::InvalidRequest("at least one adapter is required".into()));
        }
        let mut resolved = FxHashMap::default();
        for (project_id, class) in pins {
            let index = adapters
                .iter()
                .position(|adapter| adapter.class() == *class)
                .ok_or_else(|| {
                    Error::InvalidRequest(format!("no adapter registered for class {class:?}"))
                })?;
            resolved.insert(*project_id, index);
        }
        Ok(Router {
            adapters,
            pins: resolved,
        })
    }

    /// The adapter serving `project_id`.
    pub fn choose(&self, project_id: ProjectId) -> &Arc<dyn Adapter> {
        let index = self.pins.get(&project_id).copied().unwrap_or(0);
        &self.adapters[index]
    }

    /// The authoritative alias source.
    pub fn authoritative(&self) -> &Arc<dyn Adapter> {
        &self.adapters[0]
    }

    /// True when both projects route to the same adapter instance.
    pub fn same_adapter(&self, a: ProjectId, b: ProjectId) -> bool {
        let left = self.pins.get(&a).copied().unwrap_or(0);
        let right = self.pins.get(&b).copied().unwrap_or(0);
        left == right
    }

    /// True when `project_id` routes to the authoritative adapter.
    pub fn routes_to_authoritative(&self, project_id: ProjectId) -> bool {
        self.pins.get(&project_id).copied().unwrap_or(0) == 0
    }

    /// Every registered adapter, default first.
    pub fn adapters(&self) -> &[Arc<dyn Adapter>] {
        &self.adapters
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("adapters", &self.adapters.len())
            .field("pins", &self.pins.len())
            .finish()
    }
}
