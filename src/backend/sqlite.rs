//! SQLite back end.
//!
//! One connection behind a mutex; transactions hold the guard for their
//! lifetime, which gives the single-writer serializable semantics the core
//! requires. The unversioned singleton and stream uniqueness are enforced by
//! partial unique indexes, so even a hypothetical second writer could not
//! violate them.

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use rustc_hash::FxHashMap;

use crate::alias::AliasPieces;
use crate::backend::{
    Adapter, AdapterTx, Clock, ListQuery, LoopQuery, PendingSegment, PrecommitInfo,
    PrecommitQuery,
};
use crate::ctx::Ctx;
use crate::error::{Error, Result};
use crate::model::{EncryptedUserData, LoopSegmentEntry, Object, ObjectEntry, Segment};
use crate::types::{
    EncryptionParameters, LockInfo, NodeAlias, NodeId, ObjectKey, ObjectLocation, ObjectStatus,
    ObjectStream, PieceId, Placement, RedundancyScheme, SegmentPosition, StreamId, Timestamp,
    Version,
};

/// Status codes repeated in the partial indexes below. They must match
/// [`ObjectStatus::code`].
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS objects (
    project_id    BLOB NOT NULL,
    bucket_name   TEXT NOT NULL,
    object_key    BLOB NOT NULL,
    version       INTEGER NOT NULL,
    stream_id     BLOB NOT NULL,
    status        INTEGER NOT NULL,
    created_at    INTEGER NOT NULL,
    expires_at    INTEGER,
    zombie_deletion_deadline INTEGER,
    segment_count INTEGER NOT NULL DEFAULT 0,
    total_plain_size     INTEGER NOT NULL DEFAULT 0,
    total_encrypted_size INTEGER NOT NULL DEFAULT 0,
    fixed_segment_size   INTEGER NOT NULL DEFAULT 0,
    encryption    INTEGER NOT NULL DEFAULT 0,
    lock_state    INTEGER NOT NULL DEFAULT 0,
    retain_until  INTEGER,
    encrypted_metadata       BLOB,
    encrypted_metadata_nonce BLOB,
    encrypted_metadata_key   BLOB,
    encrypted_etag           BLOB,
    PRIMARY KEY (project_id, bucket_name, object_key, version, stream_id)
) WITHOUT ROWID;

-- one committed row per (location, version); pendings share version zero
CREATE UNIQUE INDEX IF NOT EXISTS objects_committed_version
    ON objects (project_id, bucket_name, object_key, version)
    WHERE status <> 1;

-- invariant: at most one unversioned object or marker per location
CREATE UNIQUE INDEX IF NOT EXISTS objects_unversioned_singleton
    ON objects (project_id, bucket_name, object_key)
    WHERE status IN (2, 4);

-- invariant: stream ids are unique; delete markers carry the zero sentinel
CREATE UNIQUE INDEX IF NOT EXISTS objects_stream_unique
    ON objects (stream_id)
    WHERE status NOT IN (4, 5);

CREATE INDEX IF NOT EXISTS objects_zombie_deadline
    ON objects (zombie_deletion_deadline)
    WHERE status = 1 AND zombie_deletion_deadline IS NOT NULL;

CREATE TABLE IF NOT EXISTS segments (
    stream_id   BLOB NOT NULL,
    position    INTEGER NOT NULL,
    created_at  INTEGER NOT NULL,
    expires_at  INTEGER,
    repaired_at INTEGER,
    root_piece_id       BLOB,
    encrypted_key_nonce BLOB,
    encrypted_key       BLOB,
    encrypted_etag      BLOB,
    encrypted_size INTEGER NOT NULL DEFAULT 0,
    plain_offset   INTEGER NOT NULL DEFAULT 0,
    plain_size     INTEGER NOT NULL DEFAULT 0,
    redundancy     INTEGER NOT NULL DEFAULT 0,
    inline_data         BLOB,
    remote_alias_pieces BLOB,
    placement      INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (stream_id, position)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS segments_plain_offset
    ON segments (stream_id, plain_offset);

CREATE TABLE IF NOT EXISTS node_aliases (
    node_alias INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id    BLOB NOT NULL UNIQUE
);
";

const OBJECT_COLUMNS: &str = "project_id, bucket_name, object_key, version, stream_id, status, \
    created_at, expires_at, zombie_deletion_deadline, segment_count, total_plain_size, \
    total_encrypted_size, fixed_segment_size, encryption, lock_state, retain_until, \
    encrypted_metadata, encrypted_metadata_nonce, encrypted_metadata_key, encrypted_etag";

const SEGMENT_COLUMNS: &str = "stream_id, position, created_at, expires_at, repaired_at, \
    root_piece_id, encrypted_key_nonce, encrypted_key, encrypted_etag, encrypted_size, \
    plain_offset, plain_size, redundancy, inline_data, remote_alias_pieces, placement";

/// Embedded relational back end over a single SQLite database.
pub struct SqliteAdapter {
    conn: Mutex<Connection>,
    clock: Clock,
    class: &'static str,
}

impl SqliteAdapter {
    /// Opens (creating if needed) a database file.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::with_clock(Connection::open(path)?, Clock::system())
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_clock(Connection::open_in_memory()?, Clock::system())
    }

    /// Opens a private in-memory database on a pinned clock, for tests that
    /// move time.
    pub fn open_in_memory_at(clock: Clock) -> Result<Self> {
        Self::with_clock(Connection::open_in_memory()?, clock)
    }

    /// Overrides the class name reported to the router, letting several
    /// instances act as distinct back-end classes.
    pub fn with_class(mut self, class: &'static str) -> Self {
        self.class = class;
        self
    }

    fn with_clock(conn: Connection, clock: Clock) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
            class: "sqlite",
        })
    }

    /// The adapter's time source.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }
}

struct SqliteTx<'a> {
    conn: MutexGuard<'a, Connection>,
    now: Timestamp,
    open: bool,
}

impl Adapter for SqliteAdapter {
    fn class(&self) -> &'static str {
        self.class
    }

    fn now(&self, ctx: &Ctx) -> Result<Timestamp> {
        ctx.check()?;
        Ok(self.clock.now())
    }

    fn begin<'a>(&'a self, ctx: &Ctx) -> Result<Box<dyn AdapterTx + 'a>> {
        ctx.check()?;
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteTx {
            conn,
            now: self.clock.now(),
            open: true,
        }))
    }

    fn get_object_exact(
        &self,
        ctx: &Ctx,
        location: &ObjectLocation,
        version: Version,
    ) -> Result<Option<Object>> {
        ctx.check()?;
        query_object_exact(&self.conn.lock(), location, version)
    }

    fn get_object_highest_visible(
        &self,
        ctx: &Ctx,
        location: &ObjectLocation,
        now: Timestamp,
    ) -> Result<Option<Object>> {
        ctx.check()?;
        query_highest_visible(&self.conn.lock(), location, now)
    }

    fn get_pending_object(&self, ctx: &Ctx, stream: &ObjectStream) -> Result<Option<Object>> {
        ctx.check()?;
        query_pending_object(&self.conn.lock(), stream)
    }

    fn list_pending_by_key(
        &self,
        ctx: &Ctx,
        location: &ObjectLocation,
        cursor: Option<(Version, StreamId)>,
        limit: usize,
    ) -> Result<Vec<Object>> {
        ctx.check()?;
        let conn = self.conn.lock();
        let mut sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects \
             WHERE project_id = ? AND bucket_name = ? AND object_key = ? AND status = 1"
        );
        let mut args = location_values(location);
        if let Some((version, stream_id)) = cursor {
            sql.push_str(" AND (version > ? OR (version = ? AND stream_id > ?))");
            args.push(Value::Integer(version.0));
            args.push(Value::Integer(version.0));
            args.push(Value::Blob(stream_id.0.to_vec()));
        }
        sql.push_str(" ORDER BY version ASC, stream_id ASC LIMIT ?");
        args.push(Value::Integer(limit as i64));
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), object_from_row)?;
        collect_rows(rows)
    }

    fn get_segment(
        &self,
        ctx: &Ctx,
        stream_id: StreamId,
        position: SegmentPosition,
    ) -> Result<Option<Segment>> {
        ctx.check()?;
        let conn = self.conn.lock();
        let sql =
            format!("SELECT {SEGMENT_COLUMNS} FROM segments WHERE stream_id = ? AND position = ?");
        conn.query_row(
            &sql,
            params![stream_id.0.as_slice(), position.column()],
            segment_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn segment_by_offset(
        &self,
        ctx: &Ctx,
        stream_id: StreamId,
        plain_offset: i64,
    ) -> Result<Option<Segment>> {
        ctx.check()?;
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {SEGMENT_COLUMNS} FROM segments \
             WHERE stream_id = ? AND plain_offset <= ? \
             ORDER BY plain_offset DESC LIMIT 1"
        );
        conn.query_row(&sql, params![stream_id.0.as_slice(), plain_offset], segment_from_row)
            .optional()
            .map_err(Error::from)
    }

    fn last_segment(&self, ctx: &Ctx, stream_id: StreamId) -> Result<Option<Segment>> {
        ctx.check()?;
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {SEGMENT_COLUMNS} FROM segments WHERE stream_id = ? \
             ORDER BY position DESC LIMIT 1"
        );
        conn.query_row(&sql, params![stream_id.0.as_slice()], segment_from_row)
            .optional()
            .map_err(Error::from)
    }

    fn list_segments(
        &self,
        ctx: &Ctx,
        stream_id: StreamId,
        cursor: Option<SegmentPosition>,
        limit: usize,
    ) -> Result<Vec<Segment>> {
        ctx.check()?;
        let conn = self.conn.lock();
        let mut sql = format!("SELECT {SEGMENT_COLUMNS} FROM segments WHERE stream_id = ?");
        let mut args = vec![Value::Blob(stream_id.0.to_vec())];
        if let Some(position) = cursor {
            sql.push_str(" AND position > ?");
            args.push(Value::Integer(position.column()));
        }
        sql.push_str(" ORDER BY position ASC LIMIT ?");
        args.push(Value::Integer(limit as i64));
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), segment_from_row)?;
        collect_rows(rows)
    }

    fn list_objects_page(&self, ctx: &Ctx, query: &ListQuery) -> Result<Vec<ObjectEntry>> {
        ctx.check()?;
        let conn = self.conn.lock();
        let mut sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE project_id = ? AND bucket_name = ?"
        );
        let mut args = vec![
            Value::Blob(query.project_id.0.to_vec()),
            Value::Text(query.bucket_name.clone()),
        ];
        if query.pending {
            sql.push_str(" AND status = 1");
        } else {
            sql.push_str(" AND status IN (2, 3, 5)");
        }
        sql.push_str(" AND (expires_at IS NULL OR expires_at > ?)");
        args.push(Value::Integer(query.now.0));
        if let Some(prefix) = &query.prefix {
            sql.push_str(" AND object_key >= ?");
            args.push(Value::Blob(prefix.0.clone()));
            if let Some(limit) = prefix.prefix_limit() {
                sql.push_str(" AND object_key < ?");
                args.push(Value::Blob(limit.0));
            }
        }
        if let Some(min_key) = &query.min_key {
            sql.push_str(" AND object_key >= ?");
            args.push(Value::Blob(min_key.0.clone()));
        }
        if let Some((key, version)) = &query.cursor {
            sql.push_str(" AND (object_key > ? OR (object_key = ? AND version < ?))");
            args.push(Value::Blob(key.0.clone()));
            args.push(Value::Blob(key.0.clone()));
            args.push(Value::Integer(version.0));
        }
        sql.push_str(" ORDER BY object_key ASC, version DESC LIMIT ?");
        args.push(Value::Integer(query.limit as i64));

        let include_user_data = query.include_user_data;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), move |row| {
            let object = object_from_row(row)?;
            Ok(entry_from_object(object, include_user_data))
        })?;
        collect_rows(rows)
    }

    fn loop_segments_page(&self, ctx: &Ctx, query: &LoopQuery) -> Result<Vec<LoopSegmentEntry>> {
        ctx.check()?;
        let conn = self.conn.lock();
        // No time-travel reads here; as_of_interval is accepted and ignored.
        let mut sql = format!("SELECT {SEGMENT_COLUMNS} FROM segments WHERE 1 = 1");
        let mut args: Vec<Value> = Vec::new();
        if let Some(start) = query.start_stream {
            sql.push_str(" AND stream_id >= ?");
            args.push(Value::Blob(start.0.to_vec()));
        }
        if let Some(end) = query.end_stream {
            sql.push_str(" AND stream_id < ?");
            args.push(Value::Blob(end.0.to_vec()));
        }
        if let Some((stream_id, position)) = query.cursor {
            sql.push_str(" AND (stream_id > ? OR (stream_id = ? AND position > ?))");
            args.push(Value::Blob(stream_id.0.to_vec()));
            args.push(Value::Blob(stream_id.0.to_vec()));
            args.push(Value::Integer(position.column()));
        }
        sql.push_str(" ORDER BY stream_id ASC, position ASC LIMIT ?");
        args.push(Value::Integer(query.batch as i64));
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            let segment = segment_from_row(row)?;
            Ok(LoopSegmentEntry {
                stream_id: segment.stream_id,
                position: segment.position,
                created_at: segment.created_at,
                expires_at: segment.expires_at,
                repaired_at: segment.repaired_at,
                root_piece_id: segment.root_piece_id,
                encrypted_size: segment.encrypted_size,
                plain_offset: segment.plain_offset,
                plain_size: segment.plain_size,
                redundancy: segment.redundancy,
                alias_pieces: segment.alias_pieces,
                placement: segment.placement,
            })
        })?;
        collect_rows(rows)
    }

    fn zombie_candidates(
        &self,
        ctx: &Ctx,
        cutoff: Timestamp,
        limit: usize,
    ) -> Result<Vec<ObjectStream>> {
        ctx.check()?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT project_id, bucket_name, object_key, version, stream_id FROM objects \
             WHERE status = 1 AND zombie_deletion_deadline IS NOT NULL \
               AND zombie_deletion_deadline < ? \
             ORDER BY zombie_deletion_deadline ASC LIMIT ?",
        )?;
        let rows = stmt.query_map(params![cutoff.0, limit as i64], |row| {
            Ok(ObjectStream {
                location: ObjectLocation {
                    project_id: crate::types::ProjectId(blob16(row.get::<_, Vec<u8>>(0)?, 0)?),
                    bucket_name: row.get(1)?,
                    object_key: ObjectKey(row.get(2)?),
                },
                version: Version(row.get(3)?),
                stream_id: StreamId(blob16(row.get::<_, Vec<u8>>(4)?, 4)?),
            })
        })?;
        collect_rows(rows)
    }

    fn ensure_node_aliases(
        &self,
        ctx: &Ctx,
        nodes: &[NodeId],
    ) -> Result<Vec<(NodeId, NodeAlias)>> {
        ctx.check()?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(Error::from)?;
        {
            let mut insert =
                tx.prepare("INSERT INTO node_aliases (node_id) VALUES (?) ON CONFLICT DO NOTHING")?;
            let mut seen = FxHashMap::default();
            for node in nodes {
                if seen.insert(*node, ()).is_none() {
                    insert.execute(params![node.0.as_slice()])?;
                }
            }
        }
        let mut out = Vec::with_capacity(nodes.len());
        {
            let mut select =
                tx.prepare("SELECT node_alias FROM node_aliases WHERE node_id = ?")?;
            let mut resolved: FxHashMap<NodeId, NodeAlias> = FxHashMap::default();
            for node in nodes {
                let alias = match resolved.get(node) {
                    Some(alias) => *alias,
                    None => {
                        let alias: i64 =
                            select.query_row(params![node.0.as_slice()], |row| row.get(0))?;
                        let alias = NodeAlias(alias as i32);
                        resolved.insert(*node, alias);
                        alias
                    }
                };
                out.push((*node, alias));
            }
        }
        tx.commit().map_err(Error::from)?;
        Ok(out)
    }

    fn mirror_node_aliases(&self, ctx: &Ctx, pairs: &[(NodeId, NodeAlias)]) -> Result<()> {
        ctx.check()?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(Error::from)?;
        {
            let mut insert =
                tx.prepare("INSERT OR IGNORE INTO node_aliases (node_alias, node_id) VALUES (?, ?)")?;
            for (node, alias) in pairs {
                insert.execute(params![i64::from(alias.0), node.0.as_slice()])?;
            }
        }
        tx.commit().map_err(Error::from)
    }

    fn node_ids_for(&self, ctx: &Ctx, aliases: &[NodeAlias]) -> Result<Vec<(NodeAlias, NodeId)>> {
        ctx.check()?;
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT node_id FROM node_aliases WHERE node_alias = ?")?;
        let mut out = Vec::with_capacity(aliases.len());
        for alias in aliases {
            let node: Option<Vec<u8>> = stmt
                .query_row(params![i64::from(alias.0)], |row| row.get(0))
                .optional()?;
            if let Some(bytes) = node {
                out.push((*alias, NodeId(blob32(bytes)?)));
            }
        }
        Ok(out)
    }

    fn scan_node_aliases(&self, ctx: &Ctx) -> Result<Vec<(NodeId, NodeAlias)>> {
        ctx.check()?;
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT node_id, node_alias FROM node_aliases ORDER BY node_alias")?;
        let rows = stmt.query_map([], |row| {
            let bytes: Vec<u8> = row.get(0)?;
            let alias: i64 = row.get(1)?;
            Ok((bytes, alias))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (bytes, alias) = row?;
            out.push((NodeId(blob32(bytes)?), NodeAlias(alias as i32)));
        }
        Ok(out)
    }

    fn batch_insert_objects(&self, ctx: &Ctx, objects: &[Object]) -> Result<()> {
        ctx.check()?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(Error::from)?;
        for object in objects {
            exec_insert_object(&tx, object)?;
        }
        tx.commit().map_err(Error::from)
    }

    fn batch_insert_segments(&self, ctx: &Ctx, segments: &[Segment]) -> Result<()> {
        ctx.check()?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(Error::from)?;
        for segment in segments {
            exec_insert_segment(&tx, segment)?;
        }
        tx.commit().map_err(Error::from)
    }
}

impl AdapterTx for SqliteTx<'_> {
    fn tx_now(&self) -> Timestamp {
        self.now
    }

    fn precommit(&mut self, ctx: &Ctx, query: &PrecommitQuery) -> Result<PrecommitInfo> {
        ctx.check()?;
        let conn = &*self.conn;
        let location = &query.location;
        let mut info = PrecommitInfo {
            timestamp_version: Version::from_timestamp(self.now),
            ..PrecommitInfo::default()
        };

        info.highest_version = conn
            .query_row(
                "SELECT MAX(version) FROM objects \
                 WHERE project_id = ? AND bucket_name = ? AND object_key = ?",
                params![
                    location.project_id.0.as_slice(),
                    &location.bucket_name,
                    location.object_key.as_bytes()
                ],
                |row| row.get::<_, Option<i64>>(0),
            )?
            .map(Version);

        if query.opts.pending {
            let (version, stream_id) = query
                .claim
                .ok_or_else(|| Error::InvalidRequest("pending probe without a claim".into()))?;
            let stream = ObjectStream {
                location: location.clone(),
                version,
                stream_id,
            };
            let pending = query_pending_object(conn, &stream)?.ok_or(Error::ObjectNotFound)?;
            if query.opts.with_segments {
                info.segments = query_pending_segments(conn, stream_id)?;
            }
            if query.opts.exclude_pending_object {
                info.pending = None;
            } else {
                let mut pending = pending;
                if query.opts.exclude_pending_expires {
                    pending.expires_at = None;
                }
                if query.opts.exclude_pending_user_data {
                    pending.user_data = EncryptedUserData::default();
                }
                info.pending = Some(pending);
            }
        }

        if query.opts.highest_visible {
            info.highest_visible_status = query_highest_visible(conn, location, self.now)?
                .map(|object| object.status);
        }

        if query.opts.unversioned || query.opts.full_unversioned {
            let sql = format!(
                "SELECT {OBJECT_COLUMNS} FROM objects \
                 WHERE project_id = ? AND bucket_name = ? AND object_key = ? \
                   AND status IN (2, 4) LIMIT 1"
            );
            let mut sibling = conn
                .query_row(
                    &sql,
                    params![
                        location.project_id.0.as_slice(),
                        &location.bucket_name,
                        location.object_key.as_bytes()
                    ],
                    object_from_row,
                )
                .optional()?;
            if !query.opts.full_unversioned {
                // displacement projection: version, stream, and lock fields
                if let Some(sibling) = sibling.as_mut() {
                    sibling.user_data = EncryptedUserData::default();
                }
            }
            info.unversioned = sibling;
        }

        Ok(info)
    }

    fn get_object_exact(
        &mut self,
        ctx: &Ctx,
        location: &ObjectLocation,
        version: Version,
    ) -> Result<Option<Object>> {
        ctx.check()?;
        query_object_exact(&self.conn, location, version)
    }

    fn get_object_highest_visible(
        &mut self,
        ctx: &Ctx,
        location: &ObjectLocation,
    ) -> Result<Option<Object>> {
        ctx.check()?;
        query_highest_visible(&self.conn, location, self.now)
    }

    fn get_pending_object(&mut self, ctx: &Ctx, stream: &ObjectStream) -> Result<Option<Object>> {
        ctx.check()?;
        query_pending_object(&self.conn, stream)
    }

    fn insert_object(&mut self, ctx: &Ctx, object: &Object) -> Result<()> {
        ctx.check()?;
        exec_insert_object(&self.conn, object)
    }

    fn promote_object(&mut self, ctx: &Ctx, from: &ObjectStream, to: &Object) -> Result<bool> {
        ctx.check()?;
        let changed = self
            .conn
            .execute(
                "UPDATE objects SET \
                     version = ?, status = ?, expires_at = ?, zombie_deletion_deadline = NULL, \
                     segment_count = ?, total_plain_size = ?, total_encrypted_size = ?, \
                     fixed_segment_size = ?, encryption = ?, lock_state = ?, retain_until = ?, \
                     encrypted_metadata = ?, encrypted_metadata_nonce = ?, \
                     encrypted_metadata_key = ?, encrypted_etag = ? \
                 WHERE project_id = ? AND bucket_name = ? AND object_key = ? \
                   AND version = ? AND stream_id = ? AND status = 1",
                params![
                    to.stream.version.0,
                    to.status.code(),
                    to.expires_at.map(|at| at.0),
                    to.segment_count,
                    to.total_plain_size,
                    to.total_encrypted_size,
                    to.fixed_segment_size,
                    to.encryption.pack(),
                    to.lock.bits(),
                    to.lock.retain_until.map(|at| at.0),
                    opt_blob(&to.user_data.encrypted_metadata),
                    opt_blob(&to.user_data.encrypted_metadata_nonce),
                    opt_blob(&to.user_data.encrypted_metadata_key),
                    opt_blob(&to.user_data.encrypted_etag),
                    from.location.project_id.0.as_slice(),
                    &from.location.bucket_name,
                    from.location.object_key.as_bytes(),
                    from.version.0,
                    from.stream_id.0.as_slice(),
                ],
            )
            .map_err(|err| map_constraint(err, "object version"))?;
        Ok(changed > 0)
    }

    fn delete_object_row(&mut self, ctx: &Ctx, stream: &ObjectStream) -> Result<bool> {
        ctx.check()?;
        let changed = self.conn.execute(
            "DELETE FROM objects WHERE project_id = ? AND bucket_name = ? AND object_key = ? \
             AND version = ? AND stream_id = ?",
            params![
                stream.location.project_id.0.as_slice(),
                &stream.location.bucket_name,
                stream.location.object_key.as_bytes(),
                stream.version.0,
                stream.stream_id.0.as_slice(),
            ],
        )?;
        Ok(changed > 0)
    }

    fn delete_zombie(
        &mut self,
        ctx: &Ctx,
        stream: &ObjectStream,
        cutoff: Timestamp,
    ) -> Result<bool> {
        ctx.check()?;
        let changed = self.conn.execute(
            "DELETE FROM objects WHERE project_id = ? AND bucket_name = ? AND object_key = ? \
             AND version = ? AND stream_id = ? \
             AND status = 1 AND zombie_deletion_deadline IS NOT NULL \
             AND zombie_deletion_deadline < ?",
            params![
                stream.location.project_id.0.as_slice(),
                &stream.location.bucket_name,
                stream.location.object_key.as_bytes(),
                stream.version.0,
                stream.stream_id.0.as_slice(),
                cutoff.0,
            ],
        )?;
        Ok(changed > 0)
    }

    fn insert_segment(&mut self, ctx: &Ctx, segment: &Segment) -> Result<()> {
        ctx.check()?;
        exec_insert_segment(&self.conn, segment)
    }

    fn insert_segments(&mut self, ctx: &Ctx, segments: &[Segment]) -> Result<()> {
        ctx.check()?;
        for segment in segments {
            exec_insert_segment(&self.conn, segment)?;
        }
        Ok(())
    }

    fn delete_segments(&mut self, ctx: &Ctx, stream_id: StreamId) -> Result<u64> {
        ctx.check()?;
        let changed = self.conn.execute(
            "DELETE FROM segments WHERE stream_id = ?",
            params![stream_id.0.as_slice()],
        )?;
        Ok(changed as u64)
    }

    fn fetch_segments(&mut self, ctx: &Ctx, stream_id: StreamId) -> Result<Vec<Segment>> {
        ctx.check()?;
        let sql = format!(
            "SELECT {SEGMENT_COLUMNS} FROM segments WHERE stream_id = ? ORDER BY position ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![stream_id.0.as_slice()], segment_from_row)?;
        collect_rows(rows)
    }

    fn any_segment_with_expiry(&mut self, ctx: &Ctx, stream_id: StreamId) -> Result<bool> {
        ctx.check()?;
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM segments WHERE stream_id = ? AND expires_at IS NOT NULL LIMIT 1",
                params![stream_id.0.as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn update_object_lock(
        &mut self,
        ctx: &Ctx,
        location: &ObjectLocation,
        version: Version,
        lock: LockInfo,
    ) -> Result<bool> {
        ctx.check()?;
        let changed = self.conn.execute(
            "UPDATE objects SET lock_state = ?, retain_until = ? \
             WHERE project_id = ? AND bucket_name = ? AND object_key = ? AND version = ? \
               AND status IN (2, 3)",
            params![
                lock.bits(),
                lock.retain_until.map(|at| at.0),
                location.project_id.0.as_slice(),
                &location.bucket_name,
                location.object_key.as_bytes(),
                version.0,
            ],
        )?;
        Ok(changed > 0)
    }

    fn commit(self: Box<Self>, ctx: &Ctx) -> Result<()> {
        ctx.check()?;
        let mut this = self;
        this.conn.execute_batch("COMMIT")?;
        this.open = false;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        let mut this = self;
        this.conn.execute_batch("ROLLBACK")?;
        this.open = false;
        Ok(())
    }
}

impl Drop for SqliteTx<'_> {
    fn drop(&mut self) {
        if self.open {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

fn location_values(location: &ObjectLocation) -> Vec<Value> {
    vec![
        Value::Blob(location.project_id.0.to_vec()),
        Value::Text(location.bucket_name.clone()),
        Value::Blob(location.object_key.0.clone()),
    ]
}

fn query_object_exact(
    conn: &Connection,
    location: &ObjectLocation,
    version: Version,
) -> Result<Option<Object>> {
    let sql = format!(
        "SELECT {OBJECT_COLUMNS} FROM objects \
         WHERE project_id = ? AND bucket_name = ? AND object_key = ? AND version = ?"
    );
    conn.query_row(
        &sql,
        params![
            location.project_id.0.as_slice(),
            &location.bucket_name,
            location.object_key.as_bytes(),
            version.0
        ],
        object_from_row,
    )
    .optional()
    .map_err(Error::from)
}

fn query_highest_visible(
    conn: &Connection,
    location: &ObjectLocation,
    now: Timestamp,
) -> Result<Option<Object>> {
    let sql = format!(
        "SELECT {OBJECT_COLUMNS} FROM objects \
         WHERE project_id = ? AND bucket_name = ? AND object_key = ? \
           AND status IN (2, 3, 4, 5) AND (expires_at IS NULL OR expires_at > ?) \
         ORDER BY version DESC LIMIT 1"
    );
    conn.query_row(
        &sql,
        params![
            location.project_id.0.as_slice(),
            &location.bucket_name,
            location.object_key.as_bytes(),
            now.0
        ],
        object_from_row,
    )
    .optional()
    .map_err(Error::from)
}

fn query_pending_object(conn: &Connection, stream: &ObjectStream) -> Result<Option<Object>> {
    let sql = format!(
        "SELECT {OBJECT_COLUMNS} FROM objects \
         WHERE project_id = ? AND bucket_name = ? AND object_key = ? \
           AND version = ? AND stream_id = ? AND status = 1"
    );
    conn.query_row(
        &sql,
        params![
            stream.location.project_id.0.as_slice(),
            &stream.location.bucket_name,
            stream.location.object_key.as_bytes(),
            stream.version.0,
            stream.stream_id.0.as_slice()
        ],
        object_from_row,
    )
    .optional()
    .map_err(Error::from)
}

fn query_pending_segments(conn: &Connection, stream_id: StreamId) -> Result<Vec<PendingSegment>> {
    let mut stmt = conn.prepare(
        "SELECT position, encrypted_size, plain_offset, plain_size, expires_at IS NOT NULL \
         FROM segments WHERE stream_id = ? ORDER BY position ASC",
    )?;
    let rows = stmt.query_map(params![stream_id.0.as_slice()], |row| {
        Ok(PendingSegment {
            position: SegmentPosition::from_column(row.get(0)?),
            encrypted_size: row.get(1)?,
            plain_offset: row.get(2)?,
            plain_size: row.get(3)?,
            has_expiry: row.get(4)?,
        })
    })?;
    collect_rows(rows)
}

fn exec_insert_object(conn: &Connection, object: &Object) -> Result<()> {
    conn.execute(
        "INSERT INTO objects (project_id, bucket_name, object_key, version, stream_id, status, \
             created_at, expires_at, zombie_deletion_deadline, segment_count, total_plain_size, \
             total_encrypted_size, fixed_segment_size, encryption, lock_state, retain_until, \
             encrypted_metadata, encrypted_metadata_nonce, encrypted_metadata_key, encrypted_etag) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            object.stream.location.project_id.0.as_slice(),
            &object.stream.location.bucket_name,
            object.stream.location.object_key.as_bytes(),
            object.stream.version.0,
            object.stream.stream_id.0.as_slice(),
            object.status.code(),
            object.created_at.0,
            object.expires_at.map(|at| at.0),
            object.zombie_deletion_deadline.map(|at| at.0),
            object.segment_count,
            object.total_plain_size,
            object.total_encrypted_size,
            object.fixed_segment_size,
            object.encryption.pack(),
            object.lock.bits(),
            object.lock.retain_until.map(|at| at.0),
            opt_blob(&object.user_data.encrypted_metadata),
            opt_blob(&object.user_data.encrypted_metadata_nonce),
            opt_blob(&object.user_data.encrypted_metadata_key),
            opt_blob(&object.user_data.encrypted_etag),
        ],
    )
    .map_err(|err| map_constraint(err, "object"))?;
    Ok(())
}

fn exec_insert_segment(conn: &Connection, segment: &Segment) -> Result<()> {
    let alias_pieces = segment.alias_pieces.encode()?;
    conn.execute(
        "INSERT INTO segments (stream_id, position, created_at, expires_at, repaired_at, \
             root_piece_id, encrypted_key_nonce, encrypted_key, encrypted_etag, encrypted_size, \
             plain_offset, plain_size, redundancy, inline_data, remote_alias_pieces, placement) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            segment.stream_id.0.as_slice(),
            segment.position.column(),
            segment.created_at.0,
            segment.expires_at.map(|at| at.0),
            segment.repaired_at.map(|at| at.0),
            if segment.root_piece_id.is_zero() {
                None
            } else {
                Some(segment.root_piece_id.0.as_slice())
            },
            opt_blob(&segment.encrypted_key_nonce),
            opt_blob(&segment.encrypted_key),
            opt_blob(&segment.encrypted_etag),
            segment.encrypted_size,
            segment.plain_offset,
            segment.plain_size,
            segment.redundancy.pack()?,
            opt_blob(&segment.inline_data),
            if alias_pieces.is_empty() {
                None
            } else {
                Some(alias_pieces.as_slice())
            },
            i64::from(segment.placement.0),
        ],
    )
    .map_err(|err| map_constraint(err, "segment"))?;
    Ok(())
}

fn entry_from_object(object: Object, include_user_data: bool) -> ObjectEntry {
    ObjectEntry {
        object_key: object.stream.location.object_key.clone(),
        is_prefix: false,
        version: object.stream.version,
        stream_id: object.stream.stream_id,
        status: object.status,
        created_at: object.created_at,
        expires_at: object.expires_at,
        segment_count: object.segment_count,
        total_plain_size: object.total_plain_size,
        total_encrypted_size: object.total_encrypted_size,
        fixed_segment_size: object.fixed_segment_size,
        user_data: include_user_data.then_some(object.user_data),
        encryption: object.encryption,
    }
}

fn object_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Object> {
    let project_id = blob16(row.get::<_, Vec<u8>>(0)?, 0)?;
    let stream_id = blob16(row.get::<_, Vec<u8>>(4)?, 4)?;
    let status = ObjectStatus::from_code(row.get(5)?).map_err(|err| conv_err(5, err))?;
    let lock = LockInfo::from_bits(
        row.get(14)?,
        row.get::<_, Option<i64>>(15)?.map(Timestamp),
    )
    .map_err(|err| conv_err(14, err))?;
    Ok(Object {
        stream: ObjectStream {
            location: ObjectLocation {
                project_id: crate::types::ProjectId(project_id),
                bucket_name: row.get(1)?,
                object_key: ObjectKey(row.get(2)?),
            },
            version: Version(row.get(3)?),
            stream_id: StreamId(stream_id),
        },
        status,
        created_at: Timestamp(row.get(6)?),
        expires_at: row.get::<_, Option<i64>>(7)?.map(Timestamp),
        zombie_deletion_deadline: row.get::<_, Option<i64>>(8)?.map(Timestamp),
        segment_count: row.get(9)?,
        total_plain_size: row.get(10)?,
        total_encrypted_size: row.get(11)?,
        fixed_segment_size: row.get(12)?,
        encryption: EncryptionParameters::unpack(row.get(13)?),
        lock,
        user_data: EncryptedUserData {
            encrypted_metadata: opt_bytes(row, 16)?,
            encrypted_metadata_nonce: opt_bytes(row, 17)?,
            encrypted_metadata_key: opt_bytes(row, 18)?,
            encrypted_etag: opt_bytes(row, 19)?,
        },
    })
}

fn segment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Segment> {
    let stream_id = blob16(row.get::<_, Vec<u8>>(0)?, 0)?;
    let root_piece_id = match row.get::<_, Option<Vec<u8>>>(5)? {
        Some(bytes) => PieceId(blob32(bytes).map_err(|err| conv_err(5, err.into()))?),
        None => PieceId::ZERO,
    };
    let alias_pieces = match row.get::<_, Option<Vec<u8>>>(14)? {
        Some(bytes) => AliasPieces::decode(&bytes).map_err(|err| conv_err(14, err))?,
        None => AliasPieces::default(),
    };
    Ok(Segment {
        stream_id: StreamId(stream_id),
        position: SegmentPosition::from_column(row.get(1)?),
        created_at: Timestamp(row.get(2)?),
        expires_at: row.get::<_, Option<i64>>(3)?.map(Timestamp),
        repaired_at: row.get::<_, Option<i64>>(4)?.map(Timestamp),
        root_piece_id,
        encrypted_key_nonce: opt_bytes(row, 6)?,
        encrypted_key: opt_bytes(row, 7)?,
        encrypted_etag: opt_bytes(row, 8)?,
        encrypted_size: row.get(9)?,
        plain_offset: row.get(10)?,
        plain_size: row.get(11)?,
        redundancy: RedundancyScheme::unpack(row.get(12)?),
        inline_data: opt_bytes(row, 13)?,
        alias_pieces,
        pieces: Vec::new(),
        placement: Placement(row.get::<_, i64>(15)? as u16),
    })
}

fn opt_bytes(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Bytes> {
    Ok(row
        .get::<_, Option<Vec<u8>>>(idx)?
        .map(Bytes::from)
        .unwrap_or_default())
}

fn opt_blob(bytes: &Bytes) -> Option<&[u8]> {
    if bytes.is_empty() {
        None
    } else {
        Some(bytes.as_ref())
    }
}

fn blob16(bytes: Vec<u8>, idx: usize) -> rusqlite::Result<[u8; 16]> {
    bytes.try_into().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Blob,
            "expected a 16-byte blob".into(),
        )
    })
}

fn blob32(bytes: Vec<u8>) -> std::result::Result<[u8; 32], rusqlite::Error> {
    bytes.try_into().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Blob,
            "expected a 32-byte blob".into(),
        )
    })
}

fn conv_err(idx: usize, err: Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Blob, Box::new(err))
}

fn map_constraint(err: rusqlite::Error, what: &str) -> Error {
    if let rusqlite::Error::SqliteFailure(code, _) = &err {
        if code.code == rusqlite::ErrorCode::ConstraintViolation {
            return Error::Conflict(format!("{what} already exists"));
        }
    }
    Error::from(err)
}

fn collect_rows<T>(
    rows: impl Iterator<Item = std::result::Result<T, rusqlite::Error>>,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
