//! Cursor-based object listing.
//!
//! The adapter serves raw pages ordered `(object_key ASC, version DESC)`;
//! this module applies the prefix/delimiter collapse and keeps the cursor
//! contract: after a prefix entry is emitted, the next row read is strictly
//! greater than that prefix, so a listing resumed at any cursor is the
//! strict suffix of the uninterrupted listing.

use crate::backend::ListQuery;
use crate::ctx::Ctx;
use crate::db::MetaDb;
use crate::error::{Error, Result};
use crate::model::{Object, ObjectEntry};
use crate::types::{
    EncryptionParameters, ObjectKey, ObjectLocation, ProjectId, StreamId, Timestamp, Version,
};

const DELIMITER: u8 = b'/';

/// Exclusive listing cursor.
#[derive(Clone, Debug, Default)]
pub struct ListCursor {
    /// Resume strictly after this key...
    pub key: ObjectKey,
    /// ...and, within the key, strictly after this version (descending
    /// order). Zero skips every version of the key.
    pub version: Version,
}

/// Lists objects at a location prefix.
#[derive(Clone, Debug)]
pub struct ListObjects {
    /// Project to list in.
    pub project_id: ProjectId,
    /// Bucket to list in.
    pub bucket_name: String,
    /// Do not collapse keys at delimiters.
    pub recursive: bool,
    /// Restrict and strip this key prefix.
    pub prefix: ObjectKey,
    /// Exclusive resume position.
    pub cursor: ListCursor,
    /// Exact number of entries to return.
    pub limit: usize,
    /// List pending objects instead of committed ones.
    pub pending: bool,
    /// Populate encrypted user metadata on entries.
    pub include_custom_metadata: bool,
    /// Populate timestamps and size aggregates on entries.
    pub include_system_metadata: bool,
}

impl ListObjects {
    fn verify(&self) -> Result<()> {
        if self.bucket_name.is_empty() {
            return Err(Error::InvalidRequest("bucket name is missing".into()));
        }
        if self.limit == 0 {
            return Err(Error::InvalidRequest("limit must be positive".into()));
        }
        Ok(())
    }
}

/// Result of [`ListObjects`].
#[derive(Clone, Debug, Default)]
pub struct ListObjectsResult {
    /// Entries in listing order, keys stripped of the request prefix.
    pub entries: Vec<ObjectEntry>,
    /// True when a further entry exists past the last one returned.
    pub more: bool,
}

/// Pages through the pending objects at one exact key.
#[derive(Clone, Debug)]
pub struct IteratePendingObjectsByKey {
    /// Location (exact key) to inspect.
    pub location: ObjectLocation,
    /// Exclusive `(version, stream)` cursor.
    pub cursor: Option<(Version, StreamId)>,
    /// Maximum objects returned.
    pub limit: usize,
}

/// One page of pending objects at a key.
#[derive(Clone, Debug)]
pub struct PendingObjectsPage {
    /// Pending objects ordered by `(version, stream_id)`.
    pub objects: Vec<Object>,
    /// True when more pending objects follow.
    pub more: bool,
}

impl MetaDb {
    /// Lists committed (or pending) objects with S3 prefix/delimiter
    /// semantics.
    pub fn list_objects(&self, ctx: &Ctx, req: ListObjects) -> Result<ListObjectsResult> {
        req.verify()?;
        let adapter = self.adapter_for(req.project_id);
        let now = adapter.now(ctx)?;

        let want = req.limit + 1;
        let mut entries: Vec<ObjectEntry> = Vec::with_capacity(want);
        let prefix_len = req.prefix.0.len();

        // cursor pair applies until the first prefix rollup reseeks past it
        let mut pair_cursor = if req.cursor.key.is_empty() {
            None
        } else {
            Some((req.cursor.key.clone(), req.cursor.version))
        };
        let mut min_key: Option<ObjectKey> = None;

        'pages: while entries.len() < want {
            ctx.check()?;
            let page_limit = (want - entries.len()).min(self.config().list_page_size);
            let page = adapter.list_objects_page(
                ctx,
                &ListQuery {
                    project_id: req.project_id,
                    bucket_name: req.bucket_name.clone(),
                    pending: req.pending,
                    cursor: pair_cursor.clone(),
                    min_key: min_key.take(),
                    prefix: (prefix_len > 0).then(|| req.prefix.clone()),
                    limit: page_limit,
                    include_user_data: req.include_custom_metadata,
                    now,
                },
            )?;
            let exhausted = page.len() < page_limit;

            for entry in page {
                let full_key = entry.object_key.clone();
                pair_cursor = Some((full_key.clone(), entry.version));

                let rel = &full_key.0[prefix_len..];
                let collapse = (!req.recursive)
                    .then(|| rel.iter().position(|&byte| byte == DELIMITER))
                    .flatten();
                match collapse {
                    Some(at) => {
                        let rel_prefix = ObjectKey(rel[..=at].to_vec());
                        let full_prefix = ObjectKey(full_key.0[..prefix_len + at + 1].to_vec());
                        // a cursor at or inside the group means it was
                        // already reported to the caller
                        if req.cursor.key < full_prefix {
                            entries.push(ObjectEntry::prefix(rel_prefix));
                        }
                        // resume strictly past the collapsed group
                        min_key = full_prefix.prefix_limit();
                        pair_cursor = None;
                        if min_key.is_none() {
                            break 'pages;
                        }
                        if entries.len() >= want {
                            break 'pages;
                        }
                        continue 'pages;
                    }
                    None => {
                        entries.push(project_entry(entry, rel, &req));
                        if entries.len() >= want {
                            break 'pages;
                        }
                    }
                }
            }

            if exhausted {
                break;
            }
        }

        let more = entries.len() > req.limit;
        entries.truncate(req.limit);
        Ok(ListObjectsResult { entries, more })
    }

    /// Pages through every pending object at one exact key.
    pub fn iterate_pending_objects_by_key(
        &self,
        ctx: &Ctx,
        req: IteratePendingObjectsByKey,
    ) -> Result<PendingObjectsPage> {
        req.location.verify()?;
        if req.limit == 0 {
            return Err(Error::InvalidRequest("limit must be positive".into()));
        }
        let adapter = self.adapter_for(req.location.project_id);
        let mut objects =
            adapter.list_pending_by_key(ctx, &req.location, req.cursor, req.limit + 1)?;
        let more = objects.len() > req.limit;
        objects.truncate(req.limit);
        Ok(PendingObjectsPage { objects, more })
    }
}

fn project_entry(mut entry: ObjectEntry, rel_key: &[u8], req: &ListObjects) -> ObjectEntry {
    entry.object_key = ObjectKey(rel_key.to_vec());
    if !req.include_system_metadata {
        entry.created_at = Timestamp(0);
        entry.expires_at = None;
        entry.segment_count = 0;
        entry.total_plain_size = 0;
        entry.total_encrypted_size = 0;
        entry.fixed_segment_size = 0;
        entry.encryption = EncryptionParameters::default();
    }
    if !req.include_custom_metadata {
        entry.user_data = None;
    }
    entry
}
