//! Deletion: exact version, last committed, and bulk.

use tracing::info;

use crate::backend::PrecommitOptions;
use crate::ctx::Ctx;
use crate::db::precommit::{displace_unversioned, precommit};
use crate::db::MetaDb;
use crate::error::{Error, Result};
use crate::model::{EncryptedUserData, Object};
use crate::types::{
    EncryptionParameters, LockInfo, ObjectKey, ObjectLocation, ObjectStatus, ObjectStream,
    ProjectId, StreamId, StreamVersionId, Timestamp, Version,
};

/// Deletes one object row by exact version.
#[derive(Clone, Debug)]
pub struct DeleteObjectExactVersion {
    /// Location of the object.
    pub location: ObjectLocation,
    /// Version to delete.
    pub version: Version,
    /// Bypass Governance retention; requires separate authorization.
    pub bypass_governance: bool,
}

impl DeleteObjectExactVersion {
    fn verify(&self) -> Result<()> {
        self.location.verify()?;
        self.version.verify_positive()
    }
}

/// Drops a pending upload and its segments.
#[derive(Clone, Debug)]
pub struct DeletePendingObject {
    /// The pending object's stream.
    pub stream: ObjectStream,
}

/// Deletes the last committed object, honoring the bucket's versioning
/// state.
#[derive(Clone, Debug)]
pub struct DeleteObjectLastCommitted {
    /// Location of the object.
    pub location: ObjectLocation,
    /// Versioning is active: stack a versioned delete marker.
    pub versioned: bool,
    /// Versioning is suspended: replace the unversioned row with an
    /// unversioned delete marker.
    pub suspended: bool,
    /// Bypass Governance retention; requires separate authorization.
    pub bypass_governance: bool,
}

impl DeleteObjectLastCommitted {
    fn verify(&self) -> Result<()> {
        self.location.verify()?;
        if self.versioned && self.suspended {
            return Err(Error::InvalidRequest(
                "a bucket cannot be both versioned and suspended".into(),
            ));
        }
        Ok(())
    }
}

/// What one delete operation did.
#[derive(Clone, Debug, Default)]
pub struct DeleteObjectResult {
    /// The row that was removed, if any.
    pub removed: Option<Object>,
    /// The delete marker that was inserted, if any.
    pub marker: Option<Object>,
    /// Segments deleted together with the removed row.
    pub segments_deleted: u64,
}

/// One item of a bulk delete.
#[derive(Clone, Debug)]
pub struct DeleteObjectsItem {
    /// Key to delete within the request's bucket.
    pub object_key: ObjectKey,
    /// Addresses an exact version; absent means "the last committed".
    pub stream_version_id: Option<StreamVersionId>,
}

/// Outcome class of one bulk-delete item.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DeleteObjectsStatus {
    /// The item was deleted (or a delete marker was inserted).
    Deleted,
    /// Nothing was found to delete.
    NotFound,
    /// Object Lock protected the item.
    Protected,
}

/// Outcome of one bulk-delete item.
#[derive(Clone, Debug)]
pub struct DeleteObjectsItemResult {
    /// Key the item addressed.
    pub object_key: ObjectKey,
    /// Version id the item addressed, when it did.
    pub requested: Option<StreamVersionId>,
    /// Outcome class.
    pub status: DeleteObjectsStatus,
    /// The removed row, when one was removed.
    pub removed: Option<Object>,
    /// The inserted delete marker, when one was inserted.
    pub marker: Option<Object>,
}

/// Deletes up to 1 000 items; every item completes independently.
#[derive(Clone, Debug)]
pub struct DeleteObjects {
    /// Project to delete in.
    pub project_id: ProjectId,
    /// Bucket to delete in.
    pub bucket_name: String,
    /// Items to delete.
    pub items: Vec<DeleteObjectsItem>,
    /// Versioning is active in the bucket.
    pub versioned: bool,
    /// Versioning is suspended in the bucket.
    pub suspended: bool,
    /// Bypass Governance retention; requires separate authorization.
    pub bypass_governance: bool,
}

impl DeleteObjects {
    fn verify(&self, limit: usize) -> Result<()> {
        if self.bucket_name.is_empty() {
            return Err(Error::InvalidRequest("bucket name is missing".into()));
        }
        if self.versioned && self.suspended {
            return Err(Error::InvalidRequest(
                "a bucket cannot be both versioned and suspended".into(),
            ));
        }
        if self.items.is_empty() {
            return Err(Error::InvalidRequest("no items to delete".into()));
        }
        if self.items.len() > limit {
            return Err(Error::InvalidRequest(format!(
                "{} items exceed the bulk delete limit {limit}",
                self.items.len()
            )));
        }
        for item in &self.items {
            if item.object_key.is_empty() {
                return Err(Error::InvalidRequest("object key is missing".into()));
            }
        }
        Ok(())
    }
}

fn delete_marker(
    location: &ObjectLocation,
    version: Version,
    status: ObjectStatus,
    now: Timestamp,
) -> Object {
    Object {
        stream: ObjectStream {
            location: location.clone(),
            version,
            stream_id: StreamId::ZERO,
        },
        status,
        created_at: now,
        expires_at: None,
        zombie_deletion_deadline: None,
        segment_count: 0,
        total_plain_size: 0,
        total_encrypted_size: 0,
        fixed_segment_size: 0,
        user_data: EncryptedUserData::default(),
        encryption: EncryptionParameters::default(),
        lock: LockInfo::default(),
    }
}

impl MetaDb {
    /// Deletes the row at `(location, version)` and its segments.
    pub fn delete_object_exact_version(
        &self,
        ctx: &Ctx,
        req: DeleteObjectExactVersion,
    ) -> Result<DeleteObjectResult> {
        req.verify()?;
        let adapter = self.adapter_for(req.location.project_id);
        let mut tx = adapter.begin(ctx)?;
        let now = tx.tx_now();

        let object = tx
            .get_object_exact(ctx, &req.location, req.version)?
            .ok_or(Error::ObjectNotFound)?;
        object.verify_unprotected(req.bypass_governance, now)?;

        tx.delete_object_row(ctx, &object.stream)?;
        let segments_deleted = if object.status.is_delete_marker() {
            0
        } else {
            tx.delete_segments(ctx, object.stream_id())?
        };
        tx.commit(ctx)?;
        info!(
            location = %object.stream.location,
            version = %object.version(),
            segments = segments_deleted,
            "object.delete_exact"
        );
        Ok(DeleteObjectResult {
            removed: Some(object),
            marker: None,
            segments_deleted,
        })
    }

    /// Drops a pending upload. The owner's alternative to waiting for the
    /// reaper.
    pub fn delete_pending_object(
        &self,
        ctx: &Ctx,
        req: DeletePendingObject,
    ) -> Result<DeleteObjectResult> {
        req.stream.verify()?;
        let adapter = self.adapter_for(req.stream.location.project_id);
        let mut tx = adapter.begin(ctx)?;
        let pending = tx
            .get_pending_object(ctx, &req.stream)?
            .ok_or(Error::ObjectNotFound)?;
        tx.delete_object_row(ctx, &pending.stream)?;
        let segments_deleted = tx.delete_segments(ctx, pending.stream_id())?;
        tx.commit(ctx)?;
        info!(
            location = %pending.stream.location,
            segments = segments_deleted,
            "object.delete_pending"
        );
        Ok(DeleteObjectResult {
            removed: Some(pending),
            marker: None,
            segments_deleted,
        })
    }

    /// Deletes (or tombstones) the last committed object at a location.
    pub fn delete_object_last_committed(
        &self,
        ctx: &Ctx,
        req: DeleteObjectLastCommitted,
    ) -> Result<DeleteObjectResult> {
        req.verify()?;
        let adapter = self.adapter_for(req.location.project_id).clone();
        let mut tx = adapter.begin(ctx)?;
        let result = if req.versioned {
            self.insert_versioned_marker(ctx, tx.as_mut(), &req.location)?
        } else if req.suspended {
            self.replace_with_unversioned_marker(
                ctx,
                tx.as_mut(),
                &req.location,
                req.bypass_governance,
            )?
        } else {
            self.delete_plain_last_committed(ctx, tx.as_mut(), &req.location, req.bypass_governance)?
        };
        tx.commit(ctx)?;
        info!(
            location = %req.location,
            marker = result.marker.is_some(),
            segments = result.segments_deleted,
            "object.delete_last_committed"
        );
        Ok(result)
    }

    /// Deletes up to the configured limit of items, each independently.
    pub fn delete_objects(&self, ctx: &Ctx, req: DeleteObjects) -> Result<Vec<DeleteObjectsItemResult>> {
        req.verify(self.config().bulk_delete_limit)?;
        let mut results = Vec::with_capacity(req.items.len());
        for item in &req.items {
            ctx.check()?;
            let location = ObjectLocation {
                project_id: req.project_id,
                bucket_name: req.bucket_name.clone(),
                object_key: item.object_key.clone(),
            };
            let outcome = self.delete_objects_item(ctx, &location, item, &req);
            results.push(match outcome {
                Ok(result) => result,
                Err(err) if err.is_object_lock() => DeleteObjectsItemResult {
                    object_key: item.object_key.clone(),
                    requested: item.stream_version_id,
                    status: DeleteObjectsStatus::Protected,
                    removed: None,
                    marker: None,
                },
                Err(Error::ObjectNotFound) => DeleteObjectsItemResult {
                    object_key: item.object_key.clone(),
                    requested: item.stream_version_id,
                    status: DeleteObjectsStatus::NotFound,
                    removed: None,
                    marker: None,
                },
                Err(err) => return Err(err),
            });
        }
        Ok(results)
    }

    fn delete_objects_item(
        &self,
        ctx: &Ctx,
        location: &ObjectLocation,
        item: &DeleteObjectsItem,
        req: &DeleteObjects,
    ) -> Result<DeleteObjectsItemResult> {
        let result = match item.stream_version_id {
            Some(svid) => {
                let adapter = self.adapter_for(location.project_id);
                let mut tx = adapter.begin(ctx)?;
                let now = tx.tx_now();
                let object = tx
                    .get_object_exact(ctx, location, svid.version)?
                    .filter(|object| svid.matches_stream(object.stream_id()))
                    .ok_or(Error::ObjectNotFound)?;
                object.verify_unprotected(req.bypass_governance, now)?;
                tx.delete_object_row(ctx, &object.stream)?;
                let segments_deleted = if object.status.is_delete_marker() {
                    0
                } else {
                    tx.delete_segments(ctx, object.stream_id())?
                };
                tx.commit(ctx)?;
                DeleteObjectResult {
                    removed: Some(object),
                    marker: None,
                    segments_deleted,
                }
            }
            None => self.delete_object_last_committed(
                ctx,
                DeleteObjectLastCommitted {
                    location: location.clone(),
                    versioned: req.versioned,
                    suspended: req.suspended,
                    bypass_governance: req.bypass_governance,
                },
            )?,
        };
        Ok(DeleteObjectsItemResult {
            object_key: item.object_key.clone(),
            requested: item.stream_version_id,
            status: DeleteObjectsStatus::Deleted,
            removed: result.removed,
            marker: result.marker,
        })
    }

    fn delete_plain_last_committed(
        &self,
        ctx: &Ctx,
        tx: &mut dyn crate::backend::AdapterTx,
        location: &ObjectLocation,
        bypass_governance: bool,
    ) -> Result<DeleteObjectResult> {
        let now = tx.tx_now();
        let object = tx
            .get_object_highest_visible(ctx, location)?
            .filter(|object| object.status.is_committed())
            .ok_or(Error::ObjectNotFound)?;
        object.verify_unprotected(bypass_governance, now)?;
        tx.delete_object_row(ctx, &object.stream)?;
        let segments_deleted = tx.delete_segments(ctx, object.stream_id())?;
        Ok(DeleteObjectResult {
            removed: Some(object),
            marker: None,
            segments_deleted,
        })
    }

    fn insert_versioned_marker(
        &self,
        ctx: &Ctx,
        tx: &mut dyn crate::backend::AdapterTx,
        location: &ObjectLocation,
    ) -> Result<DeleteObjectResult> {
        let info = precommit(tx, ctx, location, None, PrecommitOptions::default())?;
        let marker = delete_marker(
            location,
            info.assign_version(self.config().timestamp_versioning),
            ObjectStatus::DeleteMarkerVersioned,
            tx.tx_now(),
        );
        tx.insert_object(ctx, &marker)?;
        Ok(DeleteObjectResult {
            removed: None,
            marker: Some(marker),
            segments_deleted: 0,
        })
    }

    fn replace_with_unversioned_marker(
        &self,
        ctx: &Ctx,
        tx: &mut dyn crate::backend::AdapterTx,
        location: &ObjectLocation,
        bypass_governance: bool,
    ) -> Result<DeleteObjectResult> {
        let now = tx.tx_now();
        let info = precommit(
            tx,
            ctx,
            location,
            None,
            PrecommitOptions {
                unversioned: true,
                full_unversioned: true,
                ..PrecommitOptions::default()
            },
        )?;
        let displacement = displace_unversioned(tx, ctx, &info, bypass_governance, now)?;
        let marker = delete_marker(
            location,
            info.assign_version(self.config().timestamp_versioning),
            ObjectStatus::DeleteMarkerUnversioned,
            now,
        );
        tx.insert_object(ctx, &marker)?;
        Ok(DeleteObjectResult {
            removed: displacement.removed,
            marker: Some(marker),
            segments_deleted: displacement.segments_deleted,
        })
    }
}
