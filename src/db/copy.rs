//! Copy and move: duplicating segment rows under a new stream with
//! caller-supplied re-encrypted keys.

use bytes::Bytes;
use tracing::info;

use crate::backend::{AdapterTx, PrecommitOptions};
use crate::ctx::Ctx;
use crate::db::precommit::{displace_unversioned, precommit};
use crate::db::MetaDb;
use crate::error::{Error, Result};
use crate::model::{EncryptedUserData, Object, Segment};
use crate::types::{
    EncryptionParameters, LockInfo, ObjectLocation, ObjectStatus, ObjectStream, SegmentPosition,
    StreamId, Version,
};

/// Reads everything a client needs to re-encrypt segment keys for a copy.
#[derive(Clone, Debug)]
pub struct BeginCopyObject {
    /// Source location.
    pub location: ObjectLocation,
    /// Exact source version; absent means the last committed object.
    pub version: Option<Version>,
}

impl BeginCopyObject {
    fn verify(&self) -> Result<()> {
        self.location.verify()?;
        if let Some(version) = self.version {
            version.verify_positive()?;
        }
        Ok(())
    }
}

/// Per-segment key material, both as read from the source and as supplied
/// for the destination.
#[derive(Clone, Debug)]
pub struct CopySegmentKey {
    /// Segment position the key belongs to.
    pub position: SegmentPosition,
    /// Nonce for the segment content key.
    pub encrypted_key_nonce: Bytes,
    /// Encrypted segment content key.
    pub encrypted_key: Bytes,
}

/// Result of [`BeginCopyObject`].
#[derive(Clone, Debug)]
pub struct BeginCopyInfo {
    /// The resolved source row.
    pub source: ObjectStream,
    /// Source encryption parameters.
    pub encryption: EncryptionParameters,
    /// Source user metadata (still under the source metadata key).
    pub user_data: EncryptedUserData,
    /// Key material of every source segment, in position order.
    pub segment_keys: Vec<CopySegmentKey>,
    /// Number of segments the source carries.
    pub segment_count: i32,
}

/// Commits a copy at the destination.
#[derive(Clone, Debug)]
pub struct FinishCopyObject {
    /// Source row, as resolved by [`BeginCopyObject`].
    pub source: ObjectStream,
    /// Destination location; must route to the source's back end.
    pub destination: ObjectLocation,
    /// Stream id of the destination object.
    pub new_stream_id: StreamId,
    /// Re-encrypted key material, one entry per source segment.
    pub new_segment_keys: Vec<CopySegmentKey>,
    /// Nonce of the re-encrypted metadata key.
    pub new_encrypted_metadata_nonce: Bytes,
    /// Re-encrypted metadata key.
    pub new_encrypted_metadata_key: Bytes,
    /// Replace the inherited metadata instead of carrying it over.
    pub override_metadata: bool,
    /// Replacement metadata when `override_metadata` is set.
    pub new_encrypted_metadata: Bytes,
    /// The destination bucket is versioned.
    pub versioned: bool,
}

impl FinishCopyObject {
    fn verify(&self) -> Result<()> {
        self.source.verify()?;
        self.destination.verify()?;
        if self.new_stream_id.is_zero() {
            return Err(Error::InvalidRequest("new stream id is missing".into()));
        }
        if self.override_metadata {
            if self.new_encrypted_metadata.is_empty() {
                return Err(Error::InvalidRequest(
                    "override requires replacement metadata".into(),
                ));
            }
        } else if !self.new_encrypted_metadata.is_empty() {
            return Err(Error::InvalidRequest(
                "replacement metadata requires the override flag".into(),
            ));
        }
        Ok(())
    }
}

/// Commits a move: a copy whose source is deleted in the same transaction.
#[derive(Clone, Debug)]
pub struct FinishMoveObject {
    /// The copy half of the move.
    pub copy: FinishCopyObject,
}

impl MetaDb {
    /// First copy phase: reads source metadata and per-segment key material.
    pub fn begin_copy_object(&self, ctx: &Ctx, req: BeginCopyObject) -> Result<BeginCopyInfo> {
        req.verify()?;
        let source = match req.version {
            Some(version) => {
                let adapter = self.adapter_for(req.location.project_id);
                let object = adapter
                    .get_object_exact(ctx, &req.location, version)?
                    .ok_or(Error::ObjectNotFound)?;
                if object.status.is_delete_marker() {
                    return Err(Error::MethodNotAllowed("cannot copy a delete marker"));
                }
                if !object.status.is_committed() {
                    return Err(Error::ObjectNotFound);
                }
                object
            }
            None => self.last_committed(ctx, &req.location)?,
        };
        if source.segment_count > self.config().copy_segment_limit {
            return Err(Error::InvalidRequest(format!(
                "object has {} segments, the copy limit is {}",
                source.segment_count,
                self.config().copy_segment_limit
            )));
        }

        let adapter = self.adapter_for(req.location.project_id);
        let segments = adapter.list_segments(
            ctx,
            source.stream_id(),
            None,
            self.config().copy_segment_limit as usize + 1,
        )?;
        let segment_keys = segments
            .iter()
            .map(|segment| CopySegmentKey {
                position: segment.position,
                encrypted_key_nonce: segment.encrypted_key_nonce.clone(),
                encrypted_key: segment.encrypted_key.clone(),
            })
            .collect();
        Ok(BeginCopyInfo {
            source: source.stream.clone(),
            encryption: source.encryption,
            user_data: source.user_data.clone(),
            segment_count: source.segment_count,
            segment_keys,
        })
    }

    /// Second copy phase: transactionally materializes the destination.
    pub fn finish_copy_object(&self, ctx: &Ctx, req: FinishCopyObject) -> Result<Object> {
        req.verify()?;
        self.verify_shared_backend(&req)?;
        let adapter = self.adapter_for(req.source.location.project_id).clone();
        let mut tx = adapter.begin(ctx)?;
        let object = self.finish_copy_in_tx(ctx, tx.as_mut(), &req, false)?;
        tx.commit(ctx)?;
        info!(
            source = %req.source.location,
            destination = %object.stream.location,
            segments = object.segment_count,
            "object.copy"
        );
        Ok(object)
    }

    /// Copies and deletes the source in one transaction.
    pub fn finish_move_object(&self, ctx: &Ctx, req: FinishMoveObject) -> Result<Object> {
        req.copy.verify()?;
        self.verify_shared_backend(&req.copy)?;
        let adapter = self.adapter_for(req.copy.source.location.project_id).clone();
        let mut tx = adapter.begin(ctx)?;
        let object = self.finish_copy_in_tx(ctx, tx.as_mut(), &req.copy, true)?;
        tx.commit(ctx)?;
        info!(
            source = %req.copy.source.location,
            destination = %object.stream.location,
            "object.move"
        );
        Ok(object)
    }

    /// Source and destination may live in different projects, but both must
    /// route to the same back end; the copy runs in one transaction there.
    fn verify_shared_backend(&self, req: &FinishCopyObject) -> Result<()> {
        if !self
            .router()
            .same_adapter(req.source.location.project_id, req.destination.project_id)
        {
            return Err(Error::InvalidRequest(
                "copy source and destination must share a back end".into(),
            ));
        }
        Ok(())
    }

    fn finish_copy_in_tx(
        &self,
        ctx: &Ctx,
        tx: &mut dyn AdapterTx,
        req: &FinishCopyObject,
        delete_source: bool,
    ) -> Result<Object> {
        let now = tx.tx_now();

        let source = tx
            .get_object_exact(ctx, &req.source.location, req.source.version)?
            .filter(|object| object.stream_id() == req.source.stream_id)
            .ok_or(Error::ObjectNotFound)?;
        if source.status.is_delete_marker() {
            return Err(Error::MethodNotAllowed("cannot copy a delete marker"));
        }
        if !source.status.is_committed() {
            return Err(Error::ObjectNotFound);
        }
        if delete_source {
            source.verify_unprotected(false, now)?;
        }

        let segments = tx.fetch_segments(ctx, source.stream_id())?;
        if segments.len() as i32 > self.config().copy_segment_limit {
            return Err(Error::InvalidRequest(format!(
                "object has {} segments, the copy limit is {}",
                segments.len(),
                self.config().copy_segment_limit
            )));
        }
        if req.new_segment_keys.len() != segments.len() {
            return Err(Error::InvalidRequest(format!(
                "expected {} segment keys, got {}",
                segments.len(),
                req.new_segment_keys.len()
            )));
        }

        let info = precommit(
            tx,
            ctx,
            &req.destination,
            None,
            PrecommitOptions {
                unversioned: !req.versioned,
                ..PrecommitOptions::default()
            },
        )?;
        if !req.versioned {
            displace_unversioned(tx, ctx, &info, false, now)?;
        }

        let encrypted_metadata = if req.override_metadata {
            req.new_encrypted_metadata.clone()
        } else {
            source.user_data.encrypted_metadata.clone()
        };
        let user_data = if encrypted_metadata.is_empty() {
            EncryptedUserData {
                encrypted_etag: source.user_data.encrypted_etag.clone(),
                ..EncryptedUserData::default()
            }
        } else {
            EncryptedUserData {
                encrypted_metadata,
                encrypted_metadata_nonce: req.new_encrypted_metadata_nonce.clone(),
                encrypted_metadata_key: req.new_encrypted_metadata_key.clone(),
                encrypted_etag: source.user_data.encrypted_etag.clone(),
            }
        };
        user_data.verify()?;

        let destination = Object {
            stream: ObjectStream {
                location: req.destination.clone(),
                version: info.assign_version(self.config().timestamp_versioning),
                stream_id: req.new_stream_id,
            },
            status: if req.versioned {
                ObjectStatus::CommittedVersioned
            } else {
                ObjectStatus::CommittedUnversioned
            },
            created_at: now,
            expires_at: source.expires_at,
            zombie_deletion_deadline: None,
            segment_count: source.segment_count,
            total_plain_size: source.total_plain_size,
            total_encrypted_size: source.total_encrypted_size,
            // preserved as-is, even the zero of migrated old objects
            fixed_segment_size: source.fixed_segment_size,
            user_data,
            encryption: source.encryption,
            lock: LockInfo::default(),
        };
        tx.insert_object(ctx, &destination)?;

        let mut copied = Vec::with_capacity(segments.len());
        for (segment, key) in segments.into_iter().zip(&req.new_segment_keys) {
            if segment.position != key.position {
                return Err(Error::InvalidRequest(format!(
                    "segment key position {} does not match segment {}",
                    key.position, segment.position
                )));
            }
            copied.push(Segment {
                stream_id: req.new_stream_id,
                encrypted_key_nonce: key.encrypted_key_nonce.clone(),
                encrypted_key: key.encrypted_key.clone(),
                ..segment
            });
        }
        tx.insert_segments(ctx, &copied)?;

        if delete_source {
            tx.delete_object_row(ctx, &source.stream)?;
            tx.delete_segments(ctx, source.stream_id())?;
        }
        Ok(destination)
    }
}
