//! Object commit: the one transition from pending to committed.

use tracing::{debug, info};

use crate::backend::{PendingSegment, PrecommitOptions};
use crate::ctx::Ctx;
use crate::db::precommit::{displace_unversioned, precommit, verify_expiry_exclusivity};
use crate::db::MetaDb;
use crate::error::{Error, Result};
use crate::model::{EncryptedUserData, Object};
use crate::types::{EncryptionParameters, ObjectStatus, ObjectStream};

/// Finalizes a pending object.
///
/// In one transaction: the precommit probe resolves the version to assign
/// and the sibling to displace, lock and expiry invariants are validated on
/// the composite of pending object plus segments, aggregates are computed,
/// and the pending row becomes a committed row. On any failure nothing is
/// observable and the pending object remains for the reaper.
#[derive(Clone, Debug)]
pub struct CommitObject {
    /// The pending object's stream. A zero version means the version was
    /// left for commit to assign; a positive version must match the begin.
    pub stream: ObjectStream,
    /// Commit into the versioned state instead of displacing the
    /// unversioned sibling.
    pub versioned: bool,
    /// Fail with `ObjectAlreadyExists` when a committed object is already
    /// visible at the location.
    pub if_none_match: bool,
    /// Replaces the user metadata recorded at begin.
    pub override_user_data: Option<EncryptedUserData>,
    /// Supplies encryption parameters when none were recorded at begin.
    pub encryption: Option<EncryptionParameters>,
}

impl CommitObject {
    fn verify(&self) -> Result<()> {
        self.stream.verify()?;
        if !self.stream.version.is_zero() {
            self.stream.version.verify_explicit()?;
        }
        if let Some(user_data) = &self.override_user_data {
            user_data.verify()?;
        }
        Ok(())
    }
}

/// Aggregates derived from the pending object's segments.
struct SegmentTotals {
    count: i32,
    plain: i64,
    encrypted: i64,
    fixed: i32,
    any_expiry: bool,
}

fn aggregate_segments(segments: &[PendingSegment]) -> Result<SegmentTotals> {
    let mut plain = 0i64;
    let mut encrypted = 0i64;
    let mut any_expiry = false;
    let mut offset = 0i64;
    for segment in segments {
        if segment.plain_offset != offset {
            return Err(Error::InvalidRequest(
                "segments do not form a contiguous plaintext".into(),
            ));
        }
        offset += i64::from(segment.plain_size);
        plain += i64::from(segment.plain_size);
        encrypted += i64::from(segment.encrypted_size);
        any_expiry |= segment.has_expiry;
    }

    let fixed = match segments {
        [] => 0,
        [single] => single.plain_size,
        [head @ .., last] => {
            let common = head[0].plain_size;
            if head.iter().all(|segment| segment.plain_size == common)
                && last.plain_size <= common
            {
                common
            } else {
                0
            }
        }
    };

    Ok(SegmentTotals {
        count: segments.len() as i32,
        plain,
        encrypted,
        fixed,
        any_expiry,
    })
}

impl MetaDb {
    /// Commits a pending object, making it and its segments visible
    /// atomically.
    pub fn commit_object(&self, ctx: &Ctx, req: CommitObject) -> Result<Object> {
        req.verify()?;
        let adapter = self.adapter_for(req.stream.location.project_id);
        let mut tx = adapter.begin(ctx)?;
        let now = tx.tx_now();

        let info = precommit(
            tx.as_mut(),
            ctx,
            &req.stream.location,
            Some((req.stream.version, req.stream.stream_id)),
            PrecommitOptions {
                pending: true,
                with_segments: true,
                exclude_pending_user_data: req.override_user_data.is_some(),
                unversioned: !req.versioned,
                highest_visible: req.if_none_match,
                ..PrecommitOptions::default()
            },
        )?;
        let pending = info.pending.clone().ok_or(Error::ObjectNotFound)?;

        if req.if_none_match {
            if let Some(status) = info.highest_visible_status {
                if status.is_committed() {
                    return Err(Error::ObjectAlreadyExists);
                }
            }
        }

        let totals = aggregate_segments(&info.segments)?;
        verify_expiry_exclusivity(&pending, totals.any_expiry)?;

        let version = if req.stream.version.is_zero() {
            info.assign_version(self.config().timestamp_versioning)
        } else {
            req.stream.version
        };

        let displacement = if req.versioned {
            Default::default()
        } else {
            displace_unversioned(tx.as_mut(), ctx, &info, false, now)?
        };

        let committed = Object {
            stream: ObjectStream {
                location: req.stream.location.clone(),
                version,
                stream_id: req.stream.stream_id,
            },
            status: if req.versioned {
                ObjectStatus::CommittedVersioned
            } else {
                ObjectStatus::CommittedUnversioned
            },
            created_at: pending.created_at,
            expires_at: pending.expires_at,
            zombie_deletion_deadline: None,
            segment_count: totals.count,
            total_plain_size: totals.plain,
            total_encrypted_size: totals.encrypted,
            fixed_segment_size: totals.fixed,
            user_data: req.override_user_data.unwrap_or(pending.user_data),
            encryption: if pending.encryption.is_zero() {
                req.encryption.unwrap_or_default()
            } else {
                pending.encryption
            },
            lock: pending.lock,
        };

        if version == pending.stream.version {
            if !tx.promote_object(ctx, &pending.stream, &committed)? {
                return Err(Error::ObjectNotFound);
            }
        } else {
            if !tx.delete_object_row(ctx, &pending.stream)? {
                return Err(Error::ObjectNotFound);
            }
            tx.insert_object(ctx, &committed)?;
        }

        tx.commit(ctx)?;
        if let Some(removed) = &displacement.removed {
            debug!(
                location = %removed.stream.location,
                version = %removed.version(),
                "commit.displaced_sibling"
            );
        }
        info!(
            location = %committed.stream.location,
            version = %committed.version(),
            segments = committed.segment_count,
            versioned = req.versioned,
            "object.commit"
        );
        Ok(committed)
    }
}
