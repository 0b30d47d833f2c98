//! The precommit constraint.
//!
//! Every write that can change the visible state at a location runs exactly
//! one precommit probe inside its transaction. The probe observes, under a
//! single snapshot: the transaction-time version, the highest existing
//! version, the claimed pending object and its segments, the status of the
//! highest visible sibling, and the unversioned sibling. Version assignment
//! and sibling displacement then act on that snapshot; running either
//! outside the transaction would race.

use tracing::debug;

use crate::backend::{AdapterTx, PrecommitInfo, PrecommitOptions, PrecommitQuery};
use crate::ctx::Ctx;
use crate::error::{Error, Result};
use crate::model::Object;
use crate::types::{ObjectLocation, StreamId, Timestamp, Version};

/// Runs the precommit probe on an open transaction.
pub(crate) fn precommit(
    tx: &mut dyn AdapterTx,
    ctx: &Ctx,
    location: &ObjectLocation,
    claim: Option<(Version, StreamId)>,
    opts: PrecommitOptions,
) -> Result<PrecommitInfo> {
    tx.precommit(
        ctx,
        &PrecommitQuery {
            location: location.clone(),
            claim,
            opts,
        },
    )
}

/// Outcome of displacing the unversioned sibling.
#[derive(Debug, Default)]
pub(crate) struct Displacement {
    /// The removed sibling, if one existed.
    pub removed: Option<Object>,
    /// Segments deleted together with the sibling.
    pub segments_deleted: u64,
}

/// Deletes the unversioned sibling reported by precommit, in the same
/// transaction.
///
/// A protected sibling fails the enclosing operation; delete markers carry
/// no segments or protection and are simply dropped.
pub(crate) fn displace_unversioned(
    tx: &mut dyn AdapterTx,
    ctx: &Ctx,
    info: &PrecommitInfo,
    bypass_governance: bool,
    now: Timestamp,
) -> Result<Displacement> {
    let Some(sibling) = info.unversioned.as_ref() else {
        return Ok(Displacement::default());
    };
    sibling.verify_unprotected(bypass_governance, now)?;

    if !tx.delete_object_row(ctx, &sibling.stream)? {
        // the precommit snapshot guarantees the row is still there
        return Err(Error::Conflict("unversioned sibling vanished mid-transaction".into()));
    }
    let segments_deleted = if sibling.status.is_delete_marker() {
        0
    } else {
        tx.delete_segments(ctx, sibling.stream_id())?
    };
    debug!(
        location = %sibling.stream.location,
        version = %sibling.version(),
        segments = segments_deleted,
        "commit.displace"
    );
    Ok(Displacement {
        removed: Some(sibling.clone()),
        segments_deleted,
    })
}

/// Invariant: expiring objects and Object Lock exclude each other, and a
/// segment-level expiry forbids protecting the parent.
pub(crate) fn verify_expiry_exclusivity(
    object: &Object,
    any_segment_expires: bool,
) -> Result<()> {
    if object.lock.is_set() {
        if object.expires_at.is_some() {
            return Err(Error::ObjectExpiration(
                "expiring objects cannot carry retention or legal hold",
            ));
        }
        if any_segment_expires {
            return Err(Error::ObjectExpiration(
                "objects with expiring segments cannot carry retention or legal hold",
            ));
        }
    }
    Ok(())
}
