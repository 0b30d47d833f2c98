//! Object Lock reads and bounded mutations.
//!
//! Retention and legal hold are the one sanctioned mutation of a committed
//! object. Tightening is always allowed; loosening an active Governance
//! retention needs the bypass, and an active Compliance retention never
//! loosens.

use tracing::info;

use crate::backend::AdapterTx;
use crate::ctx::Ctx;
use crate::db::MetaDb;
use crate::error::{Error, Result};
use crate::model::Object;
use crate::types::{LockInfo, ObjectLocation, RetentionMode, Timestamp, Version};

/// Reads the retention state of an object.
#[derive(Clone, Debug)]
pub struct GetObjectRetention {
    /// Location of the object.
    pub location: ObjectLocation,
    /// Exact version; absent means the last committed object.
    pub version: Option<Version>,
}

/// Replaces the retention state of an object.
#[derive(Clone, Debug)]
pub struct SetObjectRetention {
    /// Location of the object.
    pub location: ObjectLocation,
    /// Exact version; absent means the last committed object.
    pub version: Option<Version>,
    /// New retention mode; `None` clears retention.
    pub mode: RetentionMode,
    /// New retention deadline; required when a mode is set.
    pub retain_until: Option<Timestamp>,
    /// Authorizes loosening an active Governance retention.
    pub bypass_governance: bool,
}

/// Reads the legal-hold flag of an object.
#[derive(Clone, Debug)]
pub struct GetObjectLegalHold {
    /// Location of the object.
    pub location: ObjectLocation,
    /// Exact version; absent means the last committed object.
    pub version: Option<Version>,
}

/// Sets or clears the legal-hold flag of an object.
#[derive(Clone, Debug)]
pub struct SetObjectLegalHold {
    /// Location of the object.
    pub location: ObjectLocation,
    /// Exact version; absent means the last committed object.
    pub version: Option<Version>,
    /// The new flag value.
    pub enabled: bool,
}

impl MetaDb {
    /// Reads the retention of a committed object.
    pub fn get_object_retention(&self, ctx: &Ctx, req: GetObjectRetention) -> Result<LockInfo> {
        let object = self.read_lockable(ctx, &req.location, req.version)?;
        Ok(object.lock)
    }

    /// Reads the legal hold of a committed object.
    pub fn get_object_legal_hold(&self, ctx: &Ctx, req: GetObjectLegalHold) -> Result<bool> {
        let object = self.read_lockable(ctx, &req.location, req.version)?;
        Ok(object.lock.legal_hold)
    }

    /// Replaces the retention of a committed object, within the bounds the
    /// current protection allows.
    pub fn set_object_retention(&self, ctx: &Ctx, req: SetObjectRetention) -> Result<()> {
        req.location.verify()?;
        LockInfo {
            retention_mode: req.mode,
            retain_until: req.retain_until,
            legal_hold: false,
        }
        .verify()?;

        let adapter = self.adapter_for(req.location.project_id).clone();
        let mut tx = adapter.begin(ctx)?;
        let now = tx.tx_now();
        let object = resolve_lockable(ctx, tx.as_mut(), &req.location, req.version)?;

        let next = LockInfo {
            retention_mode: req.mode,
            retain_until: req.retain_until,
            legal_hold: object.lock.legal_hold,
        };
        verify_lock_attachable(ctx, tx.as_mut(), &object, &next)?;
        verify_retention_transition(&object.lock, &next, req.bypass_governance, now)?;

        if !tx.update_object_lock(ctx, object.location(), object.version(), next)? {
            return Err(Error::ObjectNotFound);
        }
        tx.commit(ctx)?;
        info!(
            location = %object.stream.location,
            version = %object.version(),
            mode = ?req.mode,
            "object.set_retention"
        );
        Ok(())
    }

    /// Sets or clears the legal hold of a committed object.
    pub fn set_object_legal_hold(&self, ctx: &Ctx, req: SetObjectLegalHold) -> Result<()> {
        req.location.verify()?;
        let adapter = self.adapter_for(req.location.project_id).clone();
        let mut tx = adapter.begin(ctx)?;
        let object = resolve_lockable(ctx, tx.as_mut(), &req.location, req.version)?;

        let next = LockInfo {
            legal_hold: req.enabled,
            ..object.lock
        };
        if req.enabled {
            verify_lock_attachable(ctx, tx.as_mut(), &object, &next)?;
        }
        if !tx.update_object_lock(ctx, object.location(), object.version(), next)? {
            return Err(Error::ObjectNotFound);
        }
        tx.commit(ctx)?;
        info!(
            location = %object.stream.location,
            version = %object.version(),
            enabled = req.enabled,
            "object.set_legal_hold"
        );
        Ok(())
    }

    fn read_lockable(
        &self,
        ctx: &Ctx,
        location: &ObjectLocation,
        version: Option<Version>,
    ) -> Result<Object> {
        location.verify()?;
        match version {
            Some(version) => {
                version.verify_positive()?;
                let adapter = self.adapter_for(location.project_id);
                let object = adapter
                    .get_object_exact(ctx, location, version)?
                    .ok_or(Error::ObjectNotFound)?;
                lockable(object)
            }
            None => self.last_committed(ctx, location),
        }
    }
}

fn resolve_lockable(
    ctx: &Ctx,
    tx: &mut dyn AdapterTx,
    location: &ObjectLocation,
    version: Option<Version>,
) -> Result<Object> {
    let object = match version {
        Some(version) => {
            version.verify_positive()?;
            tx.get_object_exact(ctx, location, version)?
                .ok_or(Error::ObjectNotFound)?
        }
        None => {
            let object = tx
                .get_object_highest_visible(ctx, location)?
                .ok_or(Error::ObjectNotFound)?;
            if object.status.is_delete_marker() {
                return Err(Error::ObjectNotFound);
            }
            object
        }
    };
    lockable(object)
}

fn lockable(object: Object) -> Result<Object> {
    if object.status.is_delete_marker() {
        return Err(Error::MethodNotAllowed("delete markers carry no Object Lock state"));
    }
    if !object.status.is_committed() {
        return Err(Error::ObjectNotFound);
    }
    Ok(object)
}

/// Invariant: expiring objects (or objects with expiring segments) cannot be
/// protected.
fn verify_lock_attachable(
    ctx: &Ctx,
    tx: &mut dyn AdapterTx,
    object: &Object,
    next: &LockInfo,
) -> Result<()> {
    if !next.is_set() {
        return Ok(());
    }
    if object.expires_at.is_some() {
        return Err(Error::ObjectExpiration(
            "expiring objects cannot carry retention or legal hold",
        ));
    }
    if tx.any_segment_with_expiry(ctx, object.stream_id())? {
        return Err(Error::ObjectExpiration(
            "objects with expiring segments cannot carry retention or legal hold",
        ));
    }
    Ok(())
}

fn verify_retention_transition(
    current: &LockInfo,
    next: &LockInfo,
    bypass_governance: bool,
    now: Timestamp,
) -> Result<()> {
    if !current.retention_active(now) {
        return Ok(());
    }
    let extends = next.retention_mode == current.retention_mode
        && match (current.retain_until, next.retain_until) {
            (Some(current_until), Some(next_until)) => next_until >= current_until,
            _ => false,
        };
    match current.retention_mode {
        RetentionMode::Compliance if !extends => Err(Error::ObjectProtected),
        RetentionMode::Governance if !extends && !bypass_governance => Err(Error::ObjectProtected),
        _ => Ok(()),
    }
}
