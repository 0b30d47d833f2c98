//! Object metadata reads.

use crate::ctx::Ctx;
use crate::db::MetaDb;
use crate::error::{Error, Result};
use crate::model::Object;
use crate::types::{ObjectLocation, Version};

/// Reads one object row by exact version.
#[derive(Clone, Debug)]
pub struct GetObjectExactVersion {
    /// Location of the object.
    pub location: ObjectLocation,
    /// Version to read.
    pub version: Version,
}

impl GetObjectExactVersion {
    fn verify(&self) -> Result<()> {
        self.location.verify()?;
        self.version.verify_positive()
    }
}

/// Reads the last committed object at a location.
#[derive(Clone, Debug)]
pub struct GetObjectLastCommitted {
    /// Location of the object.
    pub location: ObjectLocation,
}

impl MetaDb {
    /// Reads a committed object by exact version.
    ///
    /// Pending and expired rows read as absent; a delete marker at the
    /// version is not retrievable content.
    pub fn get_object_exact_version(
        &self,
        ctx: &Ctx,
        req: GetObjectExactVersion,
    ) -> Result<Object> {
        req.verify()?;
        let adapter = self.adapter_for(req.location.project_id);
        let now = adapter.now(ctx)?;
        let object = adapter
            .get_object_exact(ctx, &req.location, req.version)?
            .ok_or(Error::ObjectNotFound)?;
        if object.status.is_delete_marker() {
            return Err(Error::MethodNotAllowed("the addressed version is a delete marker"));
        }
        if !object.status.is_committed() || object.is_expired(now) {
            return Err(Error::ObjectNotFound);
        }
        Ok(object)
    }

    /// Reads the last committed object; a delete marker on top reads as
    /// `ObjectNotFound`.
    pub fn get_object_last_committed(
        &self,
        ctx: &Ctx,
        req: GetObjectLastCommitted,
    ) -> Result<Object> {
        self.last_committed(ctx, &req.location)
    }
}
