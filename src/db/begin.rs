//! Opening pending objects and reserving segment positions.

use tracing::debug;

use crate::ctx::Ctx;
use crate::db::precommit::verify_expiry_exclusivity;
use crate::db::MetaDb;
use crate::error::{Error, Result};
use crate::model::{EncryptedUserData, Object};
use crate::types::{
    EncryptionParameters, LockInfo, ObjectStatus, ObjectStream, PieceId, SegmentPosition,
    Timestamp, Version,
};

/// Opens a pending object whose version is assigned at commit.
#[derive(Clone, Debug)]
pub struct BeginObjectNextVersion {
    /// Location and stream of the upload; the version must be the zero
    /// sentinel.
    pub stream: ObjectStream,
    /// Content encryption parameters.
    pub encryption: EncryptionParameters,
    /// Optional expiry of the finished object.
    pub expires_at: Option<Timestamp>,
    /// Overrides the configured zombie deadline.
    pub zombie_deletion_deadline: Option<Timestamp>,
    /// Encrypted user metadata recorded at begin.
    pub user_data: EncryptedUserData,
    /// Object Lock options recorded at begin and sealed at commit.
    pub lock: LockInfo,
}

impl BeginObjectNextVersion {
    fn verify(&self) -> Result<()> {
        self.stream.verify()?;
        if !self.stream.version.is_zero() {
            return Err(Error::InvalidRequest(
                "next-version begin requires the zero version sentinel".into(),
            ));
        }
        self.user_data.verify()?;
        self.lock.verify()?;
        if self.lock.is_set() && self.expires_at.is_some() {
            return Err(Error::ObjectExpiration(
                "expiring objects cannot carry retention or legal hold",
            ));
        }
        Ok(())
    }
}

/// Opens a pending object at a caller-chosen version.
#[derive(Clone, Debug)]
pub struct BeginObjectExactVersion {
    /// Location and stream of the upload.
    pub stream: ObjectStream,
    /// Content encryption parameters.
    pub encryption: EncryptionParameters,
    /// Optional expiry of the finished object.
    pub expires_at: Option<Timestamp>,
    /// Overrides the configured zombie deadline.
    pub zombie_deletion_deadline: Option<Timestamp>,
    /// Encrypted user metadata recorded at begin.
    pub user_data: EncryptedUserData,
    /// Object Lock options recorded at begin and sealed at commit.
    pub lock: LockInfo,
}

impl BeginObjectExactVersion {
    fn verify(&self) -> Result<()> {
        self.stream.verify()?;
        self.stream.version.verify_explicit()?;
        self.user_data.verify()?;
        self.lock.verify()?;
        if self.lock.is_set() && self.expires_at.is_some() {
            return Err(Error::ObjectExpiration(
                "expiring objects cannot carry retention or legal hold",
            ));
        }
        Ok(())
    }
}

/// Logically reserves a segment position under a pending object.
///
/// No row is inserted; positions are claimed when the segment commits.
#[derive(Clone, Debug)]
pub struct BeginSegment {
    /// The pending object's stream.
    pub stream: ObjectStream,
    /// Position being reserved.
    pub position: SegmentPosition,
    /// Seed for deriving per-node piece ids.
    pub root_piece_id: PieceId,
}

impl BeginSegment {
    fn verify(&self) -> Result<()> {
        self.stream.verify()?;
        if self.root_piece_id.is_zero() {
            return Err(Error::InvalidRequest("root piece id is missing".into()));
        }
        if self.position.part > i32::MAX as u32 {
            return Err(Error::InvalidRequest("part number out of range".into()));
        }
        Ok(())
    }
}

impl MetaDb {
    /// Inserts a pending object whose version will be assigned at commit.
    pub fn begin_object_next_version(
        &self,
        ctx: &Ctx,
        req: BeginObjectNextVersion,
    ) -> Result<Object> {
        req.verify()?;
        self.begin_object(
            ctx,
            req.stream,
            Version::ZERO,
            req.encryption,
            req.expires_at,
            req.zombie_deletion_deadline,
            req.user_data,
            req.lock,
        )
    }

    /// Inserts a pending object at an exact version, failing on collision.
    pub fn begin_object_exact_version(
        &self,
        ctx: &Ctx,
        req: BeginObjectExactVersion,
    ) -> Result<Object> {
        req.verify()?;
        let version = req.stream.version;
        self.begin_object(
            ctx,
            req.stream,
            version,
            req.encryption,
            req.expires_at,
            req.zombie_deletion_deadline,
            req.user_data,
            req.lock,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn begin_object(
        &self,
        ctx: &Ctx,
        stream: ObjectStream,
        version: Version,
        encryption: EncryptionParameters,
        expires_at: Option<Timestamp>,
        zombie_deadline: Option<Timestamp>,
        user_data: EncryptedUserData,
        lock: LockInfo,
    ) -> Result<Object> {
        let adapter = self.adapter_for(stream.location.project_id);
        let mut tx = adapter.begin(ctx)?;
        let now = tx.tx_now();

        if !version.is_zero() && tx.get_object_exact(ctx, &stream.location, version)?.is_some() {
            return Err(Error::Conflict("object version already exists".into()));
        }

        let object = Object {
            stream,
            status: ObjectStatus::Pending,
            created_at: now,
            expires_at,
            zombie_deletion_deadline: Some(
                zombie_deadline.unwrap_or_else(|| {
                    now.saturating_add(self.config().default_zombie_deadline)
                }),
            ),
            segment_count: 0,
            total_plain_size: 0,
            total_encrypted_size: 0,
            fixed_segment_size: 0,
            user_data,
            encryption,
            lock,
        };
        tx.insert_object(ctx, &object)?;
        tx.commit(ctx)?;
        debug!(location = %object.stream.location, version = %object.version(), "object.begin");
        Ok(object)
    }

    /// Validates that a segment may be placed under a pending object.
    pub fn begin_segment(&self, ctx: &Ctx, req: BeginSegment) -> Result<()> {
        req.verify()?;
        if req.position.part >= self.config().max_parts {
            return Err(Error::InvalidRequest(format!(
                "part number {} exceeds the limit {}",
                req.position.part,
                self.config().max_parts
            )));
        }
        let adapter = self.adapter_for(req.stream.location.project_id);
        let pending = adapter
            .get_pending_object(ctx, &req.stream)?
            .ok_or(Error::ObjectNotFound)?;
        verify_expiry_exclusivity(&pending, false)?;
        Ok(())
    }
}
