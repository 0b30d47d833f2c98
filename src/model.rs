//! Object and segment records as the engine reads and writes them.

use bytes::Bytes;

use crate::alias::{AliasPieces, Pieces};
use crate::error::{Error, Result};
use crate::types::{
    EncryptionParameters, LockInfo, ObjectKey, ObjectLocation, ObjectStatus, ObjectStream,
    PieceId, Placement, RedundancyScheme, SegmentPosition, StreamId, StreamVersionId, Timestamp,
    Version,
};

/// Client-encrypted metadata attached to an object.
///
/// All fields are opaque ciphertext; empty means absent.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct EncryptedUserData {
    /// Encrypted serialized user metadata.
    pub encrypted_metadata: Bytes,
    /// Nonce used for the metadata ciphertext.
    pub encrypted_metadata_nonce: Bytes,
    /// Encrypted key that unlocks `encrypted_metadata`.
    pub encrypted_metadata_key: Bytes,
    /// Encrypted ETag of the object content.
    pub encrypted_etag: Bytes,
}

impl EncryptedUserData {
    /// True when no field is set.
    pub fn is_empty(&self) -> bool {
        self.encrypted_metadata.is_empty()
            && self.encrypted_metadata_nonce.is_empty()
            && self.encrypted_metadata_key.is_empty()
            && self.encrypted_etag.is_empty()
    }

    /// Metadata requires its nonce and key, and vice versa.
    pub fn verify(&self) -> Result<()> {
        let has_metadata = !self.encrypted_metadata.is_empty();
        let has_nonce = !self.encrypted_metadata_nonce.is_empty();
        let has_key = !self.encrypted_metadata_key.is_empty();
        if has_metadata != has_nonce || has_metadata != has_key {
            return Err(Error::InvalidRequest(
                "encrypted metadata, nonce, and key must be set together".into(),
            ));
        }
        Ok(())
    }
}

/// One object row.
#[derive(Clone, Debug)]
pub struct Object {
    /// Location plus `(version, stream)` of the row.
    pub stream: ObjectStream,
    /// Lifecycle status.
    pub status: ObjectStatus,
    /// Row creation time.
    pub created_at: Timestamp,
    /// Optional expiry; expired objects are invisible and reclaimable.
    pub expires_at: Option<Timestamp>,
    /// Reaper deadline; set only while pending.
    pub zombie_deletion_deadline: Option<Timestamp>,
    /// Number of committed segments.
    pub segment_count: i32,
    /// Sum of segment plain sizes.
    pub total_plain_size: i64,
    /// Sum of segment encrypted sizes.
    pub total_encrypted_size: i64,
    /// Common plain size of the non-final segments, or zero.
    pub fixed_segment_size: i32,
    /// Encrypted user metadata.
    pub user_data: EncryptedUserData,
    /// Content encryption parameters.
    pub encryption: EncryptionParameters,
    /// Object Lock state.
    pub lock: LockInfo,
}

impl Object {
    /// The object's location.
    pub fn location(&self) -> &ObjectLocation {
        &self.stream.location
    }

    /// The row's version.
    pub fn version(&self) -> Version {
        self.stream.version
    }

    /// The row's content stream.
    pub fn stream_id(&self) -> StreamId {
        self.stream.stream_id
    }

    /// The externally visible version id of this row.
    pub fn stream_version_id(&self) -> StreamVersionId {
        StreamVersionId::new(self.stream.version, self.stream.stream_id)
    }

    /// True while Object Lock forbids deleting or mutating this object.
    pub fn is_protected(&self, bypass_governance: bool, now: Timestamp) -> bool {
        self.lock.is_protected(bypass_governance, now)
    }

    /// Translates active protection into the matching error.
    pub fn verify_unprotected(&self, bypass_governance: bool, now: Timestamp) -> Result<()> {
        if self.lock.legal_hold {
            return Err(Error::LegalHold);
        }
        if self.lock.is_protected(bypass_governance, now) {
            return Err(Error::ObjectProtected);
        }
        Ok(())
    }

    /// True when `expires_at` is set and has passed.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// One segment row.
#[derive(Clone, Debug)]
pub struct Segment {
    /// Stream the segment belongs to.
    pub stream_id: StreamId,
    /// Address within the stream.
    pub position: SegmentPosition,
    /// Row creation time.
    pub created_at: Timestamp,
    /// Optional expiry inherited from or alongside the parent object.
    pub expires_at: Option<Timestamp>,
    /// Set by the repair subsystem; the only post-commit segment mutation.
    pub repaired_at: Option<Timestamp>,
    /// Seed for per-node piece ids; zero for inline segments.
    pub root_piece_id: PieceId,
    /// Nonce for the segment content key.
    pub encrypted_key_nonce: Bytes,
    /// Encrypted segment content key.
    pub encrypted_key: Bytes,
    /// Encrypted ETag of the segment, if any.
    pub encrypted_etag: Bytes,
    /// Stored ciphertext size including overhead.
    pub encrypted_size: i32,
    /// Offset of this segment within the object's plaintext.
    pub plain_offset: i64,
    /// User-visible size of this segment.
    pub plain_size: i32,
    /// Erasure parameters; zero for inline segments.
    pub redundancy: RedundancyScheme,
    /// Ciphertext stored inline for small segments.
    pub inline_data: Bytes,
    /// Compressed piece list as stored.
    pub alias_pieces: AliasPieces,
    /// Piece list with node identities resolved; filled on read.
    pub pieces: Pieces,
    /// Regional constraint on piece placement.
    pub placement: Placement,
}

impl Segment {
    /// True when the ciphertext lives in the row itself.
    pub fn is_inline(&self) -> bool {
        self.alias_pieces.is_empty()
    }

    /// True when `offset` falls inside this segment's plaintext range.
    pub fn contains_offset(&self, offset: i64) -> bool {
        offset >= self.plain_offset && offset < self.plain_offset + i64::from(self.plain_size)
    }
}

/// One row of a listing result.
#[derive(Clone, Debug)]
pub struct ObjectEntry {
    /// Key, stripped of the listing prefix.
    pub object_key: ObjectKey,
    /// True for a synthetic collapsed-prefix entry.
    pub is_prefix: bool,
    /// Version of the row; zero for prefix entries.
    pub version: Version,
    /// Stream of the row; zero for prefix and marker entries.
    pub stream_id: StreamId,
    /// Status; prefix entries reuse the pending code and must be ignored.
    pub status: ObjectStatus,
    /// Row creation time.
    pub created_at: Timestamp,
    /// Optional expiry.
    pub expires_at: Option<Timestamp>,
    /// Number of committed segments.
    pub segment_count: i32,
    /// Sum of segment plain sizes.
    pub total_plain_size: i64,
    /// Sum of segment encrypted sizes.
    pub total_encrypted_size: i64,
    /// Common plain size of the non-final segments, or zero.
    pub fixed_segment_size: i32,
    /// Encrypted user metadata, when requested.
    pub user_data: Option<EncryptedUserData>,
    /// Content encryption parameters.
    pub encryption: EncryptionParameters,
}

impl ObjectEntry {
    /// A synthetic entry standing for every key under `prefix`.
    pub fn prefix(prefix: ObjectKey) -> Self {
        ObjectEntry {
            object_key: prefix,
            is_prefix: true,
            version: Version::ZERO,
            stream_id: StreamId::ZERO,
            status: ObjectStatus::Pending,
            created_at: Timestamp(0),
            expires_at: None,
            segment_count: 0,
            total_plain_size: 0,
            total_encrypted_size: 0,
            fixed_segment_size: 0,
            user_data: None,
            encryption: EncryptionParameters::default(),
        }
    }
}

/// One segment as streamed to background consumers.
///
/// Pieces stay in alias form; consumers resolve them only when needed.
#[derive(Clone, Debug)]
pub struct LoopSegmentEntry {
    /// Stream the segment belongs to.
    pub stream_id: StreamId,
    /// Address within the stream.
    pub position: SegmentPosition,
    /// Row creation time.
    pub created_at: Timestamp,
    /// Optional expiry.
    pub expires_at: Option<Timestamp>,
    /// Last repair time, if any.
    pub repaired_at: Option<Timestamp>,
    /// Seed for per-node piece ids; zero for inline segments.
    pub root_piece_id: PieceId,
    /// Stored ciphertext size including overhead.
    pub encrypted_size: i32,
    /// Offset within the object's plaintext.
    pub plain_offset: i64,
    /// User-visible size.
    pub plain_size: i32,
    /// Erasure parameters.
    pub redundancy: RedundancyScheme,
    /// Compressed piece list.
    pub alias_pieces: AliasPieces,
    /// Regional constraint.
    pub placement: Placement,
}

impl LoopSegmentEntry {
    /// True when the ciphertext lives in the row itself.
    pub fn is_inline(&self) -> bool {
        self.alias_pieces.is_empty()
    }
}
