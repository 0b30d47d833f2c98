//! Core identifier and value types shared across the engine.
//!
//! Identifiers are newtypes so the compiler keeps projects, streams, and
//! nodes apart. Packed codecs (segment position, redundancy, encryption,
//! lock bitfield) live next to the types they encode; every decode is range
//! checked.

use std::fmt;

use rand::RngCore;
use time::{Duration, OffsetDateTime};

use crate::error::{Error, Result};

/// Identifies a project (tenant). 16 opaque bytes.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProjectId(pub [u8; 16]);

/// Identifies an object content stream. 16 opaque bytes.
///
/// Unique across all live objects; delete markers carry [`StreamId::ZERO`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub [u8; 16]);

/// Identity of a storage node. 32 opaque bytes.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(pub [u8; 32]);

/// Compact stand-in for a [`NodeId`] inside segment piece lists.
///
/// Dense, monotonically assigned, `>= 1`, never recycled.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeAlias(pub i32);

/// Object version within a `(project, bucket, key)` location.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Version(pub i64);

/// Instant in unix nanoseconds.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Timestamp(pub i64);

/// Key of an object within a bucket. Arbitrary bytes, compared bytewise.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct ObjectKey(pub Vec<u8>);

/// Regional placement constraint for segment pieces.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Placement(pub u16);

/// Seed for deriving per-node piece identifiers of one segment.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PieceId(pub [u8; 32]);

impl PieceId {
    /// Sentinel carried by inline segments.
    pub const ZERO: PieceId = PieceId([0u8; 32]);

    /// A fresh random piece id seed.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// True for the inline sentinel.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Debug for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PieceId({})", hex::encode(self.0))
    }
}

impl fmt::Display for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl ProjectId {
    /// A random project id, for tests and fixtures.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl StreamId {
    /// Sentinel stream carried by delete markers.
    pub const ZERO: StreamId = StreamId([0u8; 16]);

    /// A fresh random stream id.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// True for the delete-marker sentinel.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Trailing eight bytes, used inside [`StreamVersionId`].
    pub fn suffix(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out.copy_from_slice(&self.0[8..16]);
        out
    }
}

impl fmt::Debug for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProjectId({})", hex::encode(self.0))
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", hex::encode(self.0))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Display for NodeAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Version {
    /// Sentinel on `BeginObjectNextVersion`: assign the version at commit.
    pub const ZERO: Version = Version(0);

    /// Versions at or above this floor are reserved for transaction-time
    /// versions. Unix nanoseconds have exceeded the floor since 2006, so
    /// timestamp versions and explicit client versions never collide.
    pub const TIMESTAMP_FLOOR: Version = Version(1 << 60);

    /// True for the auto-assign sentinel.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// The immediately following version.
    pub fn next(&self) -> Version {
        Version(self.0 + 1)
    }

    /// Derives a version from a transaction timestamp.
    pub fn from_timestamp(ts: Timestamp) -> Version {
        Version(ts.0)
    }

    /// Validates a version used to address an existing row. Timestamp-range
    /// versions are addressable; only the zero sentinel and negatives are
    /// not.
    pub fn verify_positive(&self) -> Result<()> {
        if self.0 <= 0 {
            return Err(Error::InvalidRequest("version must be positive".into()));
        }
        Ok(())
    }

    /// Validates a caller-chosen version for a new row, which additionally
    /// must stay below the reserved timestamp range.
    pub fn verify_explicit(&self) -> Result<()> {
        self.verify_positive()?;
        if *self >= Self::TIMESTAMP_FLOOR {
            return Err(Error::InvalidRequest(
                "version is inside the reserved timestamp range".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Timestamp {
    /// The current wall-clock instant.
    pub fn now() -> Self {
        Self::from_datetime(OffsetDateTime::now_utc())
    }

    /// Converts from a calendar datetime, saturating at the i64 range.
    pub fn from_datetime(dt: OffsetDateTime) -> Self {
        let nanos = dt.unix_timestamp_nanos();
        Timestamp(nanos.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
    }

    /// Converts to a calendar datetime.
    pub fn to_datetime(self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp_nanos(self.0 as i128)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    /// Shifts the instant by `duration`, saturating on overflow.
    pub fn saturating_add(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_add(duration.whole_nanoseconds().clamp(
            i64::MIN as i128,
            i64::MAX as i128,
        ) as i64))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime())
    }
}

impl ObjectKey {
    /// Borrow the raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True when the key has no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when `self` begins with `prefix`.
    pub fn starts_with(&self, prefix: &ObjectKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// The smallest key greater than every key prefixed by `self`, or `None`
    /// when no such key exists (the prefix is all 0xff).
    pub fn prefix_limit(&self) -> Option<ObjectKey> {
        let mut bytes = self.0.clone();
        while let Some(last) = bytes.last().copied() {
            if last < 0xff {
                *bytes.last_mut().unwrap() = last + 1;
                return Some(ObjectKey(bytes));
            }
            bytes.pop();
        }
        None
    }
}

impl From<&str> for ObjectKey {
    fn from(value: &str) -> Self {
        ObjectKey(value.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for ObjectKey {
    fn from(value: Vec<u8>) -> Self {
        ObjectKey(value)
    }
}

impl fmt::Debug for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectKey({})", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// Fully qualifies an object key: `(project, bucket, key)`.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ObjectLocation {
    /// Owning project.
    pub project_id: ProjectId,
    /// Bucket within the project.
    pub bucket_name: String,
    /// Key within the bucket.
    pub object_key: ObjectKey,
}

impl ObjectLocation {
    /// Validates the location fields.
    pub fn verify(&self) -> Result<()> {
        if self.bucket_name.is_empty() {
            return Err(Error::InvalidRequest("bucket name is missing".into()));
        }
        if self.bucket_name.len() > 63 {
            return Err(Error::InvalidRequest("bucket name is too long".into()));
        }
        if self.object_key.is_empty() {
            return Err(Error::InvalidRequest("object key is missing".into()));
        }
        Ok(())
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.project_id, self.bucket_name, self.object_key
        )
    }
}

/// A location plus the `(version, stream)` pair addressing one object row.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct ObjectStream {
    /// Location of the object.
    pub location: ObjectLocation,
    /// Version of the row; [`Version::ZERO`] for auto-assigned pendings.
    pub version: Version,
    /// Content stream of the row.
    pub stream_id: StreamId,
}

impl ObjectStream {
    /// Validates location and stream; the version may be the zero sentinel.
    pub fn verify(&self) -> Result<()> {
        self.location.verify()?;
        if self.stream_id.is_zero() {
            return Err(Error::InvalidRequest("stream id is missing".into()));
        }
        Ok(())
    }
}

/// Lifecycle state of an object row.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum ObjectStatus {
    /// Open upload; invisible to reads, subject to the zombie deadline.
    Pending,
    /// Committed in a bucket without versioning.
    CommittedUnversioned,
    /// Committed with a durable version.
    CommittedVersioned,
    /// Tombstone that displaced an unversioned object.
    DeleteMarkerUnversioned,
    /// Tombstone stacked on top of versioned objects.
    DeleteMarkerVersioned,
}

impl ObjectStatus {
    /// Stable storage code. The partial indexes in the SQLite schema repeat
    /// these literals; the two must move together.
    pub fn code(self) -> i64 {
        match self {
            ObjectStatus::Pending => 1,
            ObjectStatus::CommittedUnversioned => 2,
            ObjectStatus::CommittedVersioned => 3,
            ObjectStatus::DeleteMarkerUnversioned => 4,
            ObjectStatus::DeleteMarkerVersioned => 5,
        }
    }

    /// Inverse of [`code`](Self::code).
    pub fn from_code(code: i64) -> Result<Self> {
        Ok(match code {
            1 => ObjectStatus::Pending,
            2 => ObjectStatus::CommittedUnversioned,
            3 => ObjectStatus::CommittedVersioned,
            4 => ObjectStatus::DeleteMarkerUnversioned,
            5 => ObjectStatus::DeleteMarkerVersioned,
            _ => {
                return Err(Error::backend(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unknown object status code {code}"),
                )))
            }
        })
    }

    /// True for both committed statuses.
    pub fn is_committed(self) -> bool {
        matches!(
            self,
            ObjectStatus::CommittedUnversioned | ObjectStatus::CommittedVersioned
        )
    }

    /// True for both delete-marker statuses.
    pub fn is_delete_marker(self) -> bool {
        matches!(
            self,
            ObjectStatus::DeleteMarkerUnversioned | ObjectStatus::DeleteMarkerVersioned
        )
    }

    /// True for the statuses that participate in the unversioned singleton.
    pub fn is_unversioned(self) -> bool {
        matches!(
            self,
            ObjectStatus::CommittedUnversioned | ObjectStatus::DeleteMarkerUnversioned
        )
    }
}

/// Segment address within a stream: `(part, index)` packed so that integer
/// order on the packed form equals the segment's byte order.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct SegmentPosition {
    /// Multipart part number (upper 32 bits).
    pub part: u32,
    /// Index within the part (lower 32 bits).
    pub index: u32,
}

impl SegmentPosition {
    /// Packs to the storage form.
    pub fn encode(self) -> u64 {
        (u64::from(self.part) << 32) | u64::from(self.index)
    }

    /// Unpacks from the storage form.
    pub fn decode(value: u64) -> Self {
        SegmentPosition {
            part: (value >> 32) as u32,
            index: value as u32,
        }
    }

    /// The column value. Parts stay below `i32::MAX` (checked on begin), so
    /// the signed form preserves ordering in SQL.
    pub fn column(self) -> i64 {
        self.encode() as i64
    }

    /// Inverse of [`column`](Self::column).
    pub fn from_column(value: i64) -> Self {
        Self::decode(value as u64)
    }
}

impl fmt::Display for SegmentPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.part, self.index)
    }
}

/// Object Lock retention mode.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub enum RetentionMode {
    /// No retention configured.
    #[default]
    None,
    /// Bypassable with explicit authority.
    Governance,
    /// Never bypassable.
    Compliance,
}

/// Object Lock state of one object: retention plus legal hold.
///
/// Packed into a single small integer column: low 2 bits retention mode,
/// bit 2 legal hold. `retain_until` rides in its own nullable column.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct LockInfo {
    /// Retention mode, if any.
    pub retention_mode: RetentionMode,
    /// End of the retention period; required when a mode is set.
    pub retain_until: Option<Timestamp>,
    /// Legal hold flag; independent of retention.
    pub legal_hold: bool,
}

const LOCK_MODE_MASK: i64 = 0b011;
const LOCK_LEGAL_HOLD: i64 = 0b100;

impl LockInfo {
    /// Packs mode and hold into the bitfield column value.
    pub fn bits(&self) -> i64 {
        let mode = match self.retention_mode {
            RetentionMode::None => 0,
            RetentionMode::Governance => 1,
            RetentionMode::Compliance => 2,
        };
        mode | if self.legal_hold { LOCK_LEGAL_HOLD } else { 0 }
    }

    /// Unpacks the bitfield column value.
    pub fn from_bits(bits: i64, retain_until: Option<Timestamp>) -> Result<Self> {
        let retention_mode = match bits & LOCK_MODE_MASK {
            0 => RetentionMode::None,
            1 => RetentionMode::Governance,
            2 => RetentionMode::Compliance,
            _ => {
                return Err(Error::backend(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "unknown retention mode bits",
                )))
            }
        };
        Ok(LockInfo {
            retention_mode,
            retain_until,
            legal_hold: bits & LOCK_LEGAL_HOLD != 0,
        })
    }

    /// Validates that mode and deadline are set together.
    pub fn verify(&self) -> Result<()> {
        match (self.retention_mode, self.retain_until) {
            (RetentionMode::None, Some(_)) => Err(Error::InvalidRequest(
                "retention deadline without a retention mode".into(),
            )),
            (RetentionMode::None, None) => Ok(()),
            (_, None) => Err(Error::InvalidRequest(
                "retention mode without a deadline".into(),
            )),
            (_, Some(_)) => Ok(()),
        }
    }

    /// True when any protection is configured at all.
    pub fn is_set(&self) -> bool {
        self.retention_mode != RetentionMode::None || self.legal_hold
    }

    /// True while the retention period is running.
    pub fn retention_active(&self, now: Timestamp) -> bool {
        self.retention_mode != RetentionMode::None
            && self.retain_until.map(|until| now < until).unwrap_or(false)
    }

    /// The protection predicate: active retention not bypassed, or a hold.
    ///
    /// Governance yields to `bypass_governance`; Compliance never does.
    pub fn is_protected(&self, bypass_governance: bool, now: Timestamp) -> bool {
        if self.legal_hold {
            return true;
        }
        self.retention_active(now)
            && !(bypass_governance && self.retention_mode == RetentionMode::Governance)
    }
}

/// Reed-Solomon parameters of a remote segment, packed into one i64 column:
/// algorithm(8) | required(8) | repair(8) | optimal(8) | total(8) |
/// share_size(24).
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct RedundancyScheme {
    /// Erasure algorithm identifier.
    pub algorithm: u8,
    /// Shares needed to reconstruct a stripe.
    pub required_shares: u16,
    /// Share count below which repair triggers.
    pub repair_shares: u16,
    /// Target share count after repair.
    pub optimal_shares: u16,
    /// Shares produced per stripe.
    pub total_shares: u16,
    /// Bytes per share; at most 2^24 - 1.
    pub share_size: u32,
}

impl RedundancyScheme {
    /// True when no scheme is recorded (inline segments).
    pub fn is_zero(&self) -> bool {
        *self == RedundancyScheme::default()
    }

    /// Validates counts for a remote segment.
    pub fn verify(&self) -> Result<()> {
        if self.required_shares == 0 {
            return Err(Error::InvalidRequest("required shares must be positive".into()));
        }
        if self.total_shares < self.optimal_shares || self.optimal_shares < self.required_shares {
            return Err(Error::InvalidRequest(
                "redundancy shares must be ordered required <= optimal <= total".into(),
            ));
        }
        if self.share_size == 0 {
            return Err(Error::InvalidRequest("share size must be positive".into()));
        }
        Ok(())
    }

    /// Packs to the column value, range checking each field.
    pub fn pack(&self) -> Result<i64> {
        for (name, value) in [
            ("required", self.required_shares),
            ("repair", self.repair_shares),
            ("optimal", self.optimal_shares),
            ("total", self.total_shares),
        ] {
            if value > u16::from(u8::MAX) {
                return Err(Error::InvalidRequest(format!(
                    "redundancy {name} shares exceed the packable range"
                )));
            }
        }
        if self.share_size >= 1 << 24 {
            return Err(Error::InvalidRequest(
                "redundancy share size exceeds the packable range".into(),
            ));
        }
        let packed = (i64::from(self.algorithm) << 56)
            | (i64::from(self.required_shares) << 48)
            | (i64::from(self.repair_shares) << 40)
            | (i64::from(self.optimal_shares) << 32)
            | (i64::from(self.total_shares) << 24)
            | i64::from(self.share_size);
        Ok(packed)
    }

    /// Inverse of [`pack`](Self::pack).
    pub fn unpack(value: i64) -> Self {
        RedundancyScheme {
            algorithm: ((value >> 56) & 0xff) as u8,
            required_shares: ((value >> 48) & 0xff) as u16,
            repair_shares: ((value >> 40) & 0xff) as u16,
            optimal_shares: ((value >> 32) & 0xff) as u16,
            total_shares: ((value >> 24) & 0xff) as u16,
            share_size: (value & 0xff_ffff) as u32,
        }
    }
}

/// Content encryption parameters, packed as cipher(8) | block_size(32).
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct EncryptionParameters {
    /// Cipher suite identifier; zero means unencrypted/unset.
    pub cipher_suite: u8,
    /// Encryption block size in bytes.
    pub block_size: u32,
}

impl EncryptionParameters {
    /// True when nothing is recorded.
    pub fn is_zero(&self) -> bool {
        *self == EncryptionParameters::default()
    }

    /// Packs to the column value.
    pub fn pack(&self) -> i64 {
        (i64::from(self.cipher_suite) << 32) | i64::from(self.block_size)
    }

    /// Inverse of [`pack`](Self::pack).
    pub fn unpack(value: i64) -> Self {
        EncryptionParameters {
            cipher_suite: ((value >> 32) & 0xff) as u8,
            block_size: (value & 0xffff_ffff) as u32,
        }
    }
}

/// Combines a version with a stream-id suffix into the externally visible
/// version id: version (8 bytes BE) followed by the stream suffix (8 bytes).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct StreamVersionId {
    /// Addressed version.
    pub version: Version,
    /// Trailing eight bytes of the stream id, a tamper check on deletes.
    pub stream_suffix: [u8; 8],
}

impl StreamVersionId {
    /// Builds the id for an object row.
    pub fn new(version: Version, stream_id: StreamId) -> Self {
        StreamVersionId {
            version,
            stream_suffix: stream_id.suffix(),
        }
    }

    /// Encodes to the 16-byte wire form.
    pub fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.version.0.to_be_bytes());
        out[8..].copy_from_slice(&self.stream_suffix);
        out
    }

    /// Decodes the 16-byte wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 16 {
            return Err(Error::InvalidRequest("stream version id must be 16 bytes".into()));
        }
        let mut version = [0u8; 8];
        version.copy_from_slice(&bytes[..8]);
        let mut suffix = [0u8; 8];
        suffix.copy_from_slice(&bytes[8..]);
        let version = Version(i64::from_be_bytes(version));
        if version.0 <= 0 {
            return Err(Error::InvalidRequest("stream version id version must be positive".into()));
        }
        Ok(StreamVersionId {
            version,
            stream_suffix: suffix,
        })
    }

    /// True when `stream_id` carries the same suffix.
    pub fn matches_stream(&self, stream_id: StreamId) -> bool {
        self.stream_suffix == stream_id.suffix()
    }
}

impl fmt::Display for StreamVersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.encode()))
    }
}
