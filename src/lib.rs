//! # Umbra - Object and Segment Metadata Engine
//!
//! Umbra is the metadata catalog of a distributed erasure-coded object
//! store: the authoritative record of every object, every object version,
//! and every segment of ciphertext in the network, layered on a
//! transactional relational back end.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use umbra::{
//!     BeginObjectNextVersion, CommitObject, Ctx, MetaConfig, MetaDb, SqliteAdapter,
//! };
//! use umbra::types::{ObjectLocation, ObjectStream, ProjectId, StreamId, Version};
//!
//! let db = MetaDb::single(Arc::new(SqliteAdapter::open_in_memory()?), MetaConfig::testing())?;
//! let ctx = Ctx::new();
//!
//! let stream = ObjectStream {
//!     location: ObjectLocation {
//!         project_id: ProjectId::random(),
//!         bucket_name: "photos".into(),
//!         object_key: "2024/cat.jpg".into(),
//!     },
//!     version: Version::ZERO,
//!     stream_id: StreamId::random(),
//! };
//!
//! // open a pending upload, then commit it (segments would go in between)
//! db.begin_object_next_version(&ctx, BeginObjectNextVersion {
//!     stream: stream.clone(),
//!     encryption: Default::default(),
//!     expires_at: None,
//!     zombie_deletion_deadline: None,
//!     user_data: Default::default(),
//!     lock: Default::default(),
//! })?;
//! let object = db.commit_object(&ctx, CommitObject {
//!     stream,
//!     versioned: false,
//!     if_none_match: false,
//!     override_user_data: None,
//!     encryption: None,
//! })?;
//! assert_eq!(object.version(), Version(1));
//! # Ok::<(), umbra::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - **Back-end adapters**: a typed interface over a transactional
//!   relational store; a router picks one adapter per project.
//! - **Precommit**: every visible-state write runs one transactional probe
//!   that resolves version assignment, sibling displacement, and Object
//!   Lock protection under a single snapshot.
//! - **Lifecycle**: objects move pending → committed (versioned or
//!   unversioned) or are reaped; delete markers tombstone versioned
//!   histories.
//! - **Aliases**: 32-byte node identities compress to dense `i32` aliases
//!   inside segment piece lists, through a write-through cache.

pub mod alias;
pub mod backend;
pub mod config;
pub mod ctx;
pub mod db;
pub mod error;
pub mod logging;
pub mod model;
pub mod types;

// Re-export the main public API
pub use crate::alias::{AliasPiece, AliasPieces, Piece, Pieces};
pub use crate::backend::{Adapter, AdapterTx, Clock, Router, SqliteAdapter};
pub use crate::config::MetaConfig;
pub use crate::ctx::Ctx;
pub use crate::db::{
    BeginCopyInfo, BeginCopyObject, BeginObjectExactVersion, BeginObjectNextVersion, BeginSegment,
    CommitInlineSegment, CommitObject, CommitSegment, CopySegmentKey, DeleteObjectExactVersion,
    DeleteObjectLastCommitted, DeleteObjectResult, DeleteObjects, DeleteObjectsItem,
    DeleteObjectsItemResult, DeleteObjectsStatus, DeletePendingObject, DeleteZombieObjects,
    FinishCopyObject, FinishMoveObject, GetLatestObjectLastSegment, GetObjectExactVersion,
    GetObjectLastCommitted, GetObjectLegalHold, GetObjectRetention, GetSegmentByOffset,
    GetSegmentByPosition, IterateLoopSegments, IteratePendingObjectsByKey, ListCursor,
    ListObjects, ListObjectsResult, ListSegments, MetaDb, PendingObjectsPage, SegmentsPage,
    SetObjectLegalHold, SetObjectRetention, ZombieReport,
};
pub use crate::error::{Error, Result};
pub use crate::model::{
    EncryptedUserData, LoopSegmentEntry, Object, ObjectEntry, Segment,
};
