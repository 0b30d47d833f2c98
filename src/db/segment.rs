//! Segment commit and segment reads.

use bytes::Bytes;
use tracing::debug;

use crate::alias::Pieces;
use crate::ctx::Ctx;
use crate::db::MetaDb;
use crate::error::{Error, Result};
use crate::model::{Object, Segment};
use crate::types::{
    ObjectLocation, ObjectStream, PieceId, Placement, ProjectId, RedundancyScheme,
    SegmentPosition, StreamId, Timestamp,
};

/// Finalizes a remote segment under a pending object.
#[derive(Clone, Debug)]
pub struct CommitSegment {
    /// The pending object's stream.
    pub stream: ObjectStream,
    /// Position claimed by this segment.
    pub position: SegmentPosition,
    /// Seed for deriving per-node piece ids.
    pub root_piece_id: PieceId,
    /// Piece locations produced by the upload.
    pub pieces: Pieces,
    /// Nonce for the segment content key.
    pub encrypted_key_nonce: Bytes,
    /// Encrypted segment content key.
    pub encrypted_key: Bytes,
    /// Encrypted ETag of the segment, if any.
    pub encrypted_etag: Bytes,
    /// Stored ciphertext size including overhead.
    pub encrypted_size: i32,
    /// Offset within the object's plaintext.
    pub plain_offset: i64,
    /// User-visible size.
    pub plain_size: i32,
    /// Erasure parameters of the pieces.
    pub redundancy: RedundancyScheme,
    /// Regional constraint on piece placement.
    pub placement: Placement,
    /// Optional segment-level expiry.
    pub expires_at: Option<Timestamp>,
}

impl CommitSegment {
    fn verify(&self) -> Result<()> {
        self.stream.verify()?;
        if self.root_piece_id.is_zero() {
            return Err(Error::InvalidRequest("root piece id is missing".into()));
        }
        if self.pieces.is_empty() {
            return Err(Error::InvalidRequest("remote segment requires pieces".into()));
        }
        if self.encrypted_key.is_empty() || self.encrypted_key_nonce.is_empty() {
            return Err(Error::InvalidRequest("encrypted key and nonce are missing".into()));
        }
        if self.encrypted_size < 0 || self.plain_size < 0 || self.plain_offset < 0 {
            return Err(Error::InvalidRequest("segment sizes must be non-negative".into()));
        }
        if self.position.part > i32::MAX as u32 {
            return Err(Error::InvalidRequest("part number out of range".into()));
        }
        self.redundancy.verify()
    }
}

/// Finalizes a small segment stored inline in the metadata row.
#[derive(Clone, Debug)]
pub struct CommitInlineSegment {
    /// The pending object's stream.
    pub stream: ObjectStream,
    /// Position claimed by this segment.
    pub position: SegmentPosition,
    /// Nonce for the segment content key.
    pub encrypted_key_nonce: Bytes,
    /// Encrypted segment content key.
    pub encrypted_key: Bytes,
    /// Encrypted ETag of the segment, if any.
    pub encrypted_etag: Bytes,
    /// The ciphertext itself.
    pub inline_data: Bytes,
    /// Offset within the object's plaintext.
    pub plain_offset: i64,
    /// User-visible size.
    pub plain_size: i32,
    /// Optional segment-level expiry.
    pub expires_at: Option<Timestamp>,
}

impl CommitInlineSegment {
    fn verify(&self) -> Result<()> {
        self.stream.verify()?;
        if self.encrypted_key.is_empty() || self.encrypted_key_nonce.is_empty() {
            return Err(Error::InvalidRequest("encrypted key and nonce are missing".into()));
        }
        if self.plain_size < 0 || self.plain_offset < 0 {
            return Err(Error::InvalidRequest("segment sizes must be non-negative".into()));
        }
        if self.position.part > i32::MAX as u32 {
            return Err(Error::InvalidRequest("part number out of range".into()));
        }
        Ok(())
    }
}

/// Reads one segment by exact position.
#[derive(Clone, Debug)]
pub struct GetSegmentByPosition {
    /// Project owning the stream, for back-end routing.
    pub project_id: ProjectId,
    /// Stream to read from.
    pub stream_id: StreamId,
    /// Position to read.
    pub position: SegmentPosition,
}

/// Reads the segment covering a plaintext offset of the last committed
/// object.
#[derive(Clone, Debug)]
pub struct GetSegmentByOffset {
    /// Location of the object.
    pub location: ObjectLocation,
    /// Plaintext offset to resolve.
    pub plain_offset: i64,
}

/// Reads the final segment of the last committed object.
#[derive(Clone, Debug)]
pub struct GetLatestObjectLastSegment {
    /// Location of the object.
    pub location: ObjectLocation,
}

/// Pages through the segments of one stream.
#[derive(Clone, Debug)]
pub struct ListSegments {
    /// Project owning the stream, for back-end routing.
    pub project_id: ProjectId,
    /// Stream to list.
    pub stream_id: StreamId,
    /// Exclusive position cursor.
    pub cursor: Option<SegmentPosition>,
    /// Maximum segments returned.
    pub limit: usize,
}

/// One page of [`ListSegments`] output.
#[derive(Clone, Debug)]
pub struct SegmentsPage {
    /// The segments, ordered by position.
    pub segments: Vec<Segment>,
    /// True when more segments follow the page.
    pub more: bool,
}

impl MetaDb {
    /// Inserts a remote segment row under a pending object.
    pub fn commit_segment(&self, ctx: &Ctx, req: CommitSegment) -> Result<()> {
        req.verify()?;
        let project_id = req.stream.location.project_id;
        // alias assignment is idempotent, so it safely precedes the transaction
        let alias_pieces = self.pieces_for_project(ctx, project_id, &req.pieces)?;

        let adapter = self.adapter_for(project_id);
        let mut tx = adapter.begin(ctx)?;
        let pending = self.require_pending(ctx, tx.as_mut(), &req.stream)?;
        verify_segment_expiry(&pending, req.expires_at)?;

        let segment = Segment {
            stream_id: req.stream.stream_id,
            position: req.position,
            created_at: tx.tx_now(),
            expires_at: req.expires_at.or(pending.expires_at),
            repaired_at: None,
            root_piece_id: req.root_piece_id,
            encrypted_key_nonce: req.encrypted_key_nonce,
            encrypted_key: req.encrypted_key,
            encrypted_etag: req.encrypted_etag,
            encrypted_size: req.encrypted_size,
            plain_offset: req.plain_offset,
            plain_size: req.plain_size,
            redundancy: req.redundancy,
            inline_data: Bytes::new(),
            alias_pieces,
            pieces: Vec::new(),
            placement: req.placement,
        };
        tx.insert_segment(ctx, &segment)?;
        tx.commit(ctx)?;
        debug!(stream = %req.stream.stream_id, position = %req.position, "segment.commit");
        Ok(())
    }

    /// Inserts an inline segment row under a pending object.
    pub fn commit_inline_segment(&self, ctx: &Ctx, req: CommitInlineSegment) -> Result<()> {
        req.verify()?;
        let adapter = self.adapter_for(req.stream.location.project_id);
        let mut tx = adapter.begin(ctx)?;
        let pending = self.require_pending(ctx, tx.as_mut(), &req.stream)?;
        verify_segment_expiry(&pending, req.expires_at)?;

        let encrypted_size = req.inline_data.len() as i32;
        let segment = Segment {
            stream_id: req.stream.stream_id,
            position: req.position,
            created_at: tx.tx_now(),
            expires_at: req.expires_at.or(pending.expires_at),
            repaired_at: None,
            root_piece_id: PieceId::ZERO,
            encrypted_key_nonce: req.encrypted_key_nonce,
            encrypted_key: req.encrypted_key,
            encrypted_etag: req.encrypted_etag,
            encrypted_size,
            plain_offset: req.plain_offset,
            plain_size: req.plain_size,
            redundancy: RedundancyScheme::default(),
            inline_data: req.inline_data,
            alias_pieces: Default::default(),
            pieces: Vec::new(),
            placement: Placement::default(),
        };
        tx.insert_segment(ctx, &segment)?;
        tx.commit(ctx)?;
        debug!(stream = %req.stream.stream_id, position = %req.position, "segment.commit_inline");
        Ok(())
    }

    /// Reads one segment by `(stream, position)`.
    pub fn get_segment_by_position(
        &self,
        ctx: &Ctx,
        req: GetSegmentByPosition,
    ) -> Result<Segment> {
        if req.stream_id.is_zero() {
            return Err(Error::InvalidRequest("stream id is missing".into()));
        }
        let adapter = self.adapter_for(req.project_id);
        let mut segment = adapter
            .get_segment(ctx, req.stream_id, req.position)?
            .ok_or(Error::SegmentNotFound)?;
        self.resolve_segment_pieces(ctx, req.project_id, &mut segment)?;
        Ok(segment)
    }

    /// Reads the segment covering `plain_offset` of the last committed
    /// object at the location.
    pub fn get_segment_by_offset(&self, ctx: &Ctx, req: GetSegmentByOffset) -> Result<Segment> {
        if req.plain_offset < 0 {
            return Err(Error::InvalidRequest("plain offset must be non-negative".into()));
        }
        let object = self.last_committed(ctx, &req.location)?;
        let project_id = req.location.project_id;
        let adapter = self.adapter_for(project_id);
        let mut segment = adapter
            .segment_by_offset(ctx, object.stream_id(), req.plain_offset)?
            .filter(|segment| segment.contains_offset(req.plain_offset))
            .ok_or(Error::SegmentNotFound)?;
        self.resolve_segment_pieces(ctx, project_id, &mut segment)?;
        Ok(segment)
    }

    /// Reads the final segment of the last committed object at the location.
    pub fn get_latest_object_last_segment(
        &self,
        ctx: &Ctx,
        req: GetLatestObjectLastSegment,
    ) -> Result<Segment> {
        let object = self.last_committed(ctx, &req.location)?;
        let project_id = req.location.project_id;
        let adapter = self.adapter_for(project_id);
        let mut segment = adapter
            .last_segment(ctx, object.stream_id())?
            .ok_or(Error::SegmentNotFound)?;
        self.resolve_segment_pieces(ctx, project_id, &mut segment)?;
        Ok(segment)
    }

    /// Pages through the segments of one stream, in position order.
    pub fn list_segments(&self, ctx: &Ctx, req: ListSegments) -> Result<SegmentsPage> {
        if req.stream_id.is_zero() {
            return Err(Error::InvalidRequest("stream id is missing".into()));
        }
        if req.limit == 0 {
            return Err(Error::InvalidRequest("limit must be positive".into()));
        }
        let adapter = self.adapter_for(req.project_id);
        let mut segments =
            adapter.list_segments(ctx, req.stream_id, req.cursor, req.limit + 1)?;
        let more = segments.len() > req.limit;
        segments.truncate(req.limit);
        for segment in &mut segments {
            self.resolve_segment_pieces(ctx, req.project_id, segment)?;
        }
        Ok(SegmentsPage { segments, more })
    }

    fn require_pending(
        &self,
        ctx: &Ctx,
        tx: &mut dyn crate::backend::AdapterTx,
        stream: &ObjectStream,
    ) -> Result<Object> {
        tx.get_pending_object(ctx, stream)?.ok_or(Error::ObjectNotFound)
    }
}

/// A segment-level expiry under a protected object violates the expiry
/// exclusivity invariant; fail before writing the row.
fn verify_segment_expiry(pending: &Object, expires_at: Option<Timestamp>) -> Result<()> {
    if pending.lock.is_set() && (expires_at.is_some() || pending.expires_at.is_some()) {
        return Err(Error::ObjectExpiration(
            "segments of a protected object cannot expire",
        ));
    }
    Ok(())
}
