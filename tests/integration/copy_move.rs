#![allow(missing_docs)]

mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::*;
use umbra::types::{ProjectId, SegmentPosition, StreamId};
use umbra::{
    Adapter, BeginCopyObject, CopySegmentKey, Ctx, DeleteObjectLastCommitted, Error,
    FinishCopyObject, FinishMoveObject, GetObjectLastCommitted, GetSegmentByPosition, MetaConfig,
    MetaDb, Result, Router, SqliteAdapter,
};

fn fresh_keys(keys: &[CopySegmentKey]) -> Vec<CopySegmentKey> {
    keys.iter()
        .enumerate()
        .map(|(i, key)| CopySegmentKey {
            position: key.position,
            encrypted_key_nonce: Bytes::from(format!("new-nonce-{i}")),
            encrypted_key: Bytes::from(format!("new-key-{i}")),
        })
        .collect()
}

fn finish_request(
    info: &umbra::BeginCopyInfo,
    destination: umbra::types::ObjectLocation,
    new_stream_id: StreamId,
) -> FinishCopyObject {
    FinishCopyObject {
        source: info.source.clone(),
        destination,
        new_stream_id,
        new_segment_keys: fresh_keys(&info.segment_keys),
        new_encrypted_metadata_nonce: Bytes::from_static(b"meta-nonce"),
        new_encrypted_metadata_key: Bytes::from_static(b"meta-key"),
        override_metadata: false,
        new_encrypted_metadata: Bytes::new(),
        versioned: false,
    }
}

#[test]
fn copy_preserves_the_piece_list() -> Result<()> {
    let (db, ctx) = test_db()?;
    let project = ProjectId::random();
    let source_loc = location(project, "copy-src");

    let stream = begin_next_version(&db, &ctx, &source_loc)?;
    db.commit_segment(
        &ctx,
        remote_segment_request(&stream, SegmentPosition { part: 0, index: 0 }, 85, 0, 4096),
    )?;
    let source = commit_pending(&db, &ctx, stream, false)?;

    let info = db.begin_copy_object(
        &ctx,
        BeginCopyObject {
            location: source_loc.clone(),
            version: None,
        },
    )?;
    assert_eq!(info.segment_count, 1);
    assert_eq!(info.segment_keys.len(), 1);

    let dest_loc = location(project, "copy-dst");
    let new_stream = StreamId::random();
    let copied = db.finish_copy_object(&ctx, finish_request(&info, dest_loc.clone(), new_stream))?;

    assert_eq!(copied.segment_count, source.segment_count);
    assert_eq!(copied.total_plain_size, source.total_plain_size);
    assert_eq!(copied.total_encrypted_size, source.total_encrypted_size);
    assert_eq!(copied.fixed_segment_size, source.fixed_segment_size);

    let original = db.get_segment_by_position(
        &ctx,
        GetSegmentByPosition {
            project_id: project,
            stream_id: source.stream_id(),
            position: SegmentPosition { part: 0, index: 0 },
        },
    )?;
    let copy = db.get_segment_by_position(
        &ctx,
        GetSegmentByPosition {
            project_id: project,
            stream_id: new_stream,
            position: SegmentPosition { part: 0, index: 0 },
        },
    )?;
    assert_eq!(copy.pieces.len(), 85);
    assert_eq!(copy.pieces, original.pieces, "same (piece_number, node) pairs");
    assert_eq!(copy.alias_pieces, original.alias_pieces);
    assert_eq!(copy.redundancy, original.redundancy);
    assert_eq!(copy.encrypted_size, original.encrypted_size);
    assert_ne!(copy.encrypted_key, original.encrypted_key, "keys are re-encrypted");
    assert_ne!(copy.encrypted_key_nonce, original.encrypted_key_nonce);

    // the source is untouched
    db.get_object_last_committed(&ctx, GetObjectLastCommitted { location: source_loc })?;
    Ok(())
}

#[test]
fn move_deletes_the_source_in_the_same_transaction() -> Result<()> {
    let (db, ctx) = test_db()?;
    let project = ProjectId::random();
    let source_loc = location(project, "move-src");
    let source = commit_object_with_segments(&db, &ctx, &source_loc, false, 2)?;

    let info = db.begin_copy_object(
        &ctx,
        BeginCopyObject {
            location: source_loc.clone(),
            version: None,
        },
    )?;
    let dest_loc = location(project, "move-dst");
    let moved = db.finish_move_object(
        &ctx,
        FinishMoveObject {
            copy: finish_request(&info, dest_loc.clone(), StreamId::random()),
        },
    )?;
    assert_eq!(moved.segment_count, 2);

    let gone = db.get_object_last_committed(
        &ctx,
        GetObjectLastCommitted { location: source_loc },
    );
    assert!(matches!(gone, Err(Error::ObjectNotFound)));

    let source_segment = db.get_segment_by_position(
        &ctx,
        GetSegmentByPosition {
            project_id: project,
            stream_id: source.stream_id(),
            position: SegmentPosition { part: 0, index: 0 },
        },
    );
    assert!(matches!(source_segment, Err(Error::SegmentNotFound)));
    Ok(())
}

#[test]
fn copying_a_delete_marker_is_not_allowed() -> Result<()> {
    let (db, ctx) = test_db()?;
    let project = ProjectId::random();
    let loc = location(project, "marked");
    commit_object_with_segments(&db, &ctx, &loc, true, 0)?;
    db.delete_object_last_committed(
        &ctx,
        DeleteObjectLastCommitted {
            location: loc.clone(),
            versioned: true,
            suspended: false,
            bypass_governance: false,
        },
    )?;

    let begin = db.begin_copy_object(&ctx, BeginCopyObject { location: loc, version: None });
    assert!(matches!(begin, Err(Error::ObjectNotFound)), "the marker hides the object");
    Ok(())
}

#[test]
fn finish_copy_validates_the_key_count() -> Result<()> {
    let (db, ctx) = test_db()?;
    let project = ProjectId::random();
    let source_loc = location(project, "key-count");
    commit_object_with_segments(&db, &ctx, &source_loc, false, 2)?;

    let info = db.begin_copy_object(
        &ctx,
        BeginCopyObject {
            location: source_loc,
            version: None,
        },
    )?;
    let mut request = finish_request(&info, location(project, "key-count-dst"), StreamId::random());
    request.new_segment_keys.pop();
    let result = db.finish_copy_object(&ctx, request);
    assert!(matches!(result, Err(Error::InvalidRequest(_))));
    Ok(())
}

#[test]
fn unversioned_copy_displaces_the_destination_sibling() -> Result<()> {
    let (db, ctx) = test_db()?;
    let project = ProjectId::random();
    let source_loc = location(project, "displacing-src");
    let dest_loc = location(project, "displacing-dst");
    commit_object_with_segments(&db, &ctx, &source_loc, false, 1)?;
    let old_dest = commit_object_with_segments(&db, &ctx, &dest_loc, false, 1)?;

    let info = db.begin_copy_object(
        &ctx,
        BeginCopyObject {
            location: source_loc,
            version: None,
        },
    )?;
    let new_stream = StreamId::random();
    db.finish_copy_object(&ctx, finish_request(&info, dest_loc.clone(), new_stream))?;

    let visible = db.get_object_last_committed(&ctx, GetObjectLastCommitted { location: dest_loc })?;
    assert_eq!(visible.stream_id(), new_stream);
    assert_ne!(visible.stream_id(), old_dest.stream_id());

    let displaced_segment = db.get_segment_by_position(
        &ctx,
        GetSegmentByPosition {
            project_id: project,
            stream_id: old_dest.stream_id(),
            position: SegmentPosition { part: 0, index: 0 },
        },
    );
    assert!(matches!(displaced_segment, Err(Error::SegmentNotFound)));
    Ok(())
}

#[test]
fn copy_and_move_cross_projects_on_a_shared_back_end() -> Result<()> {
    let (db, ctx) = test_db()?;
    let source_project = ProjectId::random();
    let dest_project = ProjectId::random();
    let source_loc = location(source_project, "shared-src");
    let source = commit_object_with_segments(&db, &ctx, &source_loc, false, 2)?;

    let info = db.begin_copy_object(
        &ctx,
        BeginCopyObject {
            location: source_loc.clone(),
            version: None,
        },
    )?;
    let dest_loc = location(dest_project, "shared-dst");
    let copied = db.finish_copy_object(&ctx, finish_request(&info, dest_loc.clone(), StreamId::random()))?;
    assert_eq!(copied.location().project_id, dest_project);
    assert_eq!(copied.segment_count, source.segment_count);
    db.get_object_last_committed(
        &ctx,
        GetObjectLastCommitted { location: dest_loc.clone() },
    )?;
    db.get_object_last_committed(
        &ctx,
        GetObjectLastCommitted { location: source_loc },
    )?;

    // a cross-project move on the same back end works too
    let move_info = db.begin_copy_object(
        &ctx,
        BeginCopyObject {
            location: dest_loc.clone(),
            version: None,
        },
    )?;
    let third_loc = location(ProjectId::random(), "shared-moved");
    db.finish_move_object(
        &ctx,
        FinishMoveObject {
            copy: finish_request(&move_info, third_loc.clone(), StreamId::random()),
        },
    )?;
    let gone = db.get_object_last_committed(&ctx, GetObjectLastCommitted { location: dest_loc });
    assert!(matches!(gone, Err(Error::ObjectNotFound)));
    db.get_object_last_committed(&ctx, GetObjectLastCommitted { location: third_loc })?;
    Ok(())
}

#[test]
fn copy_and_move_across_back_ends_are_rejected() -> Result<()> {
    let ctx = Ctx::new();
    let primary = Arc::new(SqliteAdapter::open_in_memory()?);
    let secondary = Arc::new(SqliteAdapter::open_in_memory()?.with_class("sqlite-b"));
    let pinned_project = ProjectId::random();
    let router = Router::new(
        vec![
            primary as Arc<dyn Adapter>,
            secondary as Arc<dyn Adapter>,
        ],
        &[(pinned_project, "sqlite-b")],
    )?;
    let db = MetaDb::new(router, MetaConfig::testing());

    let source_loc = location(ProjectId::random(), "split-src");
    commit_object_with_segments(&db, &ctx, &source_loc, false, 1)?;
    let info = db.begin_copy_object(
        &ctx,
        BeginCopyObject {
            location: source_loc,
            version: None,
        },
    )?;

    let request = finish_request(&info, location(pinned_project, "split-dst"), StreamId::random());
    let copy = db.finish_copy_object(&ctx, request.clone());
    assert!(matches!(copy, Err(Error::InvalidRequest(_))));
    let moved = db.finish_move_object(&ctx, FinishMoveObject { copy: request });
    assert!(matches!(moved, Err(Error::InvalidRequest(_))));
    Ok(())
}

#[test]
fn metadata_override_requires_consistent_flags() -> Result<()> {
    let (db, ctx) = test_db()?;
    let project = ProjectId::random();
    let source_loc = location(project, "meta-flags");
    commit_object_with_segments(&db, &ctx, &source_loc, false, 0)?;

    let info = db.begin_copy_object(
        &ctx,
        BeginCopyObject {
            location: source_loc,
            version: None,
        },
    )?;
    let mut request = finish_request(&info, location(project, "meta-flags-dst"), StreamId::random());
    request.new_encrypted_metadata = Bytes::from_static(b"replacement");
    let result = db.finish_copy_object(&ctx, request);
    assert!(matches!(result, Err(Error::InvalidRequest(_))), "metadata without override flag");
    Ok(())
}
