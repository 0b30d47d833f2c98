#![allow(missing_docs)]

mod common;

use common::*;
use umbra::types::{ObjectStatus, ProjectId, SegmentPosition, Version};
use umbra::{
    CommitObject, Ctx, Error, GetObjectLastCommitted, GetSegmentByPosition, ListCursor,
    ListObjects, Result,
};

#[test]
fn commit_promotes_pending_to_unversioned() -> Result<()> {
    let (db, ctx) = test_db()?;
    let project = ProjectId::random();
    let loc = location(project, "report.pdf");

    let stream = begin_next_version(&db, &ctx, &loc)?;
    add_inline_segments(&db, &ctx, &stream, 2, 100)?;
    let object = commit_pending(&db, &ctx, stream, false)?;

    assert_eq!(object.status, ObjectStatus::CommittedUnversioned);
    assert_eq!(object.version(), Version(1), "first version at an empty location");
    assert_eq!(object.segment_count, 2);
    assert_eq!(object.total_plain_size, 200);
    assert_eq!(object.fixed_segment_size, 100);
    assert!(object.zombie_deletion_deadline.is_none(), "deadline cleared at commit");

    let read = db.get_object_last_committed(
        &ctx,
        GetObjectLastCommitted { location: loc },
    )?;
    assert_eq!(read.stream_id(), object.stream_id());
    assert_eq!(read.total_encrypted_size, object.total_encrypted_size);
    Ok(())
}

#[test]
fn pending_objects_are_invisible_until_commit() -> Result<()> {
    let (db, ctx) = test_db()?;
    let loc = location(ProjectId::random(), "invisible");

    let stream = begin_next_version(&db, &ctx, &loc)?;
    add_inline_segments(&db, &ctx, &stream, 1, 10)?;

    let read = db.get_object_last_committed(
        &ctx,
        GetObjectLastCommitted { location: loc.clone() },
    );
    assert!(matches!(read, Err(Error::ObjectNotFound)));

    commit_pending(&db, &ctx, stream, false)?;
    assert!(db
        .get_object_last_committed(&ctx, GetObjectLastCommitted { location: loc })
        .is_ok());
    Ok(())
}

#[test]
fn unversioned_replace_deletes_the_displaced_sibling() -> Result<()> {
    let (db, ctx) = test_db()?;
    let project = ProjectId::random();
    let loc = location(project, "replaced");

    let first = commit_object_with_segments(&db, &ctx, &loc, false, 3)?;
    let second = commit_object_with_segments(&db, &ctx, &loc, false, 1)?;

    let visible = db.get_object_last_committed(
        &ctx,
        GetObjectLastCommitted { location: loc.clone() },
    )?;
    assert_eq!(visible.stream_id(), second.stream_id(), "only the replacement is visible");

    // the displaced object's segments are gone
    for index in 0..3u32 {
        let gone = db.get_segment_by_position(
            &ctx,
            GetSegmentByPosition {
                project_id: project,
                stream_id: first.stream_id(),
                position: SegmentPosition { part: 0, index },
            },
        );
        assert!(matches!(gone, Err(Error::SegmentNotFound)));
    }

    let listed = db.list_objects(
        &ctx,
        ListObjects {
            project_id: project,
            bucket_name: "bucket".into(),
            recursive: true,
            prefix: Default::default(),
            cursor: ListCursor::default(),
            limit: 10,
            pending: false,
            include_custom_metadata: false,
            include_system_metadata: true,
        },
    )?;
    assert_eq!(listed.entries.len(), 1, "one listable row after the replace");
    assert!(!listed.more);
    Ok(())
}

#[test]
fn commit_without_a_pending_object_fails() -> Result<()> {
    let (db, ctx) = test_db()?;
    let loc = location(ProjectId::random(), "missing");
    let result = commit_pending(&db, &ctx, next_version_stream(&loc), false);
    assert!(matches!(result, Err(Error::ObjectNotFound)));
    Ok(())
}

#[test]
fn commit_is_single_shot() -> Result<()> {
    let (db, ctx) = test_db()?;
    let loc = location(ProjectId::random(), "twice");
    let stream = begin_next_version(&db, &ctx, &loc)?;
    commit_pending(&db, &ctx, stream.clone(), false)?;
    let again = commit_pending(&db, &ctx, stream, false);
    assert!(matches!(again, Err(Error::ObjectNotFound)), "the pending row is consumed");
    Ok(())
}

#[test]
fn if_none_match_blocks_overwrites_of_visible_objects() -> Result<()> {
    let (db, ctx) = test_db()?;
    let loc = location(ProjectId::random(), "guarded");
    commit_object_with_segments(&db, &ctx, &loc, false, 1)?;

    let stream = begin_next_version(&db, &ctx, &loc)?;
    let blocked = db.commit_object(
        &ctx,
        CommitObject {
            stream: stream.clone(),
            versioned: false,
            if_none_match: true,
            override_user_data: None,
            encryption: None,
        },
    );
    assert!(matches!(blocked, Err(Error::ObjectAlreadyExists)));

    // without the conditional the same commit replaces the sibling
    commit_pending(&db, &ctx, stream, false)?;
    Ok(())
}

#[test]
fn irregular_segments_commit_with_zero_fixed_size() -> Result<()> {
    let (db, ctx) = test_db()?;
    let loc = location(ProjectId::random(), "irregular");
    let stream = begin_next_version(&db, &ctx, &loc)?;

    for (index, (offset, size)) in [(0i64, 100i32), (100, 60), (160, 10)].iter().enumerate() {
        db.commit_inline_segment(
            &ctx,
            umbra::CommitInlineSegment {
                stream: stream.clone(),
                position: SegmentPosition {
                    part: 0,
                    index: index as u32,
                },
                encrypted_key_nonce: bytes::Bytes::from_static(b"n"),
                encrypted_key: bytes::Bytes::from_static(b"k"),
                encrypted_etag: bytes::Bytes::new(),
                inline_data: bytes::Bytes::from(vec![1u8; *size as usize]),
                plain_offset: *offset,
                plain_size: *size,
                expires_at: None,
            },
        )?;
    }

    let object = commit_pending(&db, &ctx, stream, false)?;
    assert_eq!(object.fixed_segment_size, 0);
    assert_eq!(object.total_plain_size, 170);
    Ok(())
}

#[test]
fn committed_state_survives_a_reopen() -> Result<()> {
    use std::sync::Arc;
    use umbra::{MetaConfig, MetaDb, SqliteAdapter};

    let dir = tempfile::tempdir().map_err(umbra::Error::backend)?;
    let db_path = dir.path().join("meta.db");
    let ctx = Ctx::new();
    let project = ProjectId::random();
    let loc = location(project, "durable");

    let stream = {
        let db = MetaDb::single(Arc::new(SqliteAdapter::open(&db_path)?), MetaConfig::testing())?;
        let stream = begin_next_version(&db, &ctx, &loc)?;
        add_inline_segments(&db, &ctx, &stream, 1, 42)?;
        commit_pending(&db, &ctx, stream.clone(), false)?;
        stream
    };

    let db = MetaDb::single(Arc::new(SqliteAdapter::open(&db_path)?), MetaConfig::testing())?;
    let object = db.get_object_last_committed(
        &ctx,
        GetObjectLastCommitted { location: loc },
    )?;
    assert_eq!(object.stream_id(), stream.stream_id);
    assert_eq!(object.total_plain_size, 42);
    Ok(())
}

#[test]
fn cancelled_context_aborts_the_commit() -> Result<()> {
    let (db, _) = test_db()?;
    let loc = location(ProjectId::random(), "cancelled");
    let ctx = Ctx::new();
    let stream = begin_next_version(&db, &ctx, &loc)?;

    ctx.cancel();
    let result = commit_pending(&db, &ctx, stream.clone(), false);
    assert!(matches!(result, Err(Error::Cancelled)));

    // nothing was left behind: the pending object is still committable
    let fresh = Ctx::new();
    commit_pending(&db, &fresh, stream, false)?;
    Ok(())
}
