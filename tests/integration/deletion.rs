#![allow(missing_docs)]

mod common;

use common::*;
use umbra::types::{ObjectStatus, ProjectId, SegmentPosition, StreamId, StreamVersionId, Version};
use umbra::{
    DeleteObjectExactVersion, DeleteObjectLastCommitted, DeleteObjects, DeleteObjectsItem,
    DeleteObjectsStatus, Error, GetObjectLastCommitted, GetSegmentByPosition, Result,
};

#[test]
fn exact_version_delete_removes_object_and_segments() -> Result<()> {
    let (db, ctx) = test_db()?;
    let project = ProjectId::random();
    let loc = location(project, "victim");
    let object = commit_object_with_segments(&db, &ctx, &loc, true, 2)?;

    let result = db.delete_object_exact_version(
        &ctx,
        DeleteObjectExactVersion {
            location: loc.clone(),
            version: object.version(),
            bypass_governance: false,
        },
    )?;
    assert_eq!(result.segments_deleted, 2);
    assert_eq!(
        result.removed.expect("the row is reported").stream_id(),
        object.stream_id()
    );

    let gone = db.get_segment_by_position(
        &ctx,
        GetSegmentByPosition {
            project_id: project,
            stream_id: object.stream_id(),
            position: SegmentPosition { part: 0, index: 0 },
        },
    );
    assert!(matches!(gone, Err(Error::SegmentNotFound)));

    let absent = db.delete_object_exact_version(
        &ctx,
        DeleteObjectExactVersion {
            location: loc,
            version: object.version(),
            bypass_governance: false,
        },
    );
    assert!(matches!(absent, Err(Error::ObjectNotFound)), "idempotent retries observe absence");
    Ok(())
}

#[test]
fn plain_last_committed_delete_removes_the_row() -> Result<()> {
    let (db, ctx) = test_db()?;
    let loc = location(ProjectId::random(), "plain");
    commit_object_with_segments(&db, &ctx, &loc, false, 1)?;

    let result = db.delete_object_last_committed(
        &ctx,
        DeleteObjectLastCommitted {
            location: loc.clone(),
            versioned: false,
            suspended: false,
            bypass_governance: false,
        },
    )?;
    assert!(result.marker.is_none(), "plain buckets get no tombstones");
    assert_eq!(result.segments_deleted, 1);

    let absent = db.get_object_last_committed(&ctx, GetObjectLastCommitted { location: loc });
    assert!(matches!(absent, Err(Error::ObjectNotFound)));
    Ok(())
}

#[test]
fn suspended_delete_replaces_the_unversioned_row_with_a_marker() -> Result<()> {
    let (db, ctx) = test_db()?;
    let project = ProjectId::random();
    let loc = location(project, "suspended");
    let object = commit_object_with_segments(&db, &ctx, &loc, false, 2)?;

    let result = db.delete_object_last_committed(
        &ctx,
        DeleteObjectLastCommitted {
            location: loc.clone(),
            versioned: false,
            suspended: true,
            bypass_governance: false,
        },
    )?;
    let marker = result.marker.expect("an unversioned marker is inserted");
    assert_eq!(marker.status, ObjectStatus::DeleteMarkerUnversioned);
    assert_eq!(marker.stream_id(), StreamId::ZERO);
    assert_eq!(
        result.removed.expect("the old row is removed").stream_id(),
        object.stream_id()
    );
    assert_eq!(result.segments_deleted, 2);

    // the singleton holds: a second suspended delete replaces the marker
    let again = db.delete_object_last_committed(
        &ctx,
        DeleteObjectLastCommitted {
            location: loc,
            versioned: false,
            suspended: true,
            bypass_governance: false,
        },
    )?;
    let removed = again.removed.expect("the first marker is displaced");
    assert_eq!(removed.status, ObjectStatus::DeleteMarkerUnversioned);
    assert_eq!(again.segments_deleted, 0, "markers carry no segments");
    Ok(())
}

#[test]
fn pending_uploads_can_be_dropped_by_their_owner() -> Result<()> {
    let (db, ctx) = test_db()?;
    let loc = location(ProjectId::random(), "abandoned");
    let stream = begin_next_version(&db, &ctx, &loc)?;
    add_inline_segments(&db, &ctx, &stream, 3, 8)?;

    let result = db.delete_pending_object(
        &ctx,
        umbra::DeletePendingObject { stream: stream.clone() },
    )?;
    assert_eq!(result.segments_deleted, 3);

    let gone = commit_pending(&db, &ctx, stream, false);
    assert!(matches!(gone, Err(Error::ObjectNotFound)));
    Ok(())
}

#[test]
fn bulk_delete_reports_each_item_independently() -> Result<()> {
    let (db, ctx) = test_db()?;
    let project = ProjectId::random();

    let present = location(project, "bulk-present");
    let object = commit_object_with_segments(&db, &ctx, &present, false, 1)?;

    let results = db.delete_objects(
        &ctx,
        DeleteObjects {
            project_id: project,
            bucket_name: "bucket".into(),
            items: vec![
                DeleteObjectsItem {
                    object_key: key("bulk-present"),
                    stream_version_id: None,
                },
                DeleteObjectsItem {
                    object_key: key("bulk-absent"),
                    stream_version_id: None,
                },
            ],
            versioned: false,
            suspended: false,
            bypass_governance: false,
        },
    )?;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].status, DeleteObjectsStatus::Deleted);
    assert_eq!(
        results[0].removed.as_ref().expect("removed row").stream_id(),
        object.stream_id()
    );
    assert_eq!(results[1].status, DeleteObjectsStatus::NotFound);
    Ok(())
}

#[test]
fn versioned_bulk_delete_tombstones_even_absent_keys() -> Result<()> {
    let (db, ctx) = test_db()?;
    let project = ProjectId::random();

    let results = db.delete_objects(
        &ctx,
        DeleteObjects {
            project_id: project,
            bucket_name: "bucket".into(),
            items: vec![DeleteObjectsItem {
                object_key: key("never-existed"),
                stream_version_id: None,
            }],
            versioned: true,
            suspended: false,
            bypass_governance: false,
        },
    )?;
    assert_eq!(results[0].status, DeleteObjectsStatus::Deleted);
    let marker = results[0].marker.as_ref().expect("marker for the absent key");
    assert_eq!(marker.version(), Version(1));
    assert_eq!(marker.status, ObjectStatus::DeleteMarkerVersioned);
    Ok(())
}

#[test]
fn bulk_delete_checks_the_stream_suffix() -> Result<()> {
    let (db, ctx) = test_db()?;
    let project = ProjectId::random();
    let loc = location(project, "suffixed");
    let object = commit_object_with_segments(&db, &ctx, &loc, true, 1)?;

    let wrong = StreamVersionId {
        version: object.version(),
        stream_suffix: [0xee; 8],
    };
    let right = object.stream_version_id();

    let results = db.delete_objects(
        &ctx,
        DeleteObjects {
            project_id: project,
            bucket_name: "bucket".into(),
            items: vec![
                DeleteObjectsItem {
                    object_key: key("suffixed"),
                    stream_version_id: Some(wrong),
                },
                DeleteObjectsItem {
                    object_key: key("suffixed"),
                    stream_version_id: Some(right),
                },
            ],
            versioned: true,
            suspended: false,
            bypass_governance: false,
        },
    )?;
    assert_eq!(results[0].status, DeleteObjectsStatus::NotFound, "suffix mismatch");
    assert_eq!(results[1].status, DeleteObjectsStatus::Deleted);
    Ok(())
}

#[test]
fn bulk_delete_enforces_the_item_limit() -> Result<()> {
    let (db, ctx) = test_db()?;
    let items: Vec<DeleteObjectsItem> = (0..1001)
        .map(|i| DeleteObjectsItem {
            object_key: key(&format!("item-{i}")),
            stream_version_id: None,
        })
        .collect();
    let result = db.delete_objects(
        &ctx,
        DeleteObjects {
            project_id: ProjectId::random(),
            bucket_name: "bucket".into(),
            items,
            versioned: false,
            suspended: false,
            bypass_governance: false,
        },
    );
    assert!(matches!(result, Err(Error::InvalidRequest(_))));
    Ok(())
}

#[test]
fn deleting_a_marker_by_exact_version_removes_it() -> Result<()> {
    let (db, ctx) = test_db()?;
    let loc = location(ProjectId::random(), "marker-removal");
    commit_object_with_segments(&db, &ctx, &loc, true, 0)?;

    let marker = db
        .delete_object_last_committed(
            &ctx,
            DeleteObjectLastCommitted {
                location: loc.clone(),
                versioned: true,
                suspended: false,
                bypass_governance: false,
            },
        )?
        .marker
        .expect("marker");

    let result = db.delete_object_exact_version(
        &ctx,
        DeleteObjectExactVersion {
            location: loc.clone(),
            version: marker.version(),
            bypass_governance: false,
        },
    )?;
    assert_eq!(result.segments_deleted, 0);

    // with the marker gone the object is the last committed again
    db.get_object_last_committed(&ctx, GetObjectLastCommitted { location: loc })?;
    Ok(())
}
