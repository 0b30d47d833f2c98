#![allow(missing_docs)]

mod common;

use common::*;
use umbra::types::{ProjectId, Version};
use umbra::{
    IteratePendingObjectsByKey, ListCursor, ListObjects, ListObjectsResult, MetaDb, Result,
};

fn list(
    db: &MetaDb,
    ctx: &umbra::Ctx,
    project: ProjectId,
    prefix: &str,
    cursor: (&str, i64),
    limit: usize,
    recursive: bool,
) -> Result<ListObjectsResult> {
    db.list_objects(
        ctx,
        ListObjects {
            project_id: project,
            bucket_name: "bucket".into(),
            recursive,
            prefix: prefix.into(),
            cursor: ListCursor {
                key: cursor.0.into(),
                version: Version(cursor.1),
            },
            limit,
            pending: false,
            include_custom_metadata: false,
            include_system_metadata: true,
        },
    )
}

fn seed_prefix_keys(db: &MetaDb, ctx: &umbra::Ctx) -> Result<ProjectId> {
    let project = ProjectId::random();
    for key in ["a", "b/1", "b/2", "c", "c/", "c//", "c/1", "g"] {
        commit_object_with_segments(db, ctx, &location(project, key), false, 0)?;
    }
    Ok(project)
}

#[test]
fn prefix_collapse_from_an_empty_cursor() -> Result<()> {
    let (db, ctx) = test_db()?;
    let project = seed_prefix_keys(&db, &ctx)?;

    let result = list(&db, &ctx, project, "", ("", 0), 10, false)?;
    assert_eq!(
        keys_of(&result),
        vec![
            ("a".to_string(), false),
            ("b/".to_string(), true),
            ("c".to_string(), false),
            ("c/".to_string(), true),
            ("g".to_string(), false),
        ]
    );
    assert!(!result.more);
    Ok(())
}

#[test]
fn listing_resumes_cleanly_after_a_prefix_rollup() -> Result<()> {
    let (db, ctx) = test_db()?;
    let project = seed_prefix_keys(&db, &ctx)?;

    let result = list(&db, &ctx, project, "", ("c/", 0), 10, false)?;
    assert_eq!(keys_of(&result), vec![("g".to_string(), false)]);
    Ok(())
}

#[test]
fn prefixed_listing_strips_the_prefix() -> Result<()> {
    let (db, ctx) = test_db()?;
    let project = seed_prefix_keys(&db, &ctx)?;

    let result = list(&db, &ctx, project, "c/", ("", 0), 10, false)?;
    assert_eq!(
        keys_of(&result),
        vec![
            (String::new(), false),
            ("/".to_string(), true),
            ("1".to_string(), false),
        ],
        "the object at the prefix itself, the nested prefix, and the plain key"
    );
    Ok(())
}

#[test]
fn recursive_listing_returns_every_key() -> Result<()> {
    let (db, ctx) = test_db()?;
    let project = seed_prefix_keys(&db, &ctx)?;

    let result = list(&db, &ctx, project, "", ("", 0), 20, true)?;
    let keys: Vec<String> = keys_of(&result).into_iter().map(|(key, _)| key).collect();
    assert_eq!(keys, vec!["a", "b/1", "b/2", "c", "c/", "c//", "c/1", "g"]);
    assert!(keys_of(&result).iter().all(|(_, is_prefix)| !is_prefix));
    Ok(())
}

#[test]
fn limit_is_exact_and_more_is_set() -> Result<()> {
    let (db, ctx) = test_db()?;
    let project = seed_prefix_keys(&db, &ctx)?;

    let result = list(&db, &ctx, project, "", ("", 0), 3, false)?;
    assert_eq!(
        keys_of(&result),
        vec![
            ("a".to_string(), false),
            ("b/".to_string(), true),
            ("c".to_string(), false),
        ]
    );
    assert!(result.more, "two entries remain");

    let exact = list(&db, &ctx, project, "", ("", 0), 5, false)?;
    assert_eq!(exact.entries.len(), 5);
    assert!(!exact.more);
    Ok(())
}

#[test]
fn any_cursor_listing_is_a_strict_suffix() -> Result<()> {
    let (db, ctx) = test_db()?;
    let project = seed_prefix_keys(&db, &ctx)?;

    let full = list(&db, &ctx, project, "", ("", 0), 20, false)?;
    for (i, entry) in full.entries.iter().enumerate() {
        let key = String::from_utf8_lossy(entry.object_key.as_bytes()).into_owned();
        let resumed = list(&db, &ctx, project, "", (&key, entry.version.0), 20, false)?;
        assert_eq!(
            keys_of(&resumed),
            keys_of(&full)[i + 1..].to_vec(),
            "cursor at {key:?}"
        );
    }
    Ok(())
}

#[test]
fn versions_list_newest_first_within_a_key() -> Result<()> {
    let (db, ctx) = test_db()?;
    let project = ProjectId::random();
    let loc = location(project, "versioned-key");
    for _ in 0..3 {
        commit_object_with_segments(&db, &ctx, &loc, true, 0)?;
    }

    let result = list(&db, &ctx, project, "", ("", 0), 10, true)?;
    let versions: Vec<i64> = result.entries.iter().map(|entry| entry.version.0).collect();
    assert_eq!(versions, vec![3, 2, 1]);

    // a mid-key cursor resumes with the older versions
    let resumed = list(&db, &ctx, project, "", ("versioned-key", 3), 10, true)?;
    let versions: Vec<i64> = resumed.entries.iter().map(|entry| entry.version.0).collect();
    assert_eq!(versions, vec![2, 1]);
    Ok(())
}

#[test]
fn pending_listing_sees_only_pending_objects() -> Result<()> {
    let (db, ctx) = test_db()?;
    let project = ProjectId::random();
    commit_object_with_segments(&db, &ctx, &location(project, "done"), false, 0)?;
    begin_next_version(&db, &ctx, &location(project, "in-flight"))?;

    let pending = db.list_objects(
        &ctx,
        ListObjects {
            project_id: project,
            bucket_name: "bucket".into(),
            recursive: true,
            prefix: Default::default(),
            cursor: ListCursor::default(),
            limit: 10,
            pending: true,
            include_custom_metadata: false,
            include_system_metadata: true,
        },
    )?;
    let keys: Vec<String> = keys_of(&pending).into_iter().map(|(key, _)| key).collect();
    assert_eq!(keys, vec!["in-flight"]);
    Ok(())
}

#[test]
fn expired_objects_vanish_from_listing_and_reads() -> Result<()> {
    use time::Duration;
    use umbra::types::Timestamp;

    let (db, ctx, clock) = test_db_at(Timestamp(1_700_000_000_000_000_000))?;
    let project = ProjectId::random();
    let loc = location(project, "short-lived");

    let stream = umbra::types::ObjectStream {
        location: loc.clone(),
        version: Version::ZERO,
        stream_id: umbra::types::StreamId::random(),
    };
    db.begin_object_next_version(
        &ctx,
        umbra::BeginObjectNextVersion {
            stream: stream.clone(),
            encryption: test_encryption(),
            expires_at: Some(clock.now().saturating_add(Duration::hours(1))),
            zombie_deletion_deadline: None,
            user_data: Default::default(),
            lock: Default::default(),
        },
    )?;
    commit_pending(&db, &ctx, stream, false)?;

    assert_eq!(list(&db, &ctx, project, "", ("", 0), 10, true)?.entries.len(), 1);
    db.get_object_last_committed(
        &ctx,
        umbra::GetObjectLastCommitted { location: loc.clone() },
    )?;

    clock.advance(Duration::hours(2));
    assert!(
        list(&db, &ctx, project, "", ("", 0), 10, true)?.entries.is_empty(),
        "expired rows are filtered"
    );
    let gone = db.get_object_last_committed(&ctx, umbra::GetObjectLastCommitted { location: loc });
    assert!(matches!(gone, Err(umbra::Error::ObjectNotFound)));
    Ok(())
}

#[test]
fn pending_objects_at_one_key_are_iterable() -> Result<()> {
    let (db, ctx) = test_db()?;
    let project = ProjectId::random();
    let loc = location(project, "multipart");
    let first = begin_next_version(&db, &ctx, &loc)?;
    let second = begin_next_version(&db, &ctx, &loc)?;

    let page = db.iterate_pending_objects_by_key(
        &ctx,
        IteratePendingObjectsByKey {
            location: loc,
            cursor: None,
            limit: 10,
        },
    )?;
    assert_eq!(page.objects.len(), 2);
    assert!(!page.more);
    let streams: Vec<_> = page.objects.iter().map(|object| object.stream_id()).collect();
    assert!(streams.contains(&first.stream_id));
    assert!(streams.contains(&second.stream_id));
    Ok(())
}
