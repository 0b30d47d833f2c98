#![allow(missing_docs)]

mod common;

use std::sync::Arc;

use common::*;
use umbra::types::{NodeAlias, ProjectId, SegmentPosition};
use umbra::{
    Adapter, GetSegmentByPosition, MetaConfig, MetaDb, Result, Router, SqliteAdapter,
};

#[test]
fn ensure_node_aliases_is_idempotent_and_dense() -> Result<()> {
    let (db, ctx) = test_db()?;

    let nodes = [node(1), node(2), node(3), node(2)];
    let first = db.ensure_node_aliases(&ctx, &nodes)?;
    assert_eq!(first, vec![NodeAlias(1), NodeAlias(2), NodeAlias(3), NodeAlias(2)]);

    let second = db.ensure_node_aliases(&ctx, &nodes)?;
    assert_eq!(first, second, "running twice yields the same mapping");

    let more = db.ensure_node_aliases(&ctx, &[node(9), node(1)])?;
    assert_eq!(more, vec![NodeAlias(4), NodeAlias(1)], "new nodes extend the dense range");
    Ok(())
}

#[test]
fn warm_cache_serves_known_pairs() -> Result<()> {
    let (db, ctx) = test_db()?;
    db.ensure_node_aliases(&ctx, &[node(1), node(2)])?;
    let warmed = db.warm_alias_cache(&ctx)?;
    assert_eq!(warmed, 2);
    Ok(())
}

#[test]
fn pinned_projects_mirror_authoritative_aliases() -> Result<()> {
    let ctx = umbra::Ctx::new();
    let primary = Arc::new(SqliteAdapter::open_in_memory()?);
    let secondary = Arc::new(SqliteAdapter::open_in_memory()?.with_class("sqlite-b"));
    let pinned_project = ProjectId::random();

    let router = Router::new(
        vec![
            primary.clone() as Arc<dyn Adapter>,
            secondary.clone() as Arc<dyn Adapter>,
        ],
        &[(pinned_project, "sqlite-b")],
    )?;
    let db = MetaDb::new(router, MetaConfig::testing());

    // seed the authoritative numbering with unrelated nodes
    db.ensure_node_aliases(&ctx, &[node(100), node(101), node(102)])?;

    // a segment commit for the pinned project mirrors its aliases
    let loc = location(pinned_project, "mirrored");
    let stream = begin_next_version(&db, &ctx, &loc)?;
    db.commit_segment(
        &ctx,
        remote_segment_request(&stream, SegmentPosition { part: 0, index: 0 }, 5, 0, 256),
    )?;
    commit_pending(&db, &ctx, stream.clone(), false)?;

    // the aliases resolve on the back end that stores the segment
    let segment = db.get_segment_by_position(
        &ctx,
        GetSegmentByPosition {
            project_id: pinned_project,
            stream_id: stream.stream_id,
            position: SegmentPosition { part: 0, index: 0 },
        },
    )?;
    assert_eq!(segment.pieces.len(), 5);
    assert!(
        segment
            .alias_pieces
            .0
            .iter()
            .all(|piece| piece.alias >= NodeAlias(4)),
        "mirrored aliases keep the authoritative numbering"
    );

    // and the pinned back end's table holds exactly those pairs
    let mirrored = secondary.as_ref();
    let pairs = umbra::Adapter::scan_node_aliases(mirrored, &ctx)?;
    assert_eq!(pairs.len(), 5, "only the referenced aliases were mirrored");
    Ok(())
}

#[test]
fn aliases_survive_piece_storage_round_trips() -> Result<()> {
    let (db, ctx) = test_db()?;
    let project = ProjectId::random();
    let loc = location(project, "round-trip");
    let stream = begin_next_version(&db, &ctx, &loc)?;

    let request = remote_segment_request(&stream, SegmentPosition { part: 0, index: 0 }, 10, 0, 512);
    let sent = request.pieces.clone();
    db.commit_segment(&ctx, request)?;
    commit_pending(&db, &ctx, stream.clone(), false)?;

    let segment = db.get_segment_by_position(
        &ctx,
        GetSegmentByPosition {
            project_id: project,
            stream_id: stream.stream_id,
            position: SegmentPosition { part: 0, index: 0 },
        },
    )?;
    assert_eq!(segment.pieces, sent);
    assert_eq!(segment.alias_pieces.len(), 10);
    Ok(())
}
