#![allow(missing_docs)]

mod common;

use common::*;
use time::Duration;
use umbra::types::{LockInfo, ProjectId, RetentionMode, Timestamp, Version};
use umbra::{
    DeleteObjectExactVersion, Error, GetObjectRetention, Result, SetObjectLegalHold,
    SetObjectRetention,
};

const T0: Timestamp = Timestamp(1_700_000_000_000_000_000);

fn compliance_until(until: Timestamp) -> LockInfo {
    LockInfo {
        retention_mode: RetentionMode::Compliance,
        retain_until: Some(until),
        legal_hold: false,
    }
}

fn governance_until(until: Timestamp) -> LockInfo {
    LockInfo {
        retention_mode: RetentionMode::Governance,
        retain_until: Some(until),
        legal_hold: false,
    }
}

#[test]
fn compliance_retention_blocks_deletion_until_it_expires() -> Result<()> {
    let (db, ctx, clock) = test_db_at(T0)?;
    let loc = location(ProjectId::random(), "compliance");
    let until = T0.saturating_add(Duration::hours(1));

    let stream = begin_exact_version(&db, &ctx, &loc, Version(1), compliance_until(until))?;
    add_inline_segments(&db, &ctx, &stream, 1, 16)?;
    commit_pending(&db, &ctx, stream, true)?;

    let blocked = db.delete_object_exact_version(
        &ctx,
        DeleteObjectExactVersion {
            location: loc.clone(),
            version: Version(1),
            bypass_governance: false,
        },
    );
    assert!(matches!(blocked, Err(Error::ObjectProtected)));

    let still_blocked = db.delete_object_exact_version(
        &ctx,
        DeleteObjectExactVersion {
            location: loc.clone(),
            version: Version(1),
            bypass_governance: true,
        },
    );
    assert!(matches!(still_blocked, Err(Error::ObjectProtected)), "compliance ignores bypass");

    clock.advance(Duration::hours(2));
    db.delete_object_exact_version(
        &ctx,
        DeleteObjectExactVersion {
            location: loc,
            version: Version(1),
            bypass_governance: false,
        },
    )?;
    Ok(())
}

#[test]
fn governance_retention_yields_to_the_bypass() -> Result<()> {
    let (db, ctx, _clock) = test_db_at(T0)?;
    let loc = location(ProjectId::random(), "governance");
    let until = T0.saturating_add(Duration::hours(1));

    let stream = begin_exact_version(&db, &ctx, &loc, Version(1), governance_until(until))?;
    commit_pending(&db, &ctx, stream, true)?;

    let blocked = db.delete_object_exact_version(
        &ctx,
        DeleteObjectExactVersion {
            location: loc.clone(),
            version: Version(1),
            bypass_governance: false,
        },
    );
    assert!(matches!(blocked, Err(Error::ObjectProtected)));

    db.delete_object_exact_version(
        &ctx,
        DeleteObjectExactVersion {
            location: loc,
            version: Version(1),
            bypass_governance: true,
        },
    )?;
    Ok(())
}

#[test]
fn legal_hold_blocks_deletion_regardless_of_bypass() -> Result<()> {
    let (db, ctx, _clock) = test_db_at(T0)?;
    let loc = location(ProjectId::random(), "held");
    let object = commit_object_with_segments(&db, &ctx, &loc, true, 1)?;

    db.set_object_legal_hold(
        &ctx,
        SetObjectLegalHold {
            location: loc.clone(),
            version: Some(object.version()),
            enabled: true,
        },
    )?;

    let blocked = db.delete_object_exact_version(
        &ctx,
        DeleteObjectExactVersion {
            location: loc.clone(),
            version: object.version(),
            bypass_governance: true,
        },
    );
    assert!(matches!(blocked, Err(Error::LegalHold)));

    db.set_object_legal_hold(
        &ctx,
        SetObjectLegalHold {
            location: loc.clone(),
            version: Some(object.version()),
            enabled: false,
        },
    )?;
    db.delete_object_exact_version(
        &ctx,
        DeleteObjectExactVersion {
            location: loc,
            version: object.version(),
            bypass_governance: false,
        },
    )?;
    Ok(())
}

#[test]
fn retention_is_sealed_at_commit_and_readable() -> Result<()> {
    let (db, ctx, _clock) = test_db_at(T0)?;
    let loc = location(ProjectId::random(), "sealed");
    let until = T0.saturating_add(Duration::days(30));

    let stream = begin_exact_version(&db, &ctx, &loc, Version(1), compliance_until(until))?;
    commit_pending(&db, &ctx, stream, true)?;

    let lock = db.get_object_retention(
        &ctx,
        GetObjectRetention {
            location: loc,
            version: Some(Version(1)),
        },
    )?;
    assert_eq!(lock.retention_mode, RetentionMode::Compliance);
    assert_eq!(lock.retain_until, Some(until));
    assert!(!lock.legal_hold);
    Ok(())
}

#[test]
fn compliance_retention_can_only_extend() -> Result<()> {
    let (db, ctx, _clock) = test_db_at(T0)?;
    let loc = location(ProjectId::random(), "extend-only");
    let until = T0.saturating_add(Duration::hours(1));

    let stream = begin_exact_version(&db, &ctx, &loc, Version(1), compliance_until(until))?;
    commit_pending(&db, &ctx, stream, true)?;

    let extended = T0.saturating_add(Duration::hours(3));
    db.set_object_retention(
        &ctx,
        SetObjectRetention {
            location: loc.clone(),
            version: Some(Version(1)),
            mode: RetentionMode::Compliance,
            retain_until: Some(extended),
            bypass_governance: false,
        },
    )?;

    let shortened = db.set_object_retention(
        &ctx,
        SetObjectRetention {
            location: loc.clone(),
            version: Some(Version(1)),
            mode: RetentionMode::Compliance,
            retain_until: Some(until),
            bypass_governance: true,
        },
    );
    assert!(matches!(shortened, Err(Error::ObjectProtected)));

    let cleared = db.set_object_retention(
        &ctx,
        SetObjectRetention {
            location: loc,
            version: Some(Version(1)),
            mode: RetentionMode::None,
            retain_until: None,
            bypass_governance: true,
        },
    );
    assert!(matches!(cleared, Err(Error::ObjectProtected)));
    Ok(())
}

#[test]
fn governance_retention_loosens_with_bypass_only() -> Result<()> {
    let (db, ctx, _clock) = test_db_at(T0)?;
    let loc = location(ProjectId::random(), "governed");
    let until = T0.saturating_add(Duration::hours(1));

    let stream = begin_exact_version(&db, &ctx, &loc, Version(1), governance_until(until))?;
    commit_pending(&db, &ctx, stream, true)?;

    let refused = db.set_object_retention(
        &ctx,
        SetObjectRetention {
            location: loc.clone(),
            version: Some(Version(1)),
            mode: RetentionMode::None,
            retain_until: None,
            bypass_governance: false,
        },
    );
    assert!(matches!(refused, Err(Error::ObjectProtected)));

    db.set_object_retention(
        &ctx,
        SetObjectRetention {
            location: loc,
            version: Some(Version(1)),
            mode: RetentionMode::None,
            retain_until: None,
            bypass_governance: true,
        },
    )?;
    Ok(())
}

#[test]
fn expiring_objects_cannot_be_protected() -> Result<()> {
    let (db, ctx, clock) = test_db_at(T0)?;
    let loc = location(ProjectId::random(), "expiring");

    let stream = umbra::types::ObjectStream {
        location: loc.clone(),
        version: Version(1),
        stream_id: umbra::types::StreamId::random(),
    };
    db.begin_object_exact_version(
        &ctx,
        umbra::BeginObjectExactVersion {
            stream: stream.clone(),
            encryption: test_encryption(),
            expires_at: Some(clock.now().saturating_add(Duration::days(7))),
            zombie_deletion_deadline: None,
            user_data: Default::default(),
            lock: LockInfo::default(),
        },
    )?;
    commit_pending(&db, &ctx, stream, true)?;

    let retained = db.set_object_retention(
        &ctx,
        SetObjectRetention {
            location: loc.clone(),
            version: Some(Version(1)),
            mode: RetentionMode::Compliance,
            retain_until: Some(clock.now().saturating_add(Duration::days(1))),
            bypass_governance: false,
        },
    );
    assert!(matches!(retained, Err(Error::ObjectExpiration(_))));

    let held = db.set_object_legal_hold(
        &ctx,
        SetObjectLegalHold {
            location: loc,
            version: Some(Version(1)),
            enabled: true,
        },
    );
    assert!(matches!(held, Err(Error::ObjectExpiration(_))));
    Ok(())
}

#[test]
fn begin_rejects_expiry_combined_with_lock() -> Result<()> {
    let (db, ctx, clock) = test_db_at(T0)?;
    let loc = location(ProjectId::random(), "both");

    let result = db.begin_object_exact_version(
        &ctx,
        umbra::BeginObjectExactVersion {
            stream: umbra::types::ObjectStream {
                location: loc,
                version: Version(1),
                stream_id: umbra::types::StreamId::random(),
            },
            encryption: test_encryption(),
            expires_at: Some(clock.now().saturating_add(Duration::days(1))),
            zombie_deletion_deadline: None,
            user_data: Default::default(),
            lock: compliance_until(clock.now().saturating_add(Duration::days(2))),
        },
    );
    assert!(matches!(result, Err(Error::ObjectExpiration(_))));
    Ok(())
}
