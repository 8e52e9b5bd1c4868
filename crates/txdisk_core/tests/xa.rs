//! Global transaction branches driven through the XA surface.

mod common;

use common::{boot, write_file};
use std::fs;
use tempfile::tempdir;
use txdisk_core::{EndFlag, RecoverFlag, StartFlag, TxError, Vote, XaErrorCode, Xid};

fn xid(global: &str) -> Xid {
    Xid::new(0x5458, global.as_bytes().to_vec(), b"branch-1".to_vec())
}

#[test]
fn two_phase_commit() {
    let dir = tempdir().unwrap();
    let engine = boot(dir.path());
    let xa = engine.xa_session();
    let resource = xa.xa_resource();
    let branch = xid("g-commit");

    resource.start(&branch, StartFlag::NoFlags).unwrap();
    write_file(xa.session(), "/ledger", b"entry");
    resource.end(&branch, EndFlag::Success).unwrap();

    assert_eq!(resource.prepare(&branch).unwrap(), Vote::Ok);
    assert!(!dir.path().join("data/ledger").exists());
    resource.commit(&branch, false).unwrap();
    assert_eq!(fs::read(dir.path().join("data/ledger")).unwrap(), b"entry");
    engine.shutdown();
}

#[test]
fn one_phase_commit_and_rollback() {
    let dir = tempdir().unwrap();
    let engine = boot(dir.path());
    let xa = engine.xa_session();
    let resource = xa.xa_resource();

    let kept = xid("g-one-phase");
    resource.start(&kept, StartFlag::NoFlags).unwrap();
    xa.session().create_file("/kept", false).unwrap();
    resource.end(&kept, EndFlag::Success).unwrap();
    resource.commit(&kept, true).unwrap();

    let dropped = xid("g-rollback");
    resource.start(&dropped, StartFlag::NoFlags).unwrap();
    xa.session().create_file("/dropped", false).unwrap();
    resource.end(&dropped, EndFlag::Fail).unwrap();
    resource.prepare(&dropped).unwrap();
    resource.rollback(&dropped).unwrap();

    assert!(dir.path().join("data/kept").exists());
    assert!(!dir.path().join("data/dropped").exists());
    engine.shutdown();
}

#[test]
fn read_only_branch_votes_read_only() {
    let dir = tempdir().unwrap();
    let engine = boot(dir.path());
    let xa = engine.xa_session();
    let resource = xa.xa_resource();
    let branch = xid("g-read");

    resource.start(&branch, StartFlag::NoFlags).unwrap();
    assert!(!xa.session().file_exists("/nothing", false).unwrap());
    resource.end(&branch, EndFlag::Success).unwrap();
    assert_eq!(resource.prepare(&branch).unwrap(), Vote::ReadOnly);

    // the branch is finished; there is nothing left to commit
    let err = resource.commit(&branch, false).unwrap_err();
    assert_eq!(err.code, XaErrorCode::Inval);
    assert!(resource.recover(RecoverFlag::StartEndScan).unwrap().is_empty());
    engine.shutdown();
}

#[test]
fn opening_output_stream_is_not_read_only() {
    let dir = tempdir().unwrap();
    let engine = boot(dir.path());
    let setup = engine.create_session().unwrap();
    setup.create_file("/journal", false).unwrap();
    setup.commit().unwrap();

    let xa = engine.xa_session();
    let resource = xa.xa_resource();
    let branch = xid("g-open");
    resource.start(&branch, StartFlag::NoFlags).unwrap();
    xa.session().open_output_stream("/journal", false).unwrap().close();
    resource.end(&branch, EndFlag::Success).unwrap();

    assert_eq!(resource.prepare(&branch).unwrap(), Vote::Ok);
    resource.commit(&branch, false).unwrap();
    engine.shutdown();
}

#[test]
fn protocol_violations() {
    let dir = tempdir().unwrap();
    let engine = boot(dir.path());
    let xa = engine.xa_session();
    let resource = xa.xa_resource();
    let branch = xid("g-proto");

    assert_eq!(resource.end(&branch, EndFlag::Success).unwrap_err().code, XaErrorCode::Inval);
    resource.start(&branch, StartFlag::NoFlags).unwrap();
    assert_eq!(
        resource.start(&xid("g-other"), StartFlag::NoFlags).unwrap_err().code,
        XaErrorCode::Proto
    );
    resource.end(&branch, EndFlag::Suspend).unwrap();

    assert_eq!(resource.commit(&branch, false).unwrap_err().code, XaErrorCode::Proto);
    assert_eq!(resource.start(&branch, StartFlag::NoFlags).unwrap_err().code, XaErrorCode::Inval);
    assert_eq!(resource.start(&xid("g-unknown"), StartFlag::Resume).unwrap_err().code, XaErrorCode::Inval);
    resource.start(&branch, StartFlag::Resume).unwrap();
    resource.end(&branch, EndFlag::Success).unwrap();

    assert_eq!(resource.set_transaction_timeout(-1).unwrap_err().code, XaErrorCode::Inval);
    assert!(resource.set_transaction_timeout(30).unwrap());
    assert_eq!(resource.transaction_timeout(), 30);

    resource.rollback(&branch).unwrap();
    assert_eq!(resource.rollback(&branch).unwrap_err().code, XaErrorCode::Inval);
    engine.shutdown();
}

#[test]
fn prepared_branch_survives_crash() {
    let dir = tempdir().unwrap();
    let branch = xid("g-crash");
    {
        let engine = boot(dir.path());
        let xa = engine.xa_session();
        let resource = xa.xa_resource();
        resource.start(&branch, StartFlag::NoFlags).unwrap();
        write_file(xa.session(), "/in-doubt", b"pending");
        resource.end(&branch, EndFlag::Success).unwrap();
        assert_eq!(resource.prepare(&branch).unwrap(), Vote::Ok);
        engine.halt();
    }

    let engine = boot(dir.path());
    let xa = engine.xa_session();
    let resource = xa.xa_resource();
    assert_eq!(resource.recover(RecoverFlag::StartScan).unwrap(), vec![branch.clone()]);
    assert!(resource.recover(RecoverFlag::NoFlags).unwrap().is_empty());

    // the branch still holds its exclusive lock
    let other = engine.create_session().unwrap();
    assert!(matches!(
        other.file_exists("/in-doubt", false),
        Err(TxError::LockingTimedOut(_))
    ));

    resource.commit(&branch, false).unwrap();
    assert_eq!(fs::read(dir.path().join("data/in-doubt")).unwrap(), b"pending");
    assert!(other.file_exists("/in-doubt", false).unwrap());
    other.commit().unwrap();
    engine.shutdown();

    let engine = boot(dir.path());
    assert!(engine
        .xa_session()
        .xa_resource()
        .recover(RecoverFlag::StartEndScan)
        .unwrap()
        .is_empty());
    engine.shutdown();
}

#[test]
fn unprepared_branch_is_lost_in_crash() {
    let dir = tempdir().unwrap();
    let branch = xid("g-unprepared");
    {
        let engine = boot(dir.path());
        let xa = engine.xa_session();
        xa.xa_resource().start(&branch, StartFlag::NoFlags).unwrap();
        xa.session().create_file("/never", false).unwrap();
        engine.halt();
    }

    let engine = boot(dir.path());
    let xa = engine.xa_session();
    assert!(xa.xa_resource().recover(RecoverFlag::StartEndScan).unwrap().is_empty());
    assert_eq!(xa.xa_resource().commit(&branch, false).unwrap_err().code, XaErrorCode::Inval);
    assert!(!dir.path().join("data/never").exists());
    engine.shutdown();
}

#[test]
fn same_engine_means_same_resource_manager() {
    let dir = tempdir().unwrap();
    let engine = boot(dir.path());
    let a = engine.xa_session();
    let b = engine.xa_session();
    assert!(a.xa_resource().is_same_rm(b.xa_resource()));
    engine.shutdown();
}
