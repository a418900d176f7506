use std::fs;
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;

use terra_dm::error::TerraError;
use terra_dm::lock::{FileLock, LockOptions};

fn quick() -> LockOptions {
    LockOptions {
        attempts: 3,
        interval: Duration::from_millis(5),
        stale_after: Duration::from_secs(3600),
    }
}

#[test]
fn second_holder_times_out_until_release() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("terra-dm.json");

    let held = FileLock::acquire(&target, quick()).unwrap();
    assert_eq!(held.path(), dir.path().join("terra-dm.json.lock"));
    assert!(held.path().exists());
    assert_matches!(FileLock::acquire(&target, quick()), Err(TerraError::LockTimeout(_)));

    drop(held);
    assert!(!dir.path().join("terra-dm.json.lock").exists());
    assert!(FileLock::acquire(&target, quick()).is_ok());
}

#[test]
fn waiter_gets_the_lock_after_holder_finishes() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("catalog");
    let held = FileLock::acquire(&target, quick()).unwrap();

    let waiter_target = target.clone();
    let waiter = thread::spawn(move || {
        let patient = LockOptions {
            attempts: 200,
            interval: Duration::from_millis(10),
            stale_after: Duration::from_secs(3600),
        };
        FileLock::acquire(&waiter_target, patient).map(|_| ())
    });
    thread::sleep(Duration::from_millis(50));
    drop(held);
    assert!(waiter.join().unwrap().is_ok());
}

#[test]
fn stale_lock_is_broken() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("gedi");
    fs::write(FileLock::lock_path_for(&target), "12345\n").unwrap();
    thread::sleep(Duration::from_millis(20));

    let options = LockOptions {
        stale_after: Duration::from_millis(1),
        ..quick()
    };
    assert!(FileLock::acquire(&target, options).is_ok());
}
