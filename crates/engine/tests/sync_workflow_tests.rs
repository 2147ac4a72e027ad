//! End-to-end workflow tests: two peers synchronizing through a shared
//! mount, with no server in between.

mod common;

use common::{blob_count, read_file, seeded_bytes, write_file, TestRig};
use depot_engine::{EngineError, ExclusionLock, LockInfo, Operation, Resolution};
use std::collections::HashMap;
use time::OffsetDateTime;

fn no_resolutions() -> HashMap<String, Resolution> {
    HashMap::new()
}

#[tokio::test]
async fn test_initial_push() {
    let rig = TestRig::new();
    let workdir = rig.workdir("peer-a");
    write_file(&workdir, "a.txt", b"hello");
    write_file(&workdir, "dir/b.bin", &seeded_bytes(7, 1024 * 1024));

    let mut engine = rig.engine("peer-a").await;
    let project = engine.create_project("game").unwrap();

    let outcome = engine
        .push(project.id, &workdir, "init", None, None)
        .await
        .unwrap();
    assert_eq!(outcome.files_added, 2);
    assert_eq!(outcome.files_modified, 0);
    assert_eq!(outcome.files_deleted, 0);
    assert!(outcome.snapshot_id.is_some());

    let snapshots = engine.catalog().snapshots(project.id, None, None);
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].branch, "main");
    assert_eq!(snapshots[0].file_count, 2);
    assert_eq!(snapshots[0].created_by, "peer-a");
    assert_eq!(blob_count(&rig.mount()), 2);

    // Project last-sync stamped.
    assert!(engine
        .catalog()
        .get_project(project.id)
        .unwrap()
        .last_sync_at
        .is_some());
}

#[tokio::test]
async fn test_push_without_changes_is_idempotent() {
    let rig = TestRig::new();
    let workdir = rig.workdir("peer-a");
    write_file(&workdir, "a.txt", b"hello");

    let mut engine = rig.engine("peer-a").await;
    let project = engine.create_project("game").unwrap();
    let first = engine
        .push(project.id, &workdir, "init", None, None)
        .await
        .unwrap();
    assert!(first.snapshot_id.is_some());

    let second = engine
        .push(project.id, &workdir, "again", None, None)
        .await
        .unwrap();
    assert_eq!(second.files_added, 0);
    assert_eq!(second.files_modified, 0);
    assert_eq!(second.files_deleted, 0);
    assert!(second.snapshot_id.is_none());
    assert_eq!(engine.catalog().snapshots(project.id, None, None).len(), 1);
}

#[tokio::test]
async fn test_pull_to_empty_peer_replicates_tree() {
    let rig = TestRig::new();
    let a_dir = rig.workdir("peer-a");
    let payload = seeded_bytes(21, 256 * 1024);
    write_file(&a_dir, "a.txt", b"hello");
    write_file(&a_dir, "dir/b.bin", &payload);

    let mut a = rig.engine("peer-a").await;
    let project = a.create_project("game").unwrap();
    a.push(project.id, &a_dir, "init", None, None).await.unwrap();

    let b_dir = rig.workdir("peer-b");
    let mut b = rig.engine("peer-b").await;
    let outcome = b
        .pull(project.id, &b_dir, None, &no_resolutions(), None, None)
        .await
        .unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.files_downloaded, 2);
    assert_eq!(outcome.files_deleted, 0);
    assert!(outcome.conflicts.is_empty());
    assert!(outcome.failures.is_empty());

    assert_eq!(read_file(&b_dir, "a.txt"), b"hello");
    assert_eq!(read_file(&b_dir, "dir/b.bin"), payload);

    // B's view is now clean against the head.
    let status = b.status(project.id, &b_dir, None).await.unwrap();
    assert!(status.added.is_empty());
    assert!(status.modified.is_empty());
    assert!(status.deleted.is_empty());
    assert_eq!(status.unchanged, 2);
}

#[tokio::test]
async fn test_pull_deletes_files_absent_from_head() {
    let rig = TestRig::new();
    let a_dir = rig.workdir("peer-a");
    write_file(&a_dir, "keep.txt", b"keep");
    write_file(&a_dir, "drop/old.txt", b"old");

    let mut a = rig.engine("peer-a").await;
    let project = a.create_project("game").unwrap();
    a.push(project.id, &a_dir, "one", None, None).await.unwrap();

    let b_dir = rig.workdir("peer-b");
    let mut b = rig.engine("peer-b").await;
    b.pull(project.id, &b_dir, None, &no_resolutions(), None, None)
        .await
        .unwrap();

    std::fs::remove_file(a_dir.join("drop/old.txt")).unwrap();
    a.push(project.id, &a_dir, "two", None, None).await.unwrap();

    let outcome = b
        .pull(project.id, &b_dir, None, &no_resolutions(), None, None)
        .await
        .unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.files_deleted, 1);
    assert!(!b_dir.join("drop/old.txt").exists());
    // The emptied directory is not kept around.
    assert!(!b_dir.join("drop").exists());
    assert_eq!(read_file(&b_dir, "keep.txt"), b"keep");
}

#[tokio::test]
async fn test_conflict_detection_and_keep_both() {
    let rig = TestRig::new();
    let a_dir = rig.workdir("peer-a");
    write_file(&a_dir, "a.txt", b"original");

    let mut a = rig.engine("peer-a").await;
    let project = a.create_project("game").unwrap();
    a.push(project.id, &a_dir, "init", None, None).await.unwrap();

    let b_dir = rig.workdir("peer-b");
    let mut b = rig.engine("peer-b").await;
    b.pull(project.id, &b_dir, None, &no_resolutions(), None, None)
        .await
        .unwrap();

    // A publishes a new version.
    write_file(&a_dir, "a.txt", b"from A");
    a.push(project.id, &a_dir, "update", None, None).await.unwrap();

    // B edits the same path afterwards, so B's mtime is strictly newer
    // than the mtime recorded in A's snapshot.
    std::thread::sleep(std::time::Duration::from_millis(1100));
    write_file(&b_dir, "a.txt", b"from B");

    // First pull: conflict reported, nothing touched.
    let outcome = b
        .pull(project.id, &b_dir, None, &no_resolutions(), None, None)
        .await
        .unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.files_downloaded, 0);
    assert_eq!(outcome.conflicts.len(), 1);
    assert_eq!(outcome.conflicts[0].path, "a.txt");
    assert_eq!(read_file(&b_dir, "a.txt"), b"from B");

    // Second pull with keep_both: local copy renamed, remote fetched.
    let resolutions: HashMap<String, Resolution> =
        [("a.txt".to_string(), Resolution::KeepBoth)].into();
    let outcome = b
        .pull(project.id, &b_dir, None, &resolutions, None, None)
        .await
        .unwrap();
    assert!(outcome.success);
    assert_eq!(read_file(&b_dir, "a.txt"), b"from A");
    assert_eq!(read_file(&b_dir, "a.local.txt"), b"from B");
}

#[tokio::test]
async fn test_older_local_change_loses_silently() {
    let rig = TestRig::new();
    let a_dir = rig.workdir("peer-a");
    let b_dir = rig.workdir("peer-b");

    let mut a = rig.engine("peer-a").await;
    let project = a.create_project("game").unwrap();

    // B writes first; A's snapshot carries a newer mtime.
    write_file(&b_dir, "a.txt", b"stale local");
    std::thread::sleep(std::time::Duration::from_millis(1100));
    write_file(&a_dir, "a.txt", b"newer remote");
    a.push(project.id, &a_dir, "init", None, None).await.unwrap();

    let mut b = rig.engine("peer-b").await;
    let outcome = b
        .pull(project.id, &b_dir, None, &no_resolutions(), None, None)
        .await
        .unwrap();
    assert!(outcome.success);
    assert!(outcome.conflicts.is_empty());
    assert_eq!(read_file(&b_dir, "a.txt"), b"newer remote");
}

#[tokio::test]
async fn test_selective_pull_skips_everything_else() {
    let rig = TestRig::new();
    let a_dir = rig.workdir("peer-a");
    write_file(&a_dir, "Content/x.uasset", &seeded_bytes(3, 4096));
    write_file(&a_dir, "Source/y.cpp", b"int main() {}");
    write_file(&a_dir, "Saved/z.log", b"log line");

    let mut a = rig.engine("peer-a").await;
    let project = a.create_project("game").unwrap();
    a.push(project.id, &a_dir, "init", None, None).await.unwrap();

    let b_dir = rig.workdir("peer-b");
    write_file(&b_dir, "Other/k.txt", b"local only");

    let include = vec!["Content/**".to_string()];
    let mut b = rig.engine("peer-b").await;
    let outcome = b
        .pull(
            project.id,
            &b_dir,
            None,
            &no_resolutions(),
            None,
            Some(&include),
        )
        .await
        .unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.files_downloaded, 1);
    assert_eq!(outcome.files_deleted, 0);

    assert!(b_dir.join("Content/x.uasset").exists());
    assert!(!b_dir.join("Source/y.cpp").exists());
    assert!(!b_dir.join("Saved/z.log").exists());
    // Non-matching local files stay, even though the head lacks them.
    assert_eq!(read_file(&b_dir, "Other/k.txt"), b"local only");
}

#[tokio::test]
async fn test_restore_overwrites_without_conflict_check() {
    let rig = TestRig::new();
    let a_dir = rig.workdir("peer-a");
    write_file(&a_dir, "a.txt", b"v1");

    let mut a = rig.engine("peer-a").await;
    let project = a.create_project("game").unwrap();
    let first = a
        .push(project.id, &a_dir, "v1", None, None)
        .await
        .unwrap()
        .snapshot_id
        .unwrap();

    write_file(&a_dir, "a.txt", b"v2");
    write_file(&a_dir, "extra.txt", b"only in v2");
    a.push(project.id, &a_dir, "v2", None, None).await.unwrap();

    // Local edit newer than everything; restore overwrites regardless.
    std::thread::sleep(std::time::Duration::from_millis(1100));
    write_file(&a_dir, "a.txt", b"dirty local edit");

    let outcome = a
        .restore(project.id, &a_dir, first, None, None)
        .await
        .unwrap();
    assert_eq!(outcome.files_downloaded, 1);
    assert_eq!(outcome.files_deleted, 1);
    assert_eq!(read_file(&a_dir, "a.txt"), b"v1");
    assert!(!a_dir.join("extra.txt").exists());
}

#[tokio::test]
async fn test_gc_removes_only_unreferenced_blobs() {
    let rig = TestRig::new();
    let a_dir = rig.workdir("peer-a");
    write_file(&a_dir, "a.txt", b"hello");
    write_file(&a_dir, "dir/b.bin", &seeded_bytes(9, 64 * 1024));

    let mut a = rig.engine("peer-a").await;
    let project = a.create_project("game").unwrap();
    let first = a
        .push(project.id, &a_dir, "init", None, None)
        .await
        .unwrap()
        .snapshot_id
        .unwrap();

    std::fs::remove_file(a_dir.join("dir/b.bin")).unwrap();
    a.push(project.id, &a_dir, "drop b", None, None).await.unwrap();
    assert_eq!(blob_count(&rig.mount()), 2);

    // Still referenced by the first snapshot: gc must keep everything.
    let outcome = a.gc().await.unwrap();
    assert_eq!(outcome.blobs_removed, 0);
    assert_eq!(blob_count(&rig.mount()), 2);

    a.delete_snapshot(first).unwrap();
    let outcome = a.gc().await.unwrap();
    assert_eq!(outcome.blobs_removed, 1);
    assert!(outcome.bytes_freed > 0);
    assert_eq!(blob_count(&rig.mount()), 1);

    // The surviving blob still restores.
    let b_dir = rig.workdir("peer-b");
    let mut b = rig.engine("peer-b").await;
    let pulled = b
        .pull(project.id, &b_dir, None, &no_resolutions(), None, None)
        .await
        .unwrap();
    assert!(pulled.success);
    assert_eq!(read_file(&b_dir, "a.txt"), b"hello");
}

#[tokio::test]
async fn test_push_blocked_while_lock_held() {
    let rig = TestRig::new();
    let a_dir = rig.workdir("peer-a");
    write_file(&a_dir, "a.txt", b"data");

    let mut a = rig.engine("peer-a").await;
    let project = a.create_project("game").unwrap();

    let held = ExclusionLock::acquire(&rig.mount(), "peer-b", Operation::Gc)
        .await
        .unwrap();

    let result = a.push(project.id, &a_dir, "blocked", None, None).await;
    match result {
        Err(EngineError::LockBusy { machine, operation }) => {
            assert_eq!(machine, "peer-b");
            assert_eq!(operation, "gc");
        }
        other => panic!("expected LockBusy, got {other:?}"),
    }
    held.release();

    // Lock free again: the same push goes through.
    let outcome = a.push(project.id, &a_dir, "retry", None, None).await.unwrap();
    assert_eq!(outcome.files_added, 1);
}

#[tokio::test]
async fn test_crashed_peer_lock_is_reclaimed() {
    let rig = TestRig::new();
    let a_dir = rig.workdir("peer-a");
    write_file(&a_dir, "a.txt", b"data");

    let mut a = rig.engine("peer-a").await;
    let project = a.create_project("game").unwrap();

    // Simulated crash mid-push: blobs uploaded, no snapshot written,
    // sentinel and info left behind with an expired timestamp.
    std::fs::write(rig.mount().join("sync.lock"), b"").unwrap();
    let info = LockInfo {
        machine_name: "crashed-peer".to_string(),
        locked_at: OffsetDateTime::now_utc() - time::Duration::minutes(6),
        operation: Operation::Push,
    };
    std::fs::write(
        rig.mount().join("sync.lock.info"),
        serde_json::to_vec(&info).unwrap(),
    )
    .unwrap();

    let outcome = a.push(project.id, &a_dir, "recovered", None, None).await.unwrap();
    assert_eq!(outcome.files_added, 1);

    // No partial history: exactly the one snapshot this push wrote.
    assert_eq!(a.catalog().snapshots(project.id, None, None).len(), 1);
    assert!(ExclusionLock::holder(&rig.mount()).is_none());
}

#[tokio::test]
async fn test_branches_are_independent() {
    let rig = TestRig::new();
    let a_dir = rig.workdir("peer-a");
    write_file(&a_dir, "a.txt", b"main line");

    let mut a = rig.engine("peer-a").await;
    let project = a.create_project("game").unwrap();
    a.push(project.id, &a_dir, "main 1", None, None).await.unwrap();

    write_file(&a_dir, "a.txt", b"experiment");
    a.push(project.id, &a_dir, "exp 1", Some("experiment"), None)
        .await
        .unwrap();

    // Pulling main ignores the experiment branch head.
    let b_dir = rig.workdir("peer-b");
    let mut b = rig.engine("peer-b").await;
    b.pull(project.id, &b_dir, Some("main"), &no_resolutions(), None, None)
        .await
        .unwrap();
    assert_eq!(read_file(&b_dir, "a.txt"), b"main line");

    b.pull(
        project.id,
        &b_dir,
        Some("experiment"),
        &no_resolutions(),
        None,
        None,
    )
    .await
    .unwrap();
    assert_eq!(read_file(&b_dir, "a.txt"), b"experiment");
}
