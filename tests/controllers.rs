use std::path::Path;
use std::sync::Arc;

use imgd::config::AppConfig;
use imgd::context::AppContext;
use imgd::core::{
    BackupController, BackupSet, Error, ImagingOptions, JobController, MountController, NbdPool,
    RestorationController, Status,
};
use imgd::store::MemoryStore;

fn test_context(root: &Path) -> AppContext {
    let config = AppConfig {
        node_name: "node0".into(),
        backup_path: root.join("backups"),
        mount_path: root.join("mnt"),
        database_path: root.join("imgd.db"),
        verbose: false,
        log_json: false,
    };
    AppContext::new(config, Arc::new(MemoryStore::new()), NbdPool::new(Vec::new()))
}

async fn seed_record(ctx: &AppContext, id: &str, node: &str, deleted: bool) -> BackupSet {
    let mut set = BackupSet::new(id, node, &ctx.config.backup_path);
    if deleted {
        set.mark_deleted();
    }
    ctx.store.upsert(&set).await.unwrap();
    set
}

#[tokio::test]
async fn backup_refuses_an_existing_live_record() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(dir.path());
    seed_record(&ctx, "job1", "node0", false).await;

    let err = BackupController::new(&ctx, "sda", "job1", ImagingOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BackupExists(_)));
}

#[tokio::test]
async fn backup_refuses_a_record_owned_by_another_node() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(dir.path());
    seed_record(&ctx, "job1", "node1", true).await;

    let err = BackupController::new(&ctx, "sda", "job1", ImagingOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WrongNode { .. }));
}

#[tokio::test]
async fn backup_refuses_a_stale_directory_without_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(dir.path());
    // leftover files with no record behind them
    std::fs::create_dir_all(ctx.config.backup_path.join("job1")).unwrap();

    let err = BackupController::new(&ctx, "sda", "job1", ImagingOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BackupExists(_)));
}

#[tokio::test]
async fn overwriting_a_deleted_record_purges_it_first() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(dir.path());
    let set = seed_record(&ctx, "job1", "node0", true).await;
    std::fs::create_dir_all(&set.backup_path).unwrap();
    std::fs::write(set.backup_path.join("part1.img"), b"old image").unwrap();

    let opts = ImagingOptions {
        overwrite: true,
        ..Default::default()
    };
    // construction proceeds past the conflict checks and fails later on the
    // unreadable disk; the purge has happened by then
    let result = BackupController::new(&ctx, "no_such_disk0", "job1", opts).await;
    assert!(result.is_err());

    let record = ctx.store.get("job1").await.unwrap().unwrap();
    assert!(record.purged);
    assert!(!set.backup_path.exists());
}

#[tokio::test]
async fn restoration_requires_an_existing_record() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(dir.path());

    let err = RestorationController::new(&ctx, "sda", "missing", ImagingOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn restoration_refuses_a_record_owned_by_another_node() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(dir.path());
    seed_record(&ctx, "job1", "node1", false).await;

    let err = RestorationController::new(&ctx, "sda", "job1", ImagingOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WrongNode { .. }));
}

#[tokio::test]
async fn mount_rolls_back_when_the_pool_is_exhausted() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(dir.path());
    let mut set = BackupSet::new("job1", "node0", &ctx.config.backup_path);
    set.add_partition("sda1", "ext4", 1024);
    ctx.store.upsert(&set).await.unwrap();

    let controller = MountController::new(&ctx, "job1").await.unwrap();
    let err = controller.mount().await.unwrap_err();
    assert!(matches!(err, Error::PoolExhausted));

    let status = controller.status();
    assert_eq!(status.status, Status::Error);
    // the partially created mount directory is rolled back
    assert!(!ctx.config.mount_path.join("job1").exists());

    // unmount after a rollback is a no-op, not a failure
    controller.unmount().await.unwrap();
}

#[tokio::test]
async fn kill_marks_the_job_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = test_context(dir.path());
    seed_record(&ctx, "job1", "node0", false).await;

    let controller = MountController::new(&ctx, "job1").await.unwrap();
    controller.kill().await;

    let status = controller.status();
    assert_eq!(status.status, Status::Error);
    assert!(status.error_msg.unwrap().contains("cancelled"));
}
