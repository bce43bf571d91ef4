//! Recovery routines against a real git repository.

mod common;

use campaignd::recovery::{
    EmergencyRecovery, NuclearResetOptions, RecoveryError, RecoveryOptions,
};
use common::{TestRepo, APP_FILE, APP_V1};
use std::sync::Arc;

#[tokio::test]
async fn nuclear_reset_archives_and_clears_everything() {
    let repo = TestRepo::new();
    let (safety, supervisor) = repo.protocol();
    let recovery = EmergencyRecovery::new(Arc::clone(&safety));

    for n in 2..=4 {
        repo.write(APP_FILE, &format!("export const value = {n};\n"));
        safety
            .create_stash(&format!("edit {n}"), Some("phase1"))
            .await
            .unwrap();
    }
    repo.write(".campaign/metrics/typescript.json", "{\"errors\":12}\n");
    repo.write(".campaign/metrics/lint.json", "{\"warnings\":40}\n");
    repo.write("src/scratch.ts", "export {};\n");

    let result = recovery.nuclear_reset(NuclearResetOptions::default()).await;

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.stashes_cleared, 3);
    assert!(result.metrics_cleared);
    assert_eq!(result.target_commit.as_deref(), Some(repo.head().as_str()));

    let backup = result.backup_created.clone().unwrap();
    assert!(backup.exists());
    assert_eq!(result.backup_sha256.as_ref().map(String::len), Some(64));

    assert_eq!(repo.read(APP_FILE), APP_V1);
    assert!(!repo.join("src/scratch.ts").exists());
    assert!(!repo.join(".campaign/metrics").exists());
    assert!(safety.list_stashes().await.is_empty());
    assert!(repo.git(&["stash", "list"]).trim().is_empty());

    let stats = recovery.recovery_statistics();
    assert_eq!(stats.nuclear, 1);
    assert_eq!(stats.successful, 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn nuclear_reset_counts_paths_differing_from_target() {
    let repo = TestRepo::new();
    let (safety, supervisor) = repo.protocol();
    let recovery = EmergencyRecovery::new(Arc::clone(&safety));
    let first = repo.head();

    // Committed after the target, so the work tree itself is clean for it.
    repo.write(APP_FILE, "export const value = 2;\n");
    repo.write("src/later.ts", "export const later = 1;\n");
    repo.git(&["add", "."]);
    repo.git(&["commit", "-q", "-m", "second"]);
    repo.write("src/scratch.ts", "export {};\n");

    let result = recovery
        .nuclear_reset(NuclearResetOptions {
            create_backup: false,
            target_commit: Some(first.clone()),
            ..NuclearResetOptions::default()
        })
        .await;

    assert!(result.success, "errors: {:?}", result.errors);
    // src/app.ts, src/later.ts and src/scratch.ts.
    assert_eq!(result.files_reset, 3);
    assert_eq!(repo.head(), first);
    assert_eq!(repo.read(APP_FILE), APP_V1);
    assert!(!repo.join("src/later.ts").exists());
    assert!(!repo.join("src/scratch.ts").exists());

    supervisor.shutdown().await;
}

#[tokio::test]
async fn nuclear_reset_can_preserve_stashes_and_metrics() {
    let repo = TestRepo::new();
    let (safety, supervisor) = repo.protocol();
    let recovery = EmergencyRecovery::new(Arc::clone(&safety));

    repo.write(APP_FILE, "export const value = 2;\n");
    safety.create_stash("keep me", None).await.unwrap();
    repo.write(".campaign/metrics/typescript.json", "{}\n");

    let result = recovery
        .nuclear_reset(NuclearResetOptions {
            create_backup: false,
            preserve_metrics: true,
            preserve_stashes: true,
            ..NuclearResetOptions::default()
        })
        .await;

    assert!(result.success, "errors: {:?}", result.errors);
    assert!(result.backup_created.is_none());
    assert_eq!(result.stashes_cleared, 0);
    assert!(repo.join(".campaign/metrics/typescript.json").exists());
    assert_eq!(safety.list_stashes().await.len(), 1);
    assert_eq!(repo.read(APP_FILE), APP_V1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn rollback_to_commit_resets_and_rejects_unknown_commits() {
    let repo = TestRepo::new();
    let (safety, supervisor) = repo.protocol();
    let recovery = EmergencyRecovery::new(Arc::clone(&safety));
    let first = repo.head();

    repo.write(APP_FILE, "export const value = 2;\n");
    repo.git(&["commit", "-q", "-am", "second"]);
    repo.write(APP_FILE, "export const value = 3;\n");

    let err = recovery
        .rollback_to_commit("0123456789abcdef0123456789abcdef01234567", RecoveryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RecoveryError::CommitNotFound(_)));
    assert_eq!(repo.read(APP_FILE), "export const value = 3;\n");

    let validation = recovery
        .rollback_to_commit(&first, RecoveryOptions::default())
        .await
        .unwrap();
    assert!(validation.success, "errors: {:?}", validation.errors);
    assert!(validation.build_validation);
    assert_eq!(repo.head(), first);
    assert_eq!(repo.read(APP_FILE), APP_V1);

    // The backup checkpoint holds the discarded edit.
    let backup = safety.latest_stash().await.unwrap();
    assert!(backup.stash_ref.is_some());

    supervisor.shutdown().await;
}

#[tokio::test]
async fn selective_recovery_restores_only_named_paths() {
    let repo = TestRepo::new();
    let (safety, supervisor) = repo.protocol();
    let recovery = EmergencyRecovery::new(Arc::clone(&safety));

    repo.write(APP_FILE, "export const value = 2;\n");
    repo.write("src/other.ts", "export const other = 1;\n");
    repo.git(&["add", "src/other.ts"]);
    let stash = safety.create_stash("good state", None).await.unwrap();

    repo.write(APP_FILE, "export const value = ;\n");
    repo.write("src/other.ts", "export const other = 2;\n");

    let branch = repo.git(&["rev-parse", "--abbrev-ref", "HEAD"]);
    let result = recovery
        .selective_recovery(&[APP_FILE.to_string()], Some(&stash.id))
        .await;

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.recovered, vec![APP_FILE.to_string()]);
    assert_eq!(repo.read(APP_FILE), "export const value = 2;\n");
    assert_eq!(repo.read("src/other.ts"), "export const other = 2;\n");
    assert_eq!(repo.git(&["rev-parse", "--abbrev-ref", "HEAD"]), branch);
    assert!(!repo
        .git(&["branch", "--list"])
        .contains("campaign-recovery-"));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn selective_recovery_without_checkpoints_fails() {
    let repo = TestRepo::new();
    let (safety, supervisor) = repo.protocol();
    let recovery = EmergencyRecovery::new(safety);

    let result = recovery
        .selective_recovery(&[APP_FILE.to_string()], None)
        .await;
    assert!(!result.success);
    assert!(result.stash_id.is_none());

    supervisor.shutdown().await;
}

#[tokio::test]
async fn emergency_rollback_with_options_takes_a_backup_first() {
    let repo = TestRepo::new();
    let (safety, supervisor) = repo.protocol();
    let recovery = EmergencyRecovery::new(Arc::clone(&safety));

    repo.write(APP_FILE, "export const value = 2;\n");
    let good = safety.create_stash("good", None).await.unwrap();
    repo.write(APP_FILE, "export const value = 3;\n");

    let validation = recovery
        .emergency_rollback_with_options(RecoveryOptions::default())
        .await
        .unwrap();

    // Rolled back to the checkpoint that existed before the backup.
    assert_eq!(repo.read(APP_FILE), "export const value = 2;\n");
    assert!(validation.build_validation);
    assert!(validation.stashes_preserved);
    let stashes = safety.list_stashes().await;
    assert_eq!(stashes.len(), 2);
    assert_eq!(stashes[0].id, good.id);

    supervisor.shutdown().await;
}
