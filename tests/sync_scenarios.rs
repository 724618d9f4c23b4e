//! 端到端同步场景：真实文件系统 + 可注入故障的远程存储

mod common;

use bytes::Bytes;
use common::{engine, engine_with, fast_config, FlakyStore};
use dotsync_lib::core::{
    FileStateManager, FileSyncState, JobDirection, JobState, RetryPolicy, SessionState, SnapshotStore,
};
use dotsync_lib::db::{self, SessionLog};
use dotsync_lib::error::{EngineError, JobErrorKind, RemoteError};
use dotsync_lib::storage::{remote_key, ObjectMeta, RemoteStore};
use std::fs;
use std::sync::Arc;
use std::time::Duration;

fn unavailable() -> RemoteError {
    RemoteError::Unavailable("connection reset".to_string())
}

fn conflict() -> RemoteError {
    RemoteError::VersionConflict {
        key: "k".to_string(),
        expected: None,
        actual: Some("v?".to_string()),
    }
}

#[tokio::test]
async fn unchanged_file_produces_no_jobs() {
    let home = tempfile::tempdir().unwrap();
    fs::write(home.path().join(".vimrc"), "set number\n").unwrap();
    let remote = Arc::new(FlakyStore::new());
    let engine = engine(home.path(), &["~/.vimrc"], remote.clone(), 5);

    let first = engine.start_sync().await.unwrap();
    assert_eq!(first.uploaded(), 1);
    let calls = remote.put_calls();

    let second = engine.start_sync().await.unwrap();
    assert_eq!(second.state, SessionState::Complete);
    assert!(second.jobs.is_empty());
    assert_eq!(remote.put_calls(), calls);
}

#[tokio::test]
async fn modified_file_is_uploaded_once_and_synced() {
    let home = tempfile::tempdir().unwrap();
    let bashrc = home.path().join(".bashrc");
    fs::write(&bashrc, "export EDITOR=vi\n").unwrap();
    let remote = Arc::new(FlakyStore::new());
    let engine = engine(home.path(), &["~/.bashrc"], remote.clone(), 5);
    engine.start_sync().await.unwrap();

    fs::write(&bashrc, "export EDITOR=nvim\nalias g=git\n").unwrap();
    let summary = engine.start_sync().await.unwrap();

    assert_eq!(summary.state, SessionState::Complete);
    assert_eq!(summary.jobs.len(), 1);
    assert_eq!(summary.jobs[0].direction, JobDirection::Upload);
    assert_eq!(summary.jobs[0].state, JobState::Succeeded);

    let record = engine.snapshot().get(&bashrc).await.unwrap();
    assert_eq!(record.state, FileSyncState::Synced);

    // Synced 的哈希与远程保存的内容一致
    let key = remote_key(&bashrc);
    let stored = remote.get(&key).await.unwrap();
    assert_eq!(stored, Bytes::from_static(b"export EDITOR=nvim\nalias g=git\n"));
    let head = remote.head(&key).await.unwrap().unwrap();
    assert_eq!(record.synced.unwrap().hash, head.meta.hash);
    assert_eq!(record.remote.unwrap().version, head.version);
}

#[tokio::test]
async fn deleted_file_removes_remote_object_and_record() {
    let home = tempfile::tempdir().unwrap();
    let zshrc = home.path().join(".zshrc");
    fs::write(&zshrc, "bindkey -e\n").unwrap();
    let remote = Arc::new(FlakyStore::new());
    let engine = engine(home.path(), &["~/.zshrc"], remote.clone(), 5);
    engine.start_sync().await.unwrap();
    assert!(remote.inner.contains(&remote_key(&zshrc)).await);

    fs::remove_file(&zshrc).unwrap();
    let summary = engine.start_sync().await.unwrap();

    assert_eq!(summary.state, SessionState::Complete);
    assert_eq!(summary.jobs.len(), 1);
    assert_eq!(summary.jobs[0].direction, JobDirection::Delete);
    assert_eq!(summary.jobs[0].state, JobState::Succeeded);
    assert_eq!(summary.deleted(), 1);
    assert!(!engine.snapshot().contains(&zshrc).await);
    assert!(remote.inner.is_empty().await);
}

#[tokio::test]
async fn retries_stop_at_max_attempts() {
    let home = tempfile::tempdir().unwrap();
    let gitconfig = home.path().join(".gitconfig");
    fs::write(&gitconfig, "[user]\n\tname = dev\n").unwrap();
    let remote = Arc::new(FlakyStore::new());
    remote.fail_puts([unavailable(), unavailable(), unavailable()]);
    let engine = engine(home.path(), &["~/.gitconfig"], remote.clone(), 3);

    let summary = engine.start_sync().await.unwrap();

    assert_eq!(remote.put_calls(), 3);
    assert_eq!(summary.state, SessionState::PartialFailure);
    assert_eq!(summary.jobs[0].state, JobState::Failed(JobErrorKind::RetriesExhausted));

    let status = engine.status().snapshot().await;
    assert_eq!(status.session_state, SessionState::PartialFailure);
    assert_eq!(status.failed_jobs.len(), 1);
    assert_eq!(status.files[&gitconfig].state, FileSyncState::Error);
    assert!(status.files[&gitconfig].last_error.is_some());
}

#[tokio::test]
async fn transient_failures_then_success() {
    let home = tempfile::tempdir().unwrap();
    fs::write(home.path().join(".tmux.conf"), "set -g mouse on\n").unwrap();
    let remote = Arc::new(FlakyStore::new());
    remote.fail_puts([unavailable(), unavailable()]);
    let engine = engine(home.path(), &["~/.tmux.conf"], remote.clone(), 3);

    let summary = engine.start_sync().await.unwrap();

    assert_eq!(remote.put_calls(), 3);
    assert_eq!(summary.state, SessionState::Complete);
    assert_eq!(summary.jobs[0].state, JobState::Succeeded);
}

#[tokio::test]
async fn failed_file_recovers_on_next_session() {
    let home = tempfile::tempdir().unwrap();
    let profile = home.path().join(".profile");
    fs::write(&profile, "umask 022\n").unwrap();
    let remote = Arc::new(FlakyStore::new());
    remote.fail_puts([unavailable()]);
    let engine = engine(home.path(), &["~/.profile"], remote.clone(), 1);

    let failed = engine.start_sync().await.unwrap();
    assert_eq!(failed.state, SessionState::PartialFailure);

    // 显式同步会重新提交 Error 状态的文件，并清除上次的失败列表
    let recovered = engine.start_sync().await.unwrap();
    assert_eq!(recovered.state, SessionState::Complete);
    assert_eq!(recovered.uploaded(), 1);
    let status = engine.status().snapshot().await;
    assert!(status.failed_jobs.is_empty());
    assert_eq!(status.files[&profile].state, FileSyncState::Synced);
}

#[tokio::test]
async fn unauthorized_fails_without_retry() {
    let home = tempfile::tempdir().unwrap();
    fs::write(home.path().join(".npmrc"), "save-exact=true\n").unwrap();
    let remote = Arc::new(FlakyStore::new());
    remote.fail_puts([RemoteError::Unauthorized("bad token".to_string())]);
    let engine = engine(home.path(), &["~/.npmrc"], remote.clone(), 5);

    let summary = engine.start_sync().await.unwrap();

    assert_eq!(remote.put_calls(), 1);
    assert_eq!(summary.jobs[0].state, JobState::Failed(JobErrorKind::Unauthorized));
}

#[tokio::test]
async fn unreachable_remote_aborts_session() {
    let home = tempfile::tempdir().unwrap();
    fs::write(home.path().join(".vimrc"), "syntax on\n").unwrap();
    let remote = Arc::new(FlakyStore::new());
    remote.fail_check(unavailable());
    let engine = engine(home.path(), &["~/.vimrc"], remote.clone(), 5);

    let err = engine.start_sync().await.unwrap_err();

    assert!(matches!(err, EngineError::RemoteUnreachable(_)));
    assert_eq!(remote.put_calls(), 0);
    let status = engine.status().snapshot().await;
    assert_eq!(status.session_state, SessionState::Idle);
    assert!(status.session_error.is_some());
}

#[tokio::test]
async fn explicit_start_is_rejected_while_running() {
    let home = tempfile::tempdir().unwrap();
    fs::write(home.path().join(".vimrc"), "set hidden\n").unwrap();
    let remote = Arc::new(FlakyStore::new());
    remote.set_put_delay(Duration::from_millis(200));
    let engine = Arc::new(engine(home.path(), &["~/.vimrc"], remote.clone(), 5));

    let running = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.start_sync().await })
    };
    let mut state_rx = engine.status().subscribe();
    state_rx.wait_for(|s| *s == SessionState::Running).await.unwrap();

    assert!(matches!(engine.start_sync().await, Err(EngineError::SessionInProgress)));

    let summary = running.await.unwrap().unwrap();
    assert_eq!(summary.state, SessionState::Complete);
    assert_eq!(remote.put_calls(), 1);
}

#[tokio::test]
async fn stop_cancels_jobs_not_yet_started() {
    let home = tempfile::tempdir().unwrap();
    for name in [".a", ".b", ".c"] {
        fs::write(home.path().join(name), name).unwrap();
    }
    let remote = Arc::new(FlakyStore::new());
    remote.set_put_delay(Duration::from_millis(200));
    let config = dotsync_lib::SyncConfig {
        concurrency: 1,
        ..fast_config(5)
    };
    let engine = Arc::new(engine_with(
        home.path(),
        &["~/.a", "~/.b", "~/.c"],
        remote.clone(),
        Arc::new(SnapshotStore::new()),
        config,
    ));

    let running = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.start_sync().await })
    };
    let mut state_rx = engine.status().subscribe();
    state_rx.wait_for(|s| *s == SessionState::Running).await.unwrap();
    assert!(engine.stop_sync().await);

    let summary = running.await.unwrap().unwrap();
    assert_eq!(summary.state, SessionState::Cancelled);
    assert_eq!(summary.jobs.len(), 3);
    assert!(summary.jobs.iter().any(|j| j.state == JobState::Cancelled));
    assert!(summary.jobs.iter().all(|j| j.state.is_terminal()));
    assert_eq!(engine.status().session_state(), SessionState::Cancelled);
}

#[tokio::test]
async fn stop_lets_in_flight_retry_finish() {
    let home = tempfile::tempdir().unwrap();
    fs::write(home.path().join(".gitconfig"), "[core]\n\tpager = less\n").unwrap();
    let remote = Arc::new(FlakyStore::new());
    remote.fail_puts([unavailable()]);
    let config = dotsync_lib::SyncConfig {
        retry: RetryPolicy::new(3, Duration::from_millis(300), Duration::from_millis(300)),
        ..fast_config(3)
    };
    let engine = Arc::new(engine_with(
        home.path(),
        &["~/.gitconfig"],
        remote.clone(),
        Arc::new(SnapshotStore::new()),
        config,
    ));

    let running = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.start_sync().await })
    };
    // 第一次上传失败后任务处于退避中
    while remote.put_calls() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(engine.stop_sync().await);

    let summary = running.await.unwrap().unwrap();
    assert_eq!(summary.jobs.len(), 1);
    assert_eq!(summary.jobs[0].state, JobState::Succeeded);
    assert_eq!(summary.state, SessionState::Complete);
    assert_eq!(remote.put_calls(), 2);
}

#[tokio::test]
async fn repeated_conflicts_become_persistent() {
    let home = tempfile::tempdir().unwrap();
    let vimrc = home.path().join(".vimrc");
    fs::write(&vimrc, "set nocompatible\n").unwrap();
    let remote = Arc::new(FlakyStore::new());
    // 另一台机器写入的旧内容
    remote
        .inner
        .write_unchecked(
            &remote_key(&vimrc),
            Bytes::from_static(b"old"),
            ObjectMeta {
                path: vimrc.to_string_lossy().to_string(),
                hash: "old".to_string(),
                size: 3,
                modified_time: 0,
            },
        )
        .await;
    remote.fail_puts([conflict(), conflict()]);
    let engine = engine(home.path(), &["~/.vimrc"], remote.clone(), 5);

    let summary = engine.start_sync().await.unwrap();

    assert_eq!(remote.put_calls(), 2);
    assert_eq!(summary.state, SessionState::PartialFailure);
    assert_eq!(summary.jobs[0].state, JobState::Failed(JobErrorKind::PersistentConflict));
    let record = engine.snapshot().get(&vimrc).await.unwrap();
    assert_eq!(record.state, FileSyncState::Conflict);
}

#[tokio::test]
async fn newer_remote_wins_and_local_copy_is_kept() {
    let home = tempfile::tempdir().unwrap();
    let vimrc = home.path().join(".vimrc");
    fs::write(&vimrc, "local\n").unwrap();
    let remote = Arc::new(FlakyStore::new());
    remote
        .inner
        .write_unchecked(
            &remote_key(&vimrc),
            Bytes::from_static(b"remote\n"),
            ObjectMeta {
                path: vimrc.to_string_lossy().to_string(),
                hash: dotsync_lib::core::calculate_hash(b"remote\n"),
                size: 7,
                modified_time: i64::MAX,
            },
        )
        .await;
    let engine = engine(home.path(), &["~/.vimrc"], remote.clone(), 5);

    let summary = engine.start_sync().await.unwrap();

    assert_eq!(summary.state, SessionState::Complete);
    assert_eq!(summary.jobs[0].state, JobState::Conflicted);
    assert_eq!(fs::read_to_string(&vimrc).unwrap(), "remote\n");
    let backups: Vec<_> = fs::read_dir(home.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains("_conflict_local_"))
        .collect();
    assert_eq!(backups.len(), 1);
    assert_eq!(fs::read_to_string(backups[0].path()).unwrap(), "local\n");
    assert_eq!(
        engine.snapshot().get(&vimrc).await.unwrap().state,
        FileSyncState::Synced
    );

    // 备份文件不会被跟踪，下一次会话没有任务
    let next = engine.start_sync().await.unwrap();
    assert!(next.jobs.is_empty());
}

#[tokio::test]
async fn directory_spec_tracks_nested_files() {
    let home = tempfile::tempdir().unwrap();
    let nvim = home.path().join(".config/nvim");
    fs::create_dir_all(nvim.join("lua")).unwrap();
    fs::write(nvim.join("init.lua"), "require('plugins')\n").unwrap();
    fs::write(nvim.join("lua/plugins.lua"), "return {}\n").unwrap();
    fs::create_dir_all(nvim.join(".git")).unwrap();
    fs::write(nvim.join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();
    let remote = Arc::new(FlakyStore::new());
    let engine = engine(home.path(), &["~/.config/nvim"], remote.clone(), 5);

    let summary = engine.start_sync().await.unwrap();

    assert_eq!(summary.uploaded(), 2);
    assert_eq!(remote.inner.len().await, 2);
    assert!(!engine.snapshot().contains(&nvim.join(".git/HEAD")).await);
}

#[tokio::test]
async fn missing_spec_is_reported_not_fatal() {
    let home = tempfile::tempdir().unwrap();
    fs::write(home.path().join(".vimrc"), "set ruler\n").unwrap();
    let remote = Arc::new(FlakyStore::new());
    let engine = engine(home.path(), &["~/.vimrc", "~alice/.vimrc"], remote.clone(), 5);

    let summary = engine.start_sync().await.unwrap();

    assert_eq!(summary.state, SessionState::Complete);
    assert_eq!(summary.uploaded(), 1);
    let status = engine.status().snapshot().await;
    assert_eq!(status.path_errors.len(), 1);
    assert_eq!(status.path_errors[0].spec, "~alice/.vimrc");
}

async fn open_persisted(
    home: &std::path::Path,
    db: &Arc<db::SqlitePool>,
    remote: &Arc<FlakyStore>,
) -> dotsync_lib::SyncEngine {
    let snapshot = SnapshotStore::with_persistence(FileStateManager::new(db.clone()))
        .await
        .unwrap();
    engine_with(home, &["~/.vimrc"], remote.clone(), Arc::new(snapshot), fast_config(5))
        .with_history(db.clone())
}

#[tokio::test]
async fn persisted_snapshot_survives_restart() {
    let home = tempfile::tempdir().unwrap();
    let vimrc = home.path().join(".vimrc");
    fs::write(&vimrc, "set number\n").unwrap();
    let db = Arc::new(db::connect_in_memory().await.unwrap());
    let remote = Arc::new(FlakyStore::new());

    let first = open_persisted(home.path(), &db, &remote).await;
    assert_eq!(first.start_sync().await.unwrap().uploaded(), 1);
    drop(first);

    // 重新启动后未变化的文件不再上传
    let second = open_persisted(home.path(), &db, &remote).await;
    let summary = second.start_sync().await.unwrap();
    assert!(summary.jobs.is_empty());
    assert_eq!(remote.put_calls(), 1);

    let logs = SessionLog::load_recent(&db, 10).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().all(|l| l.status == SessionState::Complete.to_string()));
    assert_eq!(logs.iter().map(|l| l.files_uploaded).sum::<i64>(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn polling_watcher_uploads_changes() {
    let home = tempfile::tempdir().unwrap();
    let inputrc = home.path().join(".inputrc");
    fs::write(&inputrc, "set editing-mode vi\n").unwrap();
    let remote = Arc::new(FlakyStore::new());
    let config = dotsync_lib::SyncConfig {
        poll_interval: Duration::from_millis(50),
        ..fast_config(5)
    };
    let engine = Arc::new(engine_with(
        home.path(),
        &["~/.inputrc"],
        remote.clone(),
        Arc::new(SnapshotStore::new()),
        config,
    ));
    let watcher = engine.spawn_watcher().await;
    let key = remote_key(&inputrc);

    let wait_for_content = |expected: &'static [u8]| {
        let remote = remote.clone();
        let key = key.clone();
        async move {
            tokio::time::timeout(Duration::from_secs(5), async {
                while remote.get(&key).await.ok().as_deref() != Some(expected) {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            })
            .await
            .is_ok()
        }
    };

    assert!(wait_for_content(b"set editing-mode vi\n").await);

    // 保证修改时间或大小变化
    fs::write(&inputrc, "set editing-mode emacs\nset bell-style none\n").unwrap();
    assert!(wait_for_content(b"set editing-mode emacs\nset bell-style none\n").await);

    engine.shutdown();
    watcher.await.unwrap();
}
