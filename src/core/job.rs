//! 同步任务：单个路径的上传/删除状态机

use crate::core::conflict::{conflict_copy_path, resolve_last_write_wins, ConflictSide, ConflictWinner};
use crate::core::file_state::{fingerprint_file, modified_millis, FileFingerprint, FileSyncState};
use crate::core::retry::RetryPolicy;
use crate::core::snapshot::SnapshotStore;
use crate::error::{JobError, JobErrorKind, RemoteError, SnapshotError};
use crate::storage::{remote_key, ObjectMeta, RemoteObjectRef, RemoteStore};
use bytes::Bytes;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

/// 任务方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobDirection {
    Upload,
    Delete,
}

impl std::fmt::Display for JobDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobDirection::Upload => write!(f, "upload"),
            JobDirection::Delete => write!(f, "delete"),
        }
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "kind")]
pub enum JobState {
    Pending,
    InFlight,
    Succeeded,
    /// 冲突中远程胜出，本地已被远程内容覆盖
    Conflicted,
    Failed(JobErrorKind),
    /// 本地文件暂时不可读或已变化，留给下一个检测周期
    Deferred,
    /// 会话停止时尚未开始执行
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Pending | JobState::InFlight)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, JobState::Failed(_))
    }
}

/// 同步任务
#[derive(Debug, Clone)]
pub struct SyncJob {
    pub id: String,
    pub path: PathBuf,
    pub direction: JobDirection,
    /// 已调用远程的次数
    pub attempts: u32,
    pub conflict_retries: u32,
    /// 调用方认为的远程版本；None 表示远程不应存在该对象
    pub base_version: Option<String>,
    /// 检测到变化的时间（毫秒），删除任务用它参与冲突判定
    pub observed_at: i64,
    pub last_error: Option<JobError>,
    pub state: JobState,
}

impl SyncJob {
    pub fn new(path: PathBuf, direction: JobDirection, base_version: Option<String>, observed_at: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            path,
            direction,
            attempts: 0,
            conflict_retries: 0,
            base_version,
            observed_at,
            last_error: None,
            state: JobState::Pending,
        }
    }

    /// 以某个终态结束而不执行（停止会话、会话中止时）
    pub fn finish_without_running(mut self, state: JobState) -> JobReport {
        self.state = state;
        JobReport::from(&self)
    }
}

/// 会话报告中的单个任务结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub id: String,
    pub path: PathBuf,
    pub direction: JobDirection,
    pub state: JobState,
    pub attempts: u32,
    pub error: Option<JobError>,
}

impl From<&SyncJob> for JobReport {
    fn from(job: &SyncJob) -> Self {
        Self {
            id: job.id.clone(),
            path: job.path.clone(),
            direction: job.direction,
            state: job.state,
            attempts: job.attempts,
            error: job.last_error.clone(),
        }
    }
}

/// 有未完成任务的路径集合，检测器据此避免重复发出事件
#[derive(Debug, Default)]
pub struct PendingSet {
    paths: Mutex<HashSet<PathBuf>>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入集合；已存在时返回 false
    pub async fn insert(&self, path: &Path) -> bool {
        self.paths.lock().await.insert(path.to_path_buf())
    }

    pub async fn remove(&self, path: &Path) {
        self.paths.lock().await.remove(path);
    }

    pub async fn contains(&self, path: &Path) -> bool {
        self.paths.lock().await.contains(path)
    }

    pub async fn len(&self) -> usize {
        self.paths.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.paths.lock().await.is_empty()
    }
}

/// 每个路径一把锁，保证同一路径最多一个执行中的任务
#[derive(Debug, Default)]
pub struct PathLocks {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// 释放路径锁；没有其他任务等待时从表中移除该路径
    pub async fn release(&self, path: &Path, guard: OwnedMutexGuard<()>) {
        drop(guard);
        let mut locks = self.locks.lock().await;
        // 表本身持有一份引用，其余引用都来自等待中的任务
        if locks.get(path).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(path);
        }
    }

    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

/// 一次远程调用之后状态机的下一步
enum Step {
    Done(JobState),
    /// 冲突后以刷新的基础版本重新提交
    Requeue,
    Transient(RemoteError),
}

/// 任务执行器（可克隆，放进 tokio::spawn）
#[derive(Clone)]
pub struct JobRunner {
    remote: Arc<dyn RemoteStore>,
    snapshot: Arc<SnapshotStore>,
    locks: Arc<PathLocks>,
    pending: Arc<PendingSet>,
    retry: RetryPolicy,
    op_timeout: Duration,
    max_conflict_retries: u32,
}

impl JobRunner {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        snapshot: Arc<SnapshotStore>,
        locks: Arc<PathLocks>,
        pending: Arc<PendingSet>,
        retry: RetryPolicy,
        op_timeout: Duration,
        max_conflict_retries: u32,
    ) -> Self {
        Self {
            remote,
            snapshot,
            locks,
            pending,
            retry,
            op_timeout,
            max_conflict_retries,
        }
    }

    /// 执行任务直到终态。已开始的任务不响应会话停止，退避重试会走完
    pub async fn run(&self, mut job: SyncJob) -> JobReport {
        let guard = self.locks.acquire(&job.path).await;
        job.state = JobState::InFlight;
        self.snapshot.mark(&job.path, FileSyncState::Syncing).await;
        debug!("开始任务: {} {}", job.direction, job.path.display());

        let mut transient_failures = 0u32;
        let outcome = loop {
            job.attempts += 1;
            let step = match job.direction {
                JobDirection::Upload => self.upload(&mut job).await,
                JobDirection::Delete => self.delete(&mut job).await,
            };

            match step {
                Step::Done(state) => break state,
                Step::Requeue => {
                    debug!("冲突后重新提交: {} (基础版本 {:?})", job.path.display(), job.base_version);
                    continue;
                }
                Step::Transient(err) => {
                    transient_failures += 1;
                    if !self.retry.should_retry(transient_failures) {
                        error!(
                            "任务最终失败 (已尝试{}次): {}: {}",
                            transient_failures,
                            job.path.display(),
                            err
                        );
                        job.last_error = Some(JobError::new(JobErrorKind::RetriesExhausted, err.to_string()));
                        break JobState::Failed(JobErrorKind::RetriesExhausted);
                    }

                    let delay = self.retry.delay_for(transient_failures);
                    warn!(
                        "远程暂时不可用，{}ms 后重试 ({}/{}): {}: {}",
                        delay.as_millis(),
                        transient_failures,
                        self.retry.max_attempts,
                        job.path.display(),
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        job.state = outcome;
        self.settle(&job).await;
        self.locks.release(&job.path, guard).await;
        self.pending.remove(&job.path).await;
        JobReport::from(&job)
    }

    /// 根据任务终态写入文件状态
    async fn settle(&self, job: &SyncJob) {
        let message = job.last_error.as_ref().map(|e| e.to_string());
        match job.state {
            // 成功与远程胜出的状态已在执行时提交
            JobState::Succeeded | JobState::Conflicted => {}
            JobState::Failed(JobErrorKind::PersistentConflict) => {
                self.snapshot
                    .set_error(&job.path, Some(FileSyncState::Conflict), message.unwrap_or_default())
                    .await;
            }
            JobState::Failed(_) => {
                self.snapshot
                    .set_error(&job.path, Some(FileSyncState::Error), message.unwrap_or_default())
                    .await;
            }
            JobState::Deferred | JobState::Cancelled | JobState::Pending | JobState::InFlight => {
                // 删除任务成功前记录可能已被移除，这里不重新创建
                if self.snapshot.contains(&job.path).await {
                    match message {
                        Some(m) => {
                            self.snapshot
                                .set_error(&job.path, Some(FileSyncState::Unsynced), m)
                                .await
                        }
                        None => self.snapshot.mark(&job.path, FileSyncState::Unsynced).await,
                    }
                }
            }
        }
    }

    /// 带超时的远程调用，超时视为暂时不可用
    async fn call<T, F>(&self, fut: F) -> Result<T, RemoteError>
    where
        F: Future<Output = Result<T, RemoteError>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Unavailable(format!(
                "operation timed out after {}s",
                self.op_timeout.as_secs_f32()
            ))),
        }
    }

    fn fail(job: &mut SyncJob, kind: JobErrorKind, message: impl Into<String>) -> Step {
        let err = JobError::new(kind, message);
        error!("任务失败: {} {}: {}", job.direction, job.path.display(), err);
        job.last_error = Some(err);
        Step::Done(JobState::Failed(kind))
    }

    fn defer(job: &mut SyncJob, err: &SnapshotError) -> Step {
        warn!("本地文件暂不可用，推迟到下个检测周期: {}", err);
        job.last_error = None;
        Step::Done(JobState::Deferred)
    }

    /// 远程错误分类；VersionConflict 由调用方单独处理
    fn classify(job: &mut SyncJob, err: RemoteError) -> Step {
        match err {
            err if err.is_transient() => Step::Transient(err),
            RemoteError::Unauthorized(_) => Self::fail(job, JobErrorKind::Unauthorized, err.to_string()),
            other => Self::fail(job, JobErrorKind::Remote, other.to_string()),
        }
    }

    async fn upload(&self, job: &mut SyncJob) -> Step {
        let path = job.path.clone();

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) => return Self::defer(job, &SnapshotError::from_io(&path, e)),
        };
        if !metadata.is_file() {
            return Self::fail(
                job,
                JobErrorKind::InvalidLocalState,
                SnapshotError::NotAFile(path).to_string(),
            );
        }
        let data = match tokio::fs::read(&path).await {
            Ok(d) => d,
            Err(e) => return Self::defer(job, &SnapshotError::from_io(&path, e)),
        };

        // 指纹对应的就是实际上传的字节
        let fp = FileFingerprint::from_bytes(&data, modified_millis(&metadata));
        let key = remote_key(&path);
        let meta = ObjectMeta {
            path: path.to_string_lossy().to_string(),
            hash: fp.hash.clone(),
            size: fp.size,
            modified_time: fp.modified_time,
        };

        let result = self
            .call(self.remote.put(&key, Bytes::from(data), job.base_version.as_deref(), &meta))
            .await;

        match result {
            Ok(version) => {
                info!("已上传: {} ({} 字节, 版本 {})", path.display(), fp.size, version);
                self.snapshot
                    .commit_synced(&path, fp, RemoteObjectRef { key, version, meta })
                    .await;
                Step::Done(JobState::Succeeded)
            }
            Err(RemoteError::VersionConflict { .. }) => {
                let local = ConflictSide::new(fp.modified_time, &fp.hash);
                self.resolve_conflict(job, &key, local, Some(&fp)).await
            }
            Err(e) => Self::classify(job, e),
        }
    }

    async fn delete(&self, job: &mut SyncJob) -> Step {
        let path = job.path.clone();

        // 文件又出现了，交给下一次检测按修改处理
        if tokio::fs::symlink_metadata(&path).await.is_ok() {
            debug!("待删除文件重新出现: {}", path.display());
            return Step::Done(JobState::Deferred);
        }

        let key = remote_key(&path);
        match self.call(self.remote.delete(&key, job.base_version.as_deref())).await {
            Ok(()) => {
                info!("已删除远程对象: {}", path.display());
                self.snapshot.remove(&path).await;
                Step::Done(JobState::Succeeded)
            }
            Err(RemoteError::VersionConflict { .. }) => {
                // 删除没有内容哈希，空串使时间相同时远程胜出
                let local = ConflictSide::new(job.observed_at, "");
                self.resolve_conflict(job, &key, local, None).await
            }
            Err(e) => Self::classify(job, e),
        }
    }

    async fn resolve_conflict(
        &self,
        job: &mut SyncJob,
        key: &str,
        local: ConflictSide<'_>,
        local_fp: Option<&FileFingerprint>,
    ) -> Step {
        let head = match self.call(self.remote.head(key)).await {
            Ok(h) => h,
            Err(e) => return Self::classify(job, e),
        };

        let Some(remote) = head else {
            // 远程对象已被删除：删除任务视为完成，上传任务改为创建
            if job.direction == JobDirection::Delete {
                self.snapshot.remove(&job.path).await;
                return Step::Done(JobState::Succeeded);
            }
            return self.requeue(job, None);
        };
        self.snapshot.set_remote(&job.path, Some(remote.clone())).await;

        // 远程已是相同内容，直接采纳其版本
        if let Some(fp) = local_fp {
            if remote.meta.hash == fp.hash {
                debug!("远程内容与本地一致，采纳远程版本: {}", job.path.display());
                self.snapshot.commit_synced(&job.path, fp.clone(), remote).await;
                return Step::Done(JobState::Succeeded);
            }
        }

        // 同一任务再次冲突：不再判定胜负，也不覆盖本地文件
        if job.conflict_retries >= self.max_conflict_retries {
            return self.persistent_conflict(job);
        }

        let winner = resolve_last_write_wins(
            local,
            ConflictSide::new(remote.meta.modified_time, &remote.meta.hash),
        );
        info!("版本冲突: {} -> {} 胜出", job.path.display(), winner);

        match winner {
            ConflictWinner::Local => self.requeue(job, Some(remote.version)),
            ConflictWinner::Remote => self.restore_from_remote(job, remote).await,
        }
    }

    fn persistent_conflict(&self, job: &mut SyncJob) -> Step {
        let retries = job.conflict_retries;
        Self::fail(
            job,
            JobErrorKind::PersistentConflict,
            format!("remote changed again after {} conflict retries", retries),
        )
    }

    fn requeue(&self, job: &mut SyncJob, base_version: Option<String>) -> Step {
        if job.conflict_retries >= self.max_conflict_retries {
            return self.persistent_conflict(job);
        }
        job.conflict_retries += 1;
        job.base_version = base_version;
        job.state = JobState::Pending;
        Step::Requeue
    }

    /// 远程胜出：保留本地副本后用远程内容原子覆盖本地文件
    async fn restore_from_remote(&self, job: &mut SyncJob, remote: RemoteObjectRef) -> Step {
        let data = match self.call(self.remote.get(&remote.key)).await {
            Ok(d) => d,
            Err(e) => return Self::classify(job, e),
        };

        let path = job.path.clone();
        let backup = conflict_copy_path(&path, chrono::Utc::now().timestamp());
        let write_path = path.clone();
        let written = tokio::task::spawn_blocking(move || {
            restore_file(&write_path, &data, &backup)?;
            fingerprint_file(&write_path, None).map_err(|e| match e {
                SnapshotError::Io { source, .. } => source,
                other => std::io::Error::other(other.to_string()),
            })
        })
        .await;

        match written {
            Ok(Ok(fp)) => {
                info!("冲突中远程胜出，已用远程内容覆盖本地: {}", path.display());
                self.snapshot.commit_synced(&path, fp, remote).await;
                Step::Done(JobState::Conflicted)
            }
            Ok(Err(e)) => Self::defer(job, &SnapshotError::from_io(&path, e)),
            Err(e) => Self::fail(job, JobErrorKind::InvalidLocalState, e.to_string()),
        }
    }
}

/// 写临时文件再 rename，覆盖前把现有本地文件复制为冲突副本
fn restore_file(path: &Path, data: &[u8], backup: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.is_file() {
        std::fs::copy(path, backup)?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.dotsync-tmp", file_name));
    // 写入或 rename 失败时清理临时文件
    let cleanup = scopeguard::guard(tmp.clone(), |tmp| {
        let _ = std::fs::remove_file(tmp);
    });
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    scopeguard::ScopeGuard::into_inner(cleanup);
    Ok(())
}
