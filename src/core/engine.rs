//! 同步引擎：会话调度、任务并发执行与历史记录

use crate::core::job::{JobDirection, JobReport, JobRunner, JobState, PathLocks, PendingSet, SyncJob};
use crate::core::path_resolver::{PathResolver, TrackedPaths};
use crate::core::retry::RetryPolicy;
use crate::core::snapshot::SnapshotStore;
use crate::core::status::{SessionOrigin, SessionState, SessionSummary, StatusReporter};
use crate::core::watcher::{build_detector, ChangeEvent, ChangeKind, ChangeScanner, WatchMode};
use crate::core::file_state::{FileStateManager, FileSyncState};
use crate::db::SessionLog;
use crate::error::{EngineError, JobError, JobErrorKind, RemoteError};
use crate::storage::RemoteStore;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 同步配置
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// 最大并发任务数
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// 单次远程调用超时
    pub op_timeout: Duration,
    pub poll_interval: Duration,
    /// 未同步过的路径连续缺失多少次后停止跟踪
    pub missing_threshold: u32,
    pub watch_mode: WatchMode,
    /// 冲突后允许重新提交的次数
    pub max_conflict_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry: RetryPolicy::default(),
            op_timeout: Duration::from_secs(crate::storage::OP_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(5),
            missing_threshold: 3,
            watch_mode: WatchMode::Auto,
            max_conflict_retries: 1,
        }
    }
}

/// 正在运行的会话
struct ActiveSession {
    id: String,
    origin: SessionOrigin,
    started_at: i64,
    cancel: CancellationToken,
}

/// 同步引擎
pub struct SyncEngine {
    remote: Arc<dyn RemoteStore>,
    snapshot: Arc<SnapshotStore>,
    tracked: Arc<TrackedPaths>,
    status: Arc<StatusReporter>,
    pending: Arc<PendingSet>,
    scanner: Arc<ChangeScanner>,
    runner: JobRunner,
    config: SyncConfig,
    history: Option<Arc<SqlitePool>>,
    /// 当前会话的取消令牌
    session_cancel: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

impl SyncEngine {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        snapshot: Arc<SnapshotStore>,
        tracked: TrackedPaths,
        config: SyncConfig,
    ) -> Self {
        let tracked = Arc::new(tracked);
        let status = Arc::new(StatusReporter::new(snapshot.clone()));
        let pending = Arc::new(PendingSet::new());
        let scanner = Arc::new(ChangeScanner::new(
            snapshot.clone(),
            tracked.clone(),
            pending.clone(),
            status.clone(),
            config.missing_threshold,
        ));
        let runner = JobRunner::new(
            remote.clone(),
            snapshot.clone(),
            Arc::new(PathLocks::new()),
            pending.clone(),
            config.retry,
            config.op_timeout,
            config.max_conflict_retries,
        );

        Self {
            remote,
            snapshot,
            tracked,
            status,
            pending,
            scanner,
            runner,
            config,
            history: None,
            session_cancel: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// 使用数据库持久化快照与会话历史
    pub async fn open(
        db: Arc<SqlitePool>,
        remote: Arc<dyn RemoteStore>,
        specs: Vec<String>,
        config: SyncConfig,
    ) -> anyhow::Result<Self> {
        let snapshot = Arc::new(SnapshotStore::with_persistence(FileStateManager::new(db.clone())).await?);
        let tracked = TrackedPaths::new(specs, PathResolver::new());
        Ok(Self::new(remote, snapshot, tracked, config).with_history(db))
    }

    /// 会话结束时写入 sync_logs
    pub fn with_history(mut self, db: Arc<SqlitePool>) -> Self {
        self.history = Some(db);
        self
    }

    pub fn status(&self) -> &Arc<StatusReporter> {
        &self.status
    }

    pub fn snapshot(&self) -> &Arc<SnapshotStore> {
        &self.snapshot
    }

    pub fn scanner(&self) -> &Arc<ChangeScanner> {
        &self.scanner
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn set_tracked_specs(&self, specs: Vec<String>) {
        self.tracked.set_specs(specs).await;
    }

    pub async fn tracked_specs(&self) -> Vec<String> {
        self.tracked.specs().await
    }

    /// 显式同步：强制全量扫描后执行一次会话。已有会话运行时拒绝。
    pub async fn start_sync(&self) -> Result<SessionSummary, EngineError> {
        let session = self.begin(SessionOrigin::Manual).await?;
        self.check_remote(&session).await?;
        let events = self.scanner.scan(true).await;
        Ok(self.run_session(session, events).await)
    }

    /// 处理检测器产生的事件
    pub async fn sync_events(&self, events: Vec<ChangeEvent>) -> Result<SessionSummary, EngineError> {
        let session = self.begin(SessionOrigin::Watcher).await?;
        if let Err(e) = self.check_remote(&session).await {
            for event in &events {
                self.pending.remove(&event.path).await;
            }
            return Err(e);
        }
        Ok(self.run_session(session, events).await)
    }

    /// 请求停止当前会话；已开始的任务会执行完。返回是否有会话在运行。
    pub async fn stop_sync(&self) -> bool {
        match self.session_cancel.lock().await.as_ref() {
            Some(token) => {
                info!("请求停止同步会话");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// 停止检测循环与当前会话
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// 启动变更检测与事件消费两个后台任务
    pub async fn spawn_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let (tx, rx) = mpsc::channel(64);
        let detector = build_detector(
            self.config.watch_mode,
            self.scanner.clone(),
            self.config.poll_interval,
        )
        .await;
        info!("变更检测方式: {}", detector.name());

        tokio::spawn(detector.run(tx, self.shutdown.child_token()));
        let engine = self.clone();
        tokio::spawn(async move { engine.run_watch_loop(rx).await })
    }

    /// 消费检测事件；有会话在运行时排队等待
    pub async fn run_watch_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Vec<ChangeEvent>>) {
        let mut state_rx = self.status.subscribe();

        loop {
            let mut events = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                batch = rx.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };
            while let Ok(more) = rx.try_recv() {
                events.extend(more);
            }

            loop {
                // 显式会话运行中：等它结束
                let idle = tokio::select! {
                    _ = self.shutdown.cancelled() => false,
                    r = state_rx.wait_for(|s| *s != SessionState::Running) => r.is_ok(),
                };
                if !idle {
                    return;
                }

                match self.sync_events(events.clone()).await {
                    Err(EngineError::SessionInProgress) => continue,
                    Err(e) => {
                        warn!("检测事件同步失败: {}", e);
                        break;
                    }
                    Ok(summary) => {
                        debug!("检测事件同步完成: {} ({})", summary.id, summary.state);
                        break;
                    }
                }
            }
        }
        debug!("事件消费循环已停止");
    }

    async fn begin(&self, origin: SessionOrigin) -> Result<ActiveSession, EngineError> {
        let id = uuid::Uuid::new_v4().to_string();
        // 持有令牌槽再进入 Running，stop_sync 看到 Running 时一定能取到令牌
        let mut slot = self.session_cancel.lock().await;
        if !self.status.try_begin_session(&id).await {
            debug!("已有同步会话在运行，拒绝新的 {} 会话", origin);
            return Err(EngineError::SessionInProgress);
        }

        let cancel = self.shutdown.child_token();
        *slot = Some(cancel.clone());
        drop(slot);
        Ok(ActiveSession {
            id,
            origin,
            started_at: chrono::Utc::now().timestamp_millis(),
            cancel,
        })
    }

    /// 会话开始前的连通性检查；失败时中止会话
    async fn check_remote(&self, session: &ActiveSession) -> Result<(), EngineError> {
        let result = match tokio::time::timeout(self.config.op_timeout, self.remote.check()).await {
            Ok(r) => r,
            Err(_) => Err(RemoteError::Unavailable("connectivity check timed out".to_string())),
        };

        if let Err(e) = result {
            error!("远程存储不可达 ({}), 会话 {} 未启动: {}", self.remote.name(), session.id, e);
            *self.session_cancel.lock().await = None;
            let err = EngineError::RemoteUnreachable(e);
            self.status.abort_session(err.to_string()).await;
            return Err(err);
        }
        Ok(())
    }

    /// 事件按路径合并为任务：同一路径只保留最后一次观测
    async fn plan_jobs(&self, events: Vec<ChangeEvent>) -> Vec<SyncJob> {
        let mut latest: BTreeMap<PathBuf, ChangeEvent> = BTreeMap::new();
        for event in events {
            latest.insert(event.path.clone(), event);
        }

        let mut jobs = Vec::with_capacity(latest.len());
        for (path, event) in latest {
            let record = self.snapshot.get(&path).await;
            let base_version = record
                .as_ref()
                .and_then(|r| r.remote.as_ref())
                .map(|r| r.version.clone());

            let direction = match event.kind {
                ChangeKind::Deleted => {
                    if base_version.is_none() {
                        // 从未上传过，直接停止跟踪
                        self.snapshot.remove(&path).await;
                        self.pending.remove(&path).await;
                        continue;
                    }
                    JobDirection::Delete
                }
                ChangeKind::Created | ChangeKind::Modified => {
                    // 排队期间已经被其它会话同步
                    if record
                        .as_ref()
                        .is_some_and(|r| r.is_clean() && r.state == FileSyncState::Synced)
                    {
                        self.pending.remove(&path).await;
                        continue;
                    }
                    JobDirection::Upload
                }
            };

            jobs.push(SyncJob::new(path, direction, base_version, event.observed_at));
        }
        jobs
    }

    async fn run_session(&self, session: ActiveSession, events: Vec<ChangeEvent>) -> SessionSummary {
        let jobs = self.plan_jobs(events).await;
        info!(
            "开始同步会话: {} ({}, {} 个任务, 远程 {})",
            session.id,
            session.origin,
            jobs.len(),
            self.remote.name()
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut handles: Vec<(JobReport, JoinHandle<JobReport>)> = Vec::new();
        let mut reports = Vec::with_capacity(jobs.len());

        for job in jobs {
            if session.cancel.is_cancelled() {
                reports.push(self.cancel_job(job).await);
                continue;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => permit.ok(),
                _ = session.cancel.cancelled() => None,
            };
            let Some(permit) = permit else {
                reports.push(self.cancel_job(job).await);
                continue;
            };

            let placeholder = JobReport::from(&job);
            let runner = self.runner.clone();
            let handle = tokio::spawn(async move {
                let report = runner.run(job).await;
                drop(permit);
                report
            });
            handles.push((placeholder, handle));
        }

        // 等待所有任务完成
        let (placeholders, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        let results = futures::future::join_all(handles).await;
        for (placeholder, result) in placeholders.into_iter().zip(results) {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!("任务异常退出: {}: {}", placeholder.path.display(), e);
                    self.pending.remove(&placeholder.path).await;
                    reports.push(JobReport {
                        state: JobState::Failed(JobErrorKind::Remote),
                        error: Some(JobError::new(JobErrorKind::Remote, e.to_string())),
                        ..placeholder
                    });
                }
            }
        }

        let state = if reports.iter().any(|r| r.state.is_failure()) {
            SessionState::PartialFailure
        } else if session.cancel.is_cancelled() && reports.iter().any(|r| r.state == JobState::Cancelled) {
            SessionState::Cancelled
        } else {
            SessionState::Complete
        };

        let summary = SessionSummary {
            id: session.id,
            origin: session.origin,
            started_at: session.started_at,
            finished_at: chrono::Utc::now().timestamp_millis(),
            state,
            jobs: reports,
        };

        if let Some(db) = &self.history {
            if let Err(e) = SessionLog::from_summary(&summary).insert(db).await {
                warn!("保存同步历史失败: {}", e);
            }
        }

        *self.session_cancel.lock().await = None;
        self.status.finish_session(summary.clone()).await;
        summary
    }

    async fn cancel_job(&self, job: SyncJob) -> JobReport {
        self.pending.remove(&job.path).await;
        job.finish_without_running(JobState::Cancelled)
    }
}
