//! 同步状态汇报：供展示层轮询的只读快照

use crate::core::file_state::FileSyncState;
use crate::core::job::{JobDirection, JobReport, JobState};
use crate::core::snapshot::SnapshotStore;
use crate::error::PathError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

/// 会话整体状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Running,
    PartialFailure,
    Complete,
    Cancelled,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Running => write!(f, "running"),
            SessionState::PartialFailure => write!(f, "partial_failure"),
            SessionState::Complete => write!(f, "complete"),
            SessionState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// 会话触发来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOrigin {
    /// 显式调用 start_sync
    Manual,
    /// 变更检测器产生的事件
    Watcher,
}

impl std::fmt::Display for SessionOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionOrigin::Manual => write!(f, "manual"),
            SessionOrigin::Watcher => write!(f, "watcher"),
        }
    }
}

/// 一次同步会话的汇总
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub origin: SessionOrigin,
    pub started_at: i64,
    pub finished_at: i64,
    pub state: SessionState,
    pub jobs: Vec<JobReport>,
}

impl SessionSummary {
    fn count(&self, direction: JobDirection) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.direction == direction && j.state == JobState::Succeeded)
            .count()
    }

    pub fn uploaded(&self) -> usize {
        self.count(JobDirection::Upload)
    }

    pub fn deleted(&self) -> usize {
        self.count(JobDirection::Delete)
    }

    pub fn failed(&self) -> impl Iterator<Item = &JobReport> {
        self.jobs.iter().filter(|j| j.state.is_failure())
    }
}

/// 单个文件的展示状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStatus {
    pub state: FileSyncState,
    pub last_error: Option<String>,
}

/// 状态快照
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub session_state: SessionState,
    pub session_id: Option<String>,
    pub files: BTreeMap<PathBuf, FileStatus>,
    /// 上一次会话中失败的任务，保留到下次会话开始
    pub failed_jobs: Vec<JobReport>,
    pub last_session: Option<SessionSummary>,
    /// 会话未能启动的原因（例如远程不可达）
    pub session_error: Option<String>,
    pub path_errors: Vec<PathError>,
}

#[derive(Debug, Default)]
struct ReporterState {
    session_id: Option<String>,
    failed_jobs: Vec<JobReport>,
    last_session: Option<SessionSummary>,
    session_error: Option<String>,
    path_errors: Vec<PathError>,
}

/// 状态汇报器。会话状态放在 watch 通道里，状态变化即通知订阅者。
pub struct StatusReporter {
    state: watch::Sender<SessionState>,
    inner: RwLock<ReporterState>,
    snapshot: Arc<SnapshotStore>,
}

impl StatusReporter {
    pub fn new(snapshot: Arc<SnapshotStore>) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            state,
            inner: RwLock::new(ReporterState::default()),
            snapshot,
        }
    }

    pub fn session_state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.session_state() == SessionState::Running
    }

    /// 订阅会话状态变化
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// 原子地进入 Running；已有会话在运行时返回 false
    pub async fn try_begin_session(&self, session_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let started = self.state.send_if_modified(|state| {
            if *state == SessionState::Running {
                false
            } else {
                *state = SessionState::Running;
                true
            }
        });

        if started {
            inner.session_id = Some(session_id.to_string());
            inner.failed_jobs.clear();
            inner.session_error = None;
        }
        started
    }

    /// 会话结束，记录汇总与失败任务
    pub async fn finish_session(&self, summary: SessionSummary) {
        let mut inner = self.inner.write().await;
        inner.failed_jobs = summary.failed().cloned().collect();
        inner.session_id = None;

        info!(
            "同步会话结束: {} {} (任务 {}, 失败 {})",
            summary.id,
            summary.state,
            summary.jobs.len(),
            inner.failed_jobs.len()
        );

        let state = summary.state;
        inner.last_session = Some(summary);
        self.state.send_replace(state);
    }

    /// 会话未能开始（例如远程不可达），回到 Idle 并记录原因
    pub async fn abort_session(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("同步会话中止: {}", reason);

        let mut inner = self.inner.write().await;
        inner.session_id = None;
        inner.session_error = Some(reason);
        self.state.send_replace(SessionState::Idle);
    }

    pub async fn set_path_errors(&self, errors: Vec<PathError>) {
        self.inner.write().await.path_errors = errors;
    }

    pub async fn last_session(&self) -> Option<SessionSummary> {
        self.inner.read().await.last_session.clone()
    }

    /// 组装当前快照
    pub async fn snapshot(&self) -> StatusSnapshot {
        let files = self
            .snapshot
            .records()
            .await
            .into_iter()
            .map(|r| {
                (
                    r.path,
                    FileStatus {
                        state: r.state,
                        last_error: r.last_error,
                    },
                )
            })
            .collect();

        let inner = self.inner.read().await;
        StatusSnapshot {
            session_state: self.session_state(),
            session_id: inner.session_id.clone(),
            files,
            failed_jobs: inner.failed_jobs.clone(),
            last_session: inner.last_session.clone(),
            session_error: inner.session_error.clone(),
            path_errors: inner.path_errors.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{JobError, JobErrorKind};
    use std::path::Path;

    fn report(path: &str, state: JobState) -> JobReport {
        let error = match state {
            JobState::Failed(kind) => Some(JobError::new(kind, "x")),
            _ => None,
        };
        JobReport {
            id: path.to_string(),
            path: PathBuf::from(path),
            direction: JobDirection::Upload,
            state,
            attempts: 1,
            error,
        }
    }

    fn summary(state: SessionState, jobs: Vec<JobReport>) -> SessionSummary {
        SessionSummary {
            id: "s1".to_string(),
            origin: SessionOrigin::Manual,
            started_at: 0,
            finished_at: 1,
            state,
            jobs,
        }
    }

    #[tokio::test]
    async fn test_single_session_guard() {
        let reporter = StatusReporter::new(Arc::new(SnapshotStore::new()));
        assert!(reporter.try_begin_session("a").await);
        assert!(!reporter.try_begin_session("b").await);
        assert_eq!(reporter.snapshot().await.session_id.as_deref(), Some("a"));

        reporter.finish_session(summary(SessionState::Complete, vec![])).await;
        assert_eq!(reporter.session_state(), SessionState::Complete);
        assert!(reporter.try_begin_session("b").await);
    }

    #[tokio::test]
    async fn test_failed_jobs_retained_until_next_session() {
        let reporter = StatusReporter::new(Arc::new(SnapshotStore::new()));
        let mut rx = reporter.subscribe();

        reporter.try_begin_session("a").await;
        reporter
            .finish_session(summary(
                SessionState::PartialFailure,
                vec![
                    report("/a", JobState::Succeeded),
                    report("/b", JobState::Failed(JobErrorKind::RetriesExhausted)),
                ],
            ))
            .await;

        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), SessionState::PartialFailure);

        let snap = reporter.snapshot().await;
        assert_eq!(snap.failed_jobs.len(), 1);
        assert_eq!(snap.failed_jobs[0].path, Path::new("/b"));

        reporter.try_begin_session("b").await;
        assert!(reporter.snapshot().await.failed_jobs.is_empty());
    }

    #[tokio::test]
    async fn test_abort_records_session_error() {
        let store = Arc::new(SnapshotStore::new());
        store.mark(Path::new("/home/u/.vimrc"), FileSyncState::Synced).await;
        let reporter = StatusReporter::new(store);

        reporter.try_begin_session("a").await;
        reporter.abort_session("remote store unreachable").await;

        let snap = reporter.snapshot().await;
        assert_eq!(snap.session_state, SessionState::Idle);
        assert_eq!(snap.session_error.as_deref(), Some("remote store unreachable"));
        assert_eq!(snap.files[Path::new("/home/u/.vimrc")].state, FileSyncState::Synced);
    }
}
