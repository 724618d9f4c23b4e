//! 错误类型定义

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 路径规格无法解析（不致命，跳过并上报）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("cannot resolve path spec `{spec}`: {reason}")]
pub struct PathError {
    pub spec: String,
    pub reason: String,
}

impl PathError {
    pub fn new(spec: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            spec: spec.into(),
            reason: reason.into(),
        }
    }
}

/// 本地文件观测错误
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// 文件不存在（引擎据此安排删除任务）
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    /// 路径存在但不是普通文件
    #[error("not a regular file: {0}")]
    NotAFile(PathBuf),

    /// 文件不可读，下一个检测周期重试
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SnapshotError {
    /// 把 io 错误按 NotFound / 其它 分类
    pub fn from_io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        let path = path.into();
        if err.kind() == std::io::ErrorKind::NotFound {
            SnapshotError::NotFound(path)
        } else {
            SnapshotError::Io { path, source: err }
        }
    }
}

/// 远程存储错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// 乐观并发失败：远程版本已前进
    #[error("version conflict on {key}: expected {expected:?}, found {actual:?}")]
    VersionConflict {
        key: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// 暂时性传输错误（含调用超时）
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    #[error("remote object not found: {0}")]
    NotFound(String),

    #[error("remote error: {0}")]
    Other(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_))
    }
}

/// 任务终止失败的分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    Unauthorized,
    PersistentConflict,
    RetriesExhausted,
    InvalidLocalState,
    Remote,
}

impl std::fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobErrorKind::Unauthorized => write!(f, "unauthorized"),
            JobErrorKind::PersistentConflict => write!(f, "persistent_conflict"),
            JobErrorKind::RetriesExhausted => write!(f, "retries_exhausted"),
            JobErrorKind::InvalidLocalState => write!(f, "invalid_local_state"),
            JobErrorKind::Remote => write!(f, "remote"),
        }
    }
}

/// 任务失败信息（保留在 StatusReporter 中直到下次会话开始）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// 会话级错误
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// 已有会话在运行，显式启动被拒绝
    #[error("a sync session is already running")]
    SessionInProgress,

    /// 远程存储完全不可达，会话未启动
    #[error("remote store unreachable: {0}")]
    RemoteUnreachable(RemoteError),
}
