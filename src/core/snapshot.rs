//! 文件快照存储：每个跟踪路径的观测指纹、已同步指纹与同步状态

use crate::core::file_state::{fingerprint_file, FileFingerprint, FileState, FileStateManager, FileSyncState};
use crate::error::SnapshotError;
use crate::storage::{ObjectMeta, RemoteObjectRef};
use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// 单个跟踪路径的记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub path: PathBuf,
    /// 最近一次观测到的磁盘指纹（文件缺失时为 None）
    pub observed: Option<FileFingerprint>,
    /// 最近一次成功上传的指纹
    pub synced: Option<FileFingerprint>,
    pub state: FileSyncState,
    /// 缓存的远程对象引用（成功与冲突时刷新）
    pub remote: Option<RemoteObjectRef>,
    pub last_error: Option<String>,
    /// 连续观测到文件缺失的次数
    pub missing_checks: u32,
}

impl FileRecord {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            observed: None,
            synced: None,
            state: FileSyncState::Unsynced,
            remote: None,
            last_error: None,
            missing_checks: 0,
        }
    }

    /// 观测内容与已同步内容一致
    pub fn is_clean(&self) -> bool {
        match (&self.observed, &self.synced) {
            (Some(observed), Some(synced)) => observed.same_content(synced),
            _ => false,
        }
    }
}

fn object_meta(path: &Path, fp: &FileFingerprint) -> ObjectMeta {
    ObjectMeta {
        path: path.to_string_lossy().to_string(),
        hash: fp.hash.clone(),
        size: fp.size,
        modified_time: fp.modified_time,
    }
}

/// 快照存储。所有修改都是对单条记录的整体替换，在短暂的写锁内完成。
#[derive(Default)]
pub struct SnapshotStore {
    records: RwLock<HashMap<PathBuf, FileRecord>>,
    persistence: Option<FileStateManager>,
}

impl SnapshotStore {
    /// 不持久化的快照存储
    pub fn new() -> Self {
        Self::default()
    }

    /// 从数据库加载已同步的指纹作为初始状态
    pub async fn with_persistence(manager: FileStateManager) -> Result<Self> {
        let states = manager.get_all_states().await?;
        let mut records = HashMap::with_capacity(states.len());

        for (path, state) in states {
            let path = PathBuf::from(path);
            let fp = state.fingerprint();
            let remote = RemoteObjectRef {
                key: state.remote_key.clone(),
                version: state.remote_version.clone(),
                meta: object_meta(&path, &fp),
            };
            records.insert(
                path.clone(),
                FileRecord {
                    path,
                    observed: Some(fp.clone()),
                    synced: Some(fp),
                    state: FileSyncState::Synced,
                    remote: Some(remote),
                    last_error: None,
                    missing_checks: 0,
                },
            );
        }

        debug!("快照存储已从数据库恢复 {} 条记录", records.len());
        Ok(Self {
            records: RwLock::new(records),
            persistence: Some(manager),
        })
    }

    /// 读取磁盘状态；大小与修改时间未变时复用已知哈希。不修改存储。
    pub async fn observe(&self, path: &Path) -> Result<FileFingerprint, SnapshotError> {
        let known = self
            .records
            .read()
            .await
            .get(path)
            .and_then(|r| r.observed.clone().or_else(|| r.synced.clone()));

        let owned = path.to_path_buf();
        match tokio::task::spawn_blocking(move || fingerprint_file(&owned, known.as_ref())).await {
            Ok(result) => result,
            Err(e) => Err(SnapshotError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::other(e.to_string()),
            }),
        }
    }

    pub async fn get(&self, path: &Path) -> Option<FileRecord> {
        self.records.read().await.get(path).cloned()
    }

    pub async fn contains(&self, path: &Path) -> bool {
        self.records.read().await.contains_key(path)
    }

    /// 替换一条记录的观测指纹与状态
    pub async fn commit(&self, path: &Path, fingerprint: FileFingerprint, state: FileSyncState) {
        self.update(path, |record| {
            record.observed = Some(fingerprint);
            record.state = state;
            record.missing_checks = 0;
        })
        .await;
    }

    /// 更新观测指纹；内容与已同步版本不同的 Synced 记录降为 Unsynced，其余状态保留。
    /// 返回更新后的记录
    pub async fn record_observed(&self, path: &Path, fingerprint: FileFingerprint) -> FileRecord {
        self.update(path, |record| {
            record.observed = Some(fingerprint);
            record.missing_checks = 0;
            if record.state == FileSyncState::Synced && !record.is_clean() {
                record.state = FileSyncState::Unsynced;
            }
        })
        .await
    }

    /// 上传（或采纳远程版本）成功：observed = synced = 指纹，状态 Synced，并持久化
    pub async fn commit_synced(&self, path: &Path, fingerprint: FileFingerprint, remote: RemoteObjectRef) {
        let state = FileState {
            file_path: path.to_string_lossy().to_string(),
            file_size: fingerprint.size as i64,
            modified_time: fingerprint.modified_time,
            checksum: fingerprint.hash.clone(),
            remote_key: remote.key.clone(),
            remote_version: remote.version.clone(),
            last_sync_time: Some(chrono::Utc::now().timestamp()),
        };

        self.update(path, |record| {
            record.observed = Some(fingerprint.clone());
            record.synced = Some(fingerprint);
            record.state = FileSyncState::Synced;
            record.remote = Some(remote);
            record.last_error = None;
            record.missing_checks = 0;
        })
        .await;

        if let Some(manager) = &self.persistence {
            if let Err(e) = manager.upsert_file_state(&state).await {
                warn!("保存文件状态失败: {}: {}", path.display(), e);
            }
        }
    }

    /// 刷新缓存的远程引用（冲突时使用）
    pub async fn set_remote(&self, path: &Path, remote: Option<RemoteObjectRef>) {
        self.update(path, |record| record.remote = remote).await;
    }

    pub async fn mark(&self, path: &Path, state: FileSyncState) {
        self.update(path, |record| {
            record.state = state;
            if state == FileSyncState::Synced {
                record.last_error = None;
            }
        })
        .await;
    }

    /// 记录错误信息；`state` 为 None 时保持当前状态
    pub async fn set_error(&self, path: &Path, state: Option<FileSyncState>, message: impl Into<String>) {
        let message = message.into();
        self.update(path, |record| {
            if let Some(state) = state {
                record.state = state;
            }
            record.last_error = Some(message);
        })
        .await;
    }

    /// 记录一次缺失观测，返回连续缺失次数
    pub async fn record_missing(&self, path: &Path) -> u32 {
        self.update(path, |record| {
            record.observed = None;
            record.missing_checks += 1;
        })
        .await
        .missing_checks
    }

    /// 移出跟踪集合，同时删除持久化的同步记录
    pub async fn remove(&self, path: &Path) -> Option<FileRecord> {
        let removed = self.records.write().await.remove(path);

        if let Some(manager) = &self.persistence {
            if let Err(e) = manager.delete_file_state(&path.to_string_lossy()).await {
                warn!("删除文件状态失败: {}: {}", path.display(), e);
            }
        }
        removed
    }

    pub async fn paths(&self) -> Vec<PathBuf> {
        self.records.read().await.keys().cloned().collect()
    }

    pub async fn records(&self) -> Vec<FileRecord> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    async fn update<F>(&self, path: &Path, apply: F) -> FileRecord
    where
        F: FnOnce(&mut FileRecord),
    {
        let mut records = self.records.write().await;
        let mut record = records
            .get(path)
            .cloned()
            .unwrap_or_else(|| FileRecord::new(path));
        apply(&mut record);
        records.insert(path.to_path_buf(), record.clone());
        record
    }
}
