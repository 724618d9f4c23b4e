//! 文件指纹与同步状态持久化 - 用于增量同步

use crate::error::SnapshotError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, info};

/// 文件指纹：内容哈希 + 大小 + 修改时间（毫秒）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFingerprint {
    pub hash: String,
    pub size: u64,
    pub modified_time: i64,
}

impl FileFingerprint {
    pub fn from_bytes(data: &[u8], modified_time: i64) -> Self {
        Self {
            hash: calculate_hash(data),
            size: data.len() as u64,
            modified_time,
        }
    }

    /// 内容是否相同（同步决策只看哈希）
    pub fn same_content(&self, other: &FileFingerprint) -> bool {
        self.hash == other.hash
    }

    /// 大小和修改时间都没变，可跳过重新哈希
    fn same_stat(&self, size: u64, modified_time: i64) -> bool {
        self.size == size && self.modified_time == modified_time
    }
}

/// 单个文件的同步状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileSyncState {
    #[default]
    Unsynced,
    Syncing,
    Synced,
    Conflict,
    Error,
}

impl std::fmt::Display for FileSyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileSyncState::Unsynced => write!(f, "unsynced"),
            FileSyncState::Syncing => write!(f, "syncing"),
            FileSyncState::Synced => write!(f, "synced"),
            FileSyncState::Conflict => write!(f, "conflict"),
            FileSyncState::Error => write!(f, "error"),
        }
    }
}

/// 计算内容哈希（BLAKE3，完整 256 位十六进制）
pub fn calculate_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// 流式计算文件哈希，避免一次性读入大文件
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// 文件修改时间（Unix 毫秒）
pub fn modified_millis(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// 读取磁盘状态生成指纹；`known` 的大小和 mtime 未变时直接复用其哈希。
///
/// 阻塞调用，异步上下文中应放到 `spawn_blocking` 里执行。
pub fn fingerprint_file(
    path: &Path,
    known: Option<&FileFingerprint>,
) -> Result<FileFingerprint, SnapshotError> {
    let metadata = std::fs::metadata(path).map_err(|e| SnapshotError::from_io(path, e))?;
    if !metadata.is_file() {
        return Err(SnapshotError::NotAFile(path.to_path_buf()));
    }

    let size = metadata.len();
    let modified_time = modified_millis(&metadata);

    if let Some(known) = known {
        if known.same_stat(size, modified_time) {
            return Ok(known.clone());
        }
    }

    let hash = hash_file(path).map_err(|e| SnapshotError::from_io(path, e))?;
    Ok(FileFingerprint {
        hash,
        size,
        modified_time,
    })
}

/// 已同步文件的持久化记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    pub file_path: String,
    pub file_size: i64,
    pub modified_time: i64,
    pub checksum: String,
    pub remote_key: String,
    pub remote_version: String,
    pub last_sync_time: Option<i64>,
}

impl FileState {
    pub fn fingerprint(&self) -> FileFingerprint {
        FileFingerprint {
            hash: self.checksum.clone(),
            size: self.file_size as u64,
            modified_time: self.modified_time,
        }
    }
}

/// 数据库行
#[derive(Debug, sqlx::FromRow)]
struct FileStateRow {
    file_path: String,
    file_size: i64,
    modified_time: i64,
    checksum: String,
    remote_key: String,
    remote_version: String,
    last_sync_time: Option<i64>,
}

impl From<FileStateRow> for FileState {
    fn from(row: FileStateRow) -> Self {
        FileState {
            file_path: row.file_path,
            file_size: row.file_size,
            modified_time: row.modified_time,
            checksum: row.checksum,
            remote_key: row.remote_key,
            remote_version: row.remote_version,
            last_sync_time: row.last_sync_time,
        }
    }
}

/// 文件状态管理器
#[derive(Clone)]
pub struct FileStateManager {
    db: Arc<SqlitePool>,
}

impl FileStateManager {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// 获取所有已同步文件状态（返回 HashMap 以便快速查找）
    pub async fn get_all_states(&self) -> Result<HashMap<String, FileState>> {
        let rows = sqlx::query_as::<_, FileStateRow>(
            "SELECT file_path, file_size, modified_time, checksum, remote_key, remote_version, last_sync_time
             FROM file_states",
        )
        .fetch_all(&*self.db)
        .await?;

        let map: HashMap<String, FileState> = rows
            .into_iter()
            .map(|row| {
                let state: FileState = row.into();
                (state.file_path.clone(), state)
            })
            .collect();

        debug!("加载了 {} 个文件的同步状态", map.len());
        Ok(map)
    }

    /// 获取单个文件状态
    pub async fn get_file_state(&self, file_path: &str) -> Result<Option<FileState>> {
        let row = sqlx::query_as::<_, FileStateRow>(
            "SELECT file_path, file_size, modified_time, checksum, remote_key, remote_version, last_sync_time
             FROM file_states WHERE file_path = ?",
        )
        .bind(file_path)
        .fetch_optional(&*self.db)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    /// 更新或插入文件状态
    pub async fn upsert_file_state(&self, state: &FileState) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"INSERT INTO file_states (file_path, file_size, modified_time, checksum, remote_key, remote_version, last_sync_time)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(file_path) DO UPDATE SET
                   file_size = excluded.file_size,
                   modified_time = excluded.modified_time,
                   checksum = excluded.checksum,
                   remote_key = excluded.remote_key,
                   remote_version = excluded.remote_version,
                   last_sync_time = excluded.last_sync_time"#,
        )
        .bind(&state.file_path)
        .bind(state.file_size)
        .bind(state.modified_time)
        .bind(&state.checksum)
        .bind(&state.remote_key)
        .bind(&state.remote_version)
        .bind(state.last_sync_time.unwrap_or(now))
        .execute(&*self.db)
        .await?;

        Ok(())
    }

    /// 删除文件状态
    pub async fn delete_file_state(&self, file_path: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM file_states WHERE file_path = ?")
            .bind(file_path)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() > 0 {
            info!("已移除文件同步记录: {}", file_path);
        }
        Ok(())
    }
}
