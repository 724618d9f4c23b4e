pub mod memory;
pub mod operator;

use crate::db::{StorageConfig, StorageType};
use crate::error::RemoteError;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

pub use operator::OpendalStore;
pub use memory::MemoryStore;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, delete 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 远程对象键前缀
pub const KEY_PREFIX: &str = "dotfiles/";

/// 随对象一起保存的元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// 本地绝对路径（仅用于展示与恢复）
    pub path: String,
    pub hash: String,
    pub size: u64,
    /// 上传方记录的本地修改时间（毫秒）
    pub modified_time: i64,
}

/// 远程对象引用：键 + 版本 + 远程指纹
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObjectRef {
    pub key: String,
    pub version: String,
    pub meta: ObjectMeta,
}

/// 由绝对路径确定性地派生远程键
pub fn remote_key(path: &Path) -> String {
    let hash = blake3::hash(path.to_string_lossy().as_bytes());
    format!("{}{}", KEY_PREFIX, hash.to_hex())
}

/// 远程存储能力接口。
///
/// 不包含任何重试逻辑，重试与退避统一由引擎负责。`expected_version` 为
/// `None` 表示调用方认为对象尚不存在。
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// 写入对象，返回新版本；远程版本与 `expected_version` 不符时返回 VersionConflict
    async fn put(
        &self,
        key: &str,
        content: Bytes,
        expected_version: Option<&str>,
        meta: &ObjectMeta,
    ) -> Result<String, RemoteError>;

    /// 读取对象内容
    async fn get(&self, key: &str) -> Result<Bytes, RemoteError>;

    /// 删除对象，冲突语义与 put 相同；对象已不存在视为成功
    async fn delete(&self, key: &str, expected_version: Option<&str>) -> Result<(), RemoteError>;

    /// 获取对象引用
    async fn head(&self, key: &str) -> Result<Option<RemoteObjectRef>, RemoteError>;

    /// 连通性检查（会话开始时调用一次）
    async fn check(&self) -> Result<(), RemoteError> {
        Ok(())
    }

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 比较当前远程版本与调用方期望的基础版本
pub(crate) fn ensure_version(
    key: &str,
    current: Option<&str>,
    expected: Option<&str>,
) -> Result<(), RemoteError> {
    if current == expected {
        return Ok(());
    }
    Err(RemoteError::VersionConflict {
        key: key.to_string(),
        expected: expected.map(str::to_string),
        actual: current.map(str::to_string),
    })
}

/// 根据配置创建远程存储实例
pub async fn create_remote(config: &StorageConfig) -> Result<Arc<dyn RemoteStore>> {
    match config.typ {
        StorageType::Memory => {
            tracing::warn!("使用内存远程存储，进程退出后数据丢失");
            Ok(Arc::new(MemoryStore::new()) as Arc<dyn RemoteStore>)
        }
        _ => Ok(Arc::new(OpendalStore::from_config(config)?) as Arc<dyn RemoteStore>),
    }
}
