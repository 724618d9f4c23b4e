use serde::{Deserialize, Serialize};

/// 远程存储类型
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// 进程内存储，用于试运行
    Memory,
    Local,
    S3,
    WebDav,
}

/// 远程存储配置（凭据只透传给适配器构造函数）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub typ: StorageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// 远程根目录 / 前缀
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self {
            typ: StorageType::Memory,
            path: None,
            bucket: None,
            region: None,
            access_key: None,
            secret_key: None,
            endpoint: None,
            username: None,
            password: None,
            root: None,
        }
    }
}

/// 同步会话历史（sync_logs 表）
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SessionLog {
    pub id: i64,
    pub session_id: String,
    pub origin: String,
    pub start_time: i64,
    pub end_time: i64,
    pub status: String,
    pub jobs_total: i64,
    pub files_uploaded: i64,
    pub files_deleted: i64,
    pub files_conflicted: i64,
    pub files_failed: i64,
    pub files_deferred: i64,
    pub error_message: Option<String>,
}
