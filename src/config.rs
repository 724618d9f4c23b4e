//! 应用配置模块：config.json 中各键对应的配置结构

use crate::core::watcher::WatchMode;
use crate::core::{RetryPolicy, SyncConfig};
use crate::db::StorageConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

/// 配置文件名
pub const CONFIG_FILE: &str = "config.json";

/// 读取 config.json 中的某个键，缺失或格式错误时返回 None
fn load_section<T: DeserializeOwned>(config_dir: &Path, key: &str) -> Option<T> {
    let content = fs::read_to_string(config_dir.join(CONFIG_FILE)).ok()?;
    let config = serde_json::from_str::<serde_json::Value>(&content).ok()?;
    let section = config.get(key)?;
    match serde_json::from_value::<T>(section.clone()) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("配置项 {} 格式错误，使用默认值: {}", key, e);
            None
        }
    }
}

/// 写回 config.json 中的某个键，保留其它键
fn save_section<T: Serialize>(config_dir: &Path, key: &str, value: &T) -> io::Result<()> {
    let config_file = config_dir.join(CONFIG_FILE);

    // 读取现有配置
    let mut config: serde_json::Value = if config_file.exists() {
        let content = fs::read_to_string(&config_file)?;
        serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
    } else {
        serde_json::json!({})
    };

    config[key] = serde_json::to_value(value).map_err(io::Error::other)?;

    let content = serde_json::to_string_pretty(&config).map_err(io::Error::other)?;
    fs::write(&config_file, content)
}

/// 同步引擎配置（config.json 的 `sync` 键）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettings {
    /// 最大并发任务数
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// 每个任务的总尝试次数
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// 轮询间隔（秒）
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// 单次远程调用超时（秒）
    #[serde(default = "default_op_timeout_secs")]
    pub op_timeout_secs: u64,
    #[serde(default = "default_missing_threshold")]
    pub missing_threshold: u32,
    #[serde(default)]
    pub watch_mode: WatchMode,
}

fn default_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    2000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_op_timeout_secs() -> u64 {
    crate::storage::OP_TIMEOUT_SECS
}

fn default_missing_threshold() -> u32 {
    3
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            poll_interval_secs: default_poll_interval_secs(),
            op_timeout_secs: default_op_timeout_secs(),
            missing_threshold: default_missing_threshold(),
            watch_mode: WatchMode::default(),
        }
    }
}

impl EngineSettings {
    /// 从配置文件加载引擎配置
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "sync").unwrap_or_default()
    }

    /// 保存引擎配置
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        save_section(config_dir, "sync", self)
    }

    /// 把取值限制在合理范围内
    pub fn clamped(mut self) -> Self {
        self.concurrency = self.concurrency.clamp(1, 32);
        self.max_attempts = self.max_attempts.clamp(1, 20);
        self.poll_interval_secs = self.poll_interval_secs.max(1);
        self.op_timeout_secs = self.op_timeout_secs.max(1);
        self.missing_threshold = self.missing_threshold.max(1);
        self
    }
}

impl From<&EngineSettings> for SyncConfig {
    fn from(settings: &EngineSettings) -> Self {
        SyncConfig {
            concurrency: settings.concurrency,
            retry: RetryPolicy::new(
                settings.max_attempts,
                Duration::from_millis(settings.retry_base_delay_ms),
                Duration::from_millis(settings.retry_max_delay_ms),
            ),
            op_timeout: Duration::from_secs(settings.op_timeout_secs),
            poll_interval: Duration::from_secs(settings.poll_interval_secs),
            missing_threshold: settings.missing_threshold,
            watch_mode: settings.watch_mode,
            ..SyncConfig::default()
        }
    }
}

/// 远程存储配置（config.json 的 `remote` 键），只由启动流程读取
pub fn load_remote_config(config_dir: &Path) -> Option<StorageConfig> {
    load_section(config_dir, "remote")
}

/// 跟踪路径列表文件：每行一个规格
pub const PATHS_FILE: &str = "paths";

/// 读取跟踪路径规格；文件不存在时返回空列表
pub fn load_path_specs(config_dir: &Path) -> io::Result<Vec<String>> {
    match fs::read_to_string(config_dir.join(PATHS_FILE)) {
        Ok(content) => Ok(content.lines().map(str::to_string).collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}
