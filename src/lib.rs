use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;

pub mod commands;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod logging;
pub mod storage;

pub use self::core::{SessionSummary, StatusSnapshot, SyncConfig, SyncEngine};
pub use db::models::{StorageConfig, StorageType};
pub use error::{EngineError, JobError, JobErrorKind, PathError, RemoteError, SnapshotError};

/// 数据库文件名
const DB_FILE: &str = "dotsync.db";

/// 应用状态，在各命令之间共享
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub engine: Arc<SyncEngine>,
    pub config_dir: PathBuf,
}

impl AppState {
    pub async fn new(
        config_dir: PathBuf,
        remote: Arc<dyn storage::RemoteStore>,
        specs: Vec<String>,
        sync_config: SyncConfig,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config_dir)?;

        // 初始化数据库（带连接池配置）并运行迁移
        let db = Arc::new(db::connect(&config_dir.join(DB_FILE)).await?);
        let engine = SyncEngine::open(db.clone(), remote, specs, sync_config).await?;

        Ok(Self {
            db,
            engine: Arc::new(engine),
            config_dir,
        })
    }

    /// 清理资源（进程退出时调用）
    pub async fn cleanup(&self) {
        tracing::info!("正在清理应用资源...");

        // 1. 停止当前会话，已开始的任务会执行完
        if self.engine.stop_sync().await {
            let mut state_rx = self.engine.status().subscribe();
            let _ = state_rx
                .wait_for(|s| *s != crate::core::SessionState::Running)
                .await;
        }

        // 2. 停止变更检测
        self.engine.shutdown();

        // 3. 关闭数据库连接池
        tracing::debug!("关闭数据库连接池...");
        self.db.close().await;

        tracing::info!("资源清理完成");
    }
}

/// 平台目录
pub mod dirs {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        let var = if cfg!(target_os = "windows") {
            "USERPROFILE"
        } else {
            "HOME"
        };
        std::env::var_os(var)
            .filter(|h| !h.is_empty())
            .map(PathBuf::from)
    }

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            home_dir().map(|h| h.join("Library").join("Application Support"))
        } else {
            // Linux：优先 XDG_CONFIG_HOME
            std::env::var_os("XDG_CONFIG_HOME")
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .or_else(|| home_dir().map(|h| h.join(".config")))
        }
    }

    /// 应用数据目录；默认目录的 config.json 中 `data_path` 可指定自定义位置
    pub fn app_config_dir() -> PathBuf {
        let default_config_dir = config_dir()
            .map(|p| p.join("dotsync"))
            .unwrap_or_else(|| PathBuf::from(".dotsync"));

        let config_file = default_config_dir.join(crate::config::CONFIG_FILE);
        std::fs::read_to_string(&config_file)
            .ok()
            .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
            .and_then(|config| config.get("data_path")?.as_str().map(PathBuf::from))
            .filter(|p| p.is_dir())
            .inspect(|p| tracing::debug!("使用自定义数据路径: {:?}", p))
            .unwrap_or(default_config_dir)
    }
}
