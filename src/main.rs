use dotsync_lib::config::{load_path_specs, load_remote_config, EngineSettings};
use dotsync_lib::logging::init_logging;
use dotsync_lib::{commands, dirs, storage, AppState, StorageConfig, SyncConfig};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_dir = dirs::app_config_dir();
    std::fs::create_dir_all(&config_dir)?;

    // 初始化日志系统
    init_logging(&config_dir);

    // `--once`：执行一次同步后退出，不启动变更检测
    let once = std::env::args().skip(1).any(|a| a == "--once");

    let remote_config = load_remote_config(&config_dir).unwrap_or_else(|| {
        warn!("config.json 中没有 remote 配置，使用内存存储");
        StorageConfig::memory()
    });
    let remote = storage::create_remote(&remote_config).await?;

    let specs = load_path_specs(&config_dir)?;
    if specs.is_empty() {
        warn!("没有跟踪路径，请在 {} 中每行添加一个路径", config_dir.join("paths").display());
    }

    let settings = EngineSettings::load(&config_dir).clamped();
    let state = AppState::new(config_dir, remote, specs, SyncConfig::from(&settings)).await?;
    info!("dotsync 已启动，远程存储: {:?}", remote_config.typ);

    match commands::sync::start_sync(&state).await {
        Ok(summary) => info!(
            "初始同步完成: {} (上传 {}, 删除 {}, 失败 {})",
            summary.state,
            summary.uploaded(),
            summary.deleted(),
            summary.failed().count()
        ),
        Err(e) => error!("初始同步失败: {}", e),
    }

    if once {
        state.cleanup().await;
        return Ok(());
    }

    let watcher = state.engine.spawn_watcher().await;

    tokio::signal::ctrl_c().await?;
    info!("收到退出信号");
    state.cleanup().await;
    let _ = watcher.await;

    Ok(())
}
