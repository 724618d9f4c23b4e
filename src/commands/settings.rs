//! 引擎配置与跟踪路径命令

use crate::config::{load_path_specs, EngineSettings, PATHS_FILE};
use crate::core::watcher::WatchMode;
use crate::AppState;

/// 获取引擎配置
pub async fn get_engine_settings(state: &AppState) -> Result<EngineSettings, String> {
    Ok(EngineSettings::load(&state.config_dir))
}

/// 部分更新引擎配置；写入 config.json，下次启动引擎时生效
#[allow(clippy::too_many_arguments)]
pub async fn set_engine_settings(
    concurrency: Option<usize>,
    max_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    poll_interval_secs: Option<u64>,
    op_timeout_secs: Option<u64>,
    missing_threshold: Option<u32>,
    watch_mode: Option<WatchMode>,
    state: &AppState,
) -> Result<EngineSettings, String> {
    let mut settings = EngineSettings::load(&state.config_dir);

    if let Some(v) = concurrency {
        settings.concurrency = v;
    }
    if let Some(v) = max_attempts {
        settings.max_attempts = v;
    }
    if let Some(v) = retry_base_delay_ms {
        settings.retry_base_delay_ms = v;
    }
    if let Some(v) = poll_interval_secs {
        settings.poll_interval_secs = v;
    }
    if let Some(v) = op_timeout_secs {
        settings.op_timeout_secs = v;
    }
    if let Some(v) = missing_threshold {
        settings.missing_threshold = v;
    }
    if let Some(v) = watch_mode {
        settings.watch_mode = v;
    }

    let settings = settings.clamped();
    settings.save(&state.config_dir).map_err(|e| e.to_string())?;
    Ok(settings)
}

/// 获取跟踪路径规格
pub async fn get_tracked_paths(state: &AppState) -> Result<Vec<String>, String> {
    Ok(state.engine.tracked_specs().await)
}

/// 替换跟踪路径规格：写回 paths 文件并立即用于下一次扫描
pub async fn set_tracked_paths(specs: Vec<String>, state: &AppState) -> Result<Vec<String>, String> {
    let mut content = specs.join("\n");
    content.push('\n');
    std::fs::write(state.config_dir.join(PATHS_FILE), content)
        .map_err(|e| format!("保存路径列表失败: {}", e))?;

    let specs = load_path_specs(&state.config_dir).map_err(|e| e.to_string())?;
    state.engine.set_tracked_specs(specs.clone()).await;
    Ok(specs)
}
