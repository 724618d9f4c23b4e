//! 同步相关命令

use crate::core::{SessionState, SessionSummary, StatusSnapshot};
use crate::db::SessionLog;
use crate::error::EngineError;
use crate::AppState;
use tokio::sync::watch;

/// 立即执行一次同步会话（强制全量扫描）。已有会话在运行时返回错误。
pub async fn start_sync(state: &AppState) -> Result<SessionSummary, String> {
    state.engine.start_sync().await.map_err(|e| match e {
        EngineError::SessionInProgress => "同步正在进行中".to_string(),
        other => format!("同步失败: {}", other),
    })
}

/// 停止当前会话。返回是否有会话在运行。
pub async fn stop_sync(state: &AppState) -> Result<bool, String> {
    Ok(state.engine.stop_sync().await)
}

/// 当前同步状态快照
pub async fn get_status(state: &AppState) -> Result<StatusSnapshot, String> {
    Ok(state.engine.status().snapshot().await)
}

/// 订阅会话状态变化
pub fn subscribe_status(state: &AppState) -> watch::Receiver<SessionState> {
    state.engine.status().subscribe()
}

/// 获取同步历史
pub async fn get_sync_history(limit: Option<i64>, state: &AppState) -> Result<Vec<SessionLog>, String> {
    let limit = limit.unwrap_or(50).clamp(1, 1000);
    SessionLog::load_recent(&state.db, limit)
        .await
        .map_err(|e| format!("加载同步历史失败: {}", e))
}
