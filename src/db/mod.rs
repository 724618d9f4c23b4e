pub mod models;
pub use models::*;

use crate::core::job::JobState;
use crate::core::status::SessionSummary;
use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
pub use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;

/// 打开（必要时创建）状态数据库并执行迁移
pub async fn connect(db_path: &Path) -> Result<SqlitePool> {
    // Windows 路径需要转换反斜杠为正斜杠
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid database path"))?
        .replace('\\', "/");

    let pool = SqlitePoolOptions::new()
        .max_connections(5) // SQLite 单文件，不需要太多连接
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect(&format!("sqlite:{}?mode=rwc", db_path_str))
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

/// 内存数据库（测试与试运行）；单连接，否则每个连接各有一份库
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

impl SessionLog {
    /// 从会话汇总生成历史记录
    pub fn from_summary(summary: &SessionSummary) -> Self {
        let count = |pred: fn(&JobState) -> bool| {
            summary.jobs.iter().filter(|j| pred(&j.state)).count() as i64
        };

        let errors: Vec<String> = summary
            .jobs
            .iter()
            .filter_map(|j| {
                j.error
                    .as_ref()
                    .map(|e| format!("{}: {}", j.path.display(), e))
            })
            .collect();

        Self {
            id: 0,
            session_id: summary.id.clone(),
            origin: summary.origin.to_string(),
            start_time: summary.started_at,
            end_time: summary.finished_at,
            status: summary.state.to_string(),
            jobs_total: summary.jobs.len() as i64,
            files_uploaded: summary.uploaded() as i64,
            files_deleted: summary.deleted() as i64,
            files_conflicted: count(|s| matches!(s, JobState::Conflicted)),
            files_failed: count(|s| matches!(s, JobState::Failed(_))),
            files_deferred: count(|s| matches!(s, JobState::Deferred)),
            error_message: if errors.is_empty() {
                None
            } else {
                Some(errors.join("; "))
            },
        }
    }

    /// 写入 sync_logs
    pub async fn insert(&self, pool: &SqlitePool) -> Result<i64> {
        let result = sqlx::query(
            r#"INSERT INTO sync_logs
               (session_id, origin, start_time, end_time, status, jobs_total, files_uploaded,
                files_deleted, files_conflicted, files_failed, files_deferred, error_message)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&self.session_id)
        .bind(&self.origin)
        .bind(self.start_time)
        .bind(self.end_time)
        .bind(&self.status)
        .bind(self.jobs_total)
        .bind(self.files_uploaded)
        .bind(self.files_deleted)
        .bind(self.files_conflicted)
        .bind(self.files_failed)
        .bind(self.files_deferred)
        .bind(&self.error_message)
        .execute(pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// 最近的会话历史，按开始时间倒序
    pub async fn load_recent(pool: &SqlitePool, limit: i64) -> Result<Vec<SessionLog>> {
        let logs = sqlx::query_as::<_, SessionLog>(
            "SELECT id, session_id, origin, start_time, end_time, status, jobs_total, files_uploaded,
                    files_deleted, files_conflicted, files_failed, files_deferred, error_message
             FROM sync_logs
             ORDER BY start_time DESC, id DESC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(pool)
        .await?;

        Ok(logs)
    }
}
