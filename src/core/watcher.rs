//! 变更检测：轮询或文件系统通知，两种实现共用同一个扫描器

use crate::core::file_state::FileSyncState;
use crate::core::job::PendingSet;
use crate::core::path_resolver::TrackedPaths;
use crate::core::snapshot::SnapshotStore;
use crate::core::status::StatusReporter;
use crate::error::SnapshotError;
use async_trait::async_trait;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// 通知事件到达后等待合并的时间
const DEBOUNCE: Duration = Duration::from_millis(250);

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// 变更事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    /// 检测时间（Unix 毫秒）
    pub observed_at: i64,
}

impl ChangeEvent {
    pub fn new(path: PathBuf, kind: ChangeKind) -> Self {
        Self {
            path,
            kind,
            observed_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// 检测方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchMode {
    /// 优先文件系统通知，失败时退回轮询
    #[default]
    Auto,
    Poll,
    Notify,
}

/// 扫描器：对比磁盘状态与快照，产生变更事件
pub struct ChangeScanner {
    snapshot: Arc<SnapshotStore>,
    tracked: Arc<TrackedPaths>,
    pending: Arc<PendingSet>,
    status: Arc<StatusReporter>,
    missing_threshold: u32,
}

impl ChangeScanner {
    pub fn new(
        snapshot: Arc<SnapshotStore>,
        tracked: Arc<TrackedPaths>,
        pending: Arc<PendingSet>,
        status: Arc<StatusReporter>,
        missing_threshold: u32,
    ) -> Self {
        Self {
            snapshot,
            tracked,
            pending,
            status,
            missing_threshold: missing_threshold.max(1),
        }
    }

    /// 会话运行期间暂停检测
    pub fn is_suspended(&self) -> bool {
        self.status.is_running()
    }

    /// 监听根目录（通知模式使用）
    pub async fn watch_roots(&self) -> Vec<(PathBuf, bool)> {
        self.tracked.resolve().await.watch_roots()
    }

    /// 扫描一次。`force` 为 true 时 Error/Conflict 状态的路径即使没有新变化也重新发出。
    ///
    /// 发出的路径会加入 PendingSet，任务结束前不会重复发出。
    pub async fn scan(&self, force: bool) -> Vec<ChangeEvent> {
        let resolved = self.tracked.resolve().await;
        self.status.set_path_errors(resolved.errors.clone()).await;

        let mut candidates: BTreeSet<PathBuf> = resolved.paths.clone();
        candidates.extend(self.snapshot.paths().await);

        let mut events = Vec::new();
        for path in candidates {
            if self.pending.contains(&path).await {
                trace!("已有未完成任务，跳过: {}", path.display());
                continue;
            }

            let previous = self.snapshot.get(&path).await;
            let kind = match self.snapshot.observe(&path).await {
                Ok(fp) => {
                    let changed_since_last_look = previous
                        .as_ref()
                        .and_then(|r| r.observed.as_ref())
                        .map_or(true, |old| !old.same_content(&fp));
                    let record = self.snapshot.record_observed(&path, fp).await;

                    if record.is_clean() {
                        // 推迟或取消的任务之后内容恢复一致
                        if record.state != FileSyncState::Synced {
                            self.snapshot.mark(&path, FileSyncState::Synced).await;
                        }
                        continue;
                    }

                    // 失败过的路径只在内容再次变化或强制扫描时重试
                    if matches!(record.state, FileSyncState::Error | FileSyncState::Conflict)
                        && !force
                        && !changed_since_last_look
                    {
                        continue;
                    }

                    if record.synced.is_none() && record.remote.is_none() {
                        ChangeKind::Created
                    } else {
                        ChangeKind::Modified
                    }
                }
                Err(SnapshotError::NotFound(_)) => {
                    let Some(record) = previous else {
                        continue;
                    };
                    let covered = resolved.paths.contains(&path) || resolved.covers(&path);

                    if covered && record.synced.is_some() {
                        // 删除失败过且上次观测时已缺失：同样等待强制扫描
                        let failed_before = record.observed.is_none()
                            && matches!(record.state, FileSyncState::Error | FileSyncState::Conflict);
                        if failed_before && !force {
                            continue;
                        }
                        self.snapshot.record_missing(&path).await;
                        ChangeKind::Deleted
                    } else {
                        let misses = self.snapshot.record_missing(&path).await;
                        if misses >= self.missing_threshold {
                            info!("路径连续 {} 次不存在，停止跟踪: {}", misses, path.display());
                            self.snapshot.remove(&path).await;
                        }
                        continue;
                    }
                }
                Err(SnapshotError::NotAFile(_)) => {
                    // 交给任务以 InvalidLocalState 失败；已报错的不重复发出
                    let failed = previous
                        .as_ref()
                        .is_some_and(|r| r.state == FileSyncState::Error);
                    if failed && !force {
                        continue;
                    }
                    ChangeKind::Modified
                }
                Err(e @ SnapshotError::Io { .. }) => {
                    warn!("读取文件失败，下个周期重试: {}", e);
                    self.snapshot.set_error(&path, None, e.to_string()).await;
                    continue;
                }
            };

            if self.pending.insert(&path).await {
                debug!("检测到变化: {:?} {}", kind, path.display());
                events.push(ChangeEvent::new(path, kind));
            }
        }

        if !events.is_empty() {
            info!("本次扫描检测到 {} 个变化", events.len());
        }
        events
    }

    /// 执行一次非强制扫描并发送结果；接收端关闭时返回 false
    async fn scan_and_send(&self, tx: &mpsc::Sender<Vec<ChangeEvent>>) -> bool {
        if self.is_suspended() {
            trace!("同步会话运行中，跳过本次检测");
            return true;
        }
        let events = self.scan(false).await;
        events.is_empty() || tx.send(events).await.is_ok()
    }
}

/// 变更来源
#[async_trait]
pub trait ChangeSource: Send {
    fn name(&self) -> &'static str;

    /// 持续检测直到取消或接收端关闭
    async fn run(self: Box<Self>, tx: mpsc::Sender<Vec<ChangeEvent>>, cancel: CancellationToken);
}

/// 固定间隔轮询
pub struct PollingDetector {
    scanner: Arc<ChangeScanner>,
    interval: Duration,
}

impl PollingDetector {
    pub fn new(scanner: Arc<ChangeScanner>, interval: Duration) -> Self {
        Self { scanner, interval }
    }
}

#[async_trait]
impl ChangeSource for PollingDetector {
    fn name(&self) -> &'static str {
        "poll"
    }

    async fn run(self: Box<Self>, tx: mpsc::Sender<Vec<ChangeEvent>>, cancel: CancellationToken) {
        info!("轮询检测已启动，间隔 {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.scanner.scan_and_send(&tx).await {
                        break;
                    }
                }
            }
        }
        debug!("轮询检测已停止");
    }
}

/// 文件系统通知 + 低频兜底轮询
pub struct NotifyDetector {
    scanner: Arc<ChangeScanner>,
    // 必须持有，drop 后停止监听
    _watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<Event>,
    safety_interval: Duration,
}

impl NotifyDetector {
    pub fn new(
        scanner: Arc<ChangeScanner>,
        roots: &[(PathBuf, bool)],
        safety_interval: Duration,
    ) -> notify::Result<Self> {
        let (event_tx, events) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let _ = event_tx.send(event);
                }
                Err(e) => warn!("文件监听错误: {}", e),
            },
            Config::default(),
        )?;

        let mut watched = 0;
        for (root, recursive) in roots {
            let mode = if *recursive {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };
            match watcher.watch(root, mode) {
                Ok(()) => watched += 1,
                // 目录尚不存在时由兜底轮询发现
                Err(e) => debug!("无法监听 {}: {}", root.display(), e),
            }
        }

        if watched == 0 && !roots.is_empty() {
            return Err(notify::Error::generic("no watch root could be registered"));
        }

        info!("文件系统通知已启动，监听 {} 个目录", watched);
        Ok(Self {
            scanner,
            _watcher: watcher,
            events,
            safety_interval,
        })
    }

    fn is_relevant(event: &Event) -> bool {
        matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any | EventKind::Other
        )
    }
}

#[async_trait]
impl ChangeSource for NotifyDetector {
    fn name(&self) -> &'static str {
        "notify"
    }

    async fn run(mut self: Box<Self>, tx: mpsc::Sender<Vec<ChangeEvent>>, cancel: CancellationToken) {
        let mut safety = tokio::time::interval(self.safety_interval);
        safety.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = safety.tick() => {
                    if !self.scanner.scan_and_send(&tx).await {
                        break;
                    }
                }
                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    if !Self::is_relevant(&event) {
                        continue;
                    }

                    // 合并一段时间内的连续事件（编辑器保存常产生多个事件）
                    tokio::time::sleep(DEBOUNCE).await;
                    while self.events.try_recv().is_ok() {}

                    if !self.scanner.scan_and_send(&tx).await {
                        break;
                    }
                }
            }
        }
        debug!("文件系统通知检测已停止");
    }
}

/// 按检测方式创建变更来源；通知不可用时退回轮询
pub async fn build_detector(
    mode: WatchMode,
    scanner: Arc<ChangeScanner>,
    poll_interval: Duration,
) -> Box<dyn ChangeSource> {
    if mode == WatchMode::Poll {
        return Box::new(PollingDetector::new(scanner, poll_interval));
    }

    let roots = scanner.watch_roots().await;
    // 通知模式下轮询只作兜底
    let safety_interval = poll_interval.saturating_mul(12);
    match NotifyDetector::new(scanner.clone(), &roots, safety_interval) {
        Ok(detector) => Box::new(detector),
        Err(e) => {
            warn!("文件系统通知不可用，改用轮询: {}", e);
            Box::new(PollingDetector::new(scanner, poll_interval))
        }
    }
}
