//! 集成测试共用：可注入故障的远程存储与引擎构造

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use dotsync_lib::core::{PathResolver, RetryPolicy, SnapshotStore, SyncConfig, SyncEngine, TrackedPaths, WatchMode};
use dotsync_lib::storage::{MemoryStore, ObjectMeta, RemoteObjectRef, RemoteStore};
use dotsync_lib::RemoteError;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 包装 MemoryStore：按脚本注入失败，并统计调用次数与同键并发
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    put_failures: Mutex<VecDeque<RemoteError>>,
    check_failure: Mutex<Option<RemoteError>>,
    put_delay: Mutex<Duration>,
    pub put_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    in_flight: Mutex<HashMap<String, usize>>,
    max_in_flight_per_key: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 接下来的 put 调用依次返回这些错误
    pub fn fail_puts(&self, errors: impl IntoIterator<Item = RemoteError>) {
        self.put_failures.lock().unwrap().extend(errors);
    }

    pub fn fail_check(&self, error: RemoteError) {
        *self.check_failure.lock().unwrap() = Some(error);
    }

    pub fn set_put_delay(&self, delay: Duration) {
        *self.put_delay.lock().unwrap() = delay;
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight_per_key(&self) -> usize {
        self.max_in_flight_per_key.load(Ordering::SeqCst)
    }

    fn enter(&self, key: &str) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let n = in_flight.entry(key.to_string()).or_default();
        *n += 1;
        self.max_in_flight_per_key.fetch_max(*n, Ordering::SeqCst);
    }

    fn leave(&self, key: &str) {
        if let Some(n) = self.in_flight.lock().unwrap().get_mut(key) {
            *n -= 1;
        }
    }
}

#[async_trait]
impl RemoteStore for FlakyStore {
    async fn put(
        &self,
        key: &str,
        content: Bytes,
        expected_version: Option<&str>,
        meta: &ObjectMeta,
    ) -> Result<String, RemoteError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.enter(key);
        let delay = *self.put_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.put_failures.lock().unwrap().pop_front();
        let result = match scripted {
            Some(err) => Err(err),
            None => self.inner.put(key, content, expected_version, meta).await,
        };
        self.leave(key);
        result
    }

    async fn get(&self, key: &str) -> Result<Bytes, RemoteError> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str, expected_version: Option<&str>) -> Result<(), RemoteError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.enter(key);
        let result = self.inner.delete(key, expected_version).await;
        self.leave(key);
        result
    }

    async fn head(&self, key: &str) -> Result<Option<RemoteObjectRef>, RemoteError> {
        self.inner.head(key).await
    }

    async fn check(&self) -> Result<(), RemoteError> {
        match self.check_failure.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

/// 重试延迟极短的测试配置
pub fn fast_config(max_attempts: u32) -> SyncConfig {
    SyncConfig {
        retry: RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(5)),
        op_timeout: Duration::from_secs(5),
        watch_mode: WatchMode::Poll,
        ..SyncConfig::default()
    }
}

/// 以 `home` 为家目录构造引擎
pub fn engine_with(
    home: &Path,
    specs: &[&str],
    remote: Arc<dyn RemoteStore>,
    snapshot: Arc<SnapshotStore>,
    config: SyncConfig,
) -> SyncEngine {
    let tracked = TrackedPaths::new(
        specs.iter().map(|s| s.to_string()).collect(),
        PathResolver::with_dirs(Some(home.to_path_buf()), home.to_path_buf()),
    );
    SyncEngine::new(remote, snapshot, tracked, config)
}

pub fn engine(home: &Path, specs: &[&str], remote: Arc<FlakyStore>, max_attempts: u32) -> SyncEngine {
    engine_with(home, specs, remote, Arc::new(SnapshotStore::new()), fast_config(max_attempts))
}
