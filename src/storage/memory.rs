//! 进程内远程存储，用于试运行与测试

use super::{ensure_version, ObjectMeta, RemoteObjectRef, RemoteStore};
use crate::error::RemoteError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: String,
    meta: ObjectMeta,
}

/// 内存存储，每次写入产生单调递增的版本号
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<String, StoredObject>>,
    next_version: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump_version(&self) -> String {
        let n = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        format!("v{}", n)
    }

    /// 绕过版本检查直接写入（模拟另一台机器的写入）
    pub async fn write_unchecked(&self, key: &str, content: Bytes, meta: ObjectMeta) -> String {
        let version = self.bump_version();
        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                data: content,
                version: version.clone(),
                meta,
            },
        );
        version
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.objects.read().await.contains_key(key)
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn put(
        &self,
        key: &str,
        content: Bytes,
        expected_version: Option<&str>,
        meta: &ObjectMeta,
    ) -> Result<String, RemoteError> {
        let mut objects = self.objects.write().await;
        let current = objects.get(key).map(|o| o.version.as_str());
        ensure_version(key, current, expected_version)?;

        let version = self.bump_version();
        objects.insert(
            key.to_string(),
            StoredObject {
                data: content,
                version: version.clone(),
                meta: meta.clone(),
            },
        );
        Ok(version)
    }

    async fn get(&self, key: &str) -> Result<Bytes, RemoteError> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| RemoteError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str, expected_version: Option<&str>) -> Result<(), RemoteError> {
        let mut objects = self.objects.write().await;
        let Some(current) = objects.get(key) else {
            return Ok(());
        };
        ensure_version(key, Some(current.version.as_str()), expected_version)?;
        objects.remove(key);
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<Option<RemoteObjectRef>, RemoteError> {
        Ok(self.objects.read().await.get(key).map(|o| RemoteObjectRef {
            key: key.to_string(),
            version: o.version.clone(),
            meta: o.meta.clone(),
        }))
    }

    fn name(&self) -> &str {
        "memory"
    }
}
