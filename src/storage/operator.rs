//! 基于 opendal 的远程存储（本地目录 / S3 / WebDAV）

use super::{ensure_version, ObjectMeta, RemoteObjectRef, RemoteStore, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS};
use crate::db::{StorageConfig, StorageType};
use crate::error::RemoteError;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use opendal::{layers::TimeoutLayer, ErrorKind, Operator};
use std::time::Duration;
use tracing::debug;

/// 元数据旁路文件后缀：对象内容之外单独保存哈希与本地修改时间
const META_SUFFIX: &str = ".meta.json";

pub struct OpendalStore {
    operator: Operator,
    name: String,
}

/// 把 opendal 错误映射到引擎的错误分类
fn map_err(key: &str, err: opendal::Error) -> RemoteError {
    match err.kind() {
        ErrorKind::NotFound => RemoteError::NotFound(key.to_string()),
        ErrorKind::PermissionDenied => RemoteError::Unauthorized(err.to_string()),
        ErrorKind::ConditionNotMatch => RemoteError::VersionConflict {
            key: key.to_string(),
            expected: None,
            actual: None,
        },
        ErrorKind::RateLimited => RemoteError::Unavailable(err.to_string()),
        _ if err.is_temporary() => RemoteError::Unavailable(err.to_string()),
        _ => RemoteError::Other(err.to_string()),
    }
}

impl OpendalStore {
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        match config.typ {
            StorageType::Local => {
                let path = config
                    .path
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("Local storage requires path"))?;
                Self::local(path)
            }
            StorageType::S3 => {
                let bucket = config
                    .bucket
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("S3 storage requires bucket"))?;
                let region = config
                    .region
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("S3 storage requires region"))?;
                let access_key = config
                    .access_key
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("S3 storage requires accessKey"))?;
                let secret_key = config
                    .secret_key
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("S3 storage requires secretKey"))?;
                Self::s3(
                    bucket,
                    region,
                    access_key,
                    secret_key,
                    config.endpoint.as_deref(),
                    config.root.as_deref(),
                )
            }
            StorageType::WebDav => {
                let endpoint = config
                    .endpoint
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("WebDAV storage requires endpoint"))?;
                let username = config
                    .username
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("WebDAV storage requires username"))?;
                let password = config
                    .password
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("WebDAV storage requires password"))?;
                Self::webdav(endpoint, username, password, config.root.as_deref())
            }
            StorageType::Memory => Err(anyhow::anyhow!("memory storage is not backed by opendal")),
        }
    }

    pub fn local(path: &str) -> Result<Self> {
        use opendal::services::Fs;

        std::fs::create_dir_all(path)?;
        tracing::info!("初始化本地远程存储: {}", path);
        let operator = Operator::new(Fs::default().root(path))?.finish();
        Ok(Self {
            operator,
            name: format!("local:{}", path),
        })
    }

    pub fn s3(
        bucket: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        endpoint: Option<&str>,
        root: Option<&str>,
    ) -> Result<Self> {
        use opendal::services::S3;

        let mut builder = S3::default()
            .bucket(bucket)
            .region(region)
            .access_key_id(access_key)
            .secret_access_key(secret_key);

        if let Some(ep) = endpoint {
            builder = builder.endpoint(ep);
        }
        if let Some(r) = root {
            builder = builder.root(r);
        }

        let operator = Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish();

        tracing::info!("初始化S3存储: bucket={}, region={}", bucket, region);
        let name = format!(
            "s3://{}{}",
            bucket,
            root.map(|p| format!("/{}", p.trim_start_matches('/')))
                .unwrap_or_default()
        );
        Ok(Self { operator, name })
    }

    pub fn webdav(endpoint: &str, username: &str, password: &str, root: Option<&str>) -> Result<Self> {
        use opendal::services::Webdav;

        let mut builder = Webdav::default()
            .endpoint(endpoint)
            .username(username)
            .password(password);

        if let Some(r) = root {
            builder = builder.root(r);
        }

        let operator = Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish();

        tracing::info!("创建WebDAV存储: endpoint={}, root={:?}", endpoint, root);
        let name = format!(
            "webdav://{}{}",
            endpoint.trim_end_matches('/'),
            root.map(|r| format!("/{}", r.trim_start_matches('/')))
                .unwrap_or_default()
        );
        Ok(Self { operator, name })
    }

    fn meta_path(key: &str) -> String {
        format!("{}{}", key, META_SUFFIX)
    }

    /// 没有 etag 的后端（本地目录、部分 WebDAV）用 大小-修改时间-哈希前缀 合成版本
    fn version_of(meta: &opendal::Metadata, object: &ObjectMeta) -> String {
        if let Some(etag) = meta.etag() {
            return etag.trim_matches('"').to_string();
        }
        let modified = meta
            .last_modified()
            .map_or(0, |t| t.timestamp_millis());
        let hash_prefix: String = object.hash.chars().take(12).collect();
        format!("{}-{}-{}", meta.content_length(), modified, hash_prefix)
    }

    async fn read_meta(&self, key: &str, stat: &opendal::Metadata) -> Result<ObjectMeta, RemoteError> {
        match self.operator.read(&Self::meta_path(key)).await {
            Ok(buf) => serde_json::from_slice(&buf.to_bytes())
                .map_err(|e| RemoteError::Other(format!("corrupt metadata for {}: {}", key, e))),
            // 旁路文件缺失时退化为对象自身的元数据
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(ObjectMeta {
                path: String::new(),
                hash: String::new(),
                size: stat.content_length(),
                modified_time: stat.last_modified().map_or(0, |t| t.timestamp_millis()),
            }),
            Err(e) => Err(map_err(key, e)),
        }
    }

    async fn current(&self, key: &str) -> Result<Option<RemoteObjectRef>, RemoteError> {
        let stat = match self.operator.stat(key).await {
            Ok(stat) => stat,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(map_err(key, e)),
        };
        let meta = self.read_meta(key, &stat).await?;

        Ok(Some(RemoteObjectRef {
            key: key.to_string(),
            version: Self::version_of(&stat, &meta),
            meta,
        }))
    }
}

#[async_trait]
impl RemoteStore for OpendalStore {
    async fn put(
        &self,
        key: &str,
        content: Bytes,
        expected_version: Option<&str>,
        meta: &ObjectMeta,
    ) -> Result<String, RemoteError> {
        // 先比较版本再写入；后端不支持条件写时，比较与写入之间存在竞争窗口
        let current = self.current(key).await?;
        ensure_version(key, current.as_ref().map(|c| c.version.as_str()), expected_version)?;

        let meta_json = serde_json::to_vec(meta)
            .map_err(|e| RemoteError::Other(format!("encode metadata: {}", e)))?;

        self.operator
            .write(key, content)
            .await
            .map_err(|e| map_err(key, e))?;
        self.operator
            .write(&Self::meta_path(key), meta_json)
            .await
            .map_err(|e| map_err(key, e))?;

        let written = self
            .current(key)
            .await?
            .ok_or_else(|| RemoteError::Unavailable(format!("{} vanished after write", key)))?;
        debug!("写入远程对象: {} -> {}", key, written.version);
        Ok(written.version)
    }

    async fn get(&self, key: &str) -> Result<Bytes, RemoteError> {
        let data = self.operator.read(key).await.map_err(|e| map_err(key, e))?;
        Ok(data.to_bytes())
    }

    async fn delete(&self, key: &str, expected_version: Option<&str>) -> Result<(), RemoteError> {
        let Some(current) = self.current(key).await? else {
            return Ok(());
        };
        ensure_version(key, Some(current.version.as_str()), expected_version)?;

        self.operator.delete(key).await.map_err(|e| map_err(key, e))?;
        self.operator
            .delete(&Self::meta_path(key))
            .await
            .map_err(|e| map_err(key, e))?;
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<Option<RemoteObjectRef>, RemoteError> {
        self.current(key).await
    }

    async fn check(&self) -> Result<(), RemoteError> {
        self.operator.check().await.map_err(|e| map_err("/", e))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
