//! bucket 布局缓存：记住每个 bucket 的后端类别，避免逐次探测。
//!
//! 缓存由 `ObjectFs` 持有并注入使用方，不是进程级全局状态；
//! 容量有界，淘汰由 moka 管理。

use crate::backend::transport::{BackendKind, ObjectTransport};
use crate::error::Result;
use moka::future::Cache;
use std::sync::Arc;

const DEFAULT_CAPACITY: u64 = 1024;

pub struct BucketLayoutCache {
    inner: Cache<String, BackendKind>,
}

impl BucketLayoutCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            inner: Cache::new(capacity),
        }
    }

    /// 返回 bucket 的后端类别；未命中时探测一次并记住结果。
    /// 探测失败不缓存，下次调用会重试。
    pub async fn kind_for(
        &self,
        transport: &Arc<dyn ObjectTransport>,
        bucket: &str,
    ) -> Result<BackendKind> {
        if let Some(kind) = self.inner.get(bucket).await {
            return Ok(kind);
        }
        let kind = transport.bucket_kind(bucket).await?;
        log::debug!("bucket {bucket} classified as {kind:?}");
        self.inner.insert(bucket.to_string(), kind).await;
        Ok(kind)
    }

    pub async fn invalidate(&self, bucket: &str) {
        self.inner.invalidate(bucket).await;
    }
}

impl Default for BucketLayoutCache {
    fn default() -> Self {
        Self::new()
    }
}
