//! 范围取数策略：单范围 GET 与批量多范围下载，瞬态错误在此边界有界重试。

use crate::backend::transport::{ObjectHandle, ObjectTransport};
use crate::error::{FsError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future;
use std::sync::Arc;
use tokio::time::{Duration, sleep};

/// 重试参数；仅 `FsError::Transient` 触发重试，指数退避。
#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
        }
    }
}

async fn with_retry<T, F, Fut>(retry: RetryConfig, operation_name: &'static str, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt <= retry.max_retries => {
                let delay_ms = retry.initial_delay_ms * 2u64.pow(attempt - 1);
                log::debug!("{operation_name} attempt {attempt} failed: {e}, retrying");
                sleep(Duration::from_millis(delay_ms)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// 把 (offset, length) 请求转成后端 wire call；length == 0 表示读到对象末尾。
#[async_trait]
pub trait RangeFetcher: Send + Sync {
    async fn fetch(&self, handle: &ObjectHandle, offset: u64, length: u64) -> Result<Bytes>;
}

/// 每次调用发一条单范围 GET；不支持批量下载的后端用它。
pub struct SingleRangeFetcher {
    transport: Arc<dyn ObjectTransport>,
    retry: RetryConfig,
}

impl SingleRangeFetcher {
    pub fn new(transport: Arc<dyn ObjectTransport>, retry: RetryConfig) -> Self {
        Self { transport, retry }
    }
}

#[async_trait]
impl RangeFetcher for SingleRangeFetcher {
    async fn fetch(&self, handle: &ObjectHandle, offset: u64, length: u64) -> Result<Bytes> {
        with_retry(self.retry, "single_range_get", || {
            self.transport.single_range_get(handle, offset, length)
        })
        .await
    }
}

/// 一次后端调用携带多个范围（zonal 类后端）；结果与输入按位置对应，
/// 任一范围失败则整批失败。
pub struct BatchRangeFetcher {
    transport: Arc<dyn ObjectTransport>,
    retry: RetryConfig,
}

impl BatchRangeFetcher {
    pub fn new(transport: Arc<dyn ObjectTransport>, retry: RetryConfig) -> Self {
        Self { transport, retry }
    }

    pub async fn fetch_many(
        &self,
        handle: &ObjectHandle,
        requests: &[(u64, u64)],
    ) -> Result<Vec<Bytes>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        // 单元素退化为单范围情形
        if let [(offset, length)] = *requests {
            let one = with_retry(self.retry, "single_range_get", || {
                self.transport.single_range_get(handle, offset, length)
            })
            .await?;
            return Ok(vec![one]);
        }
        let batched = with_retry(self.retry, "batch_range_get", || {
            self.transport.batch_range_get(handle, requests)
        })
        .await;
        match batched {
            // 后端没有批量 RPC 时退化为并发单范围请求，结果顺序不变
            Err(FsError::Unsupported(_)) => {
                let singles = requests.iter().map(|&(offset, length)| {
                    with_retry(self.retry, "single_range_get", move || {
                        self.transport.single_range_get(handle, offset, length)
                    })
                });
                future::try_join_all(singles).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl RangeFetcher for BatchRangeFetcher {
    async fn fetch(&self, handle: &ObjectHandle, offset: u64, length: u64) -> Result<Bytes> {
        let mut results = self.fetch_many(handle, &[(offset, length)]).await?;
        Ok(results.pop().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemTransport;
    use crate::backend::transport::BackendKind;
    use crate::error::FsError;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_single_fetch_retries_transient() {
        let mem = Arc::new(MemTransport::new(BackendKind::Standard));
        mem.insert_object("b", "k", b"0123456789");
        mem.inject_range_get_failures(2);
        let fetcher = SingleRangeFetcher::new(mem.clone(), fast_retry());
        let handle = ObjectHandle::new("b", "k");
        let out = fetcher.fetch(&handle, 2, 4).await.unwrap();
        assert_eq!(&out[..], b"2345");
        assert_eq!(mem.counters().single_range, 3);
    }

    #[tokio::test]
    async fn test_single_fetch_does_not_retry_not_found() {
        let mem = Arc::new(MemTransport::new(BackendKind::Standard));
        let fetcher = SingleRangeFetcher::new(mem.clone(), fast_retry());
        let handle = ObjectHandle::new("b", "missing");
        let err = fetcher.fetch(&handle, 0, 1).await.unwrap_err();
        assert!(matches!(err, FsError::NotFound(_)));
        assert_eq!(mem.counters().single_range, 1);
    }

    #[tokio::test]
    async fn test_batch_results_positional_one_wire_call() {
        let mem = Arc::new(MemTransport::new(BackendKind::AppendCapable));
        mem.insert_object("b", "k", b"abcdefghij");
        let fetcher = BatchRangeFetcher::new(mem.clone(), fast_retry());
        let handle = ObjectHandle::new("b", "k");
        // 请求乱序给出，结果按输入位置对应
        let out = fetcher
            .fetch_many(&handle, &[(8, 2), (0, 3), (4, 0)])
            .await
            .unwrap();
        assert_eq!(&out[0][..], b"ij");
        assert_eq!(&out[1][..], b"abc");
        assert_eq!(&out[2][..], b"efghij");
        assert_eq!(mem.counters().batch_range, 1);
    }

    #[tokio::test]
    async fn test_batch_falls_back_to_concurrent_singles() {
        let mem = Arc::new(MemTransport::new(BackendKind::Standard));
        mem.insert_object("b", "k", b"abcdefghij");
        let fetcher = BatchRangeFetcher::new(mem.clone(), fast_retry());
        let handle = ObjectHandle::new("b", "k");
        let out = fetcher.fetch_many(&handle, &[(0, 2), (5, 3)]).await.unwrap();
        assert_eq!(&out[0][..], b"ab");
        assert_eq!(&out[1][..], b"fgh");
        assert_eq!(mem.counters().batch_range, 0);
        assert_eq!(mem.counters().single_range, 2);
    }
}
