//! 文件系统客户端：路径解析、按 bucket 类别分派读写策略、
//! 以及 read_range / read_block / cat 一类无状态便捷操作。

use crate::backend::transport::{BackendKind, ObjectHandle, ObjectMeta, ObjectTransport};
use crate::error::{FsError, Result};
use crate::file::checker::ConsistencyMode;
use crate::file::fetch::{BatchRangeFetcher, RangeFetcher, RetryConfig, SingleRangeFetcher};
use crate::file::reader::{DEFAULT_BLOCK_SIZE, ObjectReader};
use crate::file::writer::ObjectWriter;
use crate::fs::layout::BucketLayoutCache;
use bytes::Bytes;
use std::sync::Arc;

/// 打开句柄时的可调参数；默认值对应最常见的整文件顺序读写。
#[derive(Clone, Debug)]
pub struct OpenOptions {
    pub block_size: Option<usize>,
    pub consistency: ConsistencyMode,
    pub finalize_on_close: bool,
    pub content_type: Option<String>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            block_size: None,
            consistency: ConsistencyMode::Auto,
            finalize_on_close: true,
            content_type: None,
        }
    }
}

/// 对象文件系统入口。持有传输层与 bucket 布局缓存；
/// 读写句柄按 bucket 的后端类别选择抓取器与上传策略。
pub struct ObjectFs {
    transport: Arc<dyn ObjectTransport>,
    layout: BucketLayoutCache,
    retry: RetryConfig,
}

impl ObjectFs {
    pub fn new(transport: Arc<dyn ObjectTransport>) -> Self {
        Self::with_retry(transport, RetryConfig::default())
    }

    pub fn with_retry(transport: Arc<dyn ObjectTransport>, retry: RetryConfig) -> Self {
        Self {
            transport,
            layout: BucketLayoutCache::new(),
            retry,
        }
    }

    /// `bucket/key` 形式的路径，允许前导 `/`，key 内可再含 `/`。
    pub fn split_path(path: &str) -> Result<(&str, &str)> {
        let trimmed = path.trim_start_matches('/');
        match trimmed.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok((bucket, key)),
            _ => Err(FsError::InvalidRange(format!(
                "path {path:?} is not of the form bucket/key"
            ))),
        }
    }

    async fn kind_for(&self, bucket: &str) -> Result<BackendKind> {
        self.layout.kind_for(&self.transport, bucket).await
    }

    fn fetcher_for(&self, kind: BackendKind) -> Box<dyn RangeFetcher> {
        match kind {
            // append 型后端支持一次 RPC 携带多个 range
            BackendKind::AppendCapable => {
                Box::new(BatchRangeFetcher::new(self.transport.clone(), self.retry))
            }
            BackendKind::Standard | BackendKind::Unknown => {
                Box::new(SingleRangeFetcher::new(self.transport.clone(), self.retry))
            }
        }
    }

    pub async fn info(&self, path: &str) -> Result<ObjectMeta> {
        let (bucket, key) = Self::split_path(path)?;
        self.transport.object_metadata(bucket, key).await
    }

    pub async fn open_read(&self, path: &str, opts: &OpenOptions) -> Result<ObjectReader> {
        let (bucket, key) = Self::split_path(path)?;
        let kind = self.kind_for(bucket).await?;
        Ok(ObjectReader::new(
            self.transport.clone(),
            self.fetcher_for(kind),
            ObjectHandle::new(bucket, key),
            opts.block_size.unwrap_or(DEFAULT_BLOCK_SIZE),
            opts.consistency,
        ))
    }

    pub async fn open_write(&self, path: &str, opts: &OpenOptions) -> Result<ObjectWriter> {
        let (bucket, key) = Self::split_path(path)?;
        let kind = self.kind_for(bucket).await?;
        ObjectWriter::open(
            self.transport.clone(),
            bucket,
            key,
            kind,
            opts.block_size,
            opts.consistency,
            opts.finalize_on_close,
            opts.content_type.clone(),
        )
        .await
    }

    /// 读取 `[start, end)`。负值自末尾回算；越界截断到对象大小；
    /// 解析后 `end < start` 是输入错误；空区间直接返回空字节，
    /// 不触达传输层。
    pub async fn read_range(
        &self,
        path: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Bytes> {
        let (bucket, key) = Self::split_path(path)?;
        // 两端都是非负显式值时不需要对象大小就能判定空区间
        if let (Some(s), Some(e)) = (start, end)
            && s >= 0
            && e >= 0
        {
            if e < s {
                return Err(FsError::InvalidRange(format!(
                    "end {e} precedes start {s}"
                )));
            }
            if e == s {
                return Ok(Bytes::new());
            }
        }
        let meta = self.transport.object_metadata(bucket, key).await?;
        let (offset, length) = resolve_limits(start, end, meta.size)?;
        if length == 0 {
            return Ok(Bytes::new());
        }
        let handle = ObjectHandle {
            bucket: bucket.to_string(),
            key: key.to_string(),
            generation: Some(meta.generation),
        };
        let kind = self.kind_for(bucket).await?;
        self.fetcher_for(kind).fetch(&handle, offset, length).await
    }

    /// 整块读取：`delimiter` 为 None 时等价于截断后的 `read_range`；
    /// 指定分隔符时块边界都落在分隔符之后，因此对 `[0, size)` 的任意
    /// 等距切分做 read_block 再拼接可还原原始字节。
    pub async fn read_block(
        &self,
        path: &str,
        offset: u64,
        length: u64,
        delimiter: Option<u8>,
    ) -> Result<Bytes> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        let delim = match delimiter {
            None => {
                let end = offset.saturating_add(length);
                return self
                    .read_range(path, Some(offset as i64), Some(end as i64))
                    .await;
            }
            Some(d) => d,
        };
        let (bucket, key) = Self::split_path(path)?;
        let meta = self.transport.object_metadata(bucket, key).await?;
        let handle = ObjectHandle {
            bucket: bucket.to_string(),
            key: key.to_string(),
            generation: Some(meta.generation),
        };
        let kind = self.kind_for(bucket).await?;
        let fetcher = self.fetcher_for(kind);
        let start = if offset == 0 {
            0
        } else {
            seek_delimiter(fetcher.as_ref(), &handle, offset, delim, meta.size).await?
        };
        let nominal_end = offset.saturating_add(length);
        let end = if nominal_end >= meta.size {
            meta.size
        } else {
            seek_delimiter(fetcher.as_ref(), &handle, nominal_end, delim, meta.size).await?
        };
        if start >= end {
            return Ok(Bytes::new());
        }
        fetcher.fetch(&handle, start, end - start).await
    }

    /// 整对象读取。
    pub async fn cat(&self, path: &str) -> Result<Bytes> {
        self.read_range(path, None, None).await
    }
}

/// 把可选的带符号界限解析成 `(offset, length)`。
/// 负界限自末尾回算；回算后仍为负是输入错误，不做静默截断。
fn resolve_limits(start: Option<i64>, end: Option<i64>, size: u64) -> Result<(u64, u64)> {
    let size = size as i64;
    let offset = match start {
        None => 0,
        Some(s) if s < 0 => size + s,
        Some(s) => s.min(size),
    };
    if offset < 0 {
        return Err(FsError::InvalidRange(format!(
            "resolved start offset {offset} is negative"
        )));
    }
    let effective_end = match end {
        None => size,
        Some(e) if e < 0 => size + e,
        Some(e) => e.min(size),
    };
    if effective_end < offset {
        return Err(FsError::InvalidRange(format!(
            "resolved end {effective_end} precedes start {offset}"
        )));
    }
    Ok((offset as u64, (effective_end - offset) as u64))
}

/// 从 `from` 起向前扫描分隔符，返回其后第一个字节的偏移；
/// 直到对象末尾都没有分隔符时返回 `size`。
async fn seek_delimiter(
    fetcher: &dyn RangeFetcher,
    handle: &ObjectHandle,
    from: u64,
    delim: u8,
    size: u64,
) -> Result<u64> {
    const WINDOW: u64 = 64 * 1024;
    let mut pos = from;
    while pos < size {
        let window = WINDOW.min(size - pos);
        let buf = fetcher.fetch(handle, pos, window).await?;
        if buf.is_empty() {
            break;
        }
        if let Some(i) = buf.iter().position(|&b| b == delim) {
            return Ok(pos + i as u64 + 1);
        }
        pos += buf.len() as u64;
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemTransport;

    fn standard_fs(data: &[u8]) -> (Arc<MemTransport>, ObjectFs) {
        let mem = Arc::new(MemTransport::new(BackendKind::Standard));
        mem.insert_object("b", "k", data);
        let fs = ObjectFs::new(mem.clone());
        (mem, fs)
    }

    #[test]
    fn test_split_path() {
        assert_eq!(ObjectFs::split_path("b/k").unwrap(), ("b", "k"));
        assert_eq!(
            ObjectFs::split_path("/b/dir/k.txt").unwrap(),
            ("b", "dir/k.txt")
        );
        assert!(ObjectFs::split_path("plainbucket").is_err());
        assert!(ObjectFs::split_path("b/").is_err());
    }

    #[test]
    fn test_resolve_limits_law() {
        assert_eq!(resolve_limits(None, None, 10).unwrap(), (0, 10));
        assert_eq!(resolve_limits(Some(-4), None, 10).unwrap(), (6, 4));
        assert_eq!(resolve_limits(Some(2), Some(-2), 10).unwrap(), (2, 6));
        // 越界截断
        assert_eq!(resolve_limits(Some(4), Some(100), 10).unwrap(), (4, 6));
        assert_eq!(resolve_limits(Some(20), None, 10).unwrap(), (10, 0));
        // 解析后 end < start 是输入错误
        assert!(matches!(
            resolve_limits(Some(8), Some(-8), 10).unwrap_err(),
            FsError::InvalidRange(_)
        ));
        // 回算后仍为负的界限同样是输入错误，而不是截断到 0
        assert!(matches!(
            resolve_limits(Some(-20), None, 10).unwrap_err(),
            FsError::InvalidRange(_)
        ));
        assert!(matches!(
            resolve_limits(Some(0), Some(-20), 10).unwrap_err(),
            FsError::InvalidRange(_)
        ));
    }

    #[tokio::test]
    async fn test_read_range_over_negative_start_is_an_error() {
        let (_, fs) = standard_fs(b"0123456789");
        assert!(matches!(
            fs.read_range("b/k", Some(-20), None).await.unwrap_err(),
            FsError::InvalidRange(_)
        ));
    }

    #[tokio::test]
    async fn test_read_range_negative_and_clamped() {
        let (_, fs) = standard_fs(b"0123456789");
        assert_eq!(&fs.read_range("b/k", Some(-4), None).await.unwrap()[..], b"6789");
        assert_eq!(
            &fs.read_range("b/k", Some(2), Some(-2)).await.unwrap()[..],
            b"234567"
        );
        // offset 超过对象大小返回空而不是错误
        assert!(fs.read_range("b/k", Some(100), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_range_makes_no_transport_call() {
        let (mem, fs) = standard_fs(b"0123456789");
        let out = fs.read_range("b/k", Some(5), Some(5)).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(mem.counters().metadata, 0);
        assert_eq!(mem.counters().single_range, 0);
        // read_block 的零长度同理
        let out = fs.read_block("b/k", 3, 0, Some(b'\n')).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(mem.counters().single_range, 0);
    }

    #[tokio::test]
    async fn test_read_block_without_delimiter_is_plain_range() {
        let (_, fs) = standard_fs(b"0123456789");
        assert_eq!(&fs.read_block("b/k", 3, 4, None).await.unwrap()[..], b"3456");
        assert_eq!(&fs.read_block("b/k", 8, 100, None).await.unwrap()[..], b"89");
    }

    #[tokio::test]
    async fn test_read_block_partition_reconstructs_object() {
        let data = b"alpha\nbeta\ngamma\ndelta\nepsilon";
        let (_, fs) = standard_fs(data);
        let size = data.len() as u64;
        for block in [3u64, 7, 11, 64] {
            let mut assembled = Vec::new();
            let mut offset = 0;
            while offset < size {
                let part = fs
                    .read_block("b/k", offset, block, Some(b'\n'))
                    .await
                    .unwrap();
                assembled.extend_from_slice(&part);
                offset += block;
            }
            assert_eq!(assembled, data, "partition with block size {block}");
        }
    }

    #[tokio::test]
    async fn test_cat_and_info() {
        let (_, fs) = standard_fs(b"whole object");
        assert_eq!(&fs.cat("b/k").await.unwrap()[..], b"whole object");
        assert_eq!(fs.info("b/k").await.unwrap().size, 12);
        assert!(matches!(
            fs.cat("b/missing").await.unwrap_err(),
            FsError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_open_write_then_open_read_round_trip() {
        let mem = Arc::new(MemTransport::new(BackendKind::Standard));
        let fs = ObjectFs::new(mem.clone());
        let mut w = fs.open_write("b/new", &OpenOptions::default()).await.unwrap();
        w.write(b"line one\nline two\n").await.unwrap();
        w.close().await.unwrap();
        let mut r = fs.open_read("b/new", &OpenOptions::default()).await.unwrap();
        assert_eq!(&r.read_line().await.unwrap()[..], b"line one\n");
        assert_eq!(&r.read_line().await.unwrap()[..], b"line two\n");
        r.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_append_capable_bucket_gets_batch_fetcher() {
        let mem = Arc::new(MemTransport::new(BackendKind::AppendCapable));
        mem.insert_object("b", "k", b"0123456789");
        let fs = ObjectFs::new(mem.clone());
        let mut r = fs.open_read("b/k", &OpenOptions::default()).await.unwrap();
        assert_eq!(&r.read(Some(4)).await.unwrap()[..], b"0123");
        r.close().await.unwrap();
        // 读路径一次只要一个窗口，批量抓取器按规约退化为单范围调用
        assert_eq!(mem.counters().single_range, 1);
        assert_eq!(mem.counters().batch_range, 0);
    }
}
