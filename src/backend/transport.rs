//! 传输能力抽象：元数据、范围读、三种上传协议的后端调用面。

use crate::error::{FsError, Result};
use async_trait::async_trait;
use bytes::Bytes;

/// 后端按 bucket 报告的能力类别，open 时据此选择读写策略。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// 单范围 GET + simple/resumable PUT。
    Standard,
    /// 额外支持批量多范围下载与 append-only 流式写（zonal 类后端）。
    AppendCapable,
    /// 能力探测失败时的保守默认，按 Standard 对待。
    Unknown,
}

/// 远端对象标识；句柄打开后不可变，generation 在首次访问时解析固定。
#[derive(Clone, Debug)]
pub struct ObjectHandle {
    pub bucket: String,
    pub key: String,
    pub generation: Option<i64>,
}

impl ObjectHandle {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            generation: None,
        }
    }
}

/// 对象元数据：大小、服务端声明的 md5（base64）、版本号。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    pub md5_b64: Option<String>,
    pub generation: i64,
}

/// 追加流句柄：由 `open_append_stream` 返回，close 前一直有效。
pub type StreamId = u64;

/// 后端传输能力。错误必须映射到 `FsError` 分类；
/// 不支持的调用返回 `FsError::Unsupported`，由 fs 层的能力分发避免触达。
#[async_trait]
pub trait ObjectTransport: Send + Sync {
    async fn bucket_kind(&self, bucket: &str) -> Result<BackendKind>;

    async fn object_metadata(&self, bucket: &str, key: &str) -> Result<ObjectMeta>;

    /// 读取 `[offset, offset+length)`；length == 0 表示读到对象末尾。
    async fn single_range_get(
        &self,
        handle: &ObjectHandle,
        offset: u64,
        length: u64,
    ) -> Result<Bytes>;

    /// 一次调用携带全部范围；结果与输入按位置一一对应。
    /// 任一范围失败则整个调用失败，不允许部分成功。
    async fn batch_range_get(
        &self,
        handle: &ObjectHandle,
        ranges: &[(u64, u64)],
    ) -> Result<Vec<Bytes>> {
        let _ = (handle, ranges);
        Err(FsError::Unsupported("batched multi-range download"))
    }

    async fn simple_put(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        content_type: Option<&str>,
    ) -> Result<ObjectMeta>;

    /// 发起 chunked-resumable 上传，返回会话 id。
    async fn initiate_chunked(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> Result<String>;

    /// 上传 `[offset, offset+len)`，返回后端确认的累计偏移。
    async fn upload_chunk(
        &self,
        session_id: &str,
        offset: u64,
        data: &[u8],
        is_final: bool,
    ) -> Result<u64>;

    /// 查询后端已确认接收的偏移，用于瞬态失败后的续传。
    async fn query_chunk_offset(&self, session_id: &str) -> Result<u64>;

    async fn abort_chunked(&self, session_id: &str) -> Result<()>;

    async fn open_append_stream(
        &self,
        bucket: &str,
        key: &str,
        generation: Option<i64>,
    ) -> Result<StreamId> {
        let _ = (bucket, key, generation);
        Err(FsError::Unsupported("append streams"))
    }

    /// 立即发送 bytes，返回确认后的累计偏移。
    async fn append(&self, stream: StreamId, data: &[u8]) -> Result<u64> {
        let _ = (stream, data);
        Err(FsError::Unsupported("append streams"))
    }

    /// 请求持久化检查点，不关闭流。
    async fn flush_stream(&self, stream: StreamId) -> Result<()> {
        let _ = stream;
        Err(FsError::Unsupported("append streams"))
    }

    /// 终结对象使之可读；终态操作。
    async fn finalize_stream(&self, stream: StreamId) -> Result<ObjectMeta> {
        let _ = stream;
        Err(FsError::Unsupported("append streams"))
    }

    /// 释放流资源；对任何状态的流都必须成功。
    async fn close_stream(&self, stream: StreamId) -> Result<()> {
        let _ = stream;
        Err(FsError::Unsupported("append streams"))
    }
}
