//! 上传会话状态机：Simple / ChunkedResumable / AppendStream 三种策略。
//!
//! 状态转移单向（Open 可自环），由唯一的 transition 函数把关；
//! 任何上传路径的失败都先释放底层流资源再向上传播。

use crate::backend::transport::{ObjectMeta, ObjectTransport, StreamId};
use crate::error::{FsError, Result};
use crate::file::fetch::RetryConfig;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::{Duration, sleep};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Finalizing,
    Finalized,
    Closed,
    Failed,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Open => "open",
            SessionState::Finalizing => "finalizing",
            SessionState::Finalized => "finalized",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }

    /// 唯一的状态转移入口；非法转移返回类型化错误而不是散落的布尔检查。
    fn advance(&mut self, to: SessionState, op: &'static str) -> Result<()> {
        use SessionState::*;
        let allowed = matches!(
            (*self, to),
            (Open, Open)
                | (Open, Finalizing)
                | (Open, Failed)
                | (Open, Closed)
                | (Finalizing, Finalized)
                | (Finalizing, Failed)
                | (Finalized, Closed)
                | (Failed, Closed)
        );
        if allowed {
            *self = to;
            Ok(())
        } else {
            Err(FsError::InvalidState {
                op,
                state: self.name(),
            })
        }
    }
}

/// 一次上传的公共操作面。`offset()` 是后端已持久接受的字节数，
/// 只随确认前进，绝不回退。
#[async_trait]
pub trait UploadSession: Send {
    fn state(&self) -> SessionState;
    fn offset(&self) -> u64;
    async fn write(&mut self, data: &[u8]) -> Result<()>;
    async fn flush(&mut self) -> Result<()>;
    async fn finalize(&mut self) -> Result<Option<ObjectMeta>>;
    async fn discard(&mut self) -> Result<()>;
    async fn close(&mut self, finalize_on_close: bool) -> Result<Option<ObjectMeta>>;
}

// ---------------- Simple ----------------

/// 整个负载一次 simple PUT；小对象/整体写使用，不存在部分可见状态。
pub struct SimpleUpload {
    transport: Arc<dyn ObjectTransport>,
    bucket: String,
    key: String,
    content_type: Option<String>,
    buf: Vec<u8>,
    acked: u64,
    state: SessionState,
}

impl SimpleUpload {
    pub fn new(
        transport: Arc<dyn ObjectTransport>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        content_type: Option<String>,
    ) -> Self {
        Self {
            transport,
            bucket: bucket.into(),
            key: key.into(),
            content_type,
            buf: Vec::new(),
            acked: 0,
            state: SessionState::Open,
        }
    }
}

#[async_trait]
impl UploadSession for SimpleUpload {
    fn state(&self) -> SessionState {
        self.state
    }

    fn offset(&self) -> u64 {
        self.acked
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.state.advance(SessionState::Open, "write")?;
        self.buf.extend_from_slice(data);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        // 单次 PUT 协议没有中间持久点
        Ok(())
    }

    async fn finalize(&mut self) -> Result<Option<ObjectMeta>> {
        if self.state == SessionState::Finalized {
            return Err(FsError::AlreadyFinalized);
        }
        self.state.advance(SessionState::Finalizing, "finalize")?;
        let put = self
            .transport
            .simple_put(
                &self.bucket,
                &self.key,
                &self.buf,
                self.content_type.as_deref(),
            )
            .await;
        match put {
            Ok(meta) => {
                self.acked = self.buf.len() as u64;
                self.buf.clear();
                self.state.advance(SessionState::Finalized, "finalize")?;
                Ok(Some(meta))
            }
            Err(e) => {
                self.state.advance(SessionState::Failed, "finalize")?;
                Err(e)
            }
        }
    }

    async fn discard(&mut self) -> Result<()> {
        // 尚未产生远端状态，丢弃缓冲即可
        self.buf.clear();
        self.state.advance(SessionState::Closed, "discard")?;
        Ok(())
    }

    async fn close(&mut self, finalize_on_close: bool) -> Result<Option<ObjectMeta>> {
        if self.state == SessionState::Closed {
            return Ok(None);
        }
        let meta = if finalize_on_close && self.state == SessionState::Open {
            Some(self.finalize().await?)
        } else {
            None
        };
        self.state.advance(SessionState::Closed, "close")?;
        Ok(meta.flatten())
    }
}

// ---------------- ChunkedResumable ----------------

/// 分块可续传上传：缓冲到协商 chunk 大小后整块发送；
/// 瞬态失败后以后端确认的偏移续传，而不是假设本地缓冲已被接受。
pub struct ChunkedResumableUpload {
    transport: Arc<dyn ObjectTransport>,
    bucket: String,
    key: String,
    content_type: Option<String>,
    chunk_size: usize,
    retry: RetryConfig,
    session_id: Option<String>,
    buf: Vec<u8>,
    acked: u64,
    state: SessionState,
}

impl ChunkedResumableUpload {
    pub fn new(
        transport: Arc<dyn ObjectTransport>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        content_type: Option<String>,
        chunk_size: usize,
        retry: RetryConfig,
    ) -> Self {
        Self {
            transport,
            bucket: bucket.into(),
            key: key.into(),
            content_type,
            chunk_size: chunk_size.max(1),
            retry,
            session_id: None,
            buf: Vec::new(),
            acked: 0,
            state: SessionState::Open,
        }
    }

    async fn ensure_session(&mut self) -> Result<String> {
        if let Some(id) = &self.session_id {
            return Ok(id.clone());
        }
        let id = self
            .transport
            .initiate_chunked(&self.bucket, &self.key, self.content_type.as_deref())
            .await?;
        self.session_id = Some(id.clone());
        Ok(id)
    }

    /// 发送一个 chunk；瞬态失败时执行 query-offset-then-resume。
    async fn send_chunk(&mut self, data: &[u8], is_final: bool) -> Result<()> {
        let session_id = self.ensure_session().await?;
        let mut skip = 0usize;
        let mut attempt = 0u32;
        loop {
            let pending = &data[skip..];
            let sent = self
                .transport
                .upload_chunk(&session_id, self.acked, pending, is_final)
                .await;
            match sent {
                Ok(acked) => {
                    self.acked = acked;
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay_ms = self.retry.initial_delay_ms * 2u64.pow(attempt - 1);
                    sleep(Duration::from_millis(delay_ms)).await;
                    // 本地缓冲是否已被接受以后端答复为准；
                    // 连确认偏移都拿不到时会话进入终态
                    let confirmed = match self.transport.query_chunk_offset(&session_id).await {
                        Ok(confirmed) => confirmed,
                        Err(e) => {
                            self.state
                                .advance(SessionState::Failed, "query_chunk_offset")?;
                            return Err(e);
                        }
                    };
                    let already = confirmed.saturating_sub(self.acked) as usize;
                    skip += already.min(pending.len());
                    self.acked = confirmed;
                    if skip >= data.len() && !is_final {
                        return Ok(());
                    }
                    // is_final 时须重发（可能为空的）final chunk 完成会话
                }
                Err(e) => {
                    self.state.advance(SessionState::Failed, "upload_chunk")?;
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl UploadSession for ChunkedResumableUpload {
    fn state(&self) -> SessionState {
        self.state
    }

    fn offset(&self) -> u64 {
        self.acked
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.state != SessionState::Open {
            // final chunk 已发出后写入是使用错误
            return Err(FsError::ClosedSession);
        }
        self.buf.extend_from_slice(data);
        while self.buf.len() >= self.chunk_size {
            let chunk: Vec<u8> = self.buf.drain(..self.chunk_size).collect();
            self.send_chunk(&chunk, false).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.state.advance(SessionState::Open, "flush")?;
        if !self.buf.is_empty() {
            let chunk = std::mem::take(&mut self.buf);
            self.send_chunk(&chunk, false).await?;
        }
        Ok(())
    }

    async fn finalize(&mut self) -> Result<Option<ObjectMeta>> {
        if self.state == SessionState::Finalized {
            return Err(FsError::AlreadyFinalized);
        }
        self.state.advance(SessionState::Finalizing, "finalize")?;
        let tail = std::mem::take(&mut self.buf);
        self.send_chunk(&tail, true).await?;
        self.state.advance(SessionState::Finalized, "finalize")?;
        Ok(None)
    }

    async fn discard(&mut self) -> Result<()> {
        if let Some(id) = self.session_id.take() {
            self.transport.abort_chunked(&id).await?;
        }
        self.buf.clear();
        self.state.advance(SessionState::Closed, "discard")?;
        Ok(())
    }

    async fn close(&mut self, finalize_on_close: bool) -> Result<Option<ObjectMeta>> {
        if self.state == SessionState::Closed {
            return Ok(None);
        }
        if finalize_on_close && self.state == SessionState::Open {
            self.finalize().await?;
        }
        // 未 finalize 的 resumable 会话留在后端定义的部分状态
        self.state.advance(SessionState::Closed, "close")?;
        Ok(None)
    }
}

// ---------------- AppendStream ----------------

/// append-only 流式上传（zonal 类后端）：字节立即发送，按确认推进偏移；
/// finalize 终结对象，close 无条件释放流资源。
pub struct AppendStreamUpload {
    transport: Arc<dyn ObjectTransport>,
    stream: Option<StreamId>,
    acked: u64,
    state: SessionState,
}

impl AppendStreamUpload {
    /// 建立绑定到对象的追加流；传入 generation 时续写既有对象。
    pub async fn open(
        transport: Arc<dyn ObjectTransport>,
        bucket: &str,
        key: &str,
        generation: Option<i64>,
    ) -> Result<Self> {
        let stream = transport.open_append_stream(bucket, key, generation).await?;
        Ok(Self {
            transport,
            stream: Some(stream),
            acked: 0,
            state: SessionState::Open,
        })
    }

    fn stream_id(&self) -> Result<StreamId> {
        self.stream.ok_or(FsError::InvalidState {
            op: "append",
            state: "stream released",
        })
    }

    /// 释放底层流；只执行一次。
    async fn release_stream(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            self.transport.close_stream(stream).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl UploadSession for AppendStreamUpload {
    fn state(&self) -> SessionState {
        self.state
    }

    fn offset(&self) -> u64 {
        self.acked
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.state.advance(SessionState::Open, "append")?;
        let stream = self.stream_id()?;
        match self.transport.append(stream, data).await {
            Ok(acked) => {
                self.acked = acked;
                Ok(())
            }
            Err(e) => {
                // 失败路径也必须先关闭流（不 finalize）再传播
                self.state.advance(SessionState::Failed, "append")?;
                self.release_stream().await?;
                Err(e)
            }
        }
    }

    async fn flush(&mut self) -> Result<()> {
        self.state.advance(SessionState::Open, "flush")?;
        let stream = self.stream_id()?;
        self.transport.flush_stream(stream).await
    }

    async fn finalize(&mut self) -> Result<Option<ObjectMeta>> {
        if self.state == SessionState::Finalized {
            return Err(FsError::AlreadyFinalized);
        }
        self.state.advance(SessionState::Finalizing, "finalize")?;
        let stream = self.stream_id()?;
        match self.transport.finalize_stream(stream).await {
            Ok(meta) => {
                self.state.advance(SessionState::Finalized, "finalize")?;
                Ok(Some(meta))
            }
            Err(e) => {
                self.state.advance(SessionState::Failed, "finalize")?;
                self.release_stream().await?;
                Err(e)
            }
        }
    }

    async fn discard(&mut self) -> Result<()> {
        // append-only 后端无法回滚；仅记录告警，不算错误
        log::warn!("discard is not applicable for append-only streams; nothing rolled back");
        Ok(())
    }

    async fn close(&mut self, finalize_on_close: bool) -> Result<Option<ObjectMeta>> {
        if self.state == SessionState::Closed {
            return Ok(None);
        }
        let mut meta = None;
        let mut finalize_err = None;
        if finalize_on_close && self.state == SessionState::Open {
            match self.finalize().await {
                Ok(m) => meta = m,
                Err(e) => finalize_err = Some(e),
            }
        }
        // 无论此前状态如何都释放流资源
        self.release_stream().await?;
        self.state.advance(SessionState::Closed, "close")?;
        match finalize_err {
            Some(e) => Err(e),
            None => Ok(meta),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemTransport;
    use crate::backend::transport::BackendKind;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_chunked_two_writes_offset_and_readback() {
        let mem = Arc::new(MemTransport::new(BackendKind::Standard));
        let mut up = ChunkedResumableUpload::new(mem.clone(), "b", "k", None, 4, fast_retry());
        let data1 = b"0123456";
        let data2 = b"789abcd";
        up.write(data1).await.unwrap();
        up.write(data2).await.unwrap();
        up.finalize().await.unwrap();
        assert_eq!(up.offset(), (data1.len() + data2.len()) as u64);
        assert_eq!(mem.object("b", "k").unwrap(), b"0123456789abcd");
    }

    #[tokio::test]
    async fn test_chunked_resume_when_backend_accepted_before_failure() {
        let mem = Arc::new(MemTransport::new(BackendKind::Standard));
        // chunk 被后端接受但应答丢失：续传必须以 query 到的偏移为准，不得重复发送
        mem.inject_chunk_failures(1, true);
        let mut up = ChunkedResumableUpload::new(mem.clone(), "b", "k", None, 4, fast_retry());
        up.write(b"abcdefgh").await.unwrap();
        up.finalize().await.unwrap();
        assert_eq!(mem.object("b", "k").unwrap(), b"abcdefgh");
    }

    #[tokio::test]
    async fn test_chunked_resume_when_backend_rejected() {
        let mem = Arc::new(MemTransport::new(BackendKind::Standard));
        mem.inject_chunk_failures(1, false);
        let mut up = ChunkedResumableUpload::new(mem.clone(), "b", "k", None, 4, fast_retry());
        up.write(b"abcdefgh").await.unwrap();
        up.finalize().await.unwrap();
        assert_eq!(mem.object("b", "k").unwrap(), b"abcdefgh");
        assert_eq!(up.offset(), 8);
    }

    #[tokio::test]
    async fn test_chunked_offset_query_failure_fails_the_session() {
        let mem = Arc::new(MemTransport::new(BackendKind::Standard));
        // chunk 瞬态失败触发续传查询，查询本身也失败：会话必须进入终态
        mem.inject_chunk_failures(1, false);
        mem.inject_offset_query_failures(1);
        let mut up = ChunkedResumableUpload::new(mem.clone(), "b", "k", None, 4, fast_retry());
        let err = up.write(b"abcdefgh").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(up.state(), SessionState::Failed);
        assert!(matches!(
            up.write(b"more").await.unwrap_err(),
            FsError::ClosedSession
        ));
    }

    #[tokio::test]
    async fn test_chunked_write_after_finalize_is_closed_session() {
        let mem = Arc::new(MemTransport::new(BackendKind::Standard));
        let mut up = ChunkedResumableUpload::new(mem.clone(), "b", "k", None, 4, fast_retry());
        up.write(b"xy").await.unwrap();
        up.finalize().await.unwrap();
        assert!(matches!(
            up.write(b"z").await.unwrap_err(),
            FsError::ClosedSession
        ));
        assert!(matches!(
            up.finalize().await.unwrap_err(),
            FsError::AlreadyFinalized
        ));
    }

    #[tokio::test]
    async fn test_simple_upload_single_put() {
        let mem = Arc::new(MemTransport::new(BackendKind::Standard));
        let mut up = SimpleUpload::new(mem.clone(), "b", "k", Some("text/plain".into()));
        up.write(b"hello").await.unwrap();
        let meta = up.finalize().await.unwrap().unwrap();
        assert_eq!(meta.size, 5);
        assert_eq!(up.offset(), 5);
        assert_eq!(mem.counters().simple_put, 1);
        assert_eq!(mem.counters().upload_chunk, 0);
        assert!(matches!(
            up.finalize().await.unwrap_err(),
            FsError::AlreadyFinalized
        ));
    }

    #[tokio::test]
    async fn test_append_close_without_finalize() {
        let mem = Arc::new(MemTransport::new(BackendKind::AppendCapable));
        let mut up = AppendStreamUpload::open(mem.clone(), "b", "k", None)
            .await
            .unwrap();
        up.write(b"abc").await.unwrap();
        up.close(false).await.unwrap();
        assert_eq!(mem.counters().finalize_stream, 0);
        assert_eq!(mem.counters().close_stream, 1);
    }

    #[tokio::test]
    async fn test_append_close_with_finalize_exactly_once() {
        let mem = Arc::new(MemTransport::new(BackendKind::AppendCapable));
        let mut up = AppendStreamUpload::open(mem.clone(), "b", "k", None)
            .await
            .unwrap();
        up.write(b"abc").await.unwrap();
        up.write(b"def").await.unwrap();
        assert_eq!(up.offset(), 6);
        up.close(true).await.unwrap();
        assert_eq!(mem.counters().finalize_stream, 1);
        assert_eq!(mem.counters().close_stream, 1);
        assert_eq!(mem.object("b", "k").unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn test_append_double_finalize() {
        let mem = Arc::new(MemTransport::new(BackendKind::AppendCapable));
        let mut up = AppendStreamUpload::open(mem.clone(), "b", "k", None)
            .await
            .unwrap();
        up.finalize().await.unwrap();
        assert!(matches!(
            up.finalize().await.unwrap_err(),
            FsError::AlreadyFinalized
        ));
    }

    #[tokio::test]
    async fn test_append_failure_closes_stream_once_and_propagates() {
        let mem = Arc::new(MemTransport::new(BackendKind::AppendCapable));
        let mut up = AppendStreamUpload::open(mem.clone(), "b", "k", None)
            .await
            .unwrap();
        mem.inject_append_failures(1);
        let err = up.write(b"abc").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(up.state(), SessionState::Failed);
        assert_eq!(mem.counters().close_stream, 1);
        assert_eq!(mem.counters().finalize_stream, 0);
        // 后续 close 不再重复释放流
        up.close(false).await.unwrap();
        assert_eq!(mem.counters().close_stream, 1);
    }

    #[tokio::test]
    async fn test_append_discard_is_a_warning_not_an_error() {
        let mem = Arc::new(MemTransport::new(BackendKind::AppendCapable));
        let mut up = AppendStreamUpload::open(mem.clone(), "b", "k", None)
            .await
            .unwrap();
        up.write(b"abc").await.unwrap();
        up.discard().await.unwrap();
        // 不回滚：流仍然开着，可以继续 append
        up.write(b"def").await.unwrap();
        up.close(true).await.unwrap();
        assert_eq!(mem.object("b", "k").unwrap(), b"abcdef");
    }

    #[test]
    fn test_state_machine_rejects_invalid_transitions() {
        let mut s = SessionState::Finalized;
        assert!(s.advance(SessionState::Open, "write").is_err());
        assert!(s.advance(SessionState::Finalizing, "finalize").is_err());
        assert!(s.advance(SessionState::Closed, "close").is_ok());
        let mut s = SessionState::Closed;
        assert!(s.advance(SessionState::Open, "write").is_err());
    }
}
