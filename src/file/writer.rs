//! 缓冲写句柄：小对象一次 PUT，超过阈值切换分块续传；
//! append 型后端在打开时就建立追加流。

use crate::backend::transport::{BackendKind, ObjectMeta, ObjectTransport};
use crate::error::{FsError, Result};
use crate::file::checker::{Checker, ConsistencyMode};
use crate::file::fetch::RetryConfig;
use crate::file::reader::DEFAULT_BLOCK_SIZE;
use crate::file::upload::{
    AppendStreamUpload, ChunkedResumableUpload, SimpleUpload, UploadSession,
};
use std::sync::Arc;

/// 打开时按后端能力选定的上传策略。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriteStrategy {
    /// 缓冲期间保留一次 PUT 的可能；第一次溢出后走分块续传。
    SimpleOrResumable,
    AppendStream,
}

pub struct ObjectWriter {
    transport: Arc<dyn ObjectTransport>,
    bucket: String,
    key: String,
    content_type: Option<String>,
    block_size: usize,
    finalize_on_close: bool,
    session: Option<Box<dyn UploadSession>>,
    buf: Vec<u8>,
    checker: Checker,
    written: u64,
    committed: bool,
    closed: bool,
}

impl ObjectWriter {
    /// `kind` 决定上传策略：append 型后端立刻建立追加流，
    /// 其余后端先缓冲，提交时再决定 simple 还是 chunked。
    pub async fn open(
        transport: Arc<dyn ObjectTransport>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        kind: BackendKind,
        block_size: Option<usize>,
        consistency: ConsistencyMode,
        finalize_on_close: bool,
        content_type: Option<String>,
    ) -> Result<Self> {
        let bucket = bucket.into();
        let key = key.into();
        let strategy = match kind {
            BackendKind::AppendCapable => WriteStrategy::AppendStream,
            BackendKind::Standard | BackendKind::Unknown => WriteStrategy::SimpleOrResumable,
        };
        let session: Option<Box<dyn UploadSession>> = match strategy {
            WriteStrategy::AppendStream => Some(Box::new(
                AppendStreamUpload::open(transport.clone(), &bucket, &key, None).await?,
            )),
            WriteStrategy::SimpleOrResumable => None,
        };
        // 写侧校验只能用本地可计算的量；Auto 在写路径退化为 size。
        let checker = Checker::for_mode(consistency, false);
        Ok(Self {
            transport,
            bucket,
            key,
            content_type,
            block_size: block_size.unwrap_or(DEFAULT_BLOCK_SIZE).max(1),
            finalize_on_close,
            session,
            buf: Vec::new(),
            checker,
            written: 0,
            committed: false,
            closed: false,
        })
    }

    pub fn tell(&self) -> u64 {
        self.written
    }

    fn check_writable(&self) -> Result<()> {
        if self.closed {
            return Err(FsError::ClosedHandle);
        }
        if self.committed {
            return Err(FsError::AlreadyFinalized);
        }
        Ok(())
    }

    /// 追加字节到写缓冲；跨过 block_size 阈值就把整块推给上传会话。
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.check_writable()?;
        self.checker.update(data);
        self.buf.extend_from_slice(data);
        self.written += data.len() as u64;
        if self.buf.len() >= self.block_size {
            self.drain_to_session().await?;
        }
        Ok(data.len())
    }

    /// 把缓冲字节交给会话；首次调用时为 standard 后端建立分块会话。
    async fn drain_to_session(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        if self.session.is_none() {
            let up = ChunkedResumableUpload::new(
                self.transport.clone(),
                self.bucket.clone(),
                self.key.clone(),
                self.content_type.clone(),
                self.block_size,
                RetryConfig::default(),
            );
            self.session = Some(Box::new(up));
        }
        let chunk = std::mem::take(&mut self.buf);
        match &mut self.session {
            Some(session) => session.write(&chunk).await,
            None => Ok(()),
        }
    }

    /// 强制把已缓冲的字节推到后端（append 流同时下刷一个持久点）。
    pub async fn flush(&mut self) -> Result<()> {
        self.check_writable()?;
        self.drain_to_session().await?;
        if let Some(session) = &mut self.session {
            session.flush().await?;
        }
        Ok(())
    }

    /// 提交：使对象以完整内容可见，并用服务端元数据校验写入的字节。
    pub async fn commit(&mut self) -> Result<ObjectMeta> {
        self.check_writable()?;
        let meta = match &mut self.session {
            None => {
                // 从未溢出缓冲的小对象：单次 PUT
                let mut up = SimpleUpload::new(
                    self.transport.clone(),
                    self.bucket.clone(),
                    self.key.clone(),
                    self.content_type.clone(),
                );
                up.write(&self.buf).await?;
                self.buf.clear();
                up.finalize().await?
            }
            Some(session) => {
                if !self.buf.is_empty() {
                    let tail = std::mem::take(&mut self.buf);
                    session.write(&tail).await?;
                }
                session.finalize().await?
            }
        };
        // chunked 完成应答不携带元数据，补一次 metadata 查询
        let meta = match meta {
            Some(meta) => meta,
            None => {
                self.transport
                    .object_metadata(&self.bucket, &self.key)
                    .await?
            }
        };
        self.checker.validate(&meta)?;
        self.committed = true;
        Ok(meta)
    }

    /// 放弃写入。standard 后端中止未完成会话；append 型后端
    /// 无法回滚，仅记录告警。句柄随后不可再写。
    pub async fn discard(&mut self) -> Result<()> {
        if self.closed {
            return Err(FsError::ClosedHandle);
        }
        self.buf.clear();
        if let Some(session) = &mut self.session {
            session.discard().await?;
            // 丢弃后句柄不再可用，释放底层流资源
            session.close(false).await?;
        }
        self.closed = true;
        Ok(())
    }

    /// 关闭句柄。`finalize_on_close` 为真且尚未提交时先提交；
    /// 提交失败也会把句柄置为关闭再传播错误。
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let result = if self.committed || !self.finalize_on_close {
            Ok(())
        } else {
            self.commit().await.map(|_| ())
        };
        if let Some(session) = &mut self.session {
            // 释放底层资源；finalize 已在 commit 路径完成
            session.close(false).await?;
        }
        self.closed = true;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemTransport;
    use crate::backend::transport::ObjectHandle;

    async fn open_writer(
        mem: &Arc<MemTransport>,
        kind: BackendKind,
        block_size: usize,
    ) -> ObjectWriter {
        ObjectWriter::open(
            mem.clone(),
            "b",
            "k",
            kind,
            Some(block_size),
            ConsistencyMode::Auto,
            true,
            None,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_small_write_commits_as_single_put() {
        let mem = Arc::new(MemTransport::new(BackendKind::Standard));
        let mut w = open_writer(&mem, BackendKind::Standard, 1024).await;
        w.write(b"tiny payload").await.unwrap();
        let meta = w.commit().await.unwrap();
        assert_eq!(meta.size, 12);
        assert_eq!(mem.counters().simple_put, 1);
        assert_eq!(mem.counters().upload_chunk, 0);
        assert_eq!(mem.object("b", "k").unwrap(), b"tiny payload");
    }

    #[tokio::test]
    async fn test_large_write_switches_to_chunked() {
        let mem = Arc::new(MemTransport::new(BackendKind::Standard));
        let mut w = open_writer(&mem, BackendKind::Standard, 8).await;
        let payload: Vec<u8> = (0..30u8).collect();
        w.write(&payload[..10]).await.unwrap();
        w.write(&payload[10..]).await.unwrap();
        w.commit().await.unwrap();
        assert_eq!(mem.counters().simple_put, 0);
        assert!(mem.counters().upload_chunk > 1);
        assert_eq!(mem.object("b", "k").unwrap(), payload);
    }

    #[tokio::test]
    async fn test_append_capable_streams_and_finalizes_on_close() {
        let mem = Arc::new(MemTransport::new(BackendKind::AppendCapable));
        let mut w = open_writer(&mem, BackendKind::AppendCapable, 4).await;
        w.write(b"first ").await.unwrap();
        w.write(b"second").await.unwrap();
        w.close().await.unwrap();
        assert!(mem.counters().append >= 1);
        assert_eq!(mem.counters().finalize_stream, 1);
        assert_eq!(mem.counters().close_stream, 1);
        assert_eq!(mem.object("b", "k").unwrap(), b"first second");
    }

    #[tokio::test]
    async fn test_write_after_commit_and_after_close() {
        let mem = Arc::new(MemTransport::new(BackendKind::Standard));
        let mut w = open_writer(&mem, BackendKind::Standard, 1024).await;
        w.write(b"abc").await.unwrap();
        w.commit().await.unwrap();
        assert!(matches!(
            w.write(b"more").await.unwrap_err(),
            FsError::AlreadyFinalized
        ));
        assert!(matches!(
            w.commit().await.unwrap_err(),
            FsError::AlreadyFinalized
        ));
        w.close().await.unwrap();
        assert!(matches!(
            w.write(b"more").await.unwrap_err(),
            FsError::ClosedHandle
        ));
    }

    #[tokio::test]
    async fn test_discard_leaves_no_object_on_standard_backend() {
        let mem = Arc::new(MemTransport::new(BackendKind::Standard));
        let mut w = open_writer(&mem, BackendKind::Standard, 4).await;
        w.write(b"abcdefgh").await.unwrap();
        w.discard().await.unwrap();
        assert!(mem.object("b", "k").is_none());
        assert!(matches!(
            w.write(b"x").await.unwrap_err(),
            FsError::ClosedHandle
        ));
    }

    #[tokio::test]
    async fn test_close_without_finalize_leaves_object_unpublished() {
        let mem = Arc::new(MemTransport::new(BackendKind::AppendCapable));
        let mut w = ObjectWriter::open(
            mem.clone(),
            "b",
            "k",
            BackendKind::AppendCapable,
            Some(4),
            ConsistencyMode::Auto,
            false,
            None,
        )
        .await
        .unwrap();
        w.write(b"partial").await.unwrap();
        w.close().await.unwrap();
        assert_eq!(mem.counters().finalize_stream, 0);
        assert_eq!(mem.counters().close_stream, 1);
        assert!(mem.object("b", "k").is_none());
    }

    #[tokio::test]
    async fn test_commit_validates_written_size() {
        let mem = Arc::new(MemTransport::new(BackendKind::Standard));
        let mut w = open_writer(&mem, BackendKind::Standard, 1024).await;
        w.write(b"validated bytes").await.unwrap();
        let meta = w.commit().await.unwrap();
        // size 校验通过，写入可读回
        let handle = ObjectHandle::new("b", "k");
        let back = mem.single_range_get(&handle, 0, 0).await.unwrap();
        assert_eq!(&back[..], b"validated bytes");
        assert_eq!(meta.size, w.tell());
    }
}
