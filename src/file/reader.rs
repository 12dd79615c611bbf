//! ObjectReader：在范围 GET 之上提供 seek/read/readline 的随机访问读。
//!
//! 读路径：应用 → 缓存窗口 →（miss 时）RangeFetcher → 传输层 → 校验器 → 应用。
//! 首次访问解析并固定对象 generation，句柄生命周期内读到一致视图。

use crate::backend::transport::{ObjectHandle, ObjectMeta, ObjectTransport};
use crate::error::{FsError, Result};
use crate::file::cache::BlockCache;
use crate::file::checker::{Checker, ConsistencyMode};
use crate::file::fetch::RangeFetcher;
use bytes::Bytes;
use std::io::SeekFrom;
use std::sync::Arc;

pub const DEFAULT_BLOCK_SIZE: usize = 5 * 1024 * 1024;

pub struct ObjectReader {
    transport: Arc<dyn ObjectTransport>,
    fetcher: Box<dyn RangeFetcher>,
    handle: ObjectHandle,
    block_size: usize,
    consistency: ConsistencyMode,
    // 首次访问时解析并固定
    meta: Option<ObjectMeta>,
    checker: Option<Checker>,
    cache: BlockCache,
    pos: u64,
    // 线性读校验：下一个按序偏移；乱序访问后解除 close 时的校验
    checker_offset: u64,
    checker_armed: bool,
    closed: bool,
}

impl ObjectReader {
    pub fn new(
        transport: Arc<dyn ObjectTransport>,
        fetcher: Box<dyn RangeFetcher>,
        handle: ObjectHandle,
        block_size: usize,
        consistency: ConsistencyMode,
    ) -> Self {
        Self {
            transport,
            fetcher,
            handle,
            block_size: block_size.max(1),
            consistency,
            meta: None,
            checker: None,
            cache: BlockCache::new(),
            pos: 0,
            checker_offset: 0,
            checker_armed: true,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(FsError::ClosedHandle)
        } else {
            Ok(())
        }
    }

    /// 解析对象元数据并固定 generation；每句柄只发生一次。
    async fn ensure_meta(&mut self) -> Result<&ObjectMeta> {
        if self.meta.is_none() {
            let meta = self
                .transport
                .object_metadata(&self.handle.bucket, &self.handle.key)
                .await?;
            if self.handle.generation.is_none() {
                self.handle.generation = Some(meta.generation);
            }
            self.checker = Some(Checker::for_mode(
                self.consistency,
                meta.md5_b64.is_some(),
            ));
            self.meta = Some(meta);
        }
        self.meta.as_ref().ok_or(FsError::InvalidState {
            op: "metadata",
            state: "unresolved",
        })
    }

    pub async fn size(&mut self) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.ensure_meta().await?.size)
    }

    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// 只移动游标，不触发 I/O；SeekFrom::End 需要已解析的对象大小。
    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.ensure_open()?;
        let new_pos = match pos {
            SeekFrom::Start(p) => i64::try_from(p).map_err(|_| {
                FsError::InvalidRange(format!("seek position {p} overflows addressable range"))
            })?,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
            SeekFrom::End(delta) => self.size().await? as i64 + delta,
        };
        if new_pos < 0 {
            return Err(FsError::InvalidRange(format!(
                "seek resolves to negative position {new_pos}"
            )));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }

    fn feed_checker(&mut self, offset: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.checker_armed && offset == self.checker_offset {
            if let Some(checker) = self.checker.as_mut() {
                checker.update(data);
            }
            self.checker_offset += data.len() as u64;
        } else {
            self.checker_armed = false;
        }
    }

    /// 读 n 字节；None 表示读到 EOF。命中窗口时不发 I/O，
    /// miss 时取 `max(n, block_size)` 的窗口整体替换。
    pub async fn read(&mut self, n: Option<usize>) -> Result<Bytes> {
        self.ensure_open()?;
        let size = self.ensure_meta().await?.size;
        if self.pos >= size {
            return Ok(Bytes::new());
        }
        let remaining = (size - self.pos) as usize;
        let want = n.map_or(remaining, |n| n.min(remaining));
        if want == 0 {
            return Ok(Bytes::new());
        }
        let out = if self.cache.covers(self.pos, want) {
            self.cache.slice(self.pos, want)
        } else {
            let window = want.max(self.block_size).min(remaining);
            let fetched = self.fetcher.fetch(&self.handle, self.pos, window as u64).await?;
            self.cache.replace(self.pos, fetched);
            self.cache.slice(self.pos, want)
        };
        self.feed_checker(self.pos, &out);
        self.pos += out.len() as u64;
        Ok(out)
    }

    /// 读一行（含换行符）；EOF 处返回无换行的剩余字节。
    /// 窗口按 block 增量增长，已缓存的字节不会重复拉取。
    pub async fn read_line(&mut self) -> Result<Bytes> {
        self.ensure_open()?;
        let size = self.ensure_meta().await?.size;
        if self.pos >= size {
            return Ok(Bytes::new());
        }
        if !self.cache.covers(self.pos, 1) {
            let window = self.block_size.min((size - self.pos) as usize);
            let fetched = self.fetcher.fetch(&self.handle, self.pos, window as u64).await?;
            self.cache.replace(self.pos, fetched);
        } else {
            // 前向扫描时丢弃已消费前缀，窗口驻留量不随输出增长
            self.cache.shrink_to(self.pos);
        }
        let out = loop {
            if let Some(nl) = self.cache.find_byte(self.pos, b'\n') {
                break self.cache.slice(self.pos, (nl - self.pos + 1) as usize);
            }
            if self.cache.end() >= size {
                break self.cache.tail(self.pos);
            }
            let grow = self.block_size.min((size - self.cache.end()) as usize);
            let more = self
                .fetcher
                .fetch(&self.handle, self.cache.end(), grow as u64)
                .await?;
            self.cache.extend(&more);
        };
        self.feed_checker(self.pos, &out);
        self.pos += out.len() as u64;
        Ok(out)
    }

    /// 历史最大窗口字节数（观测缓存收缩性质用）。
    pub fn cache_peak_len(&self) -> usize {
        self.cache.peak_len()
    }

    /// 释放窗口并在完成了一次完整线性读时执行一致性校验。
    /// 即使校验失败，资源也已先行释放。
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.cache.clear();
        if let (Some(meta), Some(checker)) = (self.meta.as_ref(), self.checker.as_ref())
            && self.checker_armed
            && self.checker_offset == meta.size
        {
            checker.validate(meta)?;
        }
        Ok(())
    }
}
