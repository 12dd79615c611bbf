//! 阻塞门面：在专用 runtime 上逐方法 `block_on` 驱动异步核心。
//!
//! 供非异步调用方使用；每个公开方法恰好一次 block_on，
//! 不得在已运行的 tokio runtime 内调用。

use crate::backend::transport::{ObjectMeta, ObjectTransport};
use crate::error::Result;
use crate::file::reader::ObjectReader;
use crate::file::writer::ObjectWriter;
use crate::fs::client::{ObjectFs, OpenOptions};
use bytes::Bytes;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

pub struct SyncObjectFs {
    runtime: Arc<Runtime>,
    fs: ObjectFs,
}

impl SyncObjectFs {
    pub fn new(transport: Arc<dyn ObjectTransport>) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()?;
        Ok(Self {
            runtime: Arc::new(runtime),
            fs: ObjectFs::new(transport),
        })
    }

    pub fn info(&self, path: &str) -> Result<ObjectMeta> {
        self.runtime.block_on(self.fs.info(path))
    }

    pub fn read_range(&self, path: &str, start: Option<i64>, end: Option<i64>) -> Result<Bytes> {
        self.runtime.block_on(self.fs.read_range(path, start, end))
    }

    pub fn read_block(
        &self,
        path: &str,
        offset: u64,
        length: u64,
        delimiter: Option<u8>,
    ) -> Result<Bytes> {
        self.runtime
            .block_on(self.fs.read_block(path, offset, length, delimiter))
    }

    pub fn cat(&self, path: &str) -> Result<Bytes> {
        self.runtime.block_on(self.fs.cat(path))
    }

    pub fn open_read(&self, path: &str, opts: &OpenOptions) -> Result<SyncReader> {
        let inner = self.runtime.block_on(self.fs.open_read(path, opts))?;
        Ok(SyncReader {
            runtime: self.runtime.clone(),
            inner,
        })
    }

    pub fn open_write(&self, path: &str, opts: &OpenOptions) -> Result<SyncWriter> {
        let inner = self.runtime.block_on(self.fs.open_write(path, opts))?;
        Ok(SyncWriter {
            runtime: self.runtime.clone(),
            inner,
        })
    }
}

pub struct SyncReader {
    runtime: Arc<Runtime>,
    inner: ObjectReader,
}

impl SyncReader {
    pub fn read(&mut self, n: Option<usize>) -> Result<Bytes> {
        self.runtime.block_on(self.inner.read(n))
    }

    pub fn read_line(&mut self) -> Result<Bytes> {
        self.runtime.block_on(self.inner.read_line())
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.runtime.block_on(self.inner.seek(pos))
    }

    pub fn tell(&self) -> u64 {
        self.inner.tell()
    }

    pub fn size(&mut self) -> Result<u64> {
        self.runtime.block_on(self.inner.size())
    }

    pub fn close(&mut self) -> Result<()> {
        self.runtime.block_on(self.inner.close())
    }
}

pub struct SyncWriter {
    runtime: Arc<Runtime>,
    inner: ObjectWriter,
}

impl SyncWriter {
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.runtime.block_on(self.inner.write(data))
    }

    pub fn flush(&mut self) -> Result<()> {
        self.runtime.block_on(self.inner.flush())
    }

    pub fn commit(&mut self) -> Result<ObjectMeta> {
        self.runtime.block_on(self.inner.commit())
    }

    pub fn discard(&mut self) -> Result<()> {
        self.runtime.block_on(self.inner.discard())
    }

    pub fn tell(&self) -> u64 {
        self.inner.tell()
    }

    pub fn close(&mut self) -> Result<()> {
        self.runtime.block_on(self.inner.close())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemTransport;
    use crate::backend::transport::BackendKind;

    // 阻塞门面自带 runtime，这里用普通 #[test]

    #[test]
    fn test_sync_write_then_read() {
        let mem = Arc::new(MemTransport::new(BackendKind::Standard));
        let fs = SyncObjectFs::new(mem).unwrap();
        let opts = OpenOptions::default();
        let mut w = fs.open_write("b/k", &opts).unwrap();
        w.write(b"first\nsecond\n").unwrap();
        w.close().unwrap();
        let mut r = fs.open_read("b/k", &opts).unwrap();
        assert_eq!(&r.read_line().unwrap()[..], b"first\n");
        assert_eq!(r.tell(), 6);
        r.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(&r.read(None).unwrap()[..], b"first\nsecond\n");
        r.close().unwrap();
        assert_eq!(&fs.cat("b/k").unwrap()[..], b"first\nsecond\n");
    }

    #[test]
    fn test_sync_read_range_limits() {
        let mem = Arc::new(MemTransport::new(BackendKind::Standard));
        mem.insert_object("b", "k", b"0123456789");
        let fs = SyncObjectFs::new(mem).unwrap();
        assert_eq!(&fs.read_range("b/k", Some(-3), None).unwrap()[..], b"789");
        assert!(fs.read_range("b/k", Some(4), Some(4)).unwrap().is_empty());
    }
}
