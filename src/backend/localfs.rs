//! 本地文件目录后端：模拟 append-capable 对象存储（实现 ObjectTransport）。
//!
//! 对象即 `root/bucket/key` 文件；chunked/append 上传先写入 staging 文件，
//! finalize 时 rename 进正式位置。父目录缺失一律递归创建，
//! 不从错误文本推断 precondition 语义。

use crate::backend::transport::{
    BackendKind, ObjectHandle, ObjectMeta, ObjectTransport, StreamId,
};
use crate::error::{FsError, Result};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::{fs, io::AsyncWriteExt};

struct Staged {
    bucket: String,
    key: String,
    path: PathBuf,
    finalized: bool,
}

pub struct LocalFsTransport {
    root: PathBuf,
    chunk_sessions: Mutex<HashMap<String, Staged>>,
    streams: Mutex<HashMap<StreamId, Staged>>,
    next_id: AtomicU64,
}

impl LocalFsTransport {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            chunk_sessions: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn path_for(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }

    fn staging_path(&self, id: u64) -> PathBuf {
        self.root.join(".staging").join(id.to_string())
    }

    async fn read_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        match fs::read(self.path_for(bucket, key)).await {
            Ok(buf) => Ok(buf),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FsError::NotFound(format!("{bucket}/{key}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn new_staging(&self) -> Result<(u64, PathBuf)> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let path = self.staging_path(id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        fs::File::create(&path).await?;
        Ok((id, path))
    }

    async fn promote(&self, staging: &Path, bucket: &str, key: &str) -> Result<ObjectMeta> {
        let dest = self.path_for(bucket, key);
        if let Some(dir) = dest.parent() {
            fs::create_dir_all(dir).await?;
        }
        fs::rename(staging, &dest).await?;
        self.object_metadata(bucket, key).await
    }

    fn generation_of(meta: &std::fs::Metadata) -> i64 {
        meta.modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0)
    }

    fn slice_range(data: &[u8], offset: u64, length: u64) -> Bytes {
        let start = offset.min(data.len() as u64) as usize;
        let end = if length == 0 {
            data.len()
        } else {
            (offset + length).min(data.len() as u64) as usize
        };
        Bytes::copy_from_slice(&data[start..end.max(start)])
    }
}

#[async_trait]
impl ObjectTransport for LocalFsTransport {
    async fn bucket_kind(&self, _bucket: &str) -> Result<BackendKind> {
        Ok(BackendKind::AppendCapable)
    }

    async fn object_metadata(&self, bucket: &str, key: &str) -> Result<ObjectMeta> {
        let path = self.path_for(bucket, key);
        let fs_meta = match fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FsError::NotFound(format!("{bucket}/{key}")));
            }
            Err(e) => return Err(e.into()),
        };
        let data = fs::read(&path).await?;
        Ok(ObjectMeta {
            size: fs_meta.len(),
            md5_b64: Some(B64.encode(md5::compute(&data).0)),
            generation: Self::generation_of(&fs_meta),
        })
    }

    async fn single_range_get(
        &self,
        handle: &ObjectHandle,
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        let data = self.read_object(&handle.bucket, &handle.key).await?;
        Ok(Self::slice_range(&data, offset, length))
    }

    async fn batch_range_get(
        &self,
        handle: &ObjectHandle,
        ranges: &[(u64, u64)],
    ) -> Result<Vec<Bytes>> {
        // 一次读取，按请求顺序切片，对应一次携带全部范围的 wire call。
        let data = self.read_object(&handle.bucket, &handle.key).await?;
        Ok(ranges
            .iter()
            .map(|&(offset, length)| Self::slice_range(&data, offset, length))
            .collect())
    }

    async fn simple_put(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        _content_type: Option<&str>,
    ) -> Result<ObjectMeta> {
        let path = self.path_for(bucket, key);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let mut f = fs::File::create(&path).await?;
        f.write_all(data).await?;
        f.flush().await?;
        self.object_metadata(bucket, key).await
    }

    async fn initiate_chunked(
        &self,
        bucket: &str,
        key: &str,
        _content_type: Option<&str>,
    ) -> Result<String> {
        let (id, path) = self.new_staging().await?;
        let session_id = format!("local-upload-{id}");
        self.chunk_sessions.lock().unwrap().insert(
            session_id.clone(),
            Staged {
                bucket: bucket.to_string(),
                key: key.to_string(),
                path,
                finalized: false,
            },
        );
        Ok(session_id)
    }

    async fn upload_chunk(
        &self,
        session_id: &str,
        offset: u64,
        data: &[u8],
        is_final: bool,
    ) -> Result<u64> {
        let (path, bucket, key) = {
            let sessions = self.chunk_sessions.lock().unwrap();
            let s = sessions
                .get(session_id)
                .ok_or_else(|| FsError::NotFound(format!("upload session {session_id}")))?;
            if s.finalized {
                return Err(FsError::InvalidState {
                    op: "upload_chunk",
                    state: "finalized",
                });
            }
            (s.path.clone(), s.bucket.clone(), s.key.clone())
        };
        let accepted = fs::metadata(&path).await?.len();
        if offset != accepted {
            return Err(FsError::InvalidRange(format!(
                "chunk offset {offset} does not match accepted {accepted}"
            )));
        }
        let mut f = fs::OpenOptions::new().append(true).open(&path).await?;
        f.write_all(data).await?;
        f.flush().await?;
        let acked = accepted + data.len() as u64;
        if is_final {
            if let Some(s) = self.chunk_sessions.lock().unwrap().get_mut(session_id) {
                s.finalized = true;
            }
            self.promote(&path, &bucket, &key).await?;
        }
        Ok(acked)
    }

    async fn query_chunk_offset(&self, session_id: &str) -> Result<u64> {
        let path = {
            let sessions = self.chunk_sessions.lock().unwrap();
            sessions
                .get(session_id)
                .map(|s| s.path.clone())
                .ok_or_else(|| FsError::NotFound(format!("upload session {session_id}")))?
        };
        Ok(fs::metadata(&path).await?.len())
    }

    async fn abort_chunked(&self, session_id: &str) -> Result<()> {
        let staged = self.chunk_sessions.lock().unwrap().remove(session_id);
        if let Some(s) = staged {
            let _ = fs::remove_file(&s.path).await;
        }
        Ok(())
    }

    async fn open_append_stream(
        &self,
        bucket: &str,
        key: &str,
        generation: Option<i64>,
    ) -> Result<StreamId> {
        let (id, path) = self.new_staging().await?;
        // 续写已有对象：以既有内容作为流的起点。
        if generation.is_some() {
            let existing = self.read_object(bucket, key).await?;
            fs::write(&path, &existing).await?;
        }
        self.streams.lock().unwrap().insert(
            id,
            Staged {
                bucket: bucket.to_string(),
                key: key.to_string(),
                path,
                finalized: false,
            },
        );
        Ok(id)
    }

    async fn append(&self, stream: StreamId, data: &[u8]) -> Result<u64> {
        let path = {
            let streams = self.streams.lock().unwrap();
            let s = streams
                .get(&stream)
                .ok_or_else(|| FsError::NotFound(format!("append stream {stream}")))?;
            if s.finalized {
                return Err(FsError::InvalidState {
                    op: "append",
                    state: "finalized",
                });
            }
            s.path.clone()
        };
        let mut f = fs::OpenOptions::new().append(true).open(&path).await?;
        f.write_all(data).await?;
        f.flush().await?;
        Ok(fs::metadata(&path).await?.len())
    }

    async fn flush_stream(&self, stream: StreamId) -> Result<()> {
        let path = {
            let streams = self.streams.lock().unwrap();
            streams
                .get(&stream)
                .map(|s| s.path.clone())
                .ok_or_else(|| FsError::NotFound(format!("append stream {stream}")))?
        };
        let f = fs::OpenOptions::new().append(true).open(&path).await?;
        f.sync_all().await?;
        Ok(())
    }

    async fn finalize_stream(&self, stream: StreamId) -> Result<ObjectMeta> {
        let (path, bucket, key) = {
            let mut streams = self.streams.lock().unwrap();
            let s = streams
                .get_mut(&stream)
                .ok_or_else(|| FsError::NotFound(format!("append stream {stream}")))?;
            if s.finalized {
                return Err(FsError::AlreadyFinalized);
            }
            s.finalized = true;
            (s.path.clone(), s.bucket.clone(), s.key.clone())
        };
        self.promote(&path, &bucket, &key).await
    }

    async fn close_stream(&self, stream: StreamId) -> Result<()> {
        // 未 finalize 的 staging 文件保留为后端定义的部分状态。
        self.streams.lock().unwrap().remove(&stream);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_localfs_put_get_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let t = LocalFsTransport::new(tmp.path());
        t.simple_put("b", "dir/k", b"hello", None).await.unwrap();
        let meta = t.object_metadata("b", "dir/k").await.unwrap();
        assert_eq!(meta.size, 5);
        let out = t
            .single_range_get(&ObjectHandle::new("b", "dir/k"), 1, 3)
            .await
            .unwrap();
        assert_eq!(&out[..], b"ell");
    }

    #[tokio::test]
    async fn test_localfs_append_stream_finalize_by_rename() {
        let tmp = tempfile::tempdir().unwrap();
        let t = LocalFsTransport::new(tmp.path());
        let id = t.open_append_stream("b", "k", None).await.unwrap();
        assert_eq!(t.append(id, b"abc").await.unwrap(), 3);
        assert_eq!(t.append(id, b"def").await.unwrap(), 6);
        // finalize 之前对象不可见
        assert!(matches!(
            t.object_metadata("b", "k").await.unwrap_err(),
            FsError::NotFound(_)
        ));
        let meta = t.finalize_stream(id).await.unwrap();
        assert_eq!(meta.size, 6);
        t.close_stream(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_localfs_chunked_resume_offset() {
        let tmp = tempfile::tempdir().unwrap();
        let t = LocalFsTransport::new(tmp.path());
        let sid = t.initiate_chunked("b", "k", None).await.unwrap();
        t.upload_chunk(&sid, 0, b"0123", false).await.unwrap();
        assert_eq!(t.query_chunk_offset(&sid).await.unwrap(), 4);
        // 错位的 offset 被拒绝
        assert!(t.upload_chunk(&sid, 2, b"xx", false).await.is_err());
        t.upload_chunk(&sid, 4, b"45", true).await.unwrap();
        let handle = ObjectHandle::new("b", "k");
        let out = t.single_range_get(&handle, 0, 0).await.unwrap();
        assert_eq!(&out[..], b"012345");
    }
}
