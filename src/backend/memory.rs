//! 内存后端：用于本地开发/测试，带调用计数与瞬态故障注入。

use crate::backend::transport::{
    BackendKind, ObjectHandle, ObjectMeta, ObjectTransport, StreamId,
};
use crate::error::{FsError, Result};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

fn md5_b64(data: &[u8]) -> String {
    B64.encode(md5::compute(data).0)
}

#[derive(Clone)]
struct StoredObject {
    data: Vec<u8>,
    generation: i64,
}

struct ChunkSession {
    bucket: String,
    key: String,
    buf: Vec<u8>,
    finalized: bool,
}

struct AppendStream {
    bucket: String,
    key: String,
    buf: Vec<u8>,
    finalized: bool,
    closed: bool,
}

/// 各后端调用的次数，测试用来断言"未触达传输层"之类的性质。
#[derive(Clone, Copy, Debug, Default)]
pub struct CallCounters {
    pub bucket_kind: usize,
    pub metadata: usize,
    pub single_range: usize,
    pub batch_range: usize,
    pub simple_put: usize,
    pub upload_chunk: usize,
    pub append: usize,
    pub finalize_stream: usize,
    pub close_stream: usize,
}

pub struct MemTransport {
    kind: BackendKind,
    objects: Mutex<HashMap<(String, String), StoredObject>>,
    chunk_sessions: Mutex<HashMap<String, ChunkSession>>,
    streams: Mutex<HashMap<StreamId, AppendStream>>,
    counters: Mutex<CallCounters>,
    next_generation: AtomicI64,
    next_stream: AtomicU64,
    next_session: AtomicU64,
    // 故障注入：接下来 N 次对应调用返回 Transient。
    fail_appends: AtomicUsize,
    fail_chunks: AtomicUsize,
    fail_offset_queries: AtomicUsize,
    fail_range_gets: AtomicUsize,
    // 为真时，被注入失败的 chunk 先被后端接受再报错（考察 query-offset 续传）。
    accept_before_chunk_fail: Mutex<bool>,
}

impl MemTransport {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            objects: Mutex::new(HashMap::new()),
            chunk_sessions: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            counters: Mutex::new(CallCounters::default()),
            next_generation: AtomicI64::new(1),
            next_stream: AtomicU64::new(1),
            next_session: AtomicU64::new(1),
            fail_appends: AtomicUsize::new(0),
            fail_chunks: AtomicUsize::new(0),
            fail_offset_queries: AtomicUsize::new(0),
            fail_range_gets: AtomicUsize::new(0),
            accept_before_chunk_fail: Mutex::new(false),
        }
    }

    pub fn insert_object(&self, bucket: &str, key: &str, data: &[u8]) {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        self.objects.lock().unwrap().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: data.to_vec(),
                generation,
            },
        );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
    }

    pub fn counters(&self) -> CallCounters {
        *self.counters.lock().unwrap()
    }

    pub fn inject_append_failures(&self, n: usize) {
        self.fail_appends.store(n, Ordering::SeqCst);
    }

    pub fn inject_range_get_failures(&self, n: usize) {
        self.fail_range_gets.store(n, Ordering::SeqCst);
    }

    pub fn inject_chunk_failures(&self, n: usize, accept_first: bool) {
        self.fail_chunks.store(n, Ordering::SeqCst);
        *self.accept_before_chunk_fail.lock().unwrap() = accept_first;
    }

    pub fn inject_offset_query_failures(&self, n: usize) {
        self.fail_offset_queries.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn lookup(&self, bucket: &str, key: &str) -> Result<StoredObject> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| FsError::NotFound(format!("{bucket}/{key}")))
    }

    fn publish(&self, bucket: &str, key: &str, data: Vec<u8>) -> ObjectMeta {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let meta = ObjectMeta {
            size: data.len() as u64,
            md5_b64: Some(md5_b64(&data)),
            generation,
        };
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), StoredObject { data, generation });
        meta
    }

    fn slice_range(data: &[u8], offset: u64, length: u64) -> Result<Bytes> {
        let start = offset.min(data.len() as u64) as usize;
        let end = if length == 0 {
            data.len()
        } else {
            (offset + length).min(data.len() as u64) as usize
        };
        Ok(Bytes::copy_from_slice(&data[start..end.max(start)]))
    }
}

#[async_trait]
impl ObjectTransport for MemTransport {
    async fn bucket_kind(&self, _bucket: &str) -> Result<BackendKind> {
        self.counters.lock().unwrap().bucket_kind += 1;
        Ok(self.kind)
    }

    async fn object_metadata(&self, bucket: &str, key: &str) -> Result<ObjectMeta> {
        self.counters.lock().unwrap().metadata += 1;
        let obj = self.lookup(bucket, key)?;
        Ok(ObjectMeta {
            size: obj.data.len() as u64,
            md5_b64: Some(md5_b64(&obj.data)),
            generation: obj.generation,
        })
    }

    async fn single_range_get(
        &self,
        handle: &ObjectHandle,
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        self.counters.lock().unwrap().single_range += 1;
        if Self::take_failure(&self.fail_range_gets) {
            return Err(FsError::Transient("injected range-get failure".into()));
        }
        let obj = self.lookup(&handle.bucket, &handle.key)?;
        if let Some(generation) = handle.generation
            && generation != obj.generation
        {
            return Err(FsError::NotFound(format!(
                "{}/{} generation {generation}",
                handle.bucket, handle.key
            )));
        }
        Self::slice_range(&obj.data, offset, length)
    }

    async fn batch_range_get(
        &self,
        handle: &ObjectHandle,
        ranges: &[(u64, u64)],
    ) -> Result<Vec<Bytes>> {
        if self.kind != BackendKind::AppendCapable {
            return Err(FsError::Unsupported("batched multi-range download"));
        }
        self.counters.lock().unwrap().batch_range += 1;
        let obj = self.lookup(&handle.bucket, &handle.key)?;
        ranges
            .iter()
            .map(|&(offset, length)| Self::slice_range(&obj.data, offset, length))
            .collect()
    }

    async fn simple_put(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        _content_type: Option<&str>,
    ) -> Result<ObjectMeta> {
        self.counters.lock().unwrap().simple_put += 1;
        Ok(self.publish(bucket, key, data.to_vec()))
    }

    async fn initiate_chunked(
        &self,
        bucket: &str,
        key: &str,
        _content_type: Option<&str>,
    ) -> Result<String> {
        let id = format!("mem-upload-{}", self.next_session.fetch_add(1, Ordering::SeqCst));
        self.chunk_sessions.lock().unwrap().insert(
            id.clone(),
            ChunkSession {
                bucket: bucket.to_string(),
                key: key.to_string(),
                buf: Vec::new(),
                finalized: false,
            },
        );
        Ok(id)
    }

    async fn upload_chunk(
        &self,
        session_id: &str,
        offset: u64,
        data: &[u8],
        is_final: bool,
    ) -> Result<u64> {
        self.counters.lock().unwrap().upload_chunk += 1;
        let fail = Self::take_failure(&self.fail_chunks);
        let accept = !fail || *self.accept_before_chunk_fail.lock().unwrap();
        let mut sessions = self.chunk_sessions.lock().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| FsError::NotFound(format!("upload session {session_id}")))?;
        if session.finalized {
            return Err(FsError::InvalidState {
                op: "upload_chunk",
                state: "finalized",
            });
        }
        if offset != session.buf.len() as u64 {
            return Err(FsError::InvalidRange(format!(
                "chunk offset {offset} does not match accepted {}",
                session.buf.len()
            )));
        }
        if accept {
            session.buf.extend_from_slice(data);
        }
        if fail {
            return Err(FsError::Transient("injected chunk failure".into()));
        }
        let acked = session.buf.len() as u64;
        if is_final {
            session.finalized = true;
            let (bucket, key, buf) =
                (session.bucket.clone(), session.key.clone(), session.buf.clone());
            drop(sessions);
            self.publish(&bucket, &key, buf);
        }
        Ok(acked)
    }

    async fn query_chunk_offset(&self, session_id: &str) -> Result<u64> {
        if Self::take_failure(&self.fail_offset_queries) {
            return Err(FsError::Transient("injected offset-query failure".into()));
        }
        let sessions = self.chunk_sessions.lock().unwrap();
        let session = sessions
            .get(session_id)
            .ok_or_else(|| FsError::NotFound(format!("upload session {session_id}")))?;
        Ok(session.buf.len() as u64)
    }

    async fn abort_chunked(&self, session_id: &str) -> Result<()> {
        self.chunk_sessions.lock().unwrap().remove(session_id);
        Ok(())
    }

    async fn open_append_stream(
        &self,
        bucket: &str,
        key: &str,
        generation: Option<i64>,
    ) -> Result<StreamId> {
        if self.kind != BackendKind::AppendCapable {
            return Err(FsError::Unsupported("append streams"));
        }
        // 续写已有对象时从既有 generation 的内容继续。
        let buf = match generation {
            Some(generation) => {
                let obj = self.lookup(bucket, key)?;
                if obj.generation != generation {
                    return Err(FsError::NotFound(format!(
                        "{bucket}/{key} generation {generation}"
                    )));
                }
                obj.data
            }
            None => Vec::new(),
        };
        let id = self.next_stream.fetch_add(1, Ordering::SeqCst);
        self.streams.lock().unwrap().insert(
            id,
            AppendStream {
                bucket: bucket.to_string(),
                key: key.to_string(),
                buf,
                finalized: false,
                closed: false,
            },
        );
        Ok(id)
    }

    async fn append(&self, stream: StreamId, data: &[u8]) -> Result<u64> {
        self.counters.lock().unwrap().append += 1;
        if Self::take_failure(&self.fail_appends) {
            return Err(FsError::Transient("injected append failure".into()));
        }
        let mut streams = self.streams.lock().unwrap();
        let st = streams
            .get_mut(&stream)
            .ok_or_else(|| FsError::NotFound(format!("append stream {stream}")))?;
        if st.finalized || st.closed {
            return Err(FsError::InvalidState {
                op: "append",
                state: "finalized or closed",
            });
        }
        st.buf.extend_from_slice(data);
        Ok(st.buf.len() as u64)
    }

    async fn flush_stream(&self, stream: StreamId) -> Result<()> {
        let streams = self.streams.lock().unwrap();
        streams
            .get(&stream)
            .map(|_| ())
            .ok_or_else(|| FsError::NotFound(format!("append stream {stream}")))
    }

    async fn finalize_stream(&self, stream: StreamId) -> Result<ObjectMeta> {
        self.counters.lock().unwrap().finalize_stream += 1;
        let (bucket, key, buf) = {
            let mut streams = self.streams.lock().unwrap();
            let st = streams
                .get_mut(&stream)
                .ok_or_else(|| FsError::NotFound(format!("append stream {stream}")))?;
            if st.finalized {
                return Err(FsError::AlreadyFinalized);
            }
            st.finalized = true;
            (st.bucket.clone(), st.key.clone(), st.buf.clone())
        };
        Ok(self.publish(&bucket, &key, buf))
    }

    async fn close_stream(&self, stream: StreamId) -> Result<()> {
        self.counters.lock().unwrap().close_stream += 1;
        if let Some(st) = self.streams.lock().unwrap().get_mut(&stream) {
            st.closed = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_range_get_clamps_to_object_size() {
        let mem = MemTransport::new(BackendKind::Standard);
        mem.insert_object("b", "k", b"hello world");
        let handle = ObjectHandle::new("b", "k");
        let out = mem.single_range_get(&handle, 6, 100).await.unwrap();
        assert_eq!(&out[..], b"world");
        // length == 0 读到末尾
        let out = mem.single_range_get(&handle, 0, 0).await.unwrap();
        assert_eq!(&out[..], b"hello world");
    }

    #[tokio::test]
    async fn test_batch_requires_append_capable() {
        let mem = MemTransport::new(BackendKind::Standard);
        mem.insert_object("b", "k", b"abc");
        let handle = ObjectHandle::new("b", "k");
        let err = mem.batch_range_get(&handle, &[(0, 1)]).await.unwrap_err();
        assert!(matches!(err, FsError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_append_stream_publishes_on_finalize_only() {
        let mem = MemTransport::new(BackendKind::AppendCapable);
        let id = mem.open_append_stream("b", "k", None).await.unwrap();
        mem.append(id, b"part1 ").await.unwrap();
        mem.append(id, b"part2").await.unwrap();
        assert!(mem.object("b", "k").is_none());
        mem.finalize_stream(id).await.unwrap();
        assert_eq!(mem.object("b", "k").unwrap(), b"part1 part2");
        assert!(matches!(
            mem.finalize_stream(id).await.unwrap_err(),
            FsError::AlreadyFinalized
        ));
    }
}
