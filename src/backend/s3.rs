//! S3 适配器：基于 aws-sdk-s3 的 Standard 后端，范围 GET + simple/multipart PUT。
//!
//! chunked-resumable 会话映射到 multipart upload：一个 chunk 对应一个 part，
//! `query_chunk_offset` 通过 ListParts 求和得到后端已确认的偏移。
//! 批量范围与 append 流不受支持，保持 trait 默认的 `Unsupported`。

use crate::backend::transport::{BackendKind, ObjectHandle, ObjectMeta, ObjectTransport};
use crate::error::{FsError, Result};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::{Duration, sleep};

/// S3 后端配置选项。
#[derive(Debug, Clone)]
pub struct S3Config {
    /// 区域名
    pub region: String,
    /// 兼容端点（MinIO 等），None 时走默认解析
    pub endpoint_url: Option<String>,
    /// 最大重试次数
    pub max_retries: u32,
    /// 初始重试延迟（毫秒）
    pub initial_retry_delay_ms: u64,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint_url: None,
            max_retries: 3,
            initial_retry_delay_ms: 100,
        }
    }
}

struct MpSession {
    bucket: String,
    key: String,
    upload_id: String,
    parts: Vec<CompletedPart>,
    acked: u64,
}

pub struct S3Transport {
    client: Client,
    config: S3Config,
    sessions: Mutex<HashMap<String, MpSession>>,
    next_session: AtomicU64,
}

/// 与 SDK 错误文本匹配的分类；SDK 对不同操作生成不同错误类型，
/// 这里统一按报文内容归类。
fn sdk_err(op: &'static str, e: impl std::fmt::Display) -> FsError {
    let msg = format!("{op}: {e}");
    if msg.contains("NoSuchKey") || msg.contains("NotFound") || msg.contains("NoSuchUpload") {
        FsError::NotFound(msg)
    } else if msg.contains("AccessDenied") {
        FsError::PermissionDenied(msg)
    } else {
        FsError::Transient(msg)
    }
}

impl S3Transport {
    pub async fn new(config: S3Config) -> Result<Self> {
        let mut loader = aws_config::ConfigLoader::default()
            .credentials_provider(
                aws_config::environment::EnvironmentVariableCredentialsProvider::new(),
            )
            .region(aws_config::Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let conf = loader.load().await;
        Ok(Self {
            client: Client::new(&conf),
            config,
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        })
    }

    fn md5_base64(data: &[u8]) -> String {
        B64.encode(md5::compute(data).0)
    }

    /// 非 multipart 对象的 ETag 即内容 md5 的 hex 表示；转成 base64 供校验器比较。
    fn etag_to_md5_b64(etag: Option<&str>) -> Option<String> {
        let tag = etag?.trim_matches('"');
        if tag.len() == 32 {
            hex::decode(tag).ok().map(|raw| B64.encode(raw))
        } else {
            None
        }
    }

    async fn execute_with_retry<T, F, Fut, E>(
        &self,
        operation: F,
        operation_name: &'static str,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        let max_retries = self.config.max_retries;
        loop {
            attempt += 1;
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    let mapped = sdk_err(operation_name, e);
                    if !mapped.is_transient() || attempt > max_retries {
                        return Err(mapped);
                    }
                    let delay_ms = self.config.initial_retry_delay_ms * 2u64.pow(attempt - 1);
                    log::debug!("{operation_name} attempt {attempt} failed, retrying");
                    sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectTransport for S3Transport {
    async fn bucket_kind(&self, _bucket: &str) -> Result<BackendKind> {
        Ok(BackendKind::Standard)
    }

    async fn object_metadata(&self, bucket: &str, key: &str) -> Result<ObjectMeta> {
        let head = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_err("head_object", e))?;
        Ok(ObjectMeta {
            size: head.content_length().unwrap_or(0).max(0) as u64,
            md5_b64: Self::etag_to_md5_b64(head.e_tag()),
            generation: 0,
        })
    }

    async fn single_range_get(
        &self,
        handle: &ObjectHandle,
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        // HTTP Range 的 end 是闭区间；length == 0 表示读到末尾。
        let range = if length == 0 {
            format!("bytes={offset}-")
        } else {
            format!("bytes={offset}-{}", offset + length - 1)
        };
        let resp = self
            .client
            .get_object()
            .bucket(&handle.bucket)
            .key(&handle.key)
            .range(range)
            .send()
            .await
            .map_err(|e| sdk_err("get_object", e))?;
        let body = resp
            .body
            .collect()
            .await
            .map_err(|e| FsError::Transient(format!("get_object body: {e}")))?;
        Ok(body.into_bytes())
    }

    async fn simple_put(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        content_type: Option<&str>,
    ) -> Result<ObjectMeta> {
        let checksum = Self::md5_base64(data);
        let put = self
            .execute_with_retry(
                || async {
                    let mut req = self
                        .client
                        .put_object()
                        .bucket(bucket)
                        .key(key)
                        .body(data.to_owned().into())
                        .content_md5(checksum.clone());
                    if let Some(ct) = content_type {
                        req = req.content_type(ct);
                    }
                    req.send().await
                },
                "put_object",
            )
            .await?;
        Ok(ObjectMeta {
            size: data.len() as u64,
            md5_b64: Self::etag_to_md5_b64(put.e_tag()),
            generation: 0,
        })
    }

    async fn initiate_chunked(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> Result<String> {
        let mut req = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key);
        if let Some(ct) = content_type {
            req = req.content_type(ct);
        }
        let create = req
            .send()
            .await
            .map_err(|e| sdk_err("create_multipart_upload", e))?;
        let upload_id = create.upload_id().unwrap_or_default().to_string();
        let session_id = format!(
            "s3-upload-{}",
            self.next_session.fetch_add(1, Ordering::SeqCst)
        );
        self.sessions.lock().unwrap().insert(
            session_id.clone(),
            MpSession {
                bucket: bucket.to_string(),
                key: key.to_string(),
                upload_id,
                parts: Vec::new(),
                acked: 0,
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
        let (bucket, key, upload_id, part_number, acked) = {
            let sessions = self.sessions.lock().unwrap();
            let s = sessions
                .get(session_id)
                .ok_or_else(|| FsError::NotFound(format!("upload session {session_id}")))?;
            (
                s.bucket.clone(),
                s.key.clone(),
                s.upload_id.clone(),
                s.parts.len() as i32 + 1,
                s.acked,
            )
        };
        if offset != acked {
            return Err(FsError::InvalidRange(format!(
                "chunk offset {offset} does not match accepted {acked}"
            )));
        }
        let checksum = Self::md5_base64(data);
        let resp = self
            .execute_with_retry(
                || async {
                    self.client
                        .upload_part()
                        .bucket(&bucket)
                        .key(&key)
                        .upload_id(&upload_id)
                        .part_number(part_number)
                        .content_md5(checksum.clone())
                        .body(data.to_owned().into())
                        .send()
                        .await
                },
                "upload_part",
            )
            .await?;
        let new_acked = {
            let mut sessions = self.sessions.lock().unwrap();
            let s = sessions
                .get_mut(session_id)
                .ok_or_else(|| FsError::NotFound(format!("upload session {session_id}")))?;
            s.parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(resp.e_tag().map(|t| t.to_string()))
                    .build(),
            );
            s.acked += data.len() as u64;
            s.acked
        };
        if is_final {
            let parts = {
                let sessions = self.sessions.lock().unwrap();
                sessions
                    .get(session_id)
                    .map(|s| s.parts.clone())
                    .unwrap_or_default()
            };
            let completed = CompletedMultipartUpload::builder()
                .set_parts(Some(parts))
                .build();
            self.client
                .complete_multipart_upload()
                .bucket(&bucket)
                .key(&key)
                .upload_id(&upload_id)
                .multipart_upload(completed)
                .send()
                .await
                .map_err(|e| sdk_err("complete_multipart_upload", e))?;
            self.sessions.lock().unwrap().remove(session_id);
        }
        Ok(new_acked)
    }

    async fn query_chunk_offset(&self, session_id: &str) -> Result<u64> {
        let (bucket, key, upload_id) = {
            let sessions = self.sessions.lock().unwrap();
            let s = sessions
                .get(session_id)
                .ok_or_else(|| FsError::NotFound(format!("upload session {session_id}")))?;
            (s.bucket.clone(), s.key.clone(), s.upload_id.clone())
        };
        let listed = self
            .client
            .list_parts()
            .bucket(&bucket)
            .key(&key)
            .upload_id(&upload_id)
            .send()
            .await
            .map_err(|e| sdk_err("list_parts", e))?;
        let confirmed: u64 = listed
            .parts()
            .iter()
            .map(|p| p.size().unwrap_or(0).max(0) as u64)
            .sum();
        Ok(confirmed)
    }

    async fn abort_chunked(&self, session_id: &str) -> Result<()> {
        let removed = self.sessions.lock().unwrap().remove(session_id);
        if let Some(s) = removed {
            self.client
                .abort_multipart_upload()
                .bucket(&s.bucket)
                .key(&s.key)
                .upload_id(&s.upload_id)
                .send()
                .await
                .map_err(|e| sdk_err("abort_multipart_upload", e))?;
        }
        Ok(())
    }
}
