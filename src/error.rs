//! 统一错误类型：按可重试性划分的错误分类。

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FsError>;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// 网络/5xx/超时等瞬态错误，仅在 fetcher/session 边界做有界重试。
    #[error("transient transport error: {0}")]
    Transient(String),

    #[error("backend reported corrupted data: {0}")]
    Corruption(String),

    /// 一致性校验失败：对该句柄是致命的，不自动重试。
    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("I/O operation on closed handle")]
    ClosedHandle,

    #[error("write on a session whose final chunk was already sent")]
    ClosedSession,

    #[error("upload already finalized")]
    AlreadyFinalized,

    #[error("invalid session state: cannot {op} while {state}")]
    InvalidState { op: &'static str, state: &'static str },

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("backend does not support {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// 是否允许在传输边界重试。
    pub fn is_transient(&self) -> bool {
        matches!(self, FsError::Transient(_))
    }
}
