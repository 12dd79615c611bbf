//! 一致性校验器：对流经的字节累计 size/md5，与服务端元数据比对。

use crate::backend::transport::ObjectMeta;
use crate::error::{FsError, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;

/// 调用方指定的校验模式；Auto 依据后端是否返回 digest 自动降级。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConsistencyMode {
    Md5,
    Size,
    None,
    #[default]
    Auto,
}

/// 滚动累加器。按严格递增的偏移顺序喂入一次线性读/写的每段字节，
/// 在流结束时与参考元数据比较。比较失败对该句柄是终态。
pub enum Checker {
    Md5(md5::Context),
    Size(u64),
    Null,
}

impl Checker {
    /// 按模式构造；Auto 在有 digest 时选 md5，否则退化为 size-only。
    pub fn for_mode(mode: ConsistencyMode, digest_available: bool) -> Self {
        match mode {
            ConsistencyMode::Md5 => Checker::Md5(md5::Context::new()),
            ConsistencyMode::Size => Checker::Size(0),
            ConsistencyMode::None => Checker::Null,
            ConsistencyMode::Auto => {
                if digest_available {
                    Checker::Md5(md5::Context::new())
                } else {
                    Checker::Size(0)
                }
            }
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Checker::Md5(ctx) => ctx.consume(data),
            Checker::Size(count) => *count += data.len() as u64,
            Checker::Null => {}
        }
    }

    pub fn validate(&self, reference: &ObjectMeta) -> Result<()> {
        match self {
            Checker::Md5(ctx) => {
                let digest = B64.encode(ctx.clone().compute().0);
                match &reference.md5_b64 {
                    Some(expected) if *expected == digest => Ok(()),
                    Some(expected) => Err(FsError::Integrity(format!(
                        "md5 mismatch: computed {digest}, server reported {expected}"
                    ))),
                    None => Err(FsError::Integrity(
                        "md5 checking requested but server reported no digest".into(),
                    )),
                }
            }
            Checker::Size(count) => {
                if *count == reference.size {
                    Ok(())
                } else {
                    Err(FsError::Integrity(format!(
                        "size mismatch: consumed {count}, server reported {}",
                        reference.size
                    )))
                }
            }
            Checker::Null => Ok(()),
        }
    }
}
