//! 错误类型
//!
//! 核心组件返回类型化的 [`SyncError`]，编排层与命令行入口使用 `anyhow`。

use crate::core::lister::ListingInterrupted;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// 同步核心错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// 本地根目录不存在
    #[error("本地目录不存在: {}", path.display())]
    NotFound { path: PathBuf },

    /// 目录不可读（子树级别可恢复，根目录级别致命）
    #[error("无权访问: {}", path.display())]
    Permission {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// 远程列举中断，可通过续传令牌恢复
    #[error("列举远程对象失败 (续传令牌: {:?}): {}", .0.last_token, .0.source)]
    RemoteList(Box<ListingInterrupted>),

    /// 单个动作执行失败
    #[error("传输失败 {key}: {reason}")]
    Transfer {
        key: String,
        reason: String,
        transient: bool,
    },

    /// 持久化文档格式错误
    #[error("配置文档 {document} 无效: {reason}")]
    Validation { document: String, reason: String },

    #[error("操作已取消")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl SyncError {
    /// 是否值得重试一次
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Transfer { transient, .. } => *transient,
            SyncError::Store(e) => is_transient(e),
            _ => false,
        }
    }
}

/// 判断错误链中是否包含瞬时故障（网络错误、超时、存储端临时错误）
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(e) = cause.downcast_ref::<opendal::Error>() {
            return e.is_temporary();
        }
        if cause.is::<tokio::time::error::Elapsed>() {
            return true;
        }
        if let Some(e) = cause.downcast_ref::<io::Error>() {
            return matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::UnexpectedEof
            );
        }
        false
    })
}
