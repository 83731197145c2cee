//! 错误类型定义
//!
//! - `FetchError`: 远程资源下载失败
//! - `SplitError`: 文件切分失败
//! - `DeliveryError`: 协调器对外的统一错误

use std::path::PathBuf;
use thiserror::Error;

/// 远程下载错误
#[derive(Debug, Error)]
pub enum FetchError {
    /// HTTP 请求失败（连接失败、连接超时等）
    #[error("HTTP请求失败: {0}")]
    Request(#[from] reqwest::Error),

    /// 服务器返回非成功状态码
    #[error("HTTP错误: {status} ({url})")]
    Status {
        status: reqwest::StatusCode,
        url: String,
    },

    /// 超过空闲超时仍未收到数据
    #[error("下载空闲超时: {0}秒内未收到数据")]
    IdleTimeout(u64),

    /// 本地文件读写失败
    #[error("文件操作失败: {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 下载完成后文件大小与服务器声明的不一致
    #[error("文件大小不匹配: 实际 {actual} bytes, 期望 {expected} bytes")]
    SizeMismatch { expected: u64, actual: u64 },

    /// 分段请求被服务器忽略（返回了完整内容而非 206）
    #[error("服务器忽略了 Range 请求: bytes={start}-{end}")]
    RangeIgnored { start: u64, end: u64 },

    /// 下载报告完成但目标文件不存在
    #[error("下载完成但文件不存在: {0:?}")]
    MissingOutput(PathBuf),

    /// 分段下载任务异常退出
    #[error("分段下载任务异常: {0}")]
    TaskFailed(String),
}

impl FetchError {
    /// 是否值得重试（网络类错误重试，本地 I/O 和客户端错误不重试）
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Request(_) | Self::IdleTimeout(_) | Self::SizeMismatch { .. } => true,
            Self::Status { status, .. } => {
                status.is_server_error()
                    || *status == reqwest::StatusCode::REQUEST_TIMEOUT
                    || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// 文件切分错误
#[derive(Debug, Error)]
pub enum SplitError {
    /// 源文件为空，无法切分
    #[error("源文件为空，无法切分: {0:?}")]
    EmptySource(PathBuf),

    /// 分片大小为 0
    #[error("分片大小必须大于 0")]
    InvalidChunkSize,

    /// 读写分片文件失败
    #[error("分片文件操作失败: {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 源文件在切分过程中被截断
    #[error("分片 #{part_number} 读取不完整: 实际 {actual} bytes, 期望 {expected} bytes")]
    ShortRead {
        part_number: usize,
        expected: u64,
        actual: u64,
    },

    /// 分片写入任务异常退出
    #[error("分片写入任务异常: {0}")]
    TaskFailed(String),
}

impl SplitError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// 获取可投递文件时的错误
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("下载失败: {0}")]
    Fetch(#[from] FetchError),

    #[error("切分失败: {0}")]
    Split(#[from] SplitError),

    #[error("临时目录操作失败: {0}")]
    Io(#[from] std::io::Error),
}
