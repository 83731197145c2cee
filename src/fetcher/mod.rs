//! 远程资源下载
//!
//! `RemoteFetcher` 是协调器依赖的下载能力，默认实现为多连接分段下载的 `HttpFetcher`。

mod http;
mod segment;
mod types;

pub use http::HttpFetcher;
pub use segment::{plan_segments, Segment};
pub use types::{staging_file_name, SourceDescriptor, StagedFile};

use crate::error::FetchError;
use async_trait::async_trait;

/// 远程资源下载能力
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// 将 `url` 指向的资源下载到临时目录下的唯一文件
    ///
    /// 失败时不保证清理残留文件。
    async fn fetch(&self, url: &str, filename: &str) -> Result<StagedFile, FetchError>;

    /// 探测远程资源大小（HEAD 请求）
    ///
    /// 任何失败都返回 `None`，不会返回错误。
    async fn head_size(&self, url: &str) -> Option<u64>;
}
