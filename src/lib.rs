// Delivery Splitter Library
// 大文件下载、切分与分片缓存核心库

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 日志系统
pub mod logging;

// 远程下载模块
pub mod fetcher;

// 文件切分模块
pub mod splitter;

// 分片结果缓存
pub mod cache;

// 投递协调器
pub mod coordinator;

// 公共模块（字节数格式化等）
pub mod common;

// 导出常用类型
pub use cache::{cache_key, CacheEntry, ResultCache};
pub use common::{format_bytes, format_size};
pub use config::{AppConfig, CacheConfig, FetchConfig, LogConfig, SplitterConfig};
pub use coordinator::{DeliveryPlan, SplitCoordinator};
pub use error::{DeliveryError, FetchError, SplitError};
pub use fetcher::{HttpFetcher, RemoteFetcher, SourceDescriptor, StagedFile};
pub use logging::{init_logging, LogGuard};
pub use splitter::{cleanup_parts, JoinPlan, Part, SplitEngine};
