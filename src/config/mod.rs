// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 1 GiB
const GIB: u64 = 1024 * 1024 * 1024;

/// 默认投递上限：约 1.9 GiB（超过此大小的文件需要切分）
pub const DEFAULT_DELIVERY_CEILING: u64 = GIB * 19 / 10;

/// 默认切分分片大小：1 GiB
pub const DEFAULT_SPLIT_CHUNK_SIZE: u64 = GIB;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 切分配置
    #[serde(default)]
    pub splitter: SplitterConfig,
    /// 远程下载配置
    #[serde(default)]
    pub fetch: FetchConfig,
    /// 切分结果缓存配置
    #[serde(default)]
    pub cache: CacheConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 切分配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitterConfig {
    /// 临时文件目录（下载文件和切分分片都放在这里）
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// 投递上限（字节），文件大小严格大于此值时才切分
    #[serde(default = "default_delivery_ceiling")]
    pub delivery_ceiling: u64,
    /// 切分分片大小（字节），最后一个分片可能更小
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// 每个分片复制时使用的读缓冲区大小（字节）
    #[serde(default = "default_copy_buffer_size")]
    pub copy_buffer_size: usize,
}

fn default_staging_dir() -> PathBuf {
    std::env::temp_dir().join("file_splits")
}

fn default_delivery_ceiling() -> u64 {
    DEFAULT_DELIVERY_CEILING
}

fn default_chunk_size() -> u64 {
    DEFAULT_SPLIT_CHUNK_SIZE
}

fn default_copy_buffer_size() -> usize {
    8 * 1024 * 1024 // 8MB
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            delivery_ceiling: default_delivery_ceiling(),
            chunk_size: default_chunk_size(),
            copy_buffer_size: default_copy_buffer_size(),
        }
    }
}

/// 远程下载配置
///
/// 多连接分段下载：
/// - 服务器支持 Range 时，按 `min_split_size` 切成最多 `connections` 段并发下载
/// - 每段失败后从已写入位置续传，最多尝试 `max_tries` 次，间隔固定 `retry_wait_ms`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// 最大并发连接数（分段数上限）
    #[serde(default = "default_connections")]
    pub connections: usize,
    /// 最小分段大小（字节）
    #[serde(default = "default_min_split_size")]
    pub min_split_size: u64,
    /// 每段最大尝试次数
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
    /// 重试间隔（毫秒）
    #[serde(default = "default_retry_wait_ms")]
    pub retry_wait_ms: u64,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 空闲超时（秒）：两次收到数据之间的最长等待时间
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// 请求使用的 User-Agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_connections() -> usize {
    16
}

fn default_min_split_size() -> u64 {
    1024 * 1024 // 1MB
}

fn default_max_tries() -> u32 {
    5
}

fn default_retry_wait_ms() -> u64 {
    10_000
}

fn default_connect_timeout_secs() -> u64 {
    60
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".to_string()
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            connections: default_connections(),
            min_split_size: default_min_split_size(),
            max_tries: default_max_tries(),
            retry_wait_ms: default_retry_wait_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl FetchConfig {
    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.retry_wait_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// 切分结果缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 缓存有效期（毫秒），默认 2 分钟
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,
    /// 单条缓存延迟淘汰的额外等待（毫秒），淘汰时间 = ttl + margin
    #[serde(default = "default_eviction_margin_ms")]
    pub eviction_margin_ms: u64,
    /// 定期清扫间隔（毫秒），默认 1 分钟
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_cache_ttl_ms() -> u64 {
    2 * 60 * 1000
}

fn default_eviction_margin_ms() -> u64 {
    5_000
}

fn default_sweep_interval_ms() -> u64 {
    60 * 1000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_cache_ttl_ms(),
            eviction_margin_ms: default_eviction_margin_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// 单条缓存的延迟淘汰时间
    pub fn eviction_delay(&self) -> Duration {
        Duration::from_millis(self.ttl_ms + self.eviction_margin_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl AppConfig {
    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        if self.splitter.chunk_size == 0 {
            anyhow::bail!("切分分片大小不能为 0");
        }
        if self.splitter.chunk_size > self.splitter.delivery_ceiling {
            anyhow::bail!(
                "切分分片大小 ({} bytes) 不能超过投递上限 ({} bytes)",
                self.splitter.chunk_size,
                self.splitter.delivery_ceiling
            );
        }
        if self.splitter.copy_buffer_size == 0 {
            anyhow::bail!("分片复制缓冲区大小不能为 0");
        }
        if self.fetch.connections == 0 {
            anyhow::bail!("下载并发连接数不能为 0");
        }
        if self.fetch.max_tries == 0 {
            anyhow::bail!("下载最大尝试次数至少为 1");
        }
        if self.fetch.min_split_size == 0 {
            anyhow::bail!("最小分段大小不能为 0");
        }
        if self.cache.ttl_ms == 0 || self.cache.sweep_interval_ms == 0 {
            anyhow::bail!("缓存有效期和清扫间隔必须大于 0");
        }
        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败：配置校验未通过")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {:#}", e);
                }

                default_config
            }
        }
    }
}
