//! 投递协调器
//!
//! 对外唯一入口 `obtain_deliverable_parts`：
//!
//! 1. 按 URL 查缓存，命中则直接返回已有分片
//! 2. 未命中时下载到临时目录
//! 3. 不超过投递上限的文件原样返回，由调用方负责删除
//! 4. 超过上限的文件按 `chunk_size` 切分，删除临时文件，写入缓存后返回分片

use crate::cache::{cache_key, ResultCache};
use crate::common::format_size;
use crate::config::{AppConfig, SplitterConfig};
use crate::error::DeliveryError;
use crate::fetcher::{HttpFetcher, RemoteFetcher};
use crate::splitter::{cleanup_parts, JoinPlan, Part, SplitEngine};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{error, info, warn};

/// 可投递结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DeliveryPlan {
    /// 无需切分，整个文件直接投递
    Single { file_path: PathBuf, file_size: u64 },
    /// 已切分为多个分片
    Split {
        parts: Vec<Part>,
        total_size: u64,
        /// 调用方请求的文件名
        original_name: String,
        from_cache: bool,
    },
}

impl DeliveryPlan {
    pub fn needs_split(&self) -> bool {
        matches!(self, Self::Split { .. })
    }

    pub fn total_size(&self) -> u64 {
        match self {
            Self::Single { file_size, .. } => *file_size,
            Self::Split { total_size, .. } => *total_size,
        }
    }

    /// 分片列表，单文件时为空
    pub fn parts(&self) -> &[Part] {
        match self {
            Self::Single { .. } => &[],
            Self::Split { parts, .. } => parts,
        }
    }
}

/// 投递协调器
pub struct SplitCoordinator {
    config: SplitterConfig,
    fetcher: Arc<dyn RemoteFetcher>,
    engine: SplitEngine,
    cache: Arc<ResultCache>,
}

impl SplitCoordinator {
    pub fn new(
        config: SplitterConfig,
        fetcher: Arc<dyn RemoteFetcher>,
        cache: Arc<ResultCache>,
    ) -> Self {
        let engine = SplitEngine::from_config(&config);
        Self {
            config,
            fetcher,
            engine,
            cache,
        }
    }

    /// 按配置组装默认组件（`HttpFetcher` + 新缓存），并创建临时目录
    ///
    /// 缓存的定期清扫需要调用方另行 `cache().start()`
    pub fn from_config(config: &AppConfig) -> Result<Self, DeliveryError> {
        std::fs::create_dir_all(&config.splitter.staging_dir)?;
        let fetcher = HttpFetcher::new(config.fetch.clone(), &config.splitter.staging_dir)?;
        let cache = ResultCache::new(config.cache.clone());
        Ok(Self::new(
            config.splitter.clone(),
            Arc::new(fetcher),
            Arc::new(cache),
        ))
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn config(&self) -> &SplitterConfig {
        &self.config
    }

    /// 获取可投递的文件或分片
    ///
    /// # 参数
    /// * `url` - 资源地址，同时作为缓存键来源
    /// * `filename` - 期望的文件名
    pub async fn obtain_deliverable_parts(
        &self,
        url: &str,
        filename: &str,
    ) -> Result<DeliveryPlan, DeliveryError> {
        let key = cache_key(url);

        if let Some(cached) = self.cache.lookup(&key).await {
            info!("🚀 使用缓存分片: {} ({} 个分片)", filename, cached.parts.len());
            return Ok(DeliveryPlan::Split {
                parts: cached.parts,
                total_size: cached.total_size,
                original_name: cached.original_name,
                from_cache: true,
            });
        }

        let staged = self.fetcher.fetch(url, filename).await?;

        if !self.needs_splitting(staged.size) {
            info!(
                "文件大小 {} 未超过投递上限 {}，无需切分",
                format_size(staged.size),
                format_size(self.config.delivery_ceiling)
            );
            return Ok(DeliveryPlan::Single {
                file_path: staged.path,
                file_size: staged.size,
            });
        }

        info!(
            "文件大小 {} 超过投递上限 {}，开始切分",
            format_size(staged.size),
            format_size(self.config.delivery_ceiling)
        );

        let parts = match self.engine.split(&staged.path, self.config.chunk_size).await {
            Ok(parts) => parts,
            Err(e) => {
                error!("❌ 切分失败，清理残留文件: {:?}", staged.path);
                let planned =
                    self.engine
                        .planned_parts(&staged.path, staged.size, self.config.chunk_size);
                cleanup_parts(&planned).await;
                remove_staged(&staged.path).await;
                return Err(e.into());
            }
        };

        remove_staged(&staged.path).await;

        self.cache
            .store(&key, parts.clone(), staged.size, filename)
            .await;

        Ok(DeliveryPlan::Split {
            parts,
            total_size: staged.size,
            original_name: filename.to_string(),
            from_cache: false,
        })
    }

    /// 是否超过投递上限
    pub fn needs_splitting(&self, size: u64) -> bool {
        size > self.config.delivery_ceiling
    }

    /// 探测远程资源大小，失败返回 `None`
    pub async fn probe_size(&self, url: &str) -> Option<u64> {
        self.fetcher.head_size(url).await
    }

    /// 投递结束后清理分片
    ///
    /// 该 URL 仍有缓存记录时保留分片，交由缓存过期机制删除。返回实际删除的数量。
    pub async fn cleanup_parts_if_not_cached(&self, parts: &[Part], url: &str) -> usize {
        if self.cache.contains(&cache_key(url)) {
            return 0;
        }
        cleanup_parts(parts).await
    }

    /// 生成合并说明
    pub fn join_plan(original_name: &str, num_parts: usize) -> JoinPlan {
        JoinPlan::new(original_name, num_parts)
    }
}

async fn remove_staged(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("删除临时文件失败: {:?}, 错误: {}", path, e);
        }
    }
}
