//! 分片结果缓存
//!
//! 以 URL 的 MD5 为键缓存切分结果，短时间内重复请求同一资源时直接复用分片文件。
//!
//! ## 过期机制
//!
//! 1. **延迟淘汰**: 每次写入都会安排一次 `ttl + eviction_margin` 后的淘汰，
//!    条目已被新写入覆盖时该次淘汰不生效
//! 2. **定期清扫**: `start()` 启动后台任务，每隔 `sweep_interval` 清理所有过期条目
//!
//! 两种机制互相独立。淘汰时总是先删除记录再删除分片文件。
//! 被覆盖条目的旧分片不会立即删除，而是在 `ttl + eviction_margin` 后删除。

use crate::config::CacheConfig;
use crate::splitter::{cleanup_parts, Part};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// 计算缓存键：URL 的 MD5（32 位小写十六进制）
pub fn cache_key(url: &str) -> String {
    format!("{:x}", md5::compute(url.as_bytes()))
}

/// 日志中只显示键的前 8 位
fn short_key(key: &str) -> &str {
    key.get(..8).unwrap_or(key)
}

/// 缓存条目
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub parts: Vec<Part>,
    pub total_size: u64,
    pub original_name: String,
    pub created_at: Instant,
    /// 写入代次，用于识别被覆盖的条目
    generation: u64,
}

impl CacheEntry {
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() >= ttl
    }

    async fn all_parts_exist(&self) -> bool {
        for part in &self.parts {
            if !tokio::fs::try_exists(&part.path).await.unwrap_or(false) {
                return false;
            }
        }
        true
    }
}

/// 分片结果缓存
pub struct ResultCache {
    entries: Arc<DashMap<String, CacheEntry>>,
    config: CacheConfig,
    next_generation: AtomicU64,
    /// 定期清扫任务
    sweep_task: Mutex<Option<JoinHandle<()>>>,
    /// shutdown 信号发送端
    shutdown_tx: broadcast::Sender<()>,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            entries: Arc::new(DashMap::new()),
            config,
            next_generation: AtomicU64::new(0),
            sweep_task: Mutex::new(None),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// 查询缓存
    ///
    /// 仅当条目未过期且所有分片文件仍存在时命中。
    /// 未命中的陈旧条目会被移除，其残留分片一并删除。
    pub async fn lookup(&self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.get(key).map(|e| e.value().clone())?;

        let ttl = self.config.ttl();
        if !entry.is_expired(ttl) && entry.all_parts_exist().await {
            debug!("缓存命中: {}...", short_key(key));
            return Some(entry);
        }

        // 只移除本次检查的那一代，避免误删并发写入的新条目
        let generation = entry.generation;
        if let Some((_, stale)) = self
            .entries
            .remove_if(key, |_, e| e.generation == generation)
        {
            debug!("缓存条目已失效: {}...", short_key(key));
            cleanup_parts(&stale.parts).await;
        }
        None
    }

    /// 写入缓存（覆盖同键旧条目），并安排延迟淘汰
    ///
    /// 被覆盖条目中不再引用的分片同样延迟删除。必须在 tokio 运行时内调用
    pub async fn store(
        &self,
        key: &str,
        parts: Vec<Part>,
        total_size: u64,
        original_name: impl Into<String>,
    ) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let entry = CacheEntry {
            parts,
            total_size,
            original_name: original_name.into(),
            created_at: Instant::now(),
            generation,
        };
        let num_parts = entry.parts.len();

        let superseded = self.entries.insert(key.to_string(), entry.clone());
        let delay = self.config.eviction_delay();

        if let Some(old) = superseded {
            // 旧分片可能仍在被上一个调用方使用，同样等到期后再删除
            let orphaned: Vec<Part> = old
                .parts
                .into_iter()
                .filter(|p| entry.parts.iter().all(|n| n.path != p.path))
                .collect();
            if !orphaned.is_empty() {
                debug!(
                    "缓存条目被覆盖: {}...，{} 个旧分片将在 {}s 后删除",
                    short_key(key),
                    orphaned.len(),
                    delay.as_secs()
                );
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    cleanup_parts(&orphaned).await;
                });
            }
        }

        info!(
            "💾 已缓存 {} 个分片: {}... (TTL: {}s)",
            num_parts,
            short_key(key),
            self.config.ttl().as_secs()
        );

        let entries = Arc::clone(&self.entries);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some((_, expired)) = entries.remove_if(&key, |_, e| e.generation == generation)
            {
                info!("🗑️ 缓存到期: {}...", short_key(&key));
                cleanup_parts(&expired.parts).await;
            }
        });
    }

    /// 是否存在记录（不检查过期和文件）
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// 移除记录，不删除分片文件
    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        self.entries.remove(key).map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 清理所有过期条目，返回清理数量
    pub async fn sweep_expired(&self) -> usize {
        sweep_entries(&self.entries, self.config.ttl()).await
    }

    // ========================================================================
    // 启动和关闭
    // ========================================================================

    /// 启动定期清扫任务
    pub fn start(&self) {
        let mut task = self.sweep_task.lock();
        if task.is_some() {
            warn!("缓存清扫任务已在运行");
            return;
        }

        let entries = Arc::clone(&self.entries);
        let ttl = self.config.ttl();
        let sweep_interval = self.config.sweep_interval();
        let shutdown_rx = self.shutdown_tx.subscribe();

        *task = Some(tokio::spawn(async move {
            sweep_loop(entries, ttl, sweep_interval, shutdown_rx).await;
        }));
        info!("缓存清扫任务已启动，清扫间隔: {}ms", self.config.sweep_interval_ms);
    }

    pub fn is_running(&self) -> bool {
        self.sweep_task.lock().is_some()
    }

    /// 停止定期清扫任务
    ///
    /// 已安排的延迟淘汰不受影响
    pub async fn stop(&self) {
        let handle = self.sweep_task.lock().take();
        let Some(handle) = handle else {
            return;
        };

        let _ = self.shutdown_tx.send(());
        match handle.await {
            Ok(_) => info!("缓存清扫任务已正常退出"),
            Err(e) => error!("缓存清扫任务异常退出: {}", e),
        }
    }
}

impl Drop for ResultCache {
    fn drop(&mut self) {
        if let Some(handle) = self.sweep_task.get_mut().take() {
            handle.abort();
        }
    }
}

async fn sweep_entries(entries: &DashMap<String, CacheEntry>, ttl: Duration) -> usize {
    // 先收集键，避免跨 await 持有分片锁
    let expired: Vec<String> = entries
        .iter()
        .filter(|e| e.value().is_expired(ttl))
        .map(|e| e.key().clone())
        .collect();

    let mut cleared = 0;
    for key in expired {
        if let Some((_, entry)) = entries.remove_if(&key, |_, e| e.is_expired(ttl)) {
            info!("🗑️ 清理过期缓存: {}...", short_key(&key));
            cleanup_parts(&entry.parts).await;
            cleared += 1;
        }
    }
    cleared
}

async fn sweep_loop(
    entries: Arc<DashMap<String, CacheEntry>>,
    ttl: Duration,
    sweep_interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(sweep_interval);

    // 第一次 tick 立即返回，跳过它
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let cleared = sweep_entries(&entries, ttl).await;
                if cleared > 0 {
                    info!("缓存清扫完成: 清理了 {} 个过期条目", cleared);
                } else {
                    debug!("缓存清扫完成: 无过期条目");
                }
            }
            _ = shutdown_rx.recv() => {
                info!("收到关闭信号，缓存清扫循环退出");
                break;
            }
        }
    }
}
