// 下载模块类型定义

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// 进程内递增序号，保证同一毫秒内生成的文件名也不冲突
static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// 下载目标
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// 资源 URL
    pub url: String,
    /// 期望的文件名（仅用于命名和展示）
    pub filename: String,
}

impl SourceDescriptor {
    pub fn new(url: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            filename: filename.into(),
        }
    }

    /// 缓存键（URL 的 MD5）
    pub fn cache_key(&self) -> String {
        crate::cache::cache_key(&self.url)
    }
}

/// 已下载到本地临时目录的文件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedFile {
    /// 本地绝对路径
    pub path: PathBuf,
    /// 文件大小（字节）
    pub size: u64,
    /// 来源
    pub source: SourceDescriptor,
}

/// 生成临时文件名：`{毫秒时间戳}-{序号}_{文件名}`
///
/// 文件名中的路径分隔符会被替换，保证结果始终是单个路径组件。
pub fn staging_file_name(filename: &str) -> String {
    let sanitized: String = filename
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    let sanitized = if sanitized.trim().is_empty() {
        "download".to_string()
    } else {
        sanitized
    };

    let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}_{}", Local::now().timestamp_millis(), seq, sanitized)
}
