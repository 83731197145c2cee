//! 日志系统配置
//!
//! 控制台输出 + 可选的文件持久化。日志文件按大小滚动，启动时清理过期文件。

use crate::config::LogConfig;
use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "delivery-splitter.";

/// 时间戳格式
const TIMER_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 按大小滚动的日志文件写入器
///
/// 文件名格式：`delivery-splitter.{启动时间}.log`，滚动后追加 `_{序号}`
struct RollingFile {
    log_dir: PathBuf,
    start_timestamp: String,
    index: u32,
    max_file_size: u64,
    written: u64,
    file: File,
}

impl RollingFile {
    fn open(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let start_timestamp = Local::now().format("%Y-%m-%d-%H%M%S").to_string();
        let file = Self::open_file(&log_dir, &start_timestamp, 0)?;
        Ok(Self {
            log_dir,
            start_timestamp,
            index: 0,
            max_file_size,
            written: 0,
            file,
        })
    }

    fn file_path(log_dir: &Path, start_timestamp: &str, index: u32) -> PathBuf {
        let name = if index == 0 {
            format!("{}{}.log", LOG_FILE_PREFIX, start_timestamp)
        } else {
            format!("{}{}_{}.log", LOG_FILE_PREFIX, start_timestamp, index)
        };
        log_dir.join(name)
    }

    fn open_file(log_dir: &Path, start_timestamp: &str, index: u32) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::file_path(log_dir, start_timestamp, index))
    }

    fn write_data(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_file_size {
            self.file.flush()?;
            self.index += 1;
            self.file = Self::open_file(&self.log_dir, &self.start_timestamp, self.index)?;
            self.written = 0;
        }

        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
}

/// 日志文件写入器（线程安全包装，供 tracing-appender 使用）
#[derive(Clone)]
struct LogFileWriter {
    inner: Arc<Mutex<RollingFile>>,
}

impl LogFileWriter {
    fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(RollingFile::open(log_dir, max_file_size)?)),
        })
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, RollingFile>> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "日志文件锁已中毒"))
    }
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock()?.write_data(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock()?.file.flush()
    }
}

/// 日志系统守卫
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// `RUST_LOG` 环境变量优先于 `config.level`。文件输出初始化失败时回退到仅控制台输出。
/// 宿主程序已安装全局订阅器时不做任何改动。
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIMER_FORMAT.to_string()))
        .with_ansi(true);

    let writer = if config.enabled {
        fs::create_dir_all(&config.log_dir)
            .and_then(|_| LogFileWriter::new(config.log_dir.clone(), config.max_file_size))
            .map_err(|e| eprintln!("创建日志文件失败: {:?}, 错误: {}，回退到仅控制台输出", config.log_dir, e))
            .ok()
    } else {
        None
    };

    let Some(writer) = writer else {
        if let Err(e) = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init()
        {
            warn!("全局日志订阅器已存在，沿用现有配置: {}", e);
        } else {
            info!("日志系统初始化完成（仅控制台输出）");
        }
        return LogGuard { _file_guard: None };
    };

    let (non_blocking, file_guard) = tracing_appender::non_blocking(writer);

    // 文件输出层（不带 ANSI 颜色）
    let file_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIMER_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    if let Err(e) = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
    {
        warn!("全局日志订阅器已存在，沿用现有配置: {}", e);
        return LogGuard { _file_guard: None };
    }

    info!(
        "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
        config.log_dir,
        config.retention_days,
        config.level,
        config.max_file_size as f64 / 1024.0 / 1024.0
    );

    let removed = cleanup_old_logs(&config.log_dir, config.retention_days);
    if removed > 0 {
        info!("已清理 {} 个过期日志文件", removed);
    }

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

/// 清理过期日志文件（按文件修改时间判断），返回删除数量
fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let retention = Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60);
    let now = SystemTime::now();

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_log = path
            .file_name()
            .and_then(|s| s.to_str())
            .map(|name| name.starts_with(LOG_FILE_PREFIX) && name.ends_with(".log"))
            .unwrap_or(false);
        if !is_log || !path.is_file() {
            continue;
        }

        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .map(|age| age > retention)
            .unwrap_or(false);

        if expired {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
            }
        }
    }

    removed
}
