use super::segment::{plan_segments, Segment};
use super::types::{staging_file_name, SourceDescriptor, StagedFile};
use super::RemoteFetcher;
use crate::common::format_size;
use crate::config::FetchConfig;
use crate::error::FetchError;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{self, File};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// HEAD 探测结果
#[derive(Debug, Clone, Copy, Default)]
struct ProbeInfo {
    /// Content-Length
    content_length: Option<u64>,
    /// 是否声明 `Accept-Ranges: bytes`
    accept_ranges: bool,
}

/// 下载进度（按 10% 输出日志）
#[derive(Debug)]
struct ProgressTracker {
    total: Option<u64>,
    downloaded: AtomicU64,
    last_decile: AtomicU64,
}

impl ProgressTracker {
    fn new(total: Option<u64>) -> Self {
        Self {
            total,
            downloaded: AtomicU64::new(0),
            last_decile: AtomicU64::new(0),
        }
    }

    /// 从头重新下载时清零
    fn reset(&self) {
        self.downloaded.store(0, Ordering::Relaxed);
        self.last_decile.store(0, Ordering::Relaxed);
    }

    fn add(&self, bytes: u64) {
        let downloaded = self.downloaded.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let Some(total) = self.total.filter(|t| *t > 0) else {
            return;
        };
        let decile = downloaded.min(total) * 10 / total;
        if decile > self.last_decile.fetch_max(decile, Ordering::Relaxed) {
            info!(
                "下载进度: {}% ({}/{})",
                decile * 10,
                format_size(downloaded),
                format_size(total)
            );
        }
    }
}

/// 多连接 HTTP 下载器
///
/// - 服务器支持 Range 且大小已知时，预分配文件并按分段并发下载
/// - 否则退化为单连接流式下载，失败后尽量用 Range 续传
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    config: FetchConfig,
    staging_dir: PathBuf,
}

impl HttpFetcher {
    /// 创建下载器
    ///
    /// 请求级别不设总超时（大文件下载可能持续很久），空闲超时在读取数据时单独控制
    pub fn new(config: FetchConfig, staging_dir: impl Into<PathBuf>) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .pool_max_idle_per_host(config.connections)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .build()?;

        Ok(Self {
            client,
            config,
            staging_dir: staging_dir.into(),
        })
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// HEAD 探测
    async fn probe(&self, url: &str) -> Result<ProbeInfo, FetchError> {
        let resp = self
            .client
            .head(url)
            .timeout(self.config.connect_timeout())
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status,
                url: url.to_string(),
            });
        }

        let headers = resp.headers();
        let content_length = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let accept_ranges = headers
            .get(header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

        debug!(
            "探测结果: url={}, Content-Length={:?}, Accept-Ranges={}",
            url, content_length, accept_ranges
        );

        Ok(ProbeInfo {
            content_length,
            accept_ranges,
        })
    }

    /// 下载到指定路径，按探测结果选择分段或单连接
    async fn download_to(&self, url: &str, path: &Path) -> Result<(), FetchError> {
        let probe = match self.probe(url).await {
            Ok(probe) => probe,
            Err(e) => {
                warn!("探测失败，使用单连接下载: {}", e);
                ProbeInfo::default()
            }
        };

        match probe.content_length {
            Some(total) if total > 0 && probe.accept_ranges && self.config.connections > 1 => {
                match self.download_segmented(url, path, total).await {
                    Err(FetchError::RangeIgnored { start, end }) => {
                        warn!(
                            "服务器声明支持 Range 但忽略了 bytes={}-{}，改用单连接下载",
                            start, end
                        );
                        self.download_single(url, path, Some(total)).await
                    }
                    result => result,
                }
            }
            expected => self.download_single(url, path, expected).await,
        }
    }

    /// 分段并发下载
    async fn download_segmented(&self, url: &str, path: &Path, total: u64) -> Result<(), FetchError> {
        // 预分配文件空间
        let file = File::create(path).await.map_err(|e| FetchError::io(path, e))?;
        file.set_len(total).await.map_err(|e| FetchError::io(path, e))?;
        drop(file);

        let segments = plan_segments(total, self.config.connections, self.config.min_split_size);
        info!(
            "开始分段下载: {} 个分段, 总大小 {}",
            segments.len(),
            format_size(total)
        );

        let progress = Arc::new(ProgressTracker::new(Some(total)));
        let mut tasks = JoinSet::new();

        for segment in segments {
            let client = self.client.clone();
            let config = self.config.clone();
            let url = url.to_string();
            let path = path.to_path_buf();
            let progress = progress.clone();

            tasks.spawn(async move {
                download_segment_with_retry(&client, &config, &url, &path, segment, &progress).await
            });
        }

        // 任一分段失败即整体失败：中止其余分段并等待它们退出，之后文件不再被写入
        while let Some(joined) = tasks.join_next().await {
            let err = match joined {
                Ok(Ok(segment)) => {
                    debug!("✓ 分段 #{} 完成", segment.index);
                    continue;
                }
                Ok(Err(e)) => e,
                Err(e) => FetchError::TaskFailed(e.to_string()),
            };
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            return Err(err);
        }

        verify_file_size(path, total).await
    }

    /// 单连接下载（失败后从已写入位置续传）
    async fn download_single(
        &self,
        url: &str,
        path: &Path,
        expected: Option<u64>,
    ) -> Result<(), FetchError> {
        info!("开始单连接下载: 大小 {:?}", expected.map(format_size));

        File::create(path).await.map_err(|e| FetchError::io(path, e))?;

        let progress = ProgressTracker::new(expected);
        let mut written = 0u64;
        let mut tries = 0u32;

        loop {
            match self.stream_once(url, path, &mut written, expected, &progress).await {
                Ok(()) => break,
                Err(e) => {
                    tries += 1;
                    if !e.is_retriable() || tries >= self.config.max_tries {
                        error!("✗ 下载失败（尝试 {} 次）: {}", tries, e);
                        return Err(e);
                    }
                    warn!(
                        "⚠ 下载中断，{}ms 后从 {} bytes 处续传 ({}/{}): {}",
                        self.config.retry_wait_ms, written, tries, self.config.max_tries, e
                    );
                    tokio::time::sleep(self.config.retry_wait()).await;
                }
            }
        }

        match expected {
            Some(expected) => verify_file_size(path, expected).await,
            None => Ok(()),
        }
    }

    /// 单次流式请求，从 `written` 处开始写入
    async fn stream_once(
        &self,
        url: &str,
        path: &Path,
        written: &mut u64,
        expected: Option<u64>,
        progress: &ProgressTracker,
    ) -> Result<(), FetchError> {
        let mut request = self.client.get(url);
        if *written > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", written));
        }

        let idle_timeout = self.config.idle_timeout();
        let resp = tokio::time::timeout(idle_timeout, request.send())
            .await
            .map_err(|_| FetchError::IdleTimeout(idle_timeout.as_secs()))??;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status,
                url: url.to_string(),
            });
        }

        let mut file = File::options()
            .write(true)
            .open(path)
            .await
            .map_err(|e| FetchError::io(path, e))?;

        if *written > 0 && status != StatusCode::PARTIAL_CONTENT {
            // 服务器不支持续传，从头开始
            warn!("服务器不支持续传，重新下载");
            file.set_len(0).await.map_err(|e| FetchError::io(path, e))?;
            *written = 0;
            progress.reset();
        }
        file.seek(std::io::SeekFrom::Start(*written))
            .await
            .map_err(|e| FetchError::io(path, e))?;

        let mut stream = resp.bytes_stream();

        loop {
            let next = tokio::time::timeout(idle_timeout, stream.next())
                .await
                .map_err(|_| FetchError::IdleTimeout(idle_timeout.as_secs()))?;
            let Some(data) = next else {
                break;
            };
            let data = data?;

            file.write_all(&data)
                .await
                .map_err(|e| FetchError::io(path, e))?;
            *written += data.len() as u64;
            progress.add(data.len() as u64);
        }

        file.flush().await.map_err(|e| FetchError::io(path, e))?;

        match expected {
            Some(expected) if *written < expected => Err(FetchError::SizeMismatch {
                expected,
                actual: *written,
            }),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, filename: &str) -> Result<StagedFile, FetchError> {
        fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| FetchError::io(&self.staging_dir, e))?;

        let path = self.staging_dir.join(staging_file_name(filename));
        info!("开始下载: {} -> {:?}", filename, path);

        let started = Instant::now();
        if let Err(e) = self.download_to(url, &path).await {
            // 尽力清理残留文件
            if let Err(rm) = fs::remove_file(&path).await {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    warn!("清理残留下载文件失败: {:?}, 错误: {}", path, rm);
                }
            }
            return Err(e);
        }

        let size = match fs::metadata(&path).await {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::MissingOutput(path));
            }
            Err(e) => return Err(FetchError::io(&path, e)),
        };

        info!(
            "✅ 下载完成: {} ({}), 耗时 {:.1}s",
            filename,
            format_size(size),
            started.elapsed().as_secs_f64()
        );

        Ok(StagedFile {
            path,
            size,
            source: SourceDescriptor::new(url, filename),
        })
    }

    async fn head_size(&self, url: &str) -> Option<u64> {
        match self.probe(url).await {
            Ok(probe) => probe.content_length,
            Err(e) => {
                warn!("获取远程文件大小失败: {}", e);
                None
            }
        }
    }
}

/// 下载单个分段（带固定间隔重试，重试时续传）
async fn download_segment_with_retry(
    client: &Client,
    config: &FetchConfig,
    url: &str,
    path: &Path,
    mut segment: Segment,
    progress: &ProgressTracker,
) -> Result<Segment, FetchError> {
    loop {
        match segment
            .download(client, url, path, config.idle_timeout(), |n| progress.add(n))
            .await
        {
            Ok(_) => return Ok(segment),
            Err(e) => {
                segment.retries += 1;
                if !e.is_retriable() || segment.retries >= config.max_tries {
                    error!(
                        "✗ 分段 #{} 下载失败（尝试 {} 次）: {}",
                        segment.index, segment.retries, e
                    );
                    return Err(e);
                }
                warn!(
                    "⚠ 分段 #{} 下载失败，{}ms 后续传 ({}/{}): {}",
                    segment.index, config.retry_wait_ms, segment.retries, config.max_tries, e
                );
                tokio::time::sleep(config.retry_wait()).await;
            }
        }
    }
}

/// 校验文件大小
async fn verify_file_size(path: &Path, expected: u64) -> Result<(), FetchError> {
    let actual = match fs::metadata(path).await {
        Ok(metadata) => metadata.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(FetchError::MissingOutput(path.to_path_buf()));
        }
        Err(e) => return Err(FetchError::io(path, e)),
    };

    if actual != expected {
        return Err(FetchError::SizeMismatch { expected, actual });
    }

    debug!("✅ 文件大小校验通过: {} bytes", actual);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode as HttpStatus, routing::get, Router};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;
    use tower_http::services::ServeDir;

    fn test_config() -> FetchConfig {
        FetchConfig {
            connections: 16,
            min_split_size: 16 * 1024,
            max_tries: 2,
            retry_wait_ms: 10,
            connect_timeout_secs: 5,
            idle_timeout_secs: 1,
            ..Default::default()
        }
    }

    fn test_content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    /// 启动本地 HTTP 服务：/files 下为静态文件（支持 Range），其余为自定义路由
    async fn start_server(root: &Path, extra: Router) -> String {
        let app = Router::new()
            .nest_service("/files", ServeDir::new(root))
            .merge(extra);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_segmented_download() {
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let content = test_content(300_000);
        std::fs::write(root.path().join("big.apk"), &content).unwrap();

        let base = start_server(root.path(), Router::new()).await;
        let fetcher = HttpFetcher::new(test_config(), staging.path()).unwrap();

        let staged = fetcher
            .fetch(&format!("{}/files/big.apk", base), "big.apk")
            .await
            .unwrap();

        assert_eq!(staged.size, 300_000);
        assert!(staged.path.starts_with(staging.path()));
        assert!(staged.path.to_str().unwrap().ends_with("_big.apk"));
        assert_eq!(staged.source.filename, "big.apk");
        assert_eq!(std::fs::read(&staged.path).unwrap(), content);
    }

    #[tokio::test]
    async fn test_single_stream_download_without_ranges() {
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let content = test_content(100_000);
        let body = content.clone();

        let extra = Router::new().route("/plain", get(move || async move { body }));
        let base = start_server(root.path(), extra).await;
        let fetcher = HttpFetcher::new(test_config(), staging.path()).unwrap();

        let staged = fetcher
            .fetch(&format!("{}/plain", base), "plain.bin")
            .await
            .unwrap();

        assert_eq!(staged.size, 100_000);
        assert_eq!(std::fs::read(&staged.path).unwrap(), content);
    }

    #[tokio::test]
    async fn test_head_size() {
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        std::fs::write(root.path().join("a.bin"), test_content(4321)).unwrap();

        let base = start_server(root.path(), Router::new()).await;
        let fetcher = HttpFetcher::new(test_config(), staging.path()).unwrap();

        assert_eq!(fetcher.head_size(&format!("{}/files/a.bin", base)).await, Some(4321));
        // 不存在的文件和无法连接的地址都返回 None
        assert_eq!(fetcher.head_size(&format!("{}/files/none.bin", base)).await, None);
        assert_eq!(fetcher.head_size("http://127.0.0.1:1/x").await, None);
    }

    #[tokio::test]
    async fn test_not_found_is_fatal_and_cleaned_up() {
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let base = start_server(root.path(), Router::new()).await;
        let fetcher = HttpFetcher::new(test_config(), staging.path()).unwrap();

        let err = fetcher
            .fetch(&format!("{}/files/missing.apk", base), "missing.apk")
            .await
            .unwrap_err();

        match err {
            FetchError::Status { status, .. } => assert_eq!(status, StatusCode::NOT_FOUND),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_server_error_retried_up_to_max_tries() {
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        let extra = Router::new().route(
            "/broken",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    HttpStatus::INTERNAL_SERVER_ERROR
                }
            }),
        );
        let base = start_server(root.path(), extra).await;
        let fetcher = HttpFetcher::new(test_config(), staging.path()).unwrap();

        let err = fetcher
            .fetch(&format!("{}/broken", base), "broken.apk")
            .await
            .unwrap_err();

        assert!(err.is_retriable());
        // 1 次 HEAD 探测 + max_tries 次 GET
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let extra = Router::new().route(
            "/stall",
            get(|| async {
                Body::from_stream(futures::stream::pending::<Result<Vec<u8>, std::io::Error>>())
            }),
        );
        let base = start_server(root.path(), extra).await;

        let config = FetchConfig {
            max_tries: 1,
            ..test_config()
        };
        let fetcher = HttpFetcher::new(config, staging.path()).unwrap();

        let err = fetcher
            .fetch(&format!("{}/stall", base), "stall.apk")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::IdleTimeout(1)));
    }

    #[tokio::test]
    async fn test_stalled_response_headers_time_out() {
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        // 接受连接但永远不返回响应头（HEAD 同样挂起）
        let extra = Router::new().route(
            "/hang",
            get(|| async {
                futures::future::pending::<()>().await;
                "never"
            }),
        );
        let base = start_server(root.path(), extra).await;

        let config = FetchConfig {
            max_tries: 1,
            connect_timeout_secs: 1,
            ..test_config()
        };
        let fetcher = HttpFetcher::new(config, staging.path()).unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(8),
            fetcher.fetch(&format!("{}/hang", base), "hang.apk"),
        )
        .await
        .expect("fetch should give up on its own");
        assert!(matches!(result, Err(FetchError::IdleTimeout(1))));
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);

        // 分段请求同样受限
        let output = staging.path().join("segment.bin");
        std::fs::write(&output, vec![0u8; 100]).unwrap();
        let mut segment = Segment::new(0, 0..100);
        let result = tokio::time::timeout(
            Duration::from_secs(8),
            segment.download(
                &Client::new(),
                &format!("{}/hang", base),
                &output,
                Duration::from_secs(1),
                |_| {},
            ),
        )
        .await
        .expect("segment should give up on its own");
        assert!(matches!(result, Err(FetchError::IdleTimeout(1))));
    }

    #[tokio::test]
    async fn test_ignored_range_falls_back_to_single_stream() {
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let content = test_content(100_000);
        let body = content.clone();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        // 声明支持 Range，但总是返回完整内容和 200
        let extra = Router::new().route(
            "/norange",
            get(move || {
                let body = body.clone();
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (
                        [
                            (axum::http::header::ACCEPT_RANGES, "bytes".to_string()),
                            (axum::http::header::CONTENT_LENGTH, body.len().to_string()),
                        ],
                        body,
                    )
                }
            }),
        );
        let base = start_server(root.path(), extra).await;
        let fetcher = HttpFetcher::new(test_config(), staging.path()).unwrap();

        let staged = fetcher
            .fetch(&format!("{}/norange", base), "norange.bin")
            .await
            .unwrap();

        assert_eq!(staged.size, 100_000);
        assert_eq!(std::fs::read(&staged.path).unwrap(), content);
        // HEAD + 至少一次分段请求 + 单连接请求
        assert!(hits.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_segment_resumes_from_written_offset() {
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let content = test_content(50_000);
        std::fs::write(root.path().join("r.bin"), &content).unwrap();
        let base = start_server(root.path(), Router::new()).await;

        // 模拟上一次尝试已写入前 20000 字节
        let output = staging.path().join("partial.bin");
        let mut partial = content[..20_000].to_vec();
        partial.resize(50_000, 0);
        std::fs::write(&output, &partial).unwrap();

        let mut segment = Segment::new(0, 0..50_000);
        segment.written = 20_000;

        let client = Client::new();
        let downloaded = segment
            .download(
                &client,
                &format!("{}/files/r.bin", base),
                &output,
                Duration::from_secs(5),
                |_| {},
            )
            .await
            .unwrap();

        assert_eq!(downloaded, 30_000);
        assert!(segment.is_completed());
        assert_eq!(std::fs::read(&output).unwrap(), content);
    }

    #[test]
    fn test_progress_tracker() {
        let tracker = ProgressTracker::new(Some(100));
        tracker.add(15);
        assert_eq!(tracker.last_decile.load(Ordering::Relaxed), 1);
        tracker.add(85);
        assert_eq!(tracker.last_decile.load(Ordering::Relaxed), 10);

        // 大小未知时只累计字节数
        let unknown = ProgressTracker::new(None);
        unknown.add(10);
        assert_eq!(unknown.downloaded.load(Ordering::Relaxed), 10);
        assert_eq!(unknown.last_decile.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_progress_tracker_reset_on_restart() {
        let tracker = ProgressTracker::new(Some(100));
        tracker.add(60);
        tracker.reset();
        assert_eq!(tracker.downloaded.load(Ordering::Relaxed), 0);
        assert_eq!(tracker.last_decile.load(Ordering::Relaxed), 0);

        // 重新下载时进度不会超过 100%
        tracker.add(100);
        assert_eq!(tracker.downloaded.load(Ordering::Relaxed), 100);
        assert_eq!(tracker.last_decile.load(Ordering::Relaxed), 10);
    }
}
