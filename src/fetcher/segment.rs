use crate::error::FetchError;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::{ops::Range, path::Path, time::Duration};
use tokio::{
    fs::File,
    io::{AsyncSeekExt, AsyncWriteExt},
};
use tracing::debug;

/// 下载分段
///
/// 记录已写入的字节数，重试时从 `range.start + written` 续传
#[derive(Debug, Clone)]
pub struct Segment {
    /// 分段索引
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
    /// 已写入字节数
    pub written: u64,
    /// 已失败次数
    pub retries: u32,
}

impl Segment {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self {
            index,
            range,
            written: 0,
            retries: 0,
        }
    }

    /// 分段大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 剩余待下载字节数
    pub fn remaining(&self) -> u64 {
        self.size().saturating_sub(self.written)
    }

    pub fn is_completed(&self) -> bool {
        self.remaining() == 0
    }

    /// 下载分段剩余部分（流式写入，实时回调进度）
    ///
    /// # 参数
    /// * `output_path` - 已预分配的输出文件
    /// * `idle_timeout` - 两次收到数据之间的最长等待
    /// * `progress_callback` - 进度回调，参数为新写入的字节数
    ///
    /// # 返回
    /// 本次写入的字节数。出错时已写入的部分保留在 `written` 中，供下次续传。
    pub async fn download<F>(
        &mut self,
        client: &Client,
        url: &str,
        output_path: &Path,
        idle_timeout: Duration,
        progress_callback: F,
    ) -> Result<u64, FetchError>
    where
        F: Fn(u64) + Send + Sync,
    {
        if self.is_completed() {
            return Ok(0);
        }

        let start = self.range.start + self.written;
        let end = self.range.end - 1;

        debug!(
            "下载分段 #{}: bytes={}-{} (已完成 {} bytes, 重试 {} 次)",
            self.index, start, end, self.written, self.retries
        );

        let request = client
            .get(url)
            .header(reqwest::header::RANGE, format!("bytes={}-{}", start, end))
            .send();
        let resp = tokio::time::timeout(idle_timeout, request)
            .await
            .map_err(|_| FetchError::IdleTimeout(idle_timeout.as_secs()))??;

        let status = resp.status();
        if status == StatusCode::OK {
            // 服务器返回了完整内容，无法按段写入
            return Err(FetchError::RangeIgnored { start, end });
        }
        if status != StatusCode::PARTIAL_CONTENT {
            return Err(FetchError::Status {
                status,
                url: url.to_string(),
            });
        }

        let mut file = File::options()
            .write(true)
            .open(output_path)
            .await
            .map_err(|e| FetchError::io(output_path, e))?;
        file.seek(std::io::SeekFrom::Start(start))
            .await
            .map_err(|e| FetchError::io(output_path, e))?;

        let mut stream = resp.bytes_stream();
        let mut downloaded = 0u64;

        loop {
            let next = tokio::time::timeout(idle_timeout, stream.next())
                .await
                .map_err(|_| FetchError::IdleTimeout(idle_timeout.as_secs()))?;
            let Some(data) = next else {
                break;
            };
            let data = data?;

            // 防止服务器多发数据写越界
            let take = (data.len() as u64).min(self.remaining()) as usize;
            file.write_all(&data[..take])
                .await
                .map_err(|e| FetchError::io(output_path, e))?;

            self.written += take as u64;
            downloaded += take as u64;
            progress_callback(take as u64);

            if self.is_completed() {
                break;
            }
        }

        file.flush()
            .await
            .map_err(|e| FetchError::io(output_path, e))?;

        if !self.is_completed() {
            // 连接提前关闭
            return Err(FetchError::SizeMismatch {
                expected: self.size(),
                actual: self.written,
            });
        }

        debug!("分段 #{} 下载完成，大小: {} bytes", self.index, self.size());
        Ok(downloaded)
    }
}

/// 计算分段
///
/// 分段数 = min(connections, ceil(total / min_split_size))，各段大小尽量均匀
pub fn plan_segments(total_size: u64, connections: usize, min_split_size: u64) -> Vec<Segment> {
    if total_size == 0 {
        return Vec::new();
    }

    let by_size = total_size.div_ceil(min_split_size.max(1));
    let count = by_size.min(connections.max(1) as u64).max(1);
    let segment_size = total_size.div_ceil(count);

    let mut segments = Vec::with_capacity(count as usize);
    let mut offset = 0u64;
    let mut index = 0;

    while offset < total_size {
        let end = std::cmp::min(offset + segment_size, total_size);
        segments.push(Segment::new(index, offset..end));
        offset = end;
        index += 1;
    }

    segments
}
