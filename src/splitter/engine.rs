use super::part::{part_file_name, Part};
use crate::common::format_size;
use crate::config::SplitterConfig;
use crate::error::SplitError;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// 分片切分引擎
///
/// 每个分片由独立任务从源文件对应偏移处读取并写入自己的文件，互不共享句柄
#[derive(Debug, Clone)]
pub struct SplitEngine {
    /// 分片输出目录
    output_dir: PathBuf,
    /// 单个分片任务的读缓冲大小
    buffer_size: usize,
}

impl SplitEngine {
    pub fn new(output_dir: impl Into<PathBuf>, buffer_size: usize) -> Self {
        Self {
            output_dir: output_dir.into(),
            buffer_size: buffer_size.max(4096),
        }
    }

    pub fn from_config(config: &SplitterConfig) -> Self {
        Self::new(config.staging_dir.clone(), config.copy_buffer_size)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// 计算分片布局（不访问磁盘）
    ///
    /// 分片数 = ceil(file_size / chunk_size)，第 i 片覆盖
    /// `[i*chunk_size, min((i+1)*chunk_size, file_size))`
    pub fn planned_parts(&self, source: &Path, file_size: u64, chunk_size: u64) -> Vec<Part> {
        if file_size == 0 || chunk_size == 0 {
            return Vec::new();
        }

        let base_name = base_name(source);
        let total_parts = file_size.div_ceil(chunk_size) as usize;

        (0..total_parts)
            .map(|i| {
                let start = i as u64 * chunk_size;
                let end = std::cmp::min(start + chunk_size, file_size);
                let part_number = i + 1;
                Part {
                    path: self
                        .output_dir
                        .join(part_file_name(&base_name, part_number)),
                    part_number,
                    total_parts,
                    size: end - start,
                    original_name: base_name.clone(),
                }
            })
            .collect()
    }

    /// 切分文件
    ///
    /// 所有分片并发写入，全部成功后按序号返回。任一分片失败则等其余任务结束后返回第一个错误，
    /// 已写出的分片文件由调用方清理。
    pub async fn split(&self, source: &Path, chunk_size: u64) -> Result<Vec<Part>, SplitError> {
        if chunk_size == 0 {
            return Err(SplitError::InvalidChunkSize);
        }

        let file_size = fs::metadata(source)
            .await
            .map_err(|e| SplitError::io(source, e))?
            .len();
        if file_size == 0 {
            return Err(SplitError::EmptySource(source.to_path_buf()));
        }

        fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| SplitError::io(&self.output_dir, e))?;

        let parts = self.planned_parts(source, file_size, chunk_size);
        info!(
            "开始切分文件: {:?}, 大小: {}, 分片大小: {}, 分片数: {}",
            source,
            format_size(file_size),
            format_size(chunk_size),
            parts.len()
        );

        let started = Instant::now();
        let mut tasks = JoinSet::new();
        for part in &parts {
            let source = source.to_path_buf();
            let part = part.clone();
            let offset = (part.part_number as u64 - 1) * chunk_size;
            let buffer_size = self.buffer_size;
            tasks.spawn(async move {
                copy_range(&source, &part, offset, buffer_size).await?;
                Ok::<usize, SplitError>(part.part_number)
            });
        }

        // 任一失败即整体失败；剩余任务照常跑完，保证返回时不会再有分片文件被创建
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let err = match joined {
                Ok(Ok(part_number)) => {
                    debug!("分片 {}/{} 写入完成", part_number, parts.len());
                    continue;
                }
                Ok(Err(e)) => e,
                Err(e) => SplitError::TaskFailed(e.to_string()),
            };
            if first_error.is_none() {
                error!("❌ 切分失败: {:?}, 错误: {}", source, err);
                first_error = Some(err);
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        info!(
            "✅ 切分完成: {:?} -> {} 个分片, 耗时 {:.2}s",
            source,
            parts.len(),
            started.elapsed().as_secs_f64()
        );
        Ok(parts)
    }
}

/// 复制源文件 `[offset, offset + part.size)` 到分片文件
async fn copy_range(
    source: &Path,
    part: &Part,
    offset: u64,
    buffer_size: usize,
) -> Result<(), SplitError> {
    let mut src = File::open(source)
        .await
        .map_err(|e| SplitError::io(source, e))?;
    src.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| SplitError::io(source, e))?;

    let mut reader = BufReader::with_capacity(buffer_size, src).take(part.size);
    let mut dest = File::create(&part.path)
        .await
        .map_err(|e| SplitError::io(&part.path, e))?;

    let copied = tokio::io::copy_buf(&mut reader, &mut dest)
        .await
        .map_err(|e| SplitError::io(&part.path, e))?;
    dest.flush()
        .await
        .map_err(|e| SplitError::io(&part.path, e))?;

    if copied != part.size {
        return Err(SplitError::ShortRead {
            part_number: part.part_number,
            expected: part.size,
            actual: copied,
        });
    }
    Ok(())
}

fn base_name(source: &Path) -> String {
    source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string())
}

/// 删除分片文件（尽力而为），返回实际删除的数量
///
/// 文件不存在视为已删除，其他错误只记录警告
pub async fn cleanup_parts(parts: &[Part]) -> usize {
    let mut removed = 0;
    for part in parts {
        match fs::remove_file(&part.path).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("删除分片失败: {:?}, 错误: {}", part.path, e),
        }
    }
    if removed > 0 {
        debug!("已删除 {} 个分片文件", removed);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    async fn write_source(dir: &Path, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
        let data = pattern(len);
        let path = dir.join(name);
        fs::write(&path, &data).await.unwrap();
        (path, data)
    }

    async fn concat(parts: &[Part]) -> Vec<u8> {
        let mut out = Vec::new();
        for part in parts {
            out.extend(fs::read(&part.path).await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_split_with_remainder() {
        let temp_dir = TempDir::new().unwrap();
        let out_dir = temp_dir.path().join("parts");
        let (source, data) = write_source(temp_dir.path(), "game.apk", 2500).await;

        let engine = SplitEngine::new(&out_dir, 64 * 1024);
        let parts = engine.split(&source, 1000).await.unwrap();

        assert_eq!(parts.len(), 3);
        assert_eq!(
            parts.iter().map(|p| p.size).collect::<Vec<_>>(),
            vec![1000, 1000, 500]
        );
        for (i, part) in parts.iter().enumerate() {
            assert_eq!(part.part_number, i + 1);
            assert_eq!(part.total_parts, 3);
            assert_eq!(part.original_name, "game.apk");
            assert_eq!(part.path.parent().unwrap(), out_dir);
        }
        assert_eq!(
            parts[0].path.file_name().unwrap().to_str().unwrap(),
            "game.apk.part001"
        );
        assert!(parts[2].is_last());
        assert_eq!(concat(&parts).await, data);
    }

    #[tokio::test]
    async fn test_split_exact_multiple() {
        let temp_dir = TempDir::new().unwrap();
        let (source, data) = write_source(temp_dir.path(), "a.bin", 4096).await;

        let engine = SplitEngine::new(temp_dir.path(), 4096);
        let parts = engine.split(&source, 1024).await.unwrap();

        assert_eq!(parts.len(), 4);
        assert!(parts.iter().all(|p| p.size == 1024));
        assert_eq!(concat(&parts).await, data);
    }

    #[tokio::test]
    async fn test_chunk_not_smaller_than_file_gives_single_part() {
        let temp_dir = TempDir::new().unwrap();
        let (source, data) = write_source(temp_dir.path(), "small.bin", 300).await;
        let engine = SplitEngine::new(temp_dir.path().join("out"), 4096);

        for chunk in [300, 10_000] {
            let parts = engine.split(&source, chunk).await.unwrap();
            assert_eq!(parts.len(), 1);
            assert_eq!(parts[0].size, 300);
            assert_eq!(concat(&parts).await, data);
        }
    }

    #[tokio::test]
    async fn test_empty_source_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let out_dir = temp_dir.path().join("out");
        let (source, _) = write_source(temp_dir.path(), "empty.bin", 0).await;

        let engine = SplitEngine::new(&out_dir, 4096);
        let err = engine.split(&source, 1024).await.unwrap_err();
        assert!(matches!(err, SplitError::EmptySource(_)));
        // 不产生任何分片
        assert!(!out_dir.exists());
    }

    #[tokio::test]
    async fn test_invalid_chunk_and_missing_source() {
        let temp_dir = TempDir::new().unwrap();
        let engine = SplitEngine::new(temp_dir.path(), 4096);
        let (source, _) = write_source(temp_dir.path(), "x.bin", 10).await;

        assert!(matches!(
            engine.split(&source, 0).await.unwrap_err(),
            SplitError::InvalidChunkSize
        ));
        assert!(matches!(
            engine
                .split(&temp_dir.path().join("missing.bin"), 10)
                .await
                .unwrap_err(),
            SplitError::Io { .. }
        ));
    }

    #[tokio::test]
    async fn test_failed_part_leaves_others_complete_for_cleanup() {
        let temp_dir = TempDir::new().unwrap();
        let out_dir = temp_dir.path().join("out");
        let (source, _) = write_source(temp_dir.path(), "f.bin", 1000).await;

        // 第 2 个分片的目标位置被目录占用
        std::fs::create_dir_all(out_dir.join("f.bin.part002")).unwrap();

        let engine = SplitEngine::new(&out_dir, 4096);
        let err = engine.split(&source, 400).await.unwrap_err();
        assert!(matches!(err, SplitError::Io { .. }));

        // 返回时其他分片已写完，按计划布局可以全部找到并清理
        let planned = engine.planned_parts(&source, 1000, 400);
        assert_eq!(std::fs::metadata(&planned[0].path).unwrap().len(), 400);
        assert_eq!(std::fs::metadata(&planned[2].path).unwrap().len(), 200);
        assert_eq!(cleanup_parts(&planned).await, 2);
        assert!(!planned[0].path.exists());
        assert!(!planned[2].path.exists());
    }

    #[test]
    fn test_planned_parts_layout() {
        let engine = SplitEngine::new("/staging", 4096);
        let parts = engine.planned_parts(Path::new("/tmp/123_app.apk"), 2500, 1000);

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].path, PathBuf::from("/staging/123_app.apk.part002"));
        assert_eq!(parts[2].size, 500);
        assert!(engine.planned_parts(Path::new("x"), 0, 1000).is_empty());
        assert!(engine.planned_parts(Path::new("x"), 10, 0).is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_parts_tolerates_missing() {
        let temp_dir = TempDir::new().unwrap();
        let (source, _) = write_source(temp_dir.path(), "c.bin", 100).await;
        let engine = SplitEngine::new(temp_dir.path().join("out"), 4096);
        let parts = engine.split(&source, 40).await.unwrap();

        fs::remove_file(&parts[0].path).await.unwrap();
        assert_eq!(cleanup_parts(&parts).await, 2);
        assert!(parts.iter().all(|p| !p.path.exists()));
        assert_eq!(cleanup_parts(&parts).await, 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// 分片按序拼接后与源文件一致，且布局满足 ceil 规则
        #[test]
        fn prop_split_concat_equals_source(size in 1usize..6000, chunk in 64u64..2048) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            let (parts, data, joined) = runtime.block_on(async {
                let temp_dir = TempDir::new().unwrap();
                let (source, data) = write_source(temp_dir.path(), "p.bin", size).await;
                let engine = SplitEngine::new(temp_dir.path().join("out"), 4096);
                let parts = engine.split(&source, chunk).await.unwrap();
                let joined = concat(&parts).await;
                (parts, data, joined)
            });

            prop_assert_eq!(parts.len() as u64, (size as u64).div_ceil(chunk));
            prop_assert!(parts[..parts.len() - 1].iter().all(|p| p.size == chunk));
            let last = parts.last().unwrap();
            prop_assert!(last.size >= 1 && last.size <= chunk);
            prop_assert_eq!(joined, data);
        }
    }
}
