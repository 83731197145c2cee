// 分片类型定义

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 分片文件名：`{base}.part{NNN}`（3 位补零，从 1 开始）
pub fn part_file_name(base_name: &str, part_number: usize) -> String {
    format!("{}.part{:03}", base_name, part_number)
}

/// 切分得到的单个分片
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    /// 分片文件路径
    pub path: PathBuf,
    /// 分片序号（从 1 开始）
    pub part_number: usize,
    /// 分片总数
    pub total_parts: usize,
    /// 分片大小（字节）
    pub size: u64,
    /// 切分前的文件名
    pub original_name: String,
}

impl Part {
    /// 是否为最后一个分片
    pub fn is_last(&self) -> bool {
        self.part_number == self.total_parts
    }
}

/// 合并说明
///
/// 接收方按 `part_names` 的顺序依次拼接即可还原 `original_name`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPlan {
    pub original_name: String,
    pub part_names: Vec<String>,
}

impl JoinPlan {
    pub fn new(original_name: impl Into<String>, num_parts: usize) -> Self {
        let original_name = original_name.into();
        let part_names = (1..=num_parts)
            .map(|n| part_file_name(&original_name, n))
            .collect();
        Self {
            original_name,
            part_names,
        }
    }

    pub fn num_parts(&self) -> usize {
        self.part_names.len()
    }

    /// 第一个分片的文件名（多数解压工具从第一个分片开始合并）
    pub fn first_part(&self) -> Option<&str> {
        self.part_names.first().map(String::as_str)
    }
}
