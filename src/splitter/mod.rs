//! 文件切分
//!
//! 将超过投递上限的文件按固定大小切分为多个分片文件（`name.part001`、`name.part002` ...），
//! 所有分片并发写入，全部完成后才返回。

mod engine;
mod part;

pub use engine::{cleanup_parts, SplitEngine};
pub use part::{part_file_name, JoinPlan, Part};
