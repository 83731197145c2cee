//! 公共模块
//!
//! 提供跨模块使用的通用工具

mod format;

pub use format::{format_bytes, format_size};
