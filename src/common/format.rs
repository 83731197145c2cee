//! 字节数格式化

/// 单位表（1024 进制）
const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// 格式化文件大小为人类可读格式（保留 2 位小数）
pub fn format_size(bytes: u64) -> String {
    format_bytes(bytes, 2)
}

/// 格式化文件大小为人类可读格式
///
/// 小数部分末尾的 0 会被去掉：`1024` -> `1 KB`，`1536` -> `1.5 KB`。
/// 超过 TB 的数值仍以 TB 表示。
///
/// # 参数
/// * `bytes` - 字节数
/// * `decimals` - 最多保留的小数位数
pub fn format_bytes(bytes: u64, decimals: usize) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let formatted = format!("{:.*}", decimals, value);
    let trimmed = if formatted.contains('.') {
        formatted.trim_end_matches('0').trim_end_matches('.')
    } else {
        formatted.as_str()
    };

    format!("{} {}", trimmed, UNITS[unit])
}
