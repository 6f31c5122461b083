//! 标识符工具
//!
//! 提供请求 ID 生成和模块 ID 格式校验。
//! 模块 ID 同时用作数据目录名、设置命名空间和路由前缀，
//! 因此只允许字母开头，且仅包含字母、数字、下划线和连字符。

/// 模块 ID 最大长度
pub const MAX_MODULE_ID_LENGTH: usize = 64;

/// 生成 UUID v4 格式的 ID
///
/// 用于进程间请求 ID 等需要全局唯一性的场景
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 检查模块 ID 格式是否有效
///
/// # Example
///
/// ```
/// use panel_core::utils::id::is_valid_module_id;
///
/// assert!(is_valid_module_id("docker"));
/// assert!(is_valid_module_id("site-backup_2"));
/// assert!(!is_valid_module_id("../etc"));
/// assert!(!is_valid_module_id("2fa"));
/// ```
pub fn is_valid_module_id(id: &str) -> bool {
    if id.is_empty() || id.len() > MAX_MODULE_ID_LENGTH {
        return false;
    }

    let mut chars = id.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
