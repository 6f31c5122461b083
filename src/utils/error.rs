//! 面板内核错误类型定义
//!
//! 本模块定义了插件管理器中使用的所有错误类型。

use thiserror::Error;

/// 面板内核核心错误类型
#[derive(Error, Debug)]
pub enum CoreError {
    // ==================== 注册与依赖错误 ====================

    /// 模块 ID 已存在（内置与外部模块共享同一命名空间）
    #[error("模块已存在: '{0}'")]
    DuplicateModule(String),

    /// 依赖模块未注册
    #[error("模块 '{module}' 的依赖 '{dependency}' 未找到")]
    MissingDependency {
        module: String,
        dependency: String,
    },

    /// 循环依赖
    #[error("检测到循环依赖: {0}")]
    CircularDependency(String),

    /// 模块未找到
    #[error("模块未找到: '{0}'")]
    ModuleNotFound(String),

    /// 模块没有可用实例（代码未加载）
    #[error("模块 '{0}' 没有可用的运行实例")]
    ModuleUnavailable(String),

    /// 内置模块不可卸载
    #[error("内置模块不可卸载: '{0}'")]
    BuiltinUninstall(String),

    /// 模块有依赖者，无法卸载
    #[error("模块 '{module}' 被以下内置模块依赖，无法卸载: {dependents:?}")]
    ModuleHasDependents {
        module: String,
        dependents: Vec<String>,
    },

    // ==================== 外部模块加载错误 ====================

    /// 无效的清单文件
    #[error("无效的模块清单: {0}")]
    InvalidManifest(String),

    /// 内核版本不满足要求
    #[error("版本不兼容: 模块 '{module}' 需要内核版本 >= {required}, 当前版本 {current}")]
    VersionIncompatible {
        module: String,
        required: String,
        current: String,
    },

    /// 模块产物加载失败（非致命，记录在模块上）
    #[error("模块产物加载失败: '{module_id}' - {reason}")]
    ArtifactLoadFailure {
        module_id: String,
        reason: String,
    },

    /// 模块产物未实现预期的能力接口
    #[error("模块 '{module_id}' 未提供预期的能力接口: {reason}")]
    CapabilitySymbolMismatch {
        module_id: String,
        reason: String,
    },

    // ==================== 生命周期错误 ====================

    /// 生命周期钩子执行失败
    #[error("模块 '{module_id}' 的 {hook} 钩子执行失败: {reason}")]
    LifecycleHookFailure {
        module_id: String,
        hook: &'static str,
        reason: String,
    },

    /// 注册表正被占用（钩子内的非阻塞查询）
    #[error("注册表正被占用，无法在生命周期钩子内查询")]
    RegistryBusy,

    // ==================== 能力接口错误 ====================

    /// 路径越出模块数据目录
    #[error("路径越出模块沙箱目录: '{0}'")]
    PathOutsideSandbox(String),

    /// 设置项无效
    #[error("设置项无效: {0}")]
    InvalidSettings(String),

    /// 功能未实现
    #[error("功能未实现: {0}")]
    NotImplemented(String),

    // ==================== 通信错误 ====================

    /// 进程间通信错误
    #[error("进程间通信错误: {0}")]
    Ipc(String),

    /// 请求超时
    #[error("请求超时: {0}")]
    Timeout(String),

    // ==================== 配置错误 ====================

    /// 配置加载失败
    #[error("配置加载失败: {0}")]
    ConfigLoadFailed(String),

    /// 配置值无效
    #[error("配置值无效: '{key}' - {reason}")]
    InvalidConfigValue {
        key: String,
        reason: String,
    },

    // ==================== IO 和序列化错误 ====================

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化/反序列化错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 序列化/反序列化错误
    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP 客户端错误
    #[error("HTTP 请求失败: {0}")]
    Http(#[from] reqwest::Error),

    // ==================== 通用错误 ====================

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),

    /// 初始化失败
    #[error("初始化失败: {0}")]
    InitFailed(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// 内核操作结果类型别名
pub type Result<T> = std::result::Result<T, CoreError>;

/// 状态码常量
pub mod status_code {
    /// 成功
    pub const OK: u16 = 200;

    /// 请求格式错误
    pub const BAD_REQUEST: u16 = 400;

    /// 权限不足
    pub const FORBIDDEN: u16 = 403;

    /// 未找到
    pub const NOT_FOUND: u16 = 404;

    /// 请求超时
    pub const TIMEOUT: u16 = 408;

    /// 冲突
    pub const CONFLICT: u16 = 409;

    /// 前置条件不满足
    pub const PRECONDITION_FAILED: u16 = 412;

    /// 无法处理的实体
    pub const UNPROCESSABLE: u16 = 422;

    /// 内部错误
    pub const INTERNAL_ERROR: u16 = 500;

    /// 未实现
    pub const NOT_IMPLEMENTED: u16 = 501;

    /// 服务不可用
    pub const SERVICE_UNAVAILABLE: u16 = 503;
}

/// 错误码常量
pub mod error_code {
    // 模块错误 (MODULE-xxx)
    pub const MODULE_DUPLICATE: &str = "MODULE-001";
    pub const MODULE_MISSING_DEPENDENCY: &str = "MODULE-002";
    pub const MODULE_CIRCULAR_DEPENDENCY: &str = "MODULE-003";
    pub const MODULE_NOT_FOUND: &str = "MODULE-004";
    pub const MODULE_UNAVAILABLE: &str = "MODULE-005";
    pub const MODULE_BUILTIN_UNINSTALL: &str = "MODULE-006";
    pub const MODULE_HAS_DEPENDENTS: &str = "MODULE-007";
    pub const MODULE_HOOK_FAILED: &str = "MODULE-008";

    // 插件加载错误 (PLUGIN-xxx)
    pub const PLUGIN_INVALID_MANIFEST: &str = "PLUGIN-001";
    pub const PLUGIN_VERSION_INCOMPATIBLE: &str = "PLUGIN-002";
    pub const PLUGIN_ARTIFACT_LOAD_FAILED: &str = "PLUGIN-003";
    pub const PLUGIN_SYMBOL_MISMATCH: &str = "PLUGIN-004";

    // 能力接口错误 (CAPABILITY-xxx)
    pub const CAPABILITY_PATH_OUTSIDE_SANDBOX: &str = "CAPABILITY-001";
    pub const CAPABILITY_INVALID_SETTINGS: &str = "CAPABILITY-002";

    // 通信错误 (IPC-xxx)
    pub const IPC_FAILED: &str = "IPC-001";
    pub const IPC_TIMEOUT: &str = "IPC-002";

    // 配置错误 (CONFIG-xxx)
    pub const CONFIG_LOAD_FAILED: &str = "CONFIG-001";
    pub const CONFIG_INVALID_VALUE: &str = "CONFIG-002";

    // 通用错误 (CORE-xxx)
    pub const CORE_NOT_IMPLEMENTED: &str = "CORE-001";
    pub const CORE_BUSY: &str = "CORE-002";
    pub const CORE_INTERNAL: &str = "CORE-003";
}

impl CoreError {
    /// 创建生命周期钩子失败错误
    pub fn hook(module_id: &str, hook: &'static str, reason: impl ToString) -> Self {
        CoreError::LifecycleHookFailure {
            module_id: module_id.to_string(),
            hook,
            reason: reason.to_string(),
        }
    }

    /// 是否为外部模块的非致命错误（记录后继续批量流程）
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CoreError::ArtifactLoadFailure { .. })
    }

    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::DuplicateModule(_) => error_code::MODULE_DUPLICATE,
            CoreError::MissingDependency { .. } => error_code::MODULE_MISSING_DEPENDENCY,
            CoreError::CircularDependency(_) => error_code::MODULE_CIRCULAR_DEPENDENCY,
            CoreError::ModuleNotFound(_) => error_code::MODULE_NOT_FOUND,
            CoreError::ModuleUnavailable(_) => error_code::MODULE_UNAVAILABLE,
            CoreError::BuiltinUninstall(_) => error_code::MODULE_BUILTIN_UNINSTALL,
            CoreError::ModuleHasDependents { .. } => error_code::MODULE_HAS_DEPENDENTS,
            CoreError::LifecycleHookFailure { .. } => error_code::MODULE_HOOK_FAILED,
            CoreError::InvalidManifest(_) => error_code::PLUGIN_INVALID_MANIFEST,
            CoreError::VersionIncompatible { .. } => error_code::PLUGIN_VERSION_INCOMPATIBLE,
            CoreError::ArtifactLoadFailure { .. } => error_code::PLUGIN_ARTIFACT_LOAD_FAILED,
            CoreError::CapabilitySymbolMismatch { .. } => error_code::PLUGIN_SYMBOL_MISMATCH,
            CoreError::PathOutsideSandbox(_) => error_code::CAPABILITY_PATH_OUTSIDE_SANDBOX,
            CoreError::InvalidSettings(_) => error_code::CAPABILITY_INVALID_SETTINGS,
            CoreError::Ipc(_) => error_code::IPC_FAILED,
            CoreError::Timeout(_) => error_code::IPC_TIMEOUT,
            CoreError::ConfigLoadFailed(_) => error_code::CONFIG_LOAD_FAILED,
            CoreError::InvalidConfigValue { .. } => error_code::CONFIG_INVALID_VALUE,
            CoreError::NotImplemented(_) => error_code::CORE_NOT_IMPLEMENTED,
            CoreError::RegistryBusy => error_code::CORE_BUSY,
            _ => error_code::CORE_INTERNAL,
        }
    }

    /// 获取 HTTP 状态码
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::ModuleNotFound(_) => status_code::NOT_FOUND,
            CoreError::DuplicateModule(_) => status_code::CONFLICT,
            CoreError::ModuleHasDependents { .. } => status_code::CONFLICT,
            CoreError::BuiltinUninstall(_) => status_code::FORBIDDEN,
            CoreError::PathOutsideSandbox(_) => status_code::FORBIDDEN,
            CoreError::InvalidManifest(_) => status_code::BAD_REQUEST,
            CoreError::InvalidSettings(_) => status_code::UNPROCESSABLE,
            CoreError::VersionIncompatible { .. } => status_code::PRECONDITION_FAILED,
            CoreError::MissingDependency { .. } => status_code::PRECONDITION_FAILED,
            CoreError::CircularDependency(_) => status_code::CONFLICT,
            CoreError::ModuleUnavailable(_) => status_code::SERVICE_UNAVAILABLE,
            CoreError::RegistryBusy => status_code::SERVICE_UNAVAILABLE,
            CoreError::Timeout(_) => status_code::TIMEOUT,
            CoreError::NotImplemented(_) => status_code::NOT_IMPLEMENTED,
            _ => status_code::INTERNAL_ERROR,
        }
    }
}
