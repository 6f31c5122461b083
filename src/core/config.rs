//! 内核配置
//!
//! 定义面板内核的配置结构和加载逻辑。所有字段都有 serde 默认值，
//! 因此空配置文件也是合法的。

use crate::utils::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// 宿主信息
///
/// 宿主版本在进程生命周期内不可变，外部模块的 `min_core_version`
/// 与它进行比较。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    /// 宿主名称
    #[serde(default = "default_host_name")]
    pub name: String,

    /// 宿主版本
    #[serde(default = "default_host_version")]
    pub version: String,
}

fn default_host_name() -> String {
    "panel".to_string()
}

fn default_host_version() -> String {
    crate::VERSION.to_string()
}

impl Default for HostInfo {
    fn default() -> Self {
        Self {
            name: default_host_name(),
            version: default_host_version(),
        }
    }
}

/// HTTP 服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_bind")]
    pub bind: String,

    /// API 前缀，所有模块路由挂载在其下
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
}

fn default_bind() -> String {
    "127.0.0.1:9999".to_string()
}

fn default_api_prefix() -> String {
    "/api/v1".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_prefix: default_api_prefix(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json_format: bool,

    /// 日志文件目录，设置后同时输出到文件
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// 日志轮转策略
    #[serde(default = "default_rotation")]
    pub rotation: String,

    /// 额外的过滤指令（EnvFilter 格式）
    #[serde(default)]
    pub filter: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            log_dir: None,
            rotation: default_rotation(),
            filter: None,
        }
    }
}

/// 模块管理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// 模块数据根目录，每个模块占用 `<data_dir>/<module_id>/`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// 外部插件根目录，每个子目录一个模块
    #[serde(default = "default_plugin_dir")]
    pub plugin_dir: PathBuf,

    /// 启动时默认禁用的模块 ID
    #[serde(default)]
    pub disabled: Vec<String>,

    /// 工作进程握手超时（毫秒）
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_plugin_dir() -> PathBuf {
    PathBuf::from("./plugins")
}

fn default_handshake_timeout_ms() -> u64 {
    5000
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            plugin_dir: default_plugin_dir(),
            disabled: vec![],
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

/// 内核配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    /// 配置文件路径
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// 宿主信息
    #[serde(default)]
    pub host: HostInfo,

    /// HTTP 服务配置
    #[serde(default)]
    pub server: ServerConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LogConfig,

    /// 模块管理配置
    #[serde(default)]
    pub modules: ModuleConfig,

    /// 是否为开发模式
    #[serde(default)]
    pub dev_mode: bool,
}

impl CoreConfig {
    /// 创建配置构建器
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::new()
    }

    /// 从文件加载配置
    ///
    /// 扩展名为 `.json` 时按 JSON 解析，否则按 YAML 解析。
    pub async fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            CoreError::ConfigLoadFailed(format!("读取 {} 失败: {}", path.display(), e))
        })?;

        let mut config: CoreConfig = if path.extension().map(|e| e == "json").unwrap_or(false) {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        config.config_path = Some(path);
        config.validate()?;
        Ok(config)
    }

    /// 校验配置值
    pub fn validate(&self) -> Result<()> {
        if self.host.version.trim().is_empty() {
            return Err(CoreError::InvalidConfigValue {
                key: "host.version".to_string(),
                reason: "不能为空".to_string(),
            });
        }
        if self.server.bind.parse::<SocketAddr>().is_err() {
            return Err(CoreError::InvalidConfigValue {
                key: "server.bind".to_string(),
                reason: format!("无法解析监听地址 '{}'", self.server.bind),
            });
        }
        if !self.server.api_prefix.starts_with('/') || self.server.api_prefix.ends_with('/') {
            return Err(CoreError::InvalidConfigValue {
                key: "server.api_prefix".to_string(),
                reason: "必须以 '/' 开头且不能以 '/' 结尾".to_string(),
            });
        }
        if self.modules.handshake_timeout_ms == 0 {
            return Err(CoreError::InvalidConfigValue {
                key: "modules.handshake_timeout_ms".to_string(),
                reason: "必须大于 0".to_string(),
            });
        }
        Ok(())
    }

    /// 合并另一个配置（用于覆盖）
    pub fn merge(&mut self, other: CoreConfig) {
        // 只覆盖非默认值的配置
        if other.host != HostInfo::default() {
            self.host = other.host;
        }
        if other.server.bind != default_bind() {
            self.server.bind = other.server.bind;
        }
        if other.server.api_prefix != default_api_prefix() {
            self.server.api_prefix = other.server.api_prefix;
        }
        if other.logging.level != default_log_level() {
            self.logging.level = other.logging.level;
        }
        if other.logging.json_format {
            self.logging.json_format = true;
        }
        if other.logging.log_dir.is_some() {
            self.logging.log_dir = other.logging.log_dir;
        }
        if other.modules.data_dir != default_data_dir() {
            self.modules.data_dir = other.modules.data_dir;
        }
        if other.modules.plugin_dir != default_plugin_dir() {
            self.modules.plugin_dir = other.modules.plugin_dir;
        }
        for id in other.modules.disabled {
            if !self.modules.disabled.contains(&id) {
                self.modules.disabled.push(id);
            }
        }
        if other.dev_mode {
            self.dev_mode = true;
        }
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct CoreConfigBuilder {
    config: CoreConfig,
}

impl CoreConfigBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self {
            config: CoreConfig::default(),
        }
    }

    /// 设置宿主版本
    pub fn host_version(mut self, version: impl Into<String>) -> Self {
        self.config.host.version = version.into();
        self
    }

    /// 设置监听地址
    pub fn bind(mut self, bind: impl Into<String>) -> Self {
        self.config.server.bind = bind.into();
        self
    }

    /// 设置 API 前缀
    pub fn api_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.server.api_prefix = prefix.into();
        self
    }

    /// 设置日志级别
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// 启用文件日志
    pub fn file_logging(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.config.logging.log_dir = Some(log_dir.into());
        self
    }

    /// 启用 JSON 格式日志
    pub fn json_logging(mut self) -> Self {
        self.config.logging.json_format = true;
        self
    }

    /// 设置模块数据根目录
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.modules.data_dir = dir.into();
        self
    }

    /// 设置外部插件根目录
    pub fn plugin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.modules.plugin_dir = dir.into();
        self
    }

    /// 默认禁用某个模块
    pub fn disable_module(mut self, id: impl Into<String>) -> Self {
        self.config.modules.disabled.push(id.into());
        self
    }

    /// 设置握手超时
    pub fn handshake_timeout_ms(mut self, ms: u64) -> Self {
        self.config.modules.handshake_timeout_ms = ms;
        self
    }

    /// 启用开发模式
    pub fn dev_mode(mut self) -> Self {
        self.config.dev_mode = true;
        self
    }

    /// 构建配置
    pub fn build(self) -> CoreConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoreConfig::default();
        assert!(!config.dev_mode);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.server.api_prefix, "/api/v1");
        assert_eq!(config.host.version, crate::VERSION);
        assert_eq!(config.modules.handshake_timeout_ms, 5000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = CoreConfig::builder()
            .host_version("2.0.0")
            .log_level("debug")
            .plugin_dir("/opt/panel/plugins")
            .disable_module("firewall")
            .dev_mode()
            .build();

        assert_eq!(config.host.version, "2.0.0");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.modules.plugin_dir, PathBuf::from("/opt/panel/plugins"));
        assert_eq!(config.modules.disabled, vec!["firewall".to_string()]);
        assert!(config.dev_mode);
    }

    #[test]
    fn test_config_merge() {
        let mut base = CoreConfig::builder().disable_module("a").build();
        let override_config = CoreConfig::builder()
            .log_level("debug")
            .disable_module("a")
            .disable_module("b")
            .dev_mode()
            .build();

        base.merge(override_config);

        assert_eq!(base.logging.level, "debug");
        assert_eq!(base.modules.disabled, vec!["a".to_string(), "b".to_string()]);
        assert!(base.dev_mode);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = CoreConfig::builder().bind("not-an-address").build();
        assert!(matches!(
            config.validate(),
            Err(CoreError::InvalidConfigValue { ref key, .. }) if key == "server.bind"
        ));

        let config = CoreConfig::builder().api_prefix("api/").build();
        assert!(config.validate().is_err());

        let config = CoreConfig::builder().handshake_timeout_ms(0).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "host:\n  version: \"1.4.0\"\nmodules:\n  disabled: [nginx]\n";
        let config: CoreConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.host.version, "1.4.0");
        assert_eq!(config.host.name, "panel");
        assert_eq!(config.modules.disabled, vec!["nginx".to_string()]);
        assert_eq!(config.server.bind, "127.0.0.1:9999");
    }

    #[tokio::test]
    async fn test_from_file_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panel.json");
        tokio::fs::write(&path, r#"{"server": {"api_prefix": "/api"}}"#)
            .await
            .unwrap();

        let config = CoreConfig::from_file(&path).await.unwrap();
        assert_eq!(config.server.api_prefix, "/api");
        assert_eq!(config.config_path, Some(path));
    }

    #[tokio::test]
    async fn test_from_file_missing() {
        let result = CoreConfig::from_file("/nonexistent/panel.yaml").await;
        assert!(matches!(result, Err(CoreError::ConfigLoadFailed(_))));
    }
}
