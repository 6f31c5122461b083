//! 模块元数据定义
//!
//! 定义模块描述、生命周期状态以及模块向面板贡献的界面元素
//! （菜单、前端路由、设置项）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 模块描述
///
/// 内置模块在代码中构造，外部模块由清单文件转换而来。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// 模块唯一标识（内置与外部模块共享命名空间）
    pub id: String,

    /// 模块显示名称
    pub name: String,

    /// 模块版本
    pub version: String,

    /// 模块描述
    #[serde(default)]
    pub description: String,

    /// 依赖的模块 ID
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl ModuleDescriptor {
    /// 创建新的模块描述
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            description: String::new(),
            dependencies: vec![],
        }
    }

    /// 设置描述
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// 添加依赖
    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }
}

/// 模块来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    /// 编译进宿主的内置模块，不可卸载
    Builtin,
    /// 从插件目录发现的外部模块
    External,
}

impl std::fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleKind::Builtin => f.write_str("builtin"),
            ModuleKind::External => f.write_str("external"),
        }
    }
}

/// 模块状态
///
/// `Registered → Initialized → Started ⇄ Stopped → Shutdown`，
/// `Uninstalled` 为外部模块的终止状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    /// 已注册，尚未初始化
    #[default]
    Registered,
    /// 已初始化
    Initialized,
    /// 运行中
    Started,
    /// 已停止
    Stopped,
    /// 已关闭
    Shutdown,
    /// 已卸载
    Uninstalled,
}

impl ModuleState {
    /// 是否可以初始化
    pub fn can_init(&self) -> bool {
        matches!(self, ModuleState::Registered)
    }

    /// 是否可以启动
    pub fn can_start(&self) -> bool {
        matches!(self, ModuleState::Initialized | ModuleState::Stopped)
    }

    /// 是否可以停止
    pub fn can_stop(&self) -> bool {
        matches!(self, ModuleState::Started)
    }

    /// 是否已经执行过 init，需要在关闭时调用 shutdown
    pub fn needs_shutdown(&self) -> bool {
        matches!(
            self,
            ModuleState::Initialized | ModuleState::Started | ModuleState::Stopped
        )
    }
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModuleState::Registered => "registered",
            ModuleState::Initialized => "initialized",
            ModuleState::Started => "started",
            ModuleState::Stopped => "stopped",
            ModuleState::Shutdown => "shutdown",
            ModuleState::Uninstalled => "uninstalled",
        };
        f.write_str(s)
    }
}

// ============================================================================
// 界面贡献
// ============================================================================

/// 侧边栏菜单项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub icon: String,
    pub path: String,
    /// 排序权重，越小越靠前
    #[serde(default)]
    pub order: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<MenuItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge_variant: Option<String>,
}

impl MenuItem {
    /// 创建菜单项
    pub fn new(id: impl Into<String>, title: impl Into<String>, path: impl Into<String>, order: i32) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            icon: String::new(),
            path: path.into(),
            order,
            parent: None,
            children: vec![],
            badge: None,
            badge_variant: None,
        }
    }

    /// 设置图标
    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = icon.into();
        self
    }
}

/// 前端路由声明
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontendRoute {
    pub path: String,
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub order: i32,
}

impl FrontendRoute {
    /// 创建前端路由
    pub fn new(path: impl Into<String>, component: impl Into<String>, order: i32) -> Self {
        Self {
            path: path.into(),
            component: component.into(),
            title: None,
            icon: None,
            order,
        }
    }
}

/// 清单中的路由声明与前端路由结构相同
pub type RouteDeclaration = FrontendRoute;

/// 设置项类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingType {
    #[default]
    Text,
    Password,
    Number,
    Boolean,
    Select,
    Textarea,
}

/// 设置项定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingField {
    pub key: String,
    pub label: String,
    #[serde(rename = "type", default)]
    pub field_type: SettingType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub required: bool,
    /// `select` 类型的可选值
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SettingField {
    /// 创建设置项
    pub fn new(key: impl Into<String>, label: impl Into<String>, field_type: SettingType) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            field_type,
            default: None,
            required: false,
            options: vec![],
            description: None,
        }
    }

    /// 设置默认值
    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// 标记为必填
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// 校验取值是否符合字段类型
    pub fn check_value(&self, value: &str) -> Result<(), String> {
        if self.required && value.is_empty() {
            return Err(format!("设置项 '{}' 为必填", self.key));
        }
        if value.is_empty() {
            return Ok(());
        }
        match self.field_type {
            SettingType::Number if value.parse::<f64>().is_err() => {
                Err(format!("设置项 '{}' 需要数字，收到 '{}'", self.key, value))
            }
            SettingType::Boolean if value != "true" && value != "false" => {
                Err(format!("设置项 '{}' 需要 true 或 false", self.key))
            }
            SettingType::Select if !self.options.iter().any(|o| o == value) => {
                Err(format!("设置项 '{}' 的取值 '{}' 不在可选范围内", self.key, value))
            }
            _ => Ok(()),
        }
    }
}

// ============================================================================
// 查询快照
// ============================================================================

/// 模块运行时信息快照
///
/// 列表与查询接口返回的可序列化视图，不持有注册表锁。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleInfo {
    #[serde(flatten)]
    pub descriptor: ModuleDescriptor,

    pub kind: ModuleKind,

    pub state: ModuleState,

    pub enabled: bool,

    /// 是否有可运行的实例
    pub has_instance: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// 声明的权限（仅外部模块）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_dir: Option<PathBuf>,
}

impl ModuleInfo {
    /// 获取模块 ID
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// 是否为内置模块
    pub fn is_builtin(&self) -> bool {
        self.kind == ModuleKind::Builtin
    }

    /// 检查模块是否正在运行
    pub fn is_running(&self) -> bool {
        self.state == ModuleState::Started
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_builder() {
        let desc = ModuleDescriptor::new("database", "Database", "1.0.0")
            .with_description("MySQL / PostgreSQL 管理")
            .with_dependency("docker");

        assert_eq!(desc.id, "database");
        assert_eq!(desc.dependencies, vec!["docker".to_string()]);
    }

    #[test]
    fn test_module_state_transitions() {
        assert!(ModuleState::Registered.can_init());
        assert!(!ModuleState::Initialized.can_init());

        assert!(ModuleState::Initialized.can_start());
        assert!(ModuleState::Stopped.can_start());
        assert!(!ModuleState::Started.can_start());
        assert!(!ModuleState::Registered.can_start());

        assert!(ModuleState::Started.can_stop());
        assert!(!ModuleState::Stopped.can_stop());

        assert!(ModuleState::Stopped.needs_shutdown());
        assert!(!ModuleState::Registered.needs_shutdown());
        assert!(!ModuleState::Shutdown.needs_shutdown());
    }

    #[test]
    fn test_menu_item_serde_defaults() {
        let json = r#"{"id":"apps","title":"应用商店","path":"/apps"}"#;
        let item: MenuItem = serde_json::from_str(json).unwrap();
        assert_eq!(item.order, 0);
        assert!(item.children.is_empty());
        assert!(item.badge.is_none());

        let out = serde_json::to_value(&item).unwrap();
        assert!(out.get("children").is_none());
    }

    #[test]
    fn test_setting_field_type_rename() {
        let json = r#"{"key":"port","label":"端口","type":"number","default":"8080"}"#;
        let field: SettingField = serde_json::from_str(json).unwrap();
        assert_eq!(field.field_type, SettingType::Number);
        assert_eq!(field.default.as_deref(), Some("8080"));
    }

    #[test]
    fn test_setting_field_check_value() {
        let port = SettingField::new("port", "端口", SettingType::Number).required();
        assert!(port.check_value("8080").is_ok());
        assert!(port.check_value("abc").is_err());
        assert!(port.check_value("").is_err());

        let mut mode = SettingField::new("mode", "模式", SettingType::Select);
        mode.options = vec!["fast".to_string(), "safe".to_string()];
        assert!(mode.check_value("safe").is_ok());
        assert!(mode.check_value("slow").is_err());

        let flag = SettingField::new("flag", "开关", SettingType::Boolean);
        assert!(flag.check_value("true").is_ok());
        assert!(flag.check_value("yes").is_err());
    }

    #[test]
    fn test_module_info_serialization_flattens_descriptor() {
        let info = ModuleInfo {
            descriptor: ModuleDescriptor::new("docker", "Docker", "1.0.0"),
            kind: ModuleKind::Builtin,
            state: ModuleState::Started,
            enabled: true,
            has_instance: true,
            last_error: None,
            permissions: vec![],
            author: None,
            installed_at: None,
            updated_at: None,
            data_dir: None,
            config_dir: None,
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["id"], "docker");
        assert_eq!(value["kind"], "builtin");
        assert_eq!(value["state"], "started");
        assert!(info.is_running());
    }
}
