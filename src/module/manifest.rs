//! 外部模块清单
//!
//! 负责从插件目录中的 `manifest.json` 解析、校验外部模块清单，
//! 并执行内核版本检查。

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::module::metadata::{MenuItem, ModuleDescriptor, RouteDeclaration, SettingField};
use crate::utils::{is_valid_module_id, CoreError, Result};

/// 清单文件名
pub const MANIFEST_FILE: &str = "manifest.json";

/// 已知的权限字符串
///
/// 权限只做声明和校验，不做强制隔离。
pub const KNOWN_PERMISSIONS: &[&str] = &[
    "docker.read",
    "docker.write",
    "docker.exec",
    "docker.delete",
    "files.read",
    "files.write",
    "files.delete",
    "database.read",
    "database.write",
    "database.admin",
    "nginx.read",
    "nginx.write",
    "settings.read",
    "settings.write",
    "users.read",
    "users.write",
    "system.exec",
    "system.admin",
    "notifications",
    "http",
];

/// 外部模块清单
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// 最低内核版本（按字符串序比较）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_core_version: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub menus: Vec<MenuItem>,
    #[serde(default)]
    pub settings: Vec<SettingField>,
    #[serde(default)]
    pub routes: Vec<RouteDeclaration>,
    /// 入口可执行文件，相对于模块目录
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
}

impl ExternalManifest {
    /// 转换为模块描述
    pub fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
            dependencies: self.dependencies.clone(),
        }
    }

    /// 入口文件的绝对路径
    pub fn entry_point_path(&self, module_dir: &Path) -> Option<PathBuf> {
        self.entry_point
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .map(|e| module_dir.join(e))
    }
}

/// 清单加载器
#[derive(Debug, Clone, Default)]
pub struct ManifestLoader;

impl ManifestLoader {
    /// 定位清单文件
    ///
    /// `path` 可以是模块目录，也可以直接是清单文件。
    pub fn manifest_path(path: &Path) -> PathBuf {
        if path.is_dir() {
            path.join(MANIFEST_FILE)
        } else {
            path.to_path_buf()
        }
    }

    /// 从文件解析清单
    ///
    /// # Arguments
    ///
    /// * `path` - 模块目录或 manifest.json 路径
    ///
    /// # Returns
    ///
    /// 模块目录与解析后的清单
    ///
    /// # Errors
    ///
    /// 文件不可读、JSON 无效或校验失败时返回 `InvalidManifest`
    pub async fn parse_file(path: &Path) -> Result<(PathBuf, ExternalManifest)> {
        let manifest_path = Self::manifest_path(path);
        let content = tokio::fs::read_to_string(&manifest_path).await.map_err(|e| {
            CoreError::InvalidManifest(format!("无法读取 {}: {}", manifest_path.display(), e))
        })?;
        let manifest = Self::parse_string(&content)?;

        let module_dir = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok((module_dir, manifest))
    }

    /// 从字符串解析清单
    pub fn parse_string(content: &str) -> Result<ExternalManifest> {
        let manifest: ExternalManifest = serde_json::from_str(content)
            .map_err(|e| CoreError::InvalidManifest(format!("JSON 解析失败: {}", e)))?;
        Self::validate(&manifest)?;
        Ok(manifest)
    }

    /// 校验清单
    ///
    /// 执行以下校验：
    /// - 必填字段（id, name, version），版本号必须是 semver
    /// - ID 格式与依赖 ID 格式
    /// - 权限是否属于已知集合
    /// - 入口路径必须是模块目录内的相对路径
    ///
    /// 所有错误合并为一条 `InvalidManifest`。
    pub fn validate(manifest: &ExternalManifest) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if manifest.id.is_empty() {
            errors.push("模块 ID 不能为空".to_string());
        } else if !is_valid_module_id(&manifest.id) {
            errors.push(format!(
                "模块 ID '{}' 格式无效，只允许字母开头的字母、数字、下划线和连字符",
                manifest.id
            ));
        }

        if manifest.name.trim().is_empty() {
            errors.push("模块名称不能为空".to_string());
        }

        if manifest.version.trim().is_empty() {
            errors.push("模块版本号不能为空".to_string());
        } else if let Err(e) = semver::Version::parse(&manifest.version) {
            errors.push(format!("模块版本号 '{}' 不是 semver 格式: {}", manifest.version, e));
        }

        for dep in &manifest.dependencies {
            if !is_valid_module_id(dep) {
                errors.push(format!("依赖 ID '{}' 格式无效", dep));
            } else if *dep == manifest.id {
                errors.push("模块不能依赖自身".to_string());
            }
        }

        for permission in &manifest.permissions {
            if !KNOWN_PERMISSIONS.contains(&permission.as_str()) {
                errors.push(format!("未知的权限声明: '{}'", permission));
            }
        }

        if let Some(ref entry) = manifest.entry_point {
            let escapes = Path::new(entry)
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
            if escapes {
                errors.push(format!("入口路径 '{}' 必须位于模块目录内", entry));
            }
        }

        let mut keys = std::collections::HashSet::new();
        for field in &manifest.settings {
            if !keys.insert(field.key.as_str()) {
                errors.push(format!("设置项 '{}' 重复定义", field.key));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::InvalidManifest(errors.join("; ")))
        }
    }

    /// 检查内核版本
    ///
    /// 按字符串字典序比较 `min_core_version` 与宿主版本，
    /// 因此 `"10.0.0"` 会被视为小于 `"9.0.0"`。
    pub fn check_version(manifest: &ExternalManifest, host_version: &str) -> Result<()> {
        match manifest.min_core_version.as_deref() {
            Some(min) if !min.is_empty() && min > host_version => {
                Err(CoreError::VersionIncompatible {
                    module: manifest.id.clone(),
                    required: min.to_string(),
                    current: host_version.to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}
