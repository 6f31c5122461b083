//! 模块管理模块
//!
//! 包含插件系统的核心组件：
//! - 模块元数据与清单定义
//! - 注册表与依赖解析
//! - 外部模块加载与工作进程运行时
//! - 能力桥接与路由聚合
//! - 生命周期管理器

pub mod aggregator;
pub mod bridge;
pub mod capability;
pub mod dependency;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod metadata;
pub mod registry;
pub mod runtime;

// 重导出常用类型
pub use bridge::{
    CapabilityApi, CapabilityBridge, FileSettingsStore, HttpResponse, MemorySettingsStore,
    Notification, NotificationLevel, Notifier, SettingsStore,
};
pub use capability::{Module, ModuleContext, SharedModule};
pub use dependency::DependencyGraph;
pub use loader::{ArtifactLoader, ArtifactRequest, ExternalLoader, FnArtifactLoader};
pub use manager::{LoadReport, ModuleList, ModuleManager, ModuleManagerConfig, ModuleSettings};
pub use manifest::{ExternalManifest, ManifestLoader, MANIFEST_FILE};
pub use metadata::{
    FrontendRoute, MenuItem, ModuleDescriptor, ModuleInfo, ModuleKind, ModuleState,
    RouteDeclaration, SettingField, SettingType,
};
pub use registry::{Registry, RegistryHandle};
pub use runtime::{ProcessArtifactLoader, ProcessModule};
