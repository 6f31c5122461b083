//! # Panel Core - 服务器面板插件内核
//!
//! 面板内核管理一组能力模块的完整生命周期，提供以下核心功能：
//!
//! - **模块注册**: 内置模块（编译进宿主）与外部模块（从插件目录发现）共享同一命名空间
//! - **依赖解析**: 基于 Kahn 算法的确定性拓扑排序，检测缺失依赖与循环依赖
//! - **生命周期管理**: 按依赖顺序初始化、启动，逆序停止与关闭
//! - **外部模块加载**: 校验清单、检查内核版本、以工作进程方式运行模块代码
//! - **能力桥接**: 为外部模块提供命名空间隔离的设置、沙箱文件、出站 HTTP 与通知
//! - **界面聚合**: 合并模块贡献的 HTTP 路由、菜单与前端路由
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use panel_core::{CoreConfig, PanelCore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 创建内核实例
//!     let config = CoreConfig::default();
//!     let mut core = PanelCore::new(config).await?;
//!
//!     // 加载插件并启动所有模块
//!     core.start().await?;
//!
//!     core.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## 模块结构
//!
//! - `module` - 模块注册、依赖、加载、能力与生命周期
//! - `api` - SDK、管理接口、进程间通信与工作进程 SDK
//! - `core` - 核心配置
//! - `utils` - 错误类型、日志与工具函数

#![warn(rustdoc::missing_crate_level_docs)]

pub mod api;
pub mod core;
pub mod module;
pub mod utils;

// 重导出常用类型，方便使用
pub use module::{
    CapabilityApi, ExternalManifest, FrontendRoute, MenuItem, Module, ModuleContext,
    ModuleDescriptor, ModuleInfo, ModuleKind, ModuleManager, ModuleManagerConfig, ModuleState,
    SettingField, SettingType, SharedModule,
};

pub use utils::{error_code, generate_uuid, status_code, CoreError, Result};
pub use utils::logger::{LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};

pub use core::config::{CoreConfig, CoreConfigBuilder, HostInfo, LogConfig, ModuleConfig, ServerConfig};
pub use api::sdk::PanelCore;

/// 库版本，也是默认的宿主版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 工作进程协议版本
pub use module::runtime::PROTOCOL;
