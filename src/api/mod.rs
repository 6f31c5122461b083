//! API 模块
//!
//! 包含对外提供的 SDK 接口和通信机制。
//!
//! # 模块概览
//!
//! - `sdk`: PanelCore 主接口，组装模块管理器与 HTTP 服务
//! - `http`: 模块管理 HTTP 接口
//! - `ipc`: 宿主与工作进程之间的 JSON 行协议端点
//! - `plugin`: 工作进程侧 SDK，供外部模块作者使用
//!
//! # 示例
//!
//! ```rust,no_run
//! use panel_core::{CoreConfig, PanelCore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CoreConfig::builder()
//!         .log_level("info")
//!         .build();
//!
//!     let mut core = PanelCore::new(config).await?;
//!     core.start().await?;
//!     Ok(())
//! }
//! ```

pub mod http;
pub mod ipc;
pub mod plugin;
pub mod sdk;

// 重导出主要类型
pub use sdk::{CoreState, HealthInfo, PanelCore};

pub use http::{management_router, ApiError};
pub use ipc::{IpcFrame, IpcHandler, IpcPeer, IpcRequest, IpcResponse};
pub use plugin::{serve_plugin, serve_plugin_on, PluginModule, RemoteCapabilities};
