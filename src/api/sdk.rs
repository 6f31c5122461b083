//! PanelCore SDK
//!
//! 面板内核的主要对外接口，把配置、日志、模块管理器与 HTTP 服务组装在一起：
//!
//! - 注册内置模块
//! - 扫描并加载外部插件
//! - 按依赖顺序初始化、启动、停止和关闭模块
//! - 组合模块路由与管理接口并对外提供 HTTP 服务
//!
//! # 示例
//!
//! ```rust,no_run
//! use panel_core::{CoreConfig, PanelCore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CoreConfig::builder()
//!         .bind("127.0.0.1:9999")
//!         .plugin_dir("./plugins")
//!         .build();
//!
//!     let mut core = PanelCore::new(config).await?;
//!     core.start().await?;
//!     core.serve(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!     core.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use super::http::management_router;
use crate::core::config::CoreConfig;
use crate::module::bridge::FileSettingsStore;
use crate::module::capability::SharedModule;
use crate::module::manager::{ModuleManager, ModuleManagerConfig};
use crate::utils::{CoreError, Result};

/// 设置存储文件名（位于数据根目录下）
pub const SETTINGS_FILE: &str = "settings.json";

// ============================================================================
// 内核状态
// ============================================================================

/// 内核状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreState {
    /// 已创建，尚未启动
    Initialized,
    /// 运行中
    Running,
    /// 正在关闭
    ShuttingDown,
    /// 已关闭
    Shutdown,
}

impl CoreState {
    /// 检查是否可以启动
    pub fn can_start(&self) -> bool {
        matches!(self, CoreState::Initialized)
    }

    /// 检查是否可以关闭
    pub fn can_shutdown(&self) -> bool {
        matches!(self, CoreState::Running)
    }

    /// 检查是否正在运行
    pub fn is_running(&self) -> bool {
        matches!(self, CoreState::Running)
    }
}

/// 健康信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthInfo {
    pub state: CoreState,
    pub version: String,
    pub uptime_secs: u64,
    pub modules: usize,
    pub enabled_modules: usize,
}

// ============================================================================
// PanelCore 主结构体
// ============================================================================

/// 面板内核
///
/// # 生命周期
///
/// 1. `new()` - 创建内核，打开设置存储
/// 2. `register_builtin()` - 注册内置模块
/// 3. `start()` - 加载外部插件并启动所有模块
/// 4. `serve()` - 对外提供 HTTP 服务
/// 5. `shutdown()` - 停止并关闭所有模块
pub struct PanelCore {
    config: CoreConfig,
    state: Arc<RwLock<CoreState>>,
    manager: Arc<ModuleManager>,
    started_at: Arc<RwLock<Option<Instant>>>,
}

impl PanelCore {
    /// 创建新的内核实例
    ///
    /// # Errors
    ///
    /// 配置无效或设置存储无法打开时返回错误
    pub async fn new(config: CoreConfig) -> Result<Self> {
        info!("初始化面板内核 v{}", crate::VERSION);
        config.validate()?;

        tokio::fs::create_dir_all(&config.modules.data_dir).await?;
        let store = FileSettingsStore::open(config.modules.data_dir.join(SETTINGS_FILE)).await?;
        debug!(path = %store.path().display(), "设置存储已打开");

        let manager = ModuleManager::new(ModuleManagerConfig::from_core_config(&config))
            .with_settings_store(Arc::new(store));
        Ok(Self::with_manager(config, manager))
    }

    /// 使用已构建的模块管理器创建内核
    pub fn with_manager(config: CoreConfig, manager: ModuleManager) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(CoreState::Initialized)),
            manager: Arc::new(manager),
            started_at: Arc::new(RwLock::new(None)),
        }
    }

    /// 内核配置
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// 模块管理器
    pub fn manager(&self) -> Arc<ModuleManager> {
        self.manager.clone()
    }

    /// 当前状态
    pub async fn state(&self) -> CoreState {
        *self.state.read().await
    }

    /// 健康信息
    pub async fn health(&self) -> HealthInfo {
        collect_health(&self.manager, &self.state, &self.started_at).await
    }

    /// 注册内置模块
    pub async fn register_builtin(&self, module: SharedModule) -> Result<()> {
        self.manager.register_builtin(module).await
    }

    /// 启动内核
    ///
    /// 扫描插件目录（单个插件失败只记录），然后按依赖顺序初始化并启动所有模块。
    pub async fn start(&mut self) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.can_start() {
            return Err(CoreError::InitFailed(format!(
                "内核当前状态 {:?} 不允许启动",
                *state
            )));
        }

        info!("启动面板内核...");
        match self.manager.load_external_plugins().await {
            Ok(report) => debug!(
                loaded = report.loaded.len(),
                degraded = report.degraded.len(),
                "外部插件加载完成"
            ),
            Err(e) => error!(error = %e, "部分外部插件加载失败"),
        }

        self.manager.init_all().await?;
        self.manager.start_all().await?;

        *state = CoreState::Running;
        *self.started_at.write().await = Some(Instant::now());
        info!("面板内核已启动");
        Ok(())
    }

    /// 组合 HTTP 路由
    ///
    /// 包含启用模块的路由、模块管理接口和 `<prefix>/health`。
    pub async fn router(&self) -> Router {
        let prefix = self.config.server.api_prefix.as_str();
        let modules = self.manager.mount_routes(prefix).await;

        let manager = self.manager.clone();
        let state = self.state.clone();
        let started_at = self.started_at.clone();
        let core_routes = management_router(self.manager.clone()).route(
            "/health",
            get(move || {
                let (manager, state, started_at) =
                    (manager.clone(), state.clone(), started_at.clone());
                async move { Json(collect_health(&manager, &state, &started_at).await) }
            }),
        );

        if prefix.is_empty() || prefix == "/" {
            modules.merge(core_routes)
        } else {
            modules.merge(Router::new().nest(prefix, core_routes))
        }
    }

    /// 对外提供 HTTP 服务，直到 `shutdown_signal` 完成
    pub async fn serve<F>(&self, shutdown_signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(&self.config.server.bind).await?;
        info!(addr = %self.config.server.bind, prefix = %self.config.server.api_prefix, "HTTP 服务已启动");
        axum::serve(listener, self.router().await)
            .with_graceful_shutdown(shutdown_signal)
            .await?;
        info!("HTTP 服务已停止");
        Ok(())
    }

    /// 关闭内核
    ///
    /// 未启动或已关闭时静默返回。
    pub async fn shutdown(&mut self) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.can_shutdown() {
            return Ok(());
        }

        info!("正在关闭面板内核...");
        *state = CoreState::ShuttingDown;
        self.manager.stop_all().await;
        self.manager.shutdown_all().await;
        *state = CoreState::Shutdown;

        info!("面板内核已关闭");
        Ok(())
    }
}

async fn collect_health(
    manager: &ModuleManager,
    state: &RwLock<CoreState>,
    started_at: &RwLock<Option<Instant>>,
) -> HealthInfo {
    let list = manager.list_modules().await;
    let started = *started_at.read().await;
    HealthInfo {
        state: *state.read().await,
        version: crate::VERSION.to_string(),
        uptime_secs: started.map(|t| t.elapsed().as_secs()).unwrap_or(0),
        modules: list.total,
        enabled_modules: list.enabled,
    }
}
