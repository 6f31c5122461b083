//! 模块能力接口
//!
//! 定义所有模块（内置或外部）必须实现的生命周期与贡献接口，
//! 以及初始化时传给模块的上下文。

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::Instrument;

use super::bridge::{CapabilityBridge, Notifier, SettingsStore};
use super::metadata::{FrontendRoute, MenuItem, ModuleDescriptor, SettingField};
use super::registry::RegistryHandle;
use crate::utils::{CoreError, Result};

/// 模块初始化上下文
///
/// 在 `init` 与 `migrate` 时传给模块。模块可以克隆其中的句柄留作后用。
#[derive(Clone)]
pub struct ModuleContext {
    /// 模块 ID
    pub module_id: String,
    /// 数据目录 `<data_root>/<module_id>`
    pub data_dir: PathBuf,
    /// 配置目录
    pub config_dir: PathBuf,
    /// 模块专属的 tracing span
    pub span: tracing::Span,
    /// 共享的设置存储
    pub settings: Arc<dyn SettingsStore>,
    /// 通知分发器
    pub notifier: Notifier,
    /// 共享 HTTP 客户端
    pub http: reqwest::Client,
    /// 注册表只读句柄，只提供非阻塞查询
    pub registry: RegistryHandle,
}

impl ModuleContext {
    /// 构建该模块的能力桥
    pub fn capabilities(&self) -> CapabilityBridge {
        CapabilityBridge::new(
            self.module_id.clone(),
            self.data_dir.clone(),
            self.settings.clone(),
            self.notifier.clone(),
            self.http.clone(),
        )
    }
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("module_id", &self.module_id)
            .field("data_dir", &self.data_dir)
            .field("config_dir", &self.config_dir)
            .finish()
    }
}

/// 模块接口
///
/// 生命周期钩子按 `init → migrate → start ⇄ stop → shutdown` 顺序调用，
/// 同一时刻最多只有一个钩子在执行。钩子内部不能再调用模块管理器。
///
/// # 示例
///
/// ```rust
/// use async_trait::async_trait;
/// use panel_core::module::{Module, ModuleContext, ModuleDescriptor};
/// use panel_core::utils::Result;
///
/// struct Docker {
///     descriptor: ModuleDescriptor,
/// }
///
/// #[async_trait]
/// impl Module for Docker {
///     fn descriptor(&self) -> &ModuleDescriptor {
///         &self.descriptor
///     }
///     async fn init(&self, _ctx: &ModuleContext) -> Result<()> {
///         Ok(())
///     }
///     async fn start(&self) -> Result<()> {
///         Ok(())
///     }
///     async fn stop(&self) -> Result<()> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Module: Send + Sync {
    /// 模块描述
    fn descriptor(&self) -> &ModuleDescriptor;

    /// 初始化
    async fn init(&self, ctx: &ModuleContext) -> Result<()>;

    /// 数据迁移，紧接 `init` 之后调用
    async fn migrate(&self, _ctx: &ModuleContext) -> Result<()> {
        Ok(())
    }

    /// 启动
    async fn start(&self) -> Result<()>;

    /// 停止
    async fn stop(&self) -> Result<()>;

    /// 关闭，释放模块持有的全部资源
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// HTTP 路由
    fn routes(&self) -> Option<axum::Router> {
        None
    }

    /// 菜单项
    async fn menus(&self) -> Vec<MenuItem> {
        vec![]
    }

    /// 前端路由
    async fn frontend_routes(&self) -> Vec<FrontendRoute> {
        vec![]
    }

    /// 设置项定义
    fn settings_schema(&self) -> Vec<SettingField> {
        vec![]
    }
}

/// 共享的模块实例
pub type SharedModule = Arc<dyn Module>;

/// 把钩子返回的错误包装为 `LifecycleHookFailure`
pub(crate) fn hook_failure(module_id: &str, hook: &'static str, err: CoreError) -> CoreError {
    match err {
        e @ CoreError::LifecycleHookFailure { .. } => e,
        e => CoreError::hook(module_id, hook, e),
    }
}

/// 依次调用 `init` 与 `migrate`
pub(crate) async fn init_and_migrate(module: &dyn Module, ctx: &ModuleContext) -> Result<()> {
    async {
        module
            .init(ctx)
            .await
            .map_err(|e| hook_failure(&ctx.module_id, "init", e))?;
        module
            .migrate(ctx)
            .await
            .map_err(|e| hook_failure(&ctx.module_id, "migrate", e))
    }
    .instrument(ctx.span.clone())
    .await
}
