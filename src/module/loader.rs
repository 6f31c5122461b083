//! 外部模块加载器
//!
//! 负责把插件目录中的一个模块变成可注册的 [`LoadedExternalModule`]：
//!
//! 1. 读取并校验清单
//! 2. 内核版本检查（在创建任何目录之前）
//! 3. 创建数据目录与配置目录
//! 4. 加载入口产物并立即执行 `init` 与 `migrate`
//!
//! 重复 ID 检查与注册由 [`crate::module::manager::ModuleManager`] 在持锁时完成。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use super::bridge::CapabilityBridge;
use super::capability::{init_and_migrate, ModuleContext, SharedModule};
use super::manifest::{ExternalManifest, ManifestLoader};
use super::registry::LoadedExternalModule;
use crate::core::config::HostInfo;
use crate::utils::Result;

/// 产物加载请求
pub struct ArtifactRequest<'a> {
    pub manifest: &'a ExternalManifest,
    /// 入口文件绝对路径（已确认存在）
    pub entry_point: PathBuf,
    pub module_dir: &'a Path,
    pub host: &'a HostInfo,
    /// 工作进程能力请求的应答方
    pub bridge: CapabilityBridge,
}

/// 产物加载器
///
/// 加载失败返回 `ArtifactLoadFailure`（非致命）；产物不提供预期接口时返回
/// `CapabilitySymbolMismatch`（对该模块致命）。
#[async_trait]
pub trait ArtifactLoader: Send + Sync {
    async fn load(&self, request: ArtifactRequest<'_>) -> Result<SharedModule>;
}

/// 以闭包实现的产物加载器
///
/// 用于把进程内实现的模块当作外部模块加载，例如测试或嵌入场景。
pub struct FnArtifactLoader<F> {
    f: F,
}

impl<F> FnArtifactLoader<F>
where
    F: Fn(&ArtifactRequest<'_>) -> Result<SharedModule> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> ArtifactLoader for FnArtifactLoader<F>
where
    F: Fn(&ArtifactRequest<'_>) -> Result<SharedModule> + Send + Sync,
{
    async fn load(&self, request: ArtifactRequest<'_>) -> Result<SharedModule> {
        (self.f)(&request)
    }
}

/// 加载结果
pub struct LoadOutcome {
    pub module: LoadedExternalModule,
    /// 是否已成功执行 init
    pub initialized: bool,
    /// 非致命错误
    pub last_error: Option<String>,
}

impl LoadOutcome {
    /// 是否为降级加载（没有可运行实例）
    pub fn is_degraded(&self) -> bool {
        self.module.instance.is_none()
    }
}

/// 外部模块加载器
#[derive(Clone)]
pub struct ExternalLoader {
    artifacts: Arc<dyn ArtifactLoader>,
    host: HostInfo,
    data_root: PathBuf,
}

impl ExternalLoader {
    /// 创建加载器
    pub fn new(artifacts: Arc<dyn ArtifactLoader>, host: HostInfo, data_root: impl Into<PathBuf>) -> Self {
        Self {
            artifacts,
            host,
            data_root: data_root.into(),
        }
    }

    /// 宿主信息
    pub fn host(&self) -> &HostInfo {
        &self.host
    }

    /// 模块数据目录
    pub fn data_dir(&self, module_id: &str) -> PathBuf {
        self.data_root.join(module_id)
    }

    /// 模块配置目录
    ///
    /// 位于 `.config` 下，不会与任何合法模块 ID 冲突。
    pub fn config_dir(&self, module_id: &str) -> PathBuf {
        self.data_root.join(".config").join(module_id)
    }

    /// 读取清单并检查内核版本
    ///
    /// 不产生任何副作用。
    pub async fn read_manifest(&self, path: &Path) -> Result<(PathBuf, ExternalManifest)> {
        let (module_dir, manifest) = ManifestLoader::parse_file(path).await?;
        ManifestLoader::check_version(&manifest, &self.host.version)?;
        Ok((module_dir, manifest))
    }

    /// 创建目录、加载产物并初始化
    ///
    /// # Errors
    ///
    /// - 目录创建失败返回 IO 错误
    /// - `CapabilitySymbolMismatch` 与 init/migrate 失败对该模块致命
    ///
    /// 入口缺失与 `ArtifactLoadFailure` 不返回错误，而是记录在结果中。
    pub async fn materialize(
        &self,
        module_dir: PathBuf,
        manifest: ExternalManifest,
        ctx: &ModuleContext,
    ) -> Result<LoadOutcome> {
        let module_id = manifest.id.clone();
        tokio::fs::create_dir_all(&ctx.data_dir).await?;
        tokio::fs::create_dir_all(&ctx.config_dir).await?;

        let now = Utc::now();
        let mut module = LoadedExternalModule {
            manifest,
            module_dir,
            instance: None,
            data_dir: ctx.data_dir.clone(),
            config_dir: ctx.config_dir.clone(),
            installed_at: now,
            updated_at: now,
        };

        let entry_point = match module.manifest.entry_point_path(&module.module_dir) {
            None => {
                info!(module_id = %module_id, "模块未声明入口，仅注册界面声明");
                return Ok(LoadOutcome {
                    module,
                    initialized: false,
                    last_error: None,
                });
            }
            Some(path) if !path.exists() => {
                warn!(module_id = %module_id, entry = %path.display(), "模块入口文件不存在");
                return Ok(LoadOutcome {
                    module,
                    initialized: false,
                    last_error: Some(format!("入口文件不存在: {}", path.display())),
                });
            }
            Some(path) => path,
        };

        let request = ArtifactRequest {
            manifest: &module.manifest,
            entry_point,
            module_dir: &module.module_dir,
            host: &self.host,
            bridge: ctx.capabilities(),
        };

        let instance = match self.artifacts.load(request).await {
            Ok(instance) => instance,
            Err(e) if e.is_recoverable() => {
                warn!(module_id = %module_id, error = %e, "模块产物加载失败，降级注册");
                return Ok(LoadOutcome {
                    module,
                    initialized: false,
                    last_error: Some(e.to_string()),
                });
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = init_and_migrate(instance.as_ref(), ctx).await {
            if let Err(shutdown_err) = instance.shutdown().await {
                warn!(module_id = %module_id, error = %shutdown_err, "初始化失败后关闭模块失败");
            }
            return Err(e);
        }

        module.instance = Some(instance);
        info!(module_id = %module_id, "外部模块加载并初始化完成");
        Ok(LoadOutcome {
            module,
            initialized: true,
            last_error: None,
        })
    }
}
