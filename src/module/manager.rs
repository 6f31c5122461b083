//! 模块管理器
//!
//! 整合注册表、依赖解析、外部模块加载和路由聚合，提供统一的模块
//! 生命周期管理接口。
//!
//! 所有修改注册表的操作都持有写锁，列表与聚合操作持有读锁。
//! 生命周期钩子在写锁内顺序执行，钩子只能通过 [`RegistryHandle`]
//! 做非阻塞查询。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use super::aggregator;
use super::bridge::{settings_prefix, MemorySettingsStore, Notifier, SettingsStore};
use super::capability::{hook_failure, init_and_migrate, ModuleContext, SharedModule};
use super::loader::{ArtifactLoader, ExternalLoader};
use super::manifest::MANIFEST_FILE;
use super::metadata::{FrontendRoute, MenuItem, ModuleInfo, ModuleKind, ModuleState, SettingField};
use super::registry::{BuiltinModule, ModuleEntry, Registry, RegistryHandle};
use super::runtime::ProcessArtifactLoader;
use crate::core::config::{CoreConfig, HostInfo};
use crate::utils::{CoreError, Result};

/// 模块管理器配置
#[derive(Debug, Clone)]
pub struct ModuleManagerConfig {
    /// 宿主信息
    pub host: HostInfo,
    /// 模块数据根目录
    pub data_root: PathBuf,
    /// 外部插件根目录
    pub plugin_root: PathBuf,
    /// 默认禁用的模块
    pub disabled: Vec<String>,
    /// 工作进程握手超时
    pub handshake_timeout: Duration,
}

impl Default for ModuleManagerConfig {
    fn default() -> Self {
        Self::from_core_config(&CoreConfig::default())
    }
}

impl ModuleManagerConfig {
    /// 从内核配置创建
    pub fn from_core_config(config: &CoreConfig) -> Self {
        Self {
            host: config.host.clone(),
            data_root: config.modules.data_dir.clone(),
            plugin_root: config.modules.plugin_dir.clone(),
            disabled: config.modules.disabled.clone(),
            handshake_timeout: Duration::from_millis(config.modules.handshake_timeout_ms),
        }
    }
}

/// 模块列表及统计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleList {
    pub modules: Vec<ModuleInfo>,
    pub total: usize,
    pub builtin: usize,
    pub external: usize,
    pub enabled: usize,
}

/// 模块设置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSettings {
    pub schema: Vec<SettingField>,
    pub values: BTreeMap<String, String>,
}

/// 批量加载报告
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadReport {
    /// 成功加载且有运行实例的模块
    pub loaded: Vec<String>,
    /// 降级加载的模块及原因
    pub degraded: Vec<(String, String)>,
    /// 加载失败的目录及原因
    pub failed: Vec<(PathBuf, String)>,
}

/// 模块管理器
pub struct ModuleManager {
    config: ModuleManagerConfig,
    registry: Arc<RwLock<Registry>>,
    loader: ExternalLoader,
    settings: Arc<dyn SettingsStore>,
    notifier: Notifier,
    http: reqwest::Client,
    running: AtomicBool,
}

impl ModuleManager {
    /// 创建模块管理器
    ///
    /// 默认使用内存设置存储和工作进程产物加载器。
    pub fn new(config: ModuleManagerConfig) -> Self {
        let artifacts: Arc<dyn ArtifactLoader> =
            Arc::new(ProcessArtifactLoader::new(config.handshake_timeout));
        let loader = ExternalLoader::new(artifacts, config.host.clone(), config.data_root.clone());
        Self {
            config,
            registry: Arc::new(RwLock::new(Registry::new())),
            loader,
            settings: Arc::new(MemorySettingsStore::new()),
            notifier: Notifier::default(),
            http: reqwest::Client::new(),
            running: AtomicBool::new(false),
        }
    }

    /// 替换设置存储
    pub fn with_settings_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.settings = store;
        self
    }

    /// 替换产物加载器
    pub fn with_artifact_loader(mut self, artifacts: Arc<dyn ArtifactLoader>) -> Self {
        self.loader = ExternalLoader::new(
            artifacts,
            self.config.host.clone(),
            self.config.data_root.clone(),
        );
        self
    }

    /// 替换通知分发器
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// 配置
    pub fn config(&self) -> &ModuleManagerConfig {
        &self.config
    }

    /// 通知分发器
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// 设置存储
    pub fn settings_store(&self) -> Arc<dyn SettingsStore> {
        self.settings.clone()
    }

    /// 注册表只读句柄
    pub fn registry_handle(&self) -> RegistryHandle {
        RegistryHandle::new(&self.registry)
    }

    /// 当前 Order
    pub async fn order(&self) -> Vec<String> {
        self.registry.read().await.order().to_vec()
    }

    fn context(&self, module_id: &str) -> ModuleContext {
        ModuleContext {
            module_id: module_id.to_string(),
            data_dir: self.loader.data_dir(module_id),
            config_dir: self.loader.config_dir(module_id),
            span: tracing::info_span!("module", module_id = %module_id),
            settings: self.settings.clone(),
            notifier: self.notifier.clone(),
            http: self.http.clone(),
            registry: self.registry_handle(),
        }
    }

    fn enabled_by_default(&self, module_id: &str) -> bool {
        !self.config.disabled.iter().any(|id| id == module_id)
    }

    // ==================== 注册与加载 ====================

    /// 注册内置模块
    ///
    /// 注册后尝试重新解析 Order；依赖尚未注册时保留原 Order，
    /// 在 [`ModuleManager::init_all`] 时再报错。
    #[instrument(skip_all, fields(module_id = %module.descriptor().id))]
    pub async fn register_builtin(&self, module: SharedModule) -> Result<()> {
        let module_id = module.descriptor().id.clone();
        let enabled = self.enabled_by_default(&module_id);

        let mut registry = self.registry.write().await;
        registry.register(ModuleEntry::Builtin(BuiltinModule { instance: module }), enabled)?;
        if let Err(e) = registry.resolve() {
            debug!(error = %e, "注册后暂时无法解析顺序");
        }
        info!(enabled, "内置模块已注册");
        Ok(())
    }

    /// 加载单个外部模块
    ///
    /// # Arguments
    ///
    /// * `path` - 模块目录或 manifest.json 路径
    ///
    /// # Errors
    ///
    /// - `InvalidManifest` / `VersionIncompatible`：无任何副作用
    /// - `DuplicateModule`：ID 已注册，无任何副作用
    /// - `CapabilitySymbolMismatch` / `LifecycleHookFailure`：模块未注册
    /// - `CircularDependency`：注册被回滚
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn load_external(&self, path: &Path) -> Result<ModuleInfo> {
        let (module_dir, manifest) = self.loader.read_manifest(path).await?;
        let module_id = manifest.id.clone();

        if self.registry.read().await.contains(&module_id) {
            return Err(CoreError::DuplicateModule(module_id));
        }

        let ctx = self.context(&module_id);
        let outcome = self.loader.materialize(module_dir, manifest, &ctx).await?;
        let instance = outcome.module.instance.clone();
        // 产物不可用的模块默认禁用；只有界面声明的模块照常启用
        let enabled = (!outcome.is_degraded() || outcome.last_error.is_none())
            && self.enabled_by_default(&module_id);

        let mut registry = self.registry.write().await;
        if let Err(e) = registry.register(ModuleEntry::External(outcome.module), enabled) {
            drop(registry);
            shutdown_quietly(&module_id, instance.as_ref()).await;
            return Err(e);
        }
        if let Some(slot) = registry.get_mut(&module_id) {
            if outcome.initialized {
                slot.state = ModuleState::Initialized;
            }
            slot.last_error = outcome.last_error;
        }

        match registry.resolve() {
            Ok(()) => {}
            Err(e @ CoreError::CircularDependency(_)) => {
                registry.remove(&module_id);
                drop(registry);
                warn!(module_id = %module_id, error = %e, "循环依赖，回滚注册");
                shutdown_quietly(&module_id, instance.as_ref()).await;
                return Err(e);
            }
            Err(e) => warn!(module_id = %module_id, error = %e, "注册后暂时无法解析顺序"),
        }

        let info = registry
            .get(&module_id)
            .map(|slot| slot.info())
            .ok_or_else(|| CoreError::ModuleNotFound(module_id.clone()))?;
        info!(module_id = %module_id, enabled, has_instance = info.has_instance, "外部模块已注册");
        Ok(info)
    }

    /// 扫描插件根目录并加载所有外部模块
    ///
    /// 子目录按名称字典序加载。单个模块失败不会中断扫描，
    /// 扫描结束后返回第一个致命错误。
    #[instrument(skip(self))]
    pub async fn load_external_plugins(&self) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        let root = &self.config.plugin_root;

        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(root = %root.display(), "插件目录不存在，跳过扫描");
                return Ok(report);
            }
            Err(e) => return Err(e.into()),
        };

        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_dir() && path.join(MANIFEST_FILE).is_file() {
                dirs.push(path);
            }
        }
        dirs.sort();

        let mut first_error = None;
        for dir in dirs {
            match self.load_external(&dir).await {
                Ok(info) if info.has_instance => report.loaded.push(info.id().to_string()),
                Ok(info) => report.degraded.push((
                    info.id().to_string(),
                    info.last_error.clone().unwrap_or_else(|| "未声明入口".to_string()),
                )),
                Err(e) => {
                    error!(dir = %dir.display(), error = %e, "外部模块加载失败");
                    report.failed.push((dir, e.to_string()));
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(
            loaded = report.loaded.len(),
            degraded = report.degraded.len(),
            failed = report.failed.len(),
            "插件扫描完成"
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    // ==================== 批量生命周期 ====================

    /// 按 Order 初始化所有尚未初始化且有实例的模块
    ///
    /// 先重新解析 Order；第一个失败中止整个过程。
    #[instrument(skip(self))]
    pub async fn init_all(&self) -> Result<()> {
        let mut registry = self.registry.write().await;
        registry.resolve()?;

        for module_id in registry.order().to_vec() {
            let Some(slot) = registry.get_mut(&module_id) else {
                continue;
            };
            if !slot.state.can_init() {
                continue;
            }
            let Some(instance) = slot.entry.instance() else {
                continue;
            };

            let ctx = self.context(&module_id);
            let prepared = async {
                tokio::fs::create_dir_all(&ctx.data_dir).await?;
                tokio::fs::create_dir_all(&ctx.config_dir).await?;
                init_and_migrate(instance.as_ref(), &ctx).await
            };
            match prepared.await {
                Ok(()) => {
                    slot.state = ModuleState::Initialized;
                    slot.last_error = None;
                    debug!(module_id = %module_id, "模块已初始化");
                }
                Err(e) => {
                    error!(module_id = %module_id, error = %e, "模块初始化失败");
                    slot.last_error = Some(e.to_string());
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// 按 Order 启动所有启用的模块
    ///
    /// 内置模块启动失败中止并返回错误；外部模块失败只记录并跳过。
    #[instrument(skip(self))]
    pub async fn start_all(&self) -> Result<()> {
        let mut registry = self.registry.write().await;

        for module_id in registry.order().to_vec() {
            let Some(slot) = registry.get_mut(&module_id) else {
                continue;
            };
            if !slot.enabled || !slot.state.can_start() {
                continue;
            }
            let Some(instance) = slot.entry.instance() else {
                continue;
            };

            match instance.start().await {
                Ok(()) => {
                    slot.state = ModuleState::Started;
                    slot.last_error = None;
                    info!(module_id = %module_id, "模块已启动");
                }
                Err(e) => {
                    let e = hook_failure(&module_id, "start", e);
                    slot.last_error = Some(e.to_string());
                    if slot.is_builtin() {
                        error!(module_id = %module_id, error = %e, "内置模块启动失败");
                        return Err(e);
                    }
                    warn!(module_id = %module_id, error = %e, "外部模块启动失败，跳过");
                }
            }
        }

        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// 按 Order 逆序停止所有运行中的模块
    ///
    /// 失败只记录，不中断。
    #[instrument(skip(self))]
    pub async fn stop_all(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut registry = self.registry.write().await;

        for module_id in registry.order().to_vec().into_iter().rev() {
            let Some(slot) = registry.get_mut(&module_id) else {
                continue;
            };
            if !slot.enabled || !slot.state.can_stop() {
                continue;
            }
            let Some(instance) = slot.entry.instance() else {
                continue;
            };

            match instance.stop().await {
                Ok(()) => {
                    slot.state = ModuleState::Stopped;
                    info!(module_id = %module_id, "模块已停止");
                }
                Err(e) => {
                    let e = hook_failure(&module_id, "stop", e);
                    warn!(module_id = %module_id, error = %e, "模块停止失败");
                    slot.last_error = Some(e.to_string());
                }
            }
        }
    }

    /// 关闭所有模块
    ///
    /// 逆序停止运行中的模块，再调用每个已初始化模块的 `shutdown`。
    #[instrument(skip(self))]
    pub async fn shutdown_all(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut registry = self.registry.write().await;

        let ids: Vec<String> = registry
            .slots_in_order()
            .iter()
            .rev()
            .map(|s| s.descriptor.id.clone())
            .collect();

        for module_id in ids {
            let Some(slot) = registry.get_mut(&module_id) else {
                continue;
            };
            let Some(instance) = slot.entry.instance() else {
                continue;
            };

            if slot.state.can_stop() {
                if let Err(e) = instance.stop().await {
                    warn!(module_id = %module_id, error = %e, "关闭前停止模块失败");
                }
            }
            if slot.state.needs_shutdown() {
                if let Err(e) = instance.shutdown().await {
                    warn!(module_id = %module_id, error = %e, "模块关闭失败");
                }
                slot.state = ModuleState::Shutdown;
            }
        }
        info!("所有模块已关闭");
    }

    /// 宿主是否处于运行状态（`start_all` 之后、`stop_all` 之前）
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ==================== 单模块操作 ====================

    /// 启用模块
    ///
    /// 已启用时直接返回。模块已初始化时会调用 `start`，只有成功后才标记为启用。
    /// 产物加载失败的模块返回 `ModuleUnavailable`。
    #[instrument(skip(self))]
    pub async fn enable(&self, module_id: &str) -> Result<()> {
        let mut registry = self.registry.write().await;
        let slot = registry
            .get_mut(module_id)
            .ok_or_else(|| CoreError::ModuleNotFound(module_id.to_string()))?;
        if slot.enabled {
            return Ok(());
        }
        let Some(instance) = slot.entry.instance() else {
            if slot.last_error.is_some() {
                return Err(CoreError::ModuleUnavailable(module_id.to_string()));
            }
            slot.enabled = true;
            info!(module_id = %module_id, "模块已启用");
            return Ok(());
        };

        match slot.state {
            state if state.can_start() => {
                if let Err(e) = instance.start().await {
                    let e = hook_failure(module_id, "start", e);
                    slot.last_error = Some(e.to_string());
                    return Err(e);
                }
                slot.state = ModuleState::Started;
                slot.last_error = None;
            }
            // 尚未初始化的模块在 start_all 时启动
            ModuleState::Registered | ModuleState::Started => {}
            _ => return Err(CoreError::ModuleUnavailable(module_id.to_string())),
        }

        slot.enabled = true;
        info!(module_id = %module_id, "模块已启用");
        Ok(())
    }

    /// 禁用模块
    ///
    /// 已禁用时直接返回。运行中的模块先调用 `stop`；无论停止是否成功都标记为
    /// 禁用，停止失败的错误在标记之后返回。
    #[instrument(skip(self))]
    pub async fn disable(&self, module_id: &str) -> Result<()> {
        let mut registry = self.registry.write().await;
        let slot = registry
            .get_mut(module_id)
            .ok_or_else(|| CoreError::ModuleNotFound(module_id.to_string()))?;
        if !slot.enabled {
            return Ok(());
        }

        let mut result = Ok(());
        if slot.state.can_stop() {
            if let Some(instance) = slot.entry.instance() {
                match instance.stop().await {
                    Ok(()) => slot.state = ModuleState::Stopped,
                    Err(e) => {
                        let e = hook_failure(module_id, "stop", e);
                        slot.last_error = Some(e.to_string());
                        result = Err(e);
                    }
                }
            }
        }

        slot.enabled = false;
        info!(module_id = %module_id, "模块已禁用");
        result
    }

    /// 卸载外部模块
    ///
    /// 停止并关闭模块，从注册表移除，删除其数据目录、配置目录和设置。
    /// 模块代码目录只有是插件根目录的直接子目录时才会被删除。此操作不可逆。
    ///
    /// # Errors
    ///
    /// - `ModuleNotFound` / `BuiltinUninstall` / `ModuleHasDependents`：无任何副作用
    /// - 清理失败：模块已移除，其余清理步骤照常执行，返回第一个错误
    #[instrument(skip(self))]
    pub async fn uninstall(&self, module_id: &str) -> Result<()> {
        let mut registry = self.registry.write().await;
        let slot = registry
            .get(module_id)
            .ok_or_else(|| CoreError::ModuleNotFound(module_id.to_string()))?;
        if slot.is_builtin() {
            return Err(CoreError::BuiltinUninstall(module_id.to_string()));
        }
        let dependents = registry.builtin_dependents(module_id);
        if !dependents.is_empty() {
            return Err(CoreError::ModuleHasDependents {
                module: module_id.to_string(),
                dependents,
            });
        }

        let Some(mut slot) = registry.remove(module_id) else {
            return Err(CoreError::ModuleNotFound(module_id.to_string()));
        };
        if let Some(instance) = slot.entry.instance() {
            if slot.state.can_stop() {
                if let Err(e) = instance.stop().await {
                    warn!(module_id = %module_id, error = %e, "卸载时停止模块失败");
                }
            }
            if slot.state.needs_shutdown() {
                if let Err(e) = instance.shutdown().await {
                    warn!(module_id = %module_id, error = %e, "卸载时关闭模块失败");
                }
            }
        }
        slot.state = ModuleState::Uninstalled;
        drop(registry);

        // 模块已移出注册表，清理步骤全部执行，返回第一个错误
        let mut first_error = None;
        let mut record = |step: &str, result: Result<()>| {
            if let Err(e) = result {
                warn!(module_id = %module_id, step, error = %e, "卸载清理失败");
                first_error.get_or_insert(e);
            }
        };

        record(
            "settings",
            self.settings.delete_prefix(&settings_prefix(module_id)).await,
        );
        if let Some(external) = slot.entry.as_external() {
            record("config_dir", remove_dir_if_exists(&external.config_dir).await);
            record("data_dir", remove_dir_if_exists(&external.data_dir).await);
            match owned_plugin_dir(&self.config.plugin_root, &external.module_dir).await {
                Some(dir) => record("module_dir", remove_dir_if_exists(&dir).await),
                None => info!(
                    module_id = %module_id,
                    module_dir = %external.module_dir.display(),
                    "模块目录不在插件根目录下，保留源文件"
                ),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(module_id = %module_id, "外部模块已卸载");
                Ok(())
            }
        }
    }

    /// 安装外部模块
    ///
    /// 本地目录会被复制到插件根目录下的 `<id>` 子目录再加载；
    /// 宿主运行中时，启用的模块会立即启动。
    ///
    /// # Errors
    ///
    /// 从 URL 安装返回 `NotImplemented`
    #[instrument(skip(self))]
    pub async fn install(&self, source: &str) -> Result<ModuleInfo> {
        if source.starts_with("http://") || source.starts_with("https://") {
            return Err(CoreError::NotImplemented(format!("从 URL 安装: {}", source)));
        }

        let (module_dir, manifest) = self.loader.read_manifest(Path::new(source)).await?;
        if self.registry.read().await.contains(&manifest.id) {
            return Err(CoreError::DuplicateModule(manifest.id));
        }

        let target = self.config.plugin_root.join(&manifest.id);
        let copied = !same_dir(&module_dir, &target).await;
        if copied {
            remove_dir_if_exists(&target).await?;
            copy_dir_all(&module_dir, &target).await?;
        }

        let info = match self.load_external(&target).await {
            Ok(info) => info,
            Err(e) => {
                if copied {
                    if let Err(cleanup) = remove_dir_if_exists(&target).await {
                        warn!(path = %target.display(), error = %cleanup, "清理安装目录失败");
                    }
                }
                return Err(e);
            }
        };

        if self.is_running() && info.enabled {
            if let Err(e) = self.start_one(info.id()).await {
                warn!(module_id = %info.id(), error = %e, "新安装的模块启动失败");
            }
        }
        self.get_module(info.id()).await
    }

    async fn start_one(&self, module_id: &str) -> Result<()> {
        let mut registry = self.registry.write().await;
        let slot = registry
            .get_mut(module_id)
            .ok_or_else(|| CoreError::ModuleNotFound(module_id.to_string()))?;
        let Some(instance) = slot.entry.instance() else {
            return Ok(());
        };
        if !slot.state.can_start() {
            return Ok(());
        }
        match instance.start().await {
            Ok(()) => {
                slot.state = ModuleState::Started;
                Ok(())
            }
            Err(e) => {
                let e = hook_failure(module_id, "start", e);
                slot.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    // ==================== 设置 ====================

    /// 读取模块设置
    ///
    /// 未设置的键使用定义中的默认值。
    pub async fn get_settings(&self, module_id: &str) -> Result<ModuleSettings> {
        let schema = self.settings_schema(module_id).await?;
        let prefix = settings_prefix(module_id);

        let mut values: BTreeMap<String, String> = self
            .settings
            .list_prefix(&prefix)
            .await?
            .into_iter()
            .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|k| (k.to_string(), v)))
            .collect();
        for field in &schema {
            if let Some(ref default) = field.default {
                values
                    .entry(field.key.clone())
                    .or_insert_with(|| default.clone());
            }
        }

        Ok(ModuleSettings { schema, values })
    }

    /// 更新模块设置
    ///
    /// 每个键都必须在设置定义中，取值必须符合字段类型。
    /// 任一键无效时不写入任何值。
    #[instrument(skip(self, values))]
    pub async fn update_settings(
        &self,
        module_id: &str,
        values: BTreeMap<String, String>,
    ) -> Result<ModuleSettings> {
        let schema = self.settings_schema(module_id).await?;

        let mut errors = Vec::new();
        for (key, value) in &values {
            match schema.iter().find(|f| &f.key == key) {
                Some(field) => {
                    if let Err(e) = field.check_value(value) {
                        errors.push(e);
                    }
                }
                None => errors.push(format!("未知的设置项 '{}'", key)),
            }
        }
        if !errors.is_empty() {
            return Err(CoreError::InvalidSettings(errors.join("; ")));
        }

        let prefix = settings_prefix(module_id);
        for (key, value) in &values {
            self.settings.set(&format!("{}{}", prefix, key), value).await?;
        }
        info!(module_id = %module_id, count = values.len(), "模块设置已更新");
        self.get_settings(module_id).await
    }

    async fn settings_schema(&self, module_id: &str) -> Result<Vec<SettingField>> {
        let registry = self.registry.read().await;
        let slot = registry
            .get(module_id)
            .ok_or_else(|| CoreError::ModuleNotFound(module_id.to_string()))?;
        Ok(slot.entry.settings_schema())
    }

    // ==================== 查询与聚合 ====================

    /// 列出所有模块
    pub async fn list_modules(&self) -> ModuleList {
        let modules = self.registry.read().await.list();
        let builtin = modules.iter().filter(|m| m.kind == ModuleKind::Builtin).count();
        let enabled = modules.iter().filter(|m| m.enabled).count();
        ModuleList {
            total: modules.len(),
            builtin,
            external: modules.len() - builtin,
            enabled,
            modules,
        }
    }

    /// 获取单个模块
    pub async fn get_module(&self, module_id: &str) -> Result<ModuleInfo> {
        self.registry
            .read()
            .await
            .get(module_id)
            .map(|slot| slot.info())
            .ok_or_else(|| CoreError::ModuleNotFound(module_id.to_string()))
    }

    /// 挂载所有启用模块的路由
    pub async fn mount_routes(&self, prefix: &str) -> axum::Router {
        aggregator::mount_routes(&*self.registry.read().await, prefix)
    }

    /// 收集菜单
    pub async fn collect_menus(&self) -> Vec<MenuItem> {
        aggregator::collect_menus(&*self.registry.read().await).await
    }

    /// 收集前端路由
    pub async fn collect_frontend_routes(&self) -> Vec<FrontendRoute> {
        aggregator::collect_frontend_routes(&*self.registry.read().await).await
    }
}

async fn shutdown_quietly(module_id: &str, instance: Option<&SharedModule>) {
    if let Some(instance) = instance {
        if let Err(e) = instance.shutdown().await {
            warn!(module_id = %module_id, error = %e, "回滚时关闭模块失败");
        }
    }
}

async fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// 插件根目录的直接子目录才归宿主所有
///
/// 两个路径都先规范化；模块目录等于根目录、位于根目录之外或无法解析时返回 `None`。
async fn owned_plugin_dir(plugin_root: &Path, module_dir: &Path) -> Option<PathBuf> {
    let root = tokio::fs::canonicalize(plugin_root).await.ok()?;
    let dir = tokio::fs::canonicalize(module_dir).await.ok()?;
    (dir.parent() == Some(root.as_path())).then_some(dir)
}

async fn same_dir(a: &Path, b: &Path) -> bool {
    match (tokio::fs::canonicalize(a).await, tokio::fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// 递归复制目录
fn copy_dir_all<'a>(
    from: &'a Path,
    to: &'a Path,
) -> futures::future::BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(to).await?;
        let mut entries = tokio::fs::read_dir(from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                copy_dir_all(&entry.path(), &target).await?;
            } else {
                tokio::fs::copy(entry.path(), &target).await?;
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::capability::Module;
    use crate::module::loader::FnArtifactLoader;
    use crate::module::metadata::{ModuleDescriptor, SettingType};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    type CallLog = Arc<StdMutex<Vec<String>>>;

    struct Recorder {
        descriptor: ModuleDescriptor,
        log: CallLog,
        fail_on: Option<&'static str>,
        schema: Vec<SettingField>,
    }

    impl Recorder {
        fn new(id: &str, deps: &[&str], log: &CallLog) -> Self {
            let mut descriptor = ModuleDescriptor::new(id, id, "1.0.0");
            descriptor.dependencies = deps.iter().map(|d| d.to_string()).collect();
            Self {
                descriptor,
                log: log.clone(),
                fail_on: None,
                schema: vec![],
            }
        }

        fn failing(mut self, hook: &'static str) -> Self {
            self.fail_on = Some(hook);
            self
        }

        fn record(&self, hook: &'static str) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.descriptor.id, hook));
            if self.fail_on == Some(hook) {
                return Err(CoreError::Internal(format!("{} 失败", hook)));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Module for Recorder {
        fn descriptor(&self) -> &ModuleDescriptor {
            &self.descriptor
        }
        async fn init(&self, _ctx: &ModuleContext) -> Result<()> {
            self.record("init")
        }
        async fn migrate(&self, _ctx: &ModuleContext) -> Result<()> {
            self.record("migrate")
        }
        async fn start(&self) -> Result<()> {
            self.record("start")
        }
        async fn stop(&self) -> Result<()> {
            self.record("stop")
        }
        async fn shutdown(&self) -> Result<()> {
            self.record("shutdown")
        }
        fn settings_schema(&self) -> Vec<SettingField> {
            self.schema.clone()
        }
    }

    fn manager(dir: &TempDir) -> ModuleManager {
        ModuleManager::new(ModuleManagerConfig {
            host: HostInfo::default(),
            data_root: dir.path().join("data"),
            plugin_root: dir.path().join("plugins"),
            disabled: vec![],
            handshake_timeout: Duration::from_millis(500),
        })
    }

    fn calls(log: &CallLog) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    async fn write_plugin(root: &Path, id: &str, deps: &[&str]) -> PathBuf {
        let dir = root.join(id);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let manifest = serde_json::json!({
            "id": id,
            "name": id,
            "version": "1.0.0",
            "dependencies": deps,
            "entry_point": "run",
            "settings": [
                { "key": "port", "label": "端口", "type": "number", "default": "8080" }
            ],
        });
        tokio::fs::write(dir.join(MANIFEST_FILE), manifest.to_string())
            .await
            .unwrap();
        tokio::fs::write(dir.join("run"), "").await.unwrap();
        dir
    }

    fn recording_loader(log: &CallLog) -> Arc<dyn ArtifactLoader> {
        let log = log.clone();
        Arc::new(FnArtifactLoader::new(move |request| {
            let deps: Vec<&str> = request
                .manifest
                .dependencies
                .iter()
                .map(String::as_str)
                .collect();
            let module: SharedModule = Arc::new(Recorder::new(&request.manifest.id, &deps, &log));
            Ok(module)
        }))
    }

    #[tokio::test]
    async fn test_lifecycle_follows_dependency_order() {
        let dir = TempDir::new().unwrap();
        let log = CallLog::default();
        let manager = manager(&dir);

        manager
            .register_builtin(Arc::new(Recorder::new("sites", &["nginx"], &log)))
            .await
            .unwrap();
        manager
            .register_builtin(Arc::new(Recorder::new("nginx", &["docker"], &log)))
            .await
            .unwrap();
        manager
            .register_builtin(Arc::new(Recorder::new("docker", &[], &log)))
            .await
            .unwrap();

        manager.init_all().await.unwrap();
        manager.start_all().await.unwrap();
        manager.stop_all().await;

        assert_eq!(manager.order().await, vec!["docker", "nginx", "sites"]);
        assert_eq!(
            calls(&log),
            vec![
                "docker:init", "docker:migrate", "nginx:init", "nginx:migrate", "sites:init",
                "sites:migrate", "docker:start", "nginx:start", "sites:start", "sites:stop",
                "nginx:stop", "docker:stop",
            ]
        );
        assert!(dir.path().join("data/docker").is_dir());
    }

    #[tokio::test]
    async fn test_init_all_fails_on_missing_builtin_dependency() {
        let dir = TempDir::new().unwrap();
        let log = CallLog::default();
        let manager = manager(&dir);
        manager
            .register_builtin(Arc::new(Recorder::new("sites", &["nginx"], &log)))
            .await
            .unwrap();

        let err = manager.init_all().await.unwrap_err();
        assert!(matches!(err, CoreError::MissingDependency { .. }));
        assert!(calls(&log).is_empty());
    }

    #[tokio::test]
    async fn test_builtin_start_failure_aborts() {
        let dir = TempDir::new().unwrap();
        let log = CallLog::default();
        let manager = manager(&dir);
        manager
            .register_builtin(Arc::new(Recorder::new("a", &[], &log).failing("start")))
            .await
            .unwrap();
        manager
            .register_builtin(Arc::new(Recorder::new("b", &["a"], &log)))
            .await
            .unwrap();
        manager.init_all().await.unwrap();

        let err = manager.start_all().await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::LifecycleHookFailure { hook: "start", .. }
        ));
        assert!(!calls(&log).contains(&"b:start".to_string()));
        let info = manager.get_module("a").await.unwrap();
        assert_eq!(info.state, ModuleState::Initialized);
        assert!(info.last_error.is_some());
    }

    #[tokio::test]
    async fn test_enable_disable_cycle() {
        let dir = TempDir::new().unwrap();
        let log = CallLog::default();
        let mut config = manager(&dir).config().clone();
        config.disabled = vec!["docker".to_string()];
        let manager = ModuleManager::new(config);

        manager
            .register_builtin(Arc::new(Recorder::new("docker", &[], &log)))
            .await
            .unwrap();
        manager.init_all().await.unwrap();
        manager.start_all().await.unwrap();
        assert!(!manager.get_module("docker").await.unwrap().enabled);

        manager.enable("docker").await.unwrap();
        manager.enable("docker").await.unwrap();
        manager.disable("docker").await.unwrap();
        manager.disable("docker").await.unwrap();
        manager.enable("docker").await.unwrap();

        let log = calls(&log);
        assert_eq!(log.iter().filter(|c| *c == "docker:start").count(), 2);
        assert_eq!(log.iter().filter(|c| *c == "docker:stop").count(), 1);
        let info = manager.get_module("docker").await.unwrap();
        assert!(info.enabled);
        assert_eq!(info.state, ModuleState::Started);
    }

    #[tokio::test]
    async fn test_disable_reports_stop_failure_after_flip() {
        let dir = TempDir::new().unwrap();
        let log = CallLog::default();
        let manager = manager(&dir);
        manager
            .register_builtin(Arc::new(Recorder::new("cron", &[], &log).failing("stop")))
            .await
            .unwrap();
        manager.init_all().await.unwrap();
        manager.start_all().await.unwrap();

        assert!(manager.disable("cron").await.is_err());
        assert!(!manager.get_module("cron").await.unwrap().enabled);
    }

    #[tokio::test]
    async fn test_unknown_module_operations() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        assert!(matches!(
            manager.enable("ghost").await,
            Err(CoreError::ModuleNotFound(_))
        ));
        assert!(matches!(
            manager.uninstall("ghost").await,
            Err(CoreError::ModuleNotFound(_))
        ));
        assert!(matches!(
            manager.install("https://example.com/plugin.zip").await,
            Err(CoreError::NotImplemented(_))
        ));
    }

    #[tokio::test]
    async fn test_external_load_and_uninstall() {
        let dir = TempDir::new().unwrap();
        let log = CallLog::default();
        let manager = manager(&dir).with_artifact_loader(recording_loader(&log));
        let plugin = write_plugin(&dir.path().join("src"), "backup", &[]).await;

        let info = manager.load_external(&plugin).await.unwrap();
        assert_eq!(info.state, ModuleState::Initialized);
        assert!(info.enabled);
        assert_eq!(calls(&log), vec!["backup:init", "backup:migrate"]);

        manager
            .update_settings("backup", BTreeMap::from([("port".to_string(), "9000".to_string())]))
            .await
            .unwrap();
        manager.start_all().await.unwrap();

        manager.uninstall("backup").await.unwrap();
        assert!(matches!(
            manager.get_module("backup").await,
            Err(CoreError::ModuleNotFound(_))
        ));
        assert!(!dir.path().join("data/backup").exists());
        assert!(!dir.path().join("data/.config/backup").exists());
        assert!(manager
            .settings_store()
            .list_prefix("backup.")
            .await
            .unwrap()
            .is_empty());
        let log = calls(&log);
        assert!(log.ends_with(&["backup:stop".to_string(), "backup:shutdown".to_string()]));
        // 插件根目录之外的源目录保留
        assert!(plugin.exists());
    }

    #[tokio::test]
    async fn test_uninstall_guards() {
        let dir = TempDir::new().unwrap();
        let log = CallLog::default();
        let manager = manager(&dir).with_artifact_loader(recording_loader(&log));
        let plugin = write_plugin(&dir.path().join("src"), "redis", &[]).await;
        manager.load_external(&plugin).await.unwrap();
        manager
            .register_builtin(Arc::new(Recorder::new("cache", &["redis"], &log)))
            .await
            .unwrap();

        assert!(matches!(
            manager.uninstall("cache").await,
            Err(CoreError::BuiltinUninstall(_))
        ));
        let err = manager.uninstall("redis").await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::ModuleHasDependents { ref dependents, .. } if dependents == &["cache".to_string()]
        ));
        assert!(manager.get_module("redis").await.is_ok());
        assert!(dir.path().join("data/redis").is_dir());
    }

    #[tokio::test]
    async fn test_external_cycle_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let log = CallLog::default();
        let manager = manager(&dir).with_artifact_loader(recording_loader(&log));
        let src = dir.path().join("src");
        let a = write_plugin(&src, "alpha", &["beta"]).await;
        let b = write_plugin(&src, "beta", &["alpha"]).await;

        manager.load_external(&a).await.unwrap();
        let err = manager.load_external(&b).await.unwrap_err();
        assert!(matches!(err, CoreError::CircularDependency(_)));
        assert!(manager.get_module("beta").await.is_err());
        assert!(calls(&log).contains(&"beta:shutdown".to_string()));
        assert_eq!(manager.order().await, vec!["alpha"]);
    }

    #[tokio::test]
    async fn test_duplicate_external_has_no_side_effects() {
        let dir = TempDir::new().unwrap();
        let log = CallLog::default();
        let manager = manager(&dir).with_artifact_loader(recording_loader(&log));
        manager
            .register_builtin(Arc::new(Recorder::new("docker", &[], &log)))
            .await
            .unwrap();
        let plugin = write_plugin(&dir.path().join("src"), "docker", &[]).await;

        let err = manager.load_external(&plugin).await.unwrap_err();
        assert!(matches!(err, CoreError::DuplicateModule(_)));
        assert!(calls(&log).is_empty());
        assert!(!dir.path().join("data/docker").exists());
    }

    #[tokio::test]
    async fn test_settings_defaults_and_validation() {
        let dir = TempDir::new().unwrap();
        let log = CallLog::default();
        let manager = manager(&dir);
        let mut module = Recorder::new("nginx", &[], &log);
        module.schema = vec![
            SettingField::new("port", "端口", SettingType::Number).with_default("80"),
            SettingField::new("gzip", "压缩", SettingType::Boolean),
        ];
        manager.register_builtin(Arc::new(module)).await.unwrap();

        let settings = manager.get_settings("nginx").await.unwrap();
        assert_eq!(settings.values.get("port").map(String::as_str), Some("80"));
        assert_eq!(settings.schema.len(), 2);

        let err = manager
            .update_settings(
                "nginx",
                BTreeMap::from([
                    ("port".to_string(), "8080".to_string()),
                    ("unknown".to_string(), "x".to_string()),
                ]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidSettings(_)));
        assert_eq!(
            manager.get_settings("nginx").await.unwrap().values["port"],
            "80"
        );

        let updated = manager
            .update_settings(
                "nginx",
                BTreeMap::from([
                    ("port".to_string(), "8080".to_string()),
                    ("gzip".to_string(), "true".to_string()),
                ]),
            )
            .await
            .unwrap();
        assert_eq!(updated.values["port"], "8080");
        assert_eq!(updated.values["gzip"], "true");
    }

    #[tokio::test]
    async fn test_load_external_plugins_scans_in_order() {
        let dir = TempDir::new().unwrap();
        let log = CallLog::default();
        let manager = manager(&dir).with_artifact_loader(recording_loader(&log));
        let root = dir.path().join("plugins");
        write_plugin(&root, "zeta", &[]).await;
        write_plugin(&root, "alpha", &[]).await;
        tokio::fs::create_dir_all(root.join("not-a-plugin")).await.unwrap();

        let report = manager.load_external_plugins().await.unwrap();
        assert_eq!(report.loaded, vec!["alpha", "zeta"]);
        assert!(report.failed.is_empty());

        let list = manager.list_modules().await;
        assert_eq!(list.total, 2);
        assert_eq!(list.external, 2);
        assert_eq!(list.enabled, 2);
    }

    #[tokio::test]
    async fn test_install_copies_into_plugin_root() {
        let dir = TempDir::new().unwrap();
        let log = CallLog::default();
        let manager = manager(&dir).with_artifact_loader(recording_loader(&log));
        let src = write_plugin(&dir.path().join("src"), "ftp", &[]).await;

        let info = manager.install(src.to_str().unwrap()).await.unwrap();
        assert_eq!(info.id(), "ftp");
        assert!(dir.path().join("plugins/ftp/manifest.json").is_file());

        manager.uninstall("ftp").await.unwrap();
        assert!(!dir.path().join("plugins/ftp").exists());
        assert!(src.exists());
    }
}
