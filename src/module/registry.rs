//! 模块注册表
//!
//! 以模块 ID 为键保存内置与外部模块，并维护拓扑启动顺序（Order）。
//! Order 只在 [`Registry::resolve`] 成功时更新，是启动、停止和路由挂载
//! 顺序的唯一依据。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::capability::SharedModule;
use super::dependency::DependencyGraph;
use super::manifest::ExternalManifest;
use super::metadata::{ModuleDescriptor, ModuleInfo, ModuleKind, ModuleState, SettingField};
use crate::utils::{CoreError, Result};

/// 内置模块
#[derive(Clone)]
pub struct BuiltinModule {
    pub instance: SharedModule,
}

/// 已加载的外部模块
#[derive(Clone)]
pub struct LoadedExternalModule {
    pub manifest: ExternalManifest,
    /// 插件目录（清单所在目录）
    pub module_dir: PathBuf,
    /// 运行实例，缺失表示代码不可用（非致命）
    pub instance: Option<SharedModule>,
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 注册表条目
#[derive(Clone)]
pub enum ModuleEntry {
    Builtin(BuiltinModule),
    External(LoadedExternalModule),
}

impl ModuleEntry {
    /// 模块描述
    pub fn descriptor(&self) -> ModuleDescriptor {
        match self {
            ModuleEntry::Builtin(b) => b.instance.descriptor().clone(),
            ModuleEntry::External(e) => e.manifest.descriptor(),
        }
    }

    /// 模块来源
    pub fn kind(&self) -> ModuleKind {
        match self {
            ModuleEntry::Builtin(_) => ModuleKind::Builtin,
            ModuleEntry::External(_) => ModuleKind::External,
        }
    }

    /// 运行实例
    pub fn instance(&self) -> Option<SharedModule> {
        match self {
            ModuleEntry::Builtin(b) => Some(b.instance.clone()),
            ModuleEntry::External(e) => e.instance.clone(),
        }
    }

    /// 设置项定义
    ///
    /// 外部模块以清单为准。
    pub fn settings_schema(&self) -> Vec<SettingField> {
        match self {
            ModuleEntry::Builtin(b) => b.instance.settings_schema(),
            ModuleEntry::External(e) => e.manifest.settings.clone(),
        }
    }

    /// 外部模块信息
    pub fn as_external(&self) -> Option<&LoadedExternalModule> {
        match self {
            ModuleEntry::External(e) => Some(e),
            ModuleEntry::Builtin(_) => None,
        }
    }
}

/// 注册表槽位
#[derive(Clone)]
pub struct ModuleSlot {
    pub descriptor: ModuleDescriptor,
    pub entry: ModuleEntry,
    pub state: ModuleState,
    pub enabled: bool,
    pub last_error: Option<String>,
    /// 注册序号，拓扑排序的决胜键
    pub seq: u64,
}

impl ModuleSlot {
    /// 是否为内置模块
    pub fn is_builtin(&self) -> bool {
        self.entry.kind() == ModuleKind::Builtin
    }

    /// 生成信息快照
    pub fn info(&self) -> ModuleInfo {
        let external = self.entry.as_external();
        ModuleInfo {
            descriptor: self.descriptor.clone(),
            kind: self.entry.kind(),
            state: self.state,
            enabled: self.enabled,
            has_instance: self.entry.instance().is_some(),
            last_error: self.last_error.clone(),
            permissions: external
                .map(|e| e.manifest.permissions.clone())
                .unwrap_or_default(),
            author: external
                .map(|e| e.manifest.author.clone())
                .filter(|a| !a.is_empty()),
            installed_at: external.map(|e| e.installed_at),
            updated_at: external.map(|e| e.updated_at),
            data_dir: external.map(|e| e.data_dir.clone()),
            config_dir: external.map(|e| e.config_dir.clone()),
        }
    }
}

/// 模块注册表
#[derive(Default)]
pub struct Registry {
    /// 已注册的模块：module_id -> slot
    modules: HashMap<String, ModuleSlot>,
    /// 拓扑启动顺序
    order: Vec<String>,
    next_seq: u64,
}

impl Registry {
    /// 创建空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册模块
    ///
    /// # Errors
    ///
    /// ID 已被任一类模块占用时返回 `DuplicateModule`，注册表不变
    pub fn register(&mut self, entry: ModuleEntry, enabled: bool) -> Result<u64> {
        let descriptor = entry.descriptor();
        if self.modules.contains_key(&descriptor.id) {
            return Err(CoreError::DuplicateModule(descriptor.id));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        debug!(module_id = %descriptor.id, seq, kind = %entry.kind(), "注册模块");

        self.modules.insert(
            descriptor.id.clone(),
            ModuleSlot {
                descriptor,
                entry,
                state: ModuleState::Registered,
                enabled,
                last_error: None,
                seq,
            },
        );
        Ok(seq)
    }

    /// 移除模块并从 Order 中删去
    ///
    /// 删除一个节点不会破坏剩余节点的拓扑顺序。
    pub fn remove(&mut self, module_id: &str) -> Option<ModuleSlot> {
        let slot = self.modules.remove(module_id)?;
        self.order.retain(|id| id != module_id);
        Some(slot)
    }

    /// 重新计算 Order
    ///
    /// 内置模块的未知依赖是致命错误；外部模块的未知依赖只记录警告并跳过该边。
    /// 失败时保留之前的 Order。
    pub fn resolve(&mut self) -> Result<()> {
        let mut graph = DependencyGraph::new();
        let mut slots: Vec<&ModuleSlot> = self.modules.values().collect();
        slots.sort_by_key(|s| s.seq);

        for slot in &slots {
            graph.add_module(&slot.descriptor.id, slot.seq);
        }

        for slot in &slots {
            for dep in &slot.descriptor.dependencies {
                if graph.add_dependency(&slot.descriptor.id, dep) {
                    continue;
                }
                if slot.is_builtin() {
                    return Err(CoreError::MissingDependency {
                        module: slot.descriptor.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                warn!(
                    module_id = %slot.descriptor.id,
                    dependency = %dep,
                    "外部模块依赖未找到，忽略该依赖"
                );
            }
        }

        let order = graph.topological_sort()?;
        debug!(order = ?order, "模块顺序已更新");
        self.order = order;
        Ok(())
    }

    /// 当前 Order
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// 获取槽位
    pub fn get(&self, module_id: &str) -> Option<&ModuleSlot> {
        self.modules.get(module_id)
    }

    /// 获取可变槽位
    pub fn get_mut(&mut self, module_id: &str) -> Option<&mut ModuleSlot> {
        self.modules.get_mut(module_id)
    }

    /// 是否包含某模块
    pub fn contains(&self, module_id: &str) -> bool {
        self.modules.contains_key(module_id)
    }

    /// 模块数量
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// 直接依赖该模块的内置模块
    pub fn builtin_dependents(&self, module_id: &str) -> Vec<String> {
        let mut dependents: Vec<&ModuleSlot> = self
            .modules
            .values()
            .filter(|s| s.is_builtin() && s.descriptor.dependencies.iter().any(|d| d == module_id))
            .collect();
        dependents.sort_by_key(|s| s.seq);
        dependents.iter().map(|s| s.descriptor.id.clone()).collect()
    }

    /// 按 Order 排列的全部槽位
    ///
    /// 尚未进入 Order 的模块（注册后未成功解析）按注册序号排在末尾。
    pub fn slots_in_order(&self) -> Vec<&ModuleSlot> {
        let mut slots: Vec<&ModuleSlot> = self
            .order
            .iter()
            .filter_map(|id| self.modules.get(id))
            .collect();

        let mut pending: Vec<&ModuleSlot> = self
            .modules
            .values()
            .filter(|s| !self.order.contains(&s.descriptor.id))
            .collect();
        pending.sort_by_key(|s| s.seq);
        slots.extend(pending);
        slots
    }

    /// 信息快照列表
    pub fn list(&self) -> Vec<ModuleInfo> {
        self.slots_in_order().into_iter().map(ModuleSlot::info).collect()
    }
}

/// 注册表只读句柄
///
/// 交给生命周期钩子使用。只提供 `try_*` 查询，注册表被占用时立即返回
/// `RegistryBusy`，钩子不会因为等待锁而死锁。
#[derive(Clone)]
pub struct RegistryHandle {
    inner: Weak<RwLock<Registry>>,
}

impl RegistryHandle {
    /// 创建句柄
    pub fn new(registry: &Arc<RwLock<Registry>>) -> Self {
        Self {
            inner: Arc::downgrade(registry),
        }
    }

    fn with_registry<T>(&self, f: impl FnOnce(&Registry) -> T) -> Result<T> {
        let registry = self
            .inner
            .upgrade()
            .ok_or_else(|| CoreError::Internal("注册表已释放".to_string()))?;
        let guard = registry.try_read().map_err(|_| CoreError::RegistryBusy)?;
        Ok(f(&guard))
    }

    /// 列出所有模块
    pub fn try_list(&self) -> Result<Vec<ModuleInfo>> {
        self.with_registry(Registry::list)
    }

    /// 查询单个模块
    pub fn try_get(&self, module_id: &str) -> Result<Option<ModuleInfo>> {
        self.with_registry(|r| r.get(module_id).map(ModuleSlot::info))
    }

    /// 模块是否已注册且启用
    pub fn try_is_enabled(&self, module_id: &str) -> Result<bool> {
        self.with_registry(|r| r.get(module_id).map(|s| s.enabled).unwrap_or(false))
    }
}
