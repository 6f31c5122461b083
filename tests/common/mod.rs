//! 集成测试共用的辅助模块

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use tempfile::TempDir;

use panel_core::module::ModuleManagerConfig;
use panel_core::{
    CoreError, HostInfo, MenuItem, Module, ModuleContext, ModuleDescriptor, Result, SettingField,
};

/// 钩子调用记录，格式为 `<id>:<hook>`
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn calls(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub fn count(log: &CallLog, entry: &str) -> usize {
    log.lock().unwrap().iter().filter(|c| *c == entry).count()
}

/// 记录生命周期调用的测试模块
pub struct TestModule {
    descriptor: ModuleDescriptor,
    log: CallLog,
    fail_on: Option<&'static str>,
    route: Option<&'static str>,
    menus: Vec<MenuItem>,
    schema: Vec<SettingField>,
}

impl TestModule {
    pub fn new(id: &str, deps: &[&str], log: &CallLog) -> Self {
        let mut descriptor = ModuleDescriptor::new(id, id, "1.0.0");
        descriptor.dependencies = deps.iter().map(|d| d.to_string()).collect();
        Self {
            descriptor,
            log: log.clone(),
            fail_on: None,
            route: None,
            menus: vec![],
            schema: vec![],
        }
    }

    pub fn failing(mut self, hook: &'static str) -> Self {
        self.fail_on = Some(hook);
        self
    }

    /// 贡献一个返回模块 ID 的 GET 路由
    pub fn with_route(mut self, path: &'static str) -> Self {
        self.route = Some(path);
        self
    }

    pub fn with_menu(mut self, menu: MenuItem) -> Self {
        self.menus.push(menu);
        self
    }

    pub fn with_setting(mut self, field: SettingField) -> Self {
        self.schema.push(field);
        self
    }

    pub fn shared(self) -> Arc<dyn Module> {
        Arc::new(self)
    }

    fn record(&self, hook: &'static str) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.descriptor.id, hook));
        match self.fail_on {
            Some(h) if h == hook => Err(CoreError::Internal(format!("{} 钩子故意失败", hook))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Module for TestModule {
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
    fn routes(&self) -> Option<Router> {
        let path = self.route?;
        let id = self.descriptor.id.clone();
        Some(Router::new().route(
            path,
            get(move || {
                let id = id.clone();
                async move { id }
            }),
        ))
    }
    async fn menus(&self) -> Vec<MenuItem> {
        self.menus.clone()
    }
    fn settings_schema(&self) -> Vec<SettingField> {
        self.schema.clone()
    }
}

/// 以临时目录为根的管理器配置
pub fn manager_config(dir: &TempDir) -> ModuleManagerConfig {
    ModuleManagerConfig {
        host: HostInfo::default(),
        data_root: dir.path().join("data"),
        plugin_root: dir.path().join("plugins"),
        disabled: vec![],
        handshake_timeout: Duration::from_secs(10),
    }
}

/// 在 `root/<id>` 写入清单，返回模块目录
pub async fn write_manifest(root: &Path, manifest: serde_json::Value) -> PathBuf {
    let id = manifest["id"].as_str().unwrap().to_string();
    let dir = root.join(id);
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(dir.join("manifest.json"), manifest.to_string())
        .await
        .unwrap();
    dir
}
