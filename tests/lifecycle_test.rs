//! # 生命周期集成测试
//!
//! 测试模块管理器的完整工作流程：
//! - 注册 → 依赖解析 → 初始化 → 启动 → 停止 → 关闭
//! - 重复注册、循环依赖、缺失依赖
//! - 启用/禁用与卸载的边界情况

mod common;

use std::sync::Arc;

use common::{calls, count, manager_config, write_manifest, CallLog, TestModule};
use panel_core::module::{ArtifactLoader, FnArtifactLoader, ModuleManager, SharedModule};
use panel_core::{CoreError, ModuleState};
use serde_json::json;
use tempfile::TempDir;

fn position(order: &[String], id: &str) -> usize {
    order.iter().position(|o| o == id).unwrap()
}

/// 把清单中的外部模块实例化为 TestModule
fn test_loader(log: &CallLog) -> Arc<dyn ArtifactLoader> {
    let log = log.clone();
    Arc::new(FnArtifactLoader::new(move |request| {
        let deps: Vec<&str> = request
            .manifest
            .dependencies
            .iter()
            .map(String::as_str)
            .collect();
        let module: SharedModule = TestModule::new(&request.manifest.id, &deps, &log).shared();
        Ok(module)
    }))
}

async fn external(dir: &TempDir, id: &str, deps: &[&str]) -> std::path::PathBuf {
    let root = dir.path().join("sources");
    let module_dir = write_manifest(
        &root,
        json!({ "id": id, "name": id, "version": "1.0.0", "dependencies": deps, "entry_point": "bin" }),
    )
    .await;
    tokio::fs::write(module_dir.join("bin"), "").await.unwrap();
    module_dir
}

// ============================================================================
// 依赖顺序
// ============================================================================

#[tokio::test]
async fn test_panel_stack_ordering() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let manager = ModuleManager::new(manager_config(&dir));

    // 注册顺序故意打乱
    for (id, deps) in [
        ("sites", vec!["nginx", "database"]),
        ("apps", vec!["docker"]),
        ("nginx", vec![]),
        ("database", vec!["docker"]),
        ("docker", vec![]),
    ] {
        manager
            .register_builtin(TestModule::new(id, &deps, &log).shared())
            .await
            .unwrap();
    }

    manager.init_all().await.unwrap();
    let order = manager.order().await;
    assert_eq!(order, vec!["nginx", "docker", "apps", "database", "sites"]);

    for (module, dep) in [
        ("sites", "nginx"),
        ("sites", "database"),
        ("apps", "docker"),
        ("database", "docker"),
    ] {
        assert!(position(&order, dep) < position(&order, module));
    }

    manager.start_all().await.unwrap();
    let started: Vec<String> = calls(&log)
        .into_iter()
        .filter(|c| c.ends_with(":start"))
        .collect();
    assert_eq!(
        started,
        vec!["nginx:start", "docker:start", "apps:start", "database:start", "sites:start"]
    );

    manager.stop_all().await;
    let stopped: Vec<String> = calls(&log)
        .into_iter()
        .filter(|c| c.ends_with(":stop"))
        .collect();
    assert_eq!(
        stopped,
        vec!["sites:stop", "database:stop", "apps:stop", "docker:stop", "nginx:stop"]
    );

    manager.shutdown_all().await;
    assert_eq!(count(&log, "docker:shutdown"), 1);
    let list = manager.list_modules().await;
    assert!(list.modules.iter().all(|m| m.state == ModuleState::Shutdown));
}

#[tokio::test]
async fn test_mixed_builtin_and_external_ordering() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let manager = ModuleManager::new(manager_config(&dir)).with_artifact_loader(test_loader(&log));

    manager
        .register_builtin(TestModule::new("docker", &[], &log).shared())
        .await
        .unwrap();
    let path = external(&dir, "redis", &["docker"]).await;
    manager.load_external(&path).await.unwrap();
    manager
        .register_builtin(TestModule::new("cache", &["redis"], &log).shared())
        .await
        .unwrap();

    manager.init_all().await.unwrap();
    manager.start_all().await.unwrap();

    assert_eq!(manager.order().await, vec!["docker", "redis", "cache"]);
    // 外部模块在加载时已初始化，init_all 不会再次调用
    assert_eq!(count(&log, "redis:init"), 1);
    assert_eq!(count(&log, "redis:start"), 1);
}

// ============================================================================
// 注册错误
// ============================================================================

#[tokio::test]
async fn test_duplicate_ids_rejected_across_kinds() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let manager = ModuleManager::new(manager_config(&dir)).with_artifact_loader(test_loader(&log));

    manager
        .register_builtin(TestModule::new("docker", &[], &log).shared())
        .await
        .unwrap();
    let before = manager.order().await;

    let err = manager
        .register_builtin(TestModule::new("docker", &[], &log).shared())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::DuplicateModule(_)));

    let path = external(&dir, "docker", &[]).await;
    let err = manager.load_external(&path).await.unwrap_err();
    assert!(matches!(err, CoreError::DuplicateModule(_)));

    assert_eq!(manager.list_modules().await.total, 1);
    assert_eq!(manager.order().await, before);
}

#[tokio::test]
async fn test_builtin_cycle_fails_and_keeps_order() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let manager = ModuleManager::new(manager_config(&dir));

    manager
        .register_builtin(TestModule::new("base", &[], &log).shared())
        .await
        .unwrap();
    manager
        .register_builtin(TestModule::new("a", &["b"], &log).shared())
        .await
        .unwrap();
    manager
        .register_builtin(TestModule::new("b", &["a"], &log).shared())
        .await
        .unwrap();

    let err = manager.init_all().await.unwrap_err();
    assert!(matches!(err, CoreError::CircularDependency(_)));
    assert_eq!(manager.order().await, vec!["base"]);
    assert!(calls(&log).is_empty());
}

#[tokio::test]
async fn test_init_failure_stops_batch() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let manager = ModuleManager::new(manager_config(&dir));

    manager
        .register_builtin(TestModule::new("docker", &[], &log).failing("migrate").shared())
        .await
        .unwrap();
    manager
        .register_builtin(TestModule::new("apps", &["docker"], &log).shared())
        .await
        .unwrap();

    let err = manager.init_all().await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::LifecycleHookFailure { hook: "migrate", .. }
    ));
    assert_eq!(calls(&log), vec!["docker:init", "docker:migrate"]);

    let docker = manager.get_module("docker").await.unwrap();
    assert_eq!(docker.state, ModuleState::Registered);
    assert!(docker.last_error.unwrap().contains("migrate"));
}

#[tokio::test]
async fn test_external_start_failure_is_skipped() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let failing_log = log.clone();
    let loader: Arc<dyn ArtifactLoader> = Arc::new(FnArtifactLoader::new(move |request| {
        let module: SharedModule = TestModule::new(&request.manifest.id, &[], &failing_log)
            .failing("start")
            .shared();
        Ok(module)
    }));
    let manager = ModuleManager::new(manager_config(&dir)).with_artifact_loader(loader);

    let path = external(&dir, "flaky", &[]).await;
    manager.load_external(&path).await.unwrap();
    manager
        .register_builtin(TestModule::new("docker", &[], &log).shared())
        .await
        .unwrap();

    manager.init_all().await.unwrap();
    manager.start_all().await.unwrap();

    let flaky = manager.get_module("flaky").await.unwrap();
    assert_eq!(flaky.state, ModuleState::Initialized);
    assert!(flaky.last_error.is_some());
    assert_eq!(
        manager.get_module("docker").await.unwrap().state,
        ModuleState::Started
    );
}

// ============================================================================
// 启用、禁用与卸载
// ============================================================================

#[tokio::test]
async fn test_enable_disable_enable_counts_hooks() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let mut config = manager_config(&dir);
    config.disabled.push("nginx".to_string());
    let manager = ModuleManager::new(config);

    manager
        .register_builtin(TestModule::new("nginx", &[], &log).shared())
        .await
        .unwrap();
    manager.init_all().await.unwrap();
    manager.start_all().await.unwrap();
    assert_eq!(count(&log, "nginx:start"), 0);

    manager.enable("nginx").await.unwrap();
    manager.disable("nginx").await.unwrap();
    manager.enable("nginx").await.unwrap();

    assert_eq!(count(&log, "nginx:start"), 2);
    assert_eq!(count(&log, "nginx:stop"), 1);
    assert!(manager.get_module("nginx").await.unwrap().enabled);
}

#[tokio::test]
async fn test_uninstall_rejections_leave_registry_untouched() {
    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let manager = ModuleManager::new(manager_config(&dir));
    manager
        .register_builtin(TestModule::new("docker", &[], &log).shared())
        .await
        .unwrap();
    manager.init_all().await.unwrap();
    manager.start_all().await.unwrap();
    let before = manager.list_modules().await;

    assert!(matches!(
        manager.uninstall("nowhere").await,
        Err(CoreError::ModuleNotFound(_))
    ));
    assert!(matches!(
        manager.uninstall("docker").await,
        Err(CoreError::BuiltinUninstall(_))
    ));

    let after = manager.list_modules().await;
    assert_eq!(after.total, before.total);
    assert_eq!(after.enabled, before.enabled);
    assert_eq!(count(&log, "docker:stop"), 0);
    assert_eq!(
        manager.get_module("docker").await.unwrap().state,
        ModuleState::Started
    );
}

#[tokio::test]
async fn test_unresolved_module_is_not_aggregated() {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use panel_core::MenuItem;
    use tower::ServiceExt;

    let dir = TempDir::new().unwrap();
    let log = CallLog::default();
    let manager = ModuleManager::new(manager_config(&dir));
    manager
        .register_builtin(
            TestModule::new("docker", &[], &log)
                .with_menu(MenuItem::new("docker", "容器", "/docker", 20))
                .shared(),
        )
        .await
        .unwrap();
    // 依赖缺失，注册成功但无法进入 Order
    manager
        .register_builtin(
            TestModule::new("sites", &["nginx"], &log)
                .with_route("/sites")
                .with_menu(MenuItem::new("sites", "网站", "/sites", 10))
                .shared(),
        )
        .await
        .unwrap();
    assert_eq!(manager.order().await, vec!["docker".to_string()]);

    let menus = manager.collect_menus().await;
    assert_eq!(menus.len(), 1);
    assert_eq!(menus[0].path, "/docker");

    let response = manager
        .mount_routes("/api/v1")
        .await
        .oneshot(Request::builder().uri("/api/v1/sites").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_uninstall_keeps_plugin_root_and_siblings() {
    let dir = TempDir::new().unwrap();
    let manager = ModuleManager::new(manager_config(&dir));
    let plugins = dir.path().join("plugins");

    // 清单直接放在插件根目录下
    tokio::fs::create_dir_all(&plugins).await.unwrap();
    tokio::fs::write(
        plugins.join("manifest.json"),
        json!({ "id": "rooted", "name": "Rooted", "version": "1.0.0" }).to_string(),
    )
    .await
    .unwrap();
    let sibling = write_manifest(
        &plugins,
        json!({ "id": "other", "name": "Other", "version": "1.0.0" }),
    )
    .await;

    manager.load_external(&plugins).await.unwrap();
    manager.uninstall("rooted").await.unwrap();

    assert!(manager.get_module("rooted").await.is_err());
    assert!(!dir.path().join("data/rooted").exists());
    assert!(plugins.is_dir());
    assert!(sibling.join("manifest.json").is_file());
}

#[tokio::test]
async fn test_uninstall_keeps_sources_reached_through_parent_dir() {
    let dir = TempDir::new().unwrap();
    let manager = ModuleManager::new(manager_config(&dir));
    tokio::fs::create_dir_all(dir.path().join("plugins")).await.unwrap();
    let shared = write_manifest(
        &dir.path().join("shared"),
        json!({ "id": "ext", "name": "Ext", "version": "1.0.0" }),
    )
    .await;

    // 路径字面上以插件根目录开头，实际位于其外
    let dotted = dir.path().join("plugins").join("..").join("shared").join("ext");
    manager.load_external(&dotted).await.unwrap();
    manager.uninstall("ext").await.unwrap();

    assert!(manager.get_module("ext").await.is_err());
    assert!(shared.join("manifest.json").is_file());
}

#[tokio::test]
async fn test_uninstall_finishes_cleanup_after_failure() {
    let dir = TempDir::new().unwrap();
    let manager = ModuleManager::new(manager_config(&dir));
    let module_dir = write_manifest(
        &dir.path().join("plugins"),
        json!({ "id": "stale", "name": "Stale", "version": "1.0.0" }),
    )
    .await;
    manager.load_external(&module_dir).await.unwrap();
    manager
        .settings_store()
        .set("stale.retention", "7")
        .await
        .unwrap();

    // 配置目录被普通文件占据，删除目录必然失败
    let config_dir = dir.path().join("data/.config/stale");
    tokio::fs::remove_dir_all(&config_dir).await.unwrap();
    tokio::fs::write(&config_dir, "not a directory").await.unwrap();

    let err = manager.uninstall("stale").await.unwrap_err();
    assert!(matches!(err, CoreError::Io(_)), "unexpected error: {err}");

    // 其余清理步骤照常完成
    assert!(manager.get_module("stale").await.is_err());
    assert!(!dir.path().join("data/stale").exists());
    assert!(!module_dir.exists());
    assert!(manager
        .settings_store()
        .list_prefix("stale.")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_hooks_see_registry_busy() {
    use async_trait::async_trait;
    use panel_core::{Module, ModuleContext, ModuleDescriptor, Result};
    use std::sync::Mutex;

    struct BusyCheck {
        descriptor: ModuleDescriptor,
        seen: Arc<Mutex<Option<bool>>>,
    }

    #[async_trait]
    impl Module for BusyCheck {
        fn descriptor(&self) -> &ModuleDescriptor {
            &self.descriptor
        }
        async fn init(&self, ctx: &ModuleContext) -> Result<()> {
            let busy = matches!(ctx.registry.try_list(), Err(CoreError::RegistryBusy));
            *self.seen.lock().unwrap() = Some(busy);
            Ok(())
        }
        async fn start(&self) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
    }

    let dir = TempDir::new().unwrap();
    let manager = ModuleManager::new(manager_config(&dir));
    let seen = Arc::new(Mutex::new(None));
    manager
        .register_builtin(Arc::new(BusyCheck {
            descriptor: ModuleDescriptor::new("watcher", "watcher", "1.0.0"),
            seen: seen.clone(),
        }))
        .await
        .unwrap();

    manager.init_all().await.unwrap();
    assert_eq!(*seen.lock().unwrap(), Some(true));
    // 钩子之外可以正常查询
    assert_eq!(manager.registry_handle().try_list().unwrap().len(), 1);
}
