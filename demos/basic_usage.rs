//! 基本使用示例
//!
//! 本示例展示了面板内核的基本使用方法，包括：
//!
//! - 注册带依赖的内置模块
//! - 启动内核并查看启动顺序
//! - 聚合菜单、读写模块设置
//! - 禁用模块与优雅关闭
//!
//! # 运行示例
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use panel_core::{
    CoreConfig, MenuItem, Module, ModuleContext, ModuleDescriptor, PanelCore, Result, SettingField,
    SettingType,
};

/// 演示用模块，只打印生命周期事件
struct DemoModule {
    descriptor: ModuleDescriptor,
    menu_order: i32,
}

impl DemoModule {
    fn new(id: &str, name: &str, deps: &[&str], menu_order: i32) -> Arc<Self> {
        let mut descriptor = ModuleDescriptor::new(id, name, "1.0.0");
        descriptor.dependencies = deps.iter().map(|d| d.to_string()).collect();
        Arc::new(Self {
            descriptor,
            menu_order,
        })
    }
}

#[async_trait]
impl Module for DemoModule {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn init(&self, ctx: &ModuleContext) -> Result<()> {
        println!("  [init]  {:<10} 数据目录 {}", self.descriptor.id, ctx.data_dir.display());
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        println!("  [start] {}", self.descriptor.id);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        println!("  [stop]  {}", self.descriptor.id);
        Ok(())
    }

    async fn menus(&self) -> Vec<MenuItem> {
        vec![MenuItem::new(
            self.descriptor.id.as_str(),
            self.descriptor.name.as_str(),
            format!("/{}", self.descriptor.id),
            self.menu_order,
        )]
    }

    fn settings_schema(&self) -> Vec<SettingField> {
        if self.descriptor.id == "nginx" {
            vec![SettingField::new("worker_processes", "工作进程数", SettingType::Number)
                .with_default("auto")]
        } else {
            vec![]
        }
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    println!("=== 面板内核基本使用示例 ===\n");

    let workspace = tempfile::tempdir()?;
    let config = CoreConfig::builder()
        .data_dir(workspace.path().join("data"))
        .plugin_dir(workspace.path().join("plugins"))
        .build();

    // 1. 创建内核并注册内置模块（注册顺序与依赖顺序无关）
    println!("1. 注册内置模块");
    let mut core = PanelCore::new(config).await?;
    core.register_builtin(DemoModule::new("sites", "网站", &["nginx", "database"], 10)).await?;
    core.register_builtin(DemoModule::new("nginx", "Nginx", &[], 30)).await?;
    core.register_builtin(DemoModule::new("database", "数据库", &["docker"], 20)).await?;
    core.register_builtin(DemoModule::new("docker", "容器", &[], 40)).await?;

    // 2. 启动
    println!("\n2. 启动内核");
    core.start().await?;
    println!("  启动顺序: {:?}", core.manager().order().await);

    // 3. 菜单聚合
    println!("\n3. 聚合菜单");
    for menu in core.manager().collect_menus().await {
        println!("  {:>3}  {:<8} {}", menu.order, menu.title, menu.path);
    }

    // 4. 模块设置
    println!("\n4. 模块设置");
    let settings = core.manager().get_settings("nginx").await?;
    println!("  默认值: {:?}", settings.values);
    let update = [("worker_processes".to_string(), "abc".to_string())].into();
    match core.manager().update_settings("nginx", update).await {
        Ok(_) => println!("  意外地接受了非法值"),
        Err(e) => println!("  非法值被拒绝: {}", e),
    }
    let update = [("worker_processes".to_string(), "4".to_string())].into();
    let settings = core.manager().update_settings("nginx", update).await?;
    println!("  更新后: {:?}", settings.values);

    // 5. 禁用模块
    println!("\n5. 禁用 sites");
    core.manager().disable("sites").await?;
    let list = core.manager().list_modules().await;
    println!("  共 {} 个模块，启用 {} 个", list.total, list.enabled);

    // 6. 健康状态与关闭
    let health = core.health().await;
    println!("\n6. 健康状态: {:?}，运行 {} 秒", health.state, health.uptime_secs);

    println!("\n7. 关闭内核");
    core.shutdown().await?;
    println!("  内核状态: {:?}", core.state().await);

    println!("\n=== 示例完成 ===");
    Ok(())
}
