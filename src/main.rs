//! Panel Core 命令行入口
//!
//! 面板内核的命令行工具，提供启动与检查功能。
//!
//! # 命令概览
//!
//! - `start` - 启动内核（默认）
//! - `version` - 显示版本信息
//! - `check-config` - 验证配置文件
//! - `check-manifest` - 验证外部模块清单
//!
//! # 使用示例
//!
//! ```bash
//! # 启动内核
//! panel-core start
//!
//! # 使用自定义配置文件启动
//! panel-core -c my-config.yaml start
//!
//! # 检查插件清单
//! panel-core check-manifest ./plugins/backup
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use axum::routing::get;
use axum::{Json, Router};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;

use panel_core::module::ManifestLoader;
use panel_core::{
    CoreConfig, HostInfo, Logger, LoggerConfig, MenuItem, Module, ModuleContext,
    ModuleDescriptor, PanelCore,
};

/// Panel Core - 服务器面板插件内核
#[derive(Parser)]
#[command(name = "panel-core")]
#[command(version, about = "服务器面板插件内核", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// 日志级别 (trace, debug, info, warn, error)，覆盖配置文件
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// 开发模式（显示文件名与行号）
    #[arg(long, global = true)]
    dev: bool,

    /// 子命令
    #[command(subcommand)]
    command: Option<Commands>,
}

/// 可用的子命令
#[derive(Subcommand)]
enum Commands {
    /// 启动内核
    ///
    /// 注册内置模块、加载插件目录中的外部模块并对外提供 HTTP 服务。
    /// 按 Ctrl+C 可优雅关闭。
    Start,

    /// 查看版本信息
    Version,

    /// 验证配置文件
    CheckConfig {
        /// 配置文件路径（不指定则使用全局 -c 选项）
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// 验证外部模块清单
    CheckManifest {
        /// 模块目录或 manifest.json 路径
        path: PathBuf,
    },
}

// ============================================================================
// 内置系统模块
// ============================================================================

/// 系统信息模块，随宿主一起编译
struct SystemModule {
    descriptor: ModuleDescriptor,
}

impl SystemModule {
    fn new() -> Self {
        Self {
            descriptor: ModuleDescriptor::new("system", "系统", panel_core::VERSION)
                .with_description("宿主系统信息"),
        }
    }
}

#[async_trait]
impl Module for SystemModule {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn init(&self, ctx: &ModuleContext) -> panel_core::Result<()> {
        info!(data_dir = %ctx.data_dir.display(), "系统模块初始化");
        Ok(())
    }

    async fn start(&self) -> panel_core::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> panel_core::Result<()> {
        Ok(())
    }

    fn routes(&self) -> Option<Router> {
        Some(Router::new().route(
            "/system/info",
            get(|| async {
                Json(serde_json::json!({
                    "version": panel_core::VERSION,
                    "os": std::env::consts::OS,
                    "arch": std::env::consts::ARCH,
                }))
            }),
        ))
    }

    async fn menus(&self) -> Vec<MenuItem> {
        vec![MenuItem::new("system", "系统", "/system", 0).with_icon("settings")]
    }
}

// ============================================================================
// 命令实现
// ============================================================================

/// 加载配置，文件不存在时使用默认配置
async fn load_config(path: &Path) -> Result<CoreConfig, Box<dyn std::error::Error>> {
    if path.exists() {
        Ok(CoreConfig::from_file(path).await?)
    } else {
        Ok(CoreConfig::default())
    }
}

/// 启动内核
async fn run_start(config: CoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut logger_config = LoggerConfig::from_log_config(&config.logging);
    logger_config.show_file_line = config.dev_mode;
    let _guard = Logger::init(logger_config)?;

    let mut core = PanelCore::new(config).await?;
    core.register_builtin(Arc::new(SystemModule::new())).await?;
    core.start().await?;

    let modules = core.manager().list_modules().await;
    println!();
    println!("面板内核已启动");
    println!("═══════════════════════════════════════");
    println!("  版本:     {}", panel_core::VERSION);
    println!("  地址:     http://{}{}", core.config().server.bind, core.config().server.api_prefix);
    println!("  模块:     {} 个（内置 {}，外部 {}）", modules.total, modules.builtin, modules.external);
    println!();
    println!("  按 Ctrl+C 优雅关闭");
    println!("═══════════════════════════════════════");
    println!();

    let served = core
        .serve(async {
            let _ = signal::ctrl_c().await;
        })
        .await;

    info!("收到关闭信号，正在优雅关闭...");
    core.shutdown().await?;
    served?;
    Ok(())
}

/// 检查配置文件
async fn check_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("检查配置文件: {}", path.display());
    println!();

    if !path.exists() {
        println!("⚠️  警告: 配置文件不存在，将使用默认配置");
        println!();
        print_config(&CoreConfig::default());
        return Ok(());
    }

    match CoreConfig::from_file(path).await {
        Ok(config) => {
            println!("✅ 配置文件有效！");
            println!();
            print_config(&config);
            Ok(())
        }
        Err(e) => {
            println!("❌ 配置文件无效: {}", e);
            Err(Box::new(e))
        }
    }
}

fn print_config(config: &CoreConfig) {
    println!("配置内容:");
    println!("────────────────────────────────────────");
    println!("  [宿主]");
    println!("    名称:           {}", config.host.name);
    println!("    版本:           {}", config.host.version);
    println!();
    println!("  [服务]");
    println!("    监听地址:       {}", config.server.bind);
    println!("    接口前缀:       {}", config.server.api_prefix);
    println!();
    println!("  [日志配置]");
    println!("    日志级别:       {}", config.logging.level);
    println!("    JSON 格式:      {}", if config.logging.json_format { "是" } else { "否" });
    if let Some(ref dir) = config.logging.log_dir {
        println!("    日志目录:       {} ({})", dir.display(), config.logging.rotation);
    }
    println!();
    println!("  [模块配置]");
    println!("    数据目录:       {}", config.modules.data_dir.display());
    println!("    插件目录:       {}", config.modules.plugin_dir.display());
    println!("    默认禁用:       {:?}", config.modules.disabled);
    println!("    握手超时:       {} ms", config.modules.handshake_timeout_ms);
    println!();
    println!("  [其他]");
    println!("    开发模式:       {}", if config.dev_mode { "是" } else { "否" });
    println!("────────────────────────────────────────");
}

/// 检查外部模块清单
async fn check_manifest(path: &Path, host: &HostInfo) -> Result<(), Box<dyn std::error::Error>> {
    println!("检查模块清单: {}", path.display());
    println!();

    let (module_dir, manifest) = match ManifestLoader::parse_file(path).await {
        Ok(parsed) => parsed,
        Err(e) => {
            println!("❌ 清单无效: {}", e);
            return Err(Box::new(e));
        }
    };

    println!("  ID:             {}", manifest.id);
    println!("  名称:           {}", manifest.name);
    println!("  版本:           {}", manifest.version);
    println!("  依赖:           {:?}", manifest.dependencies);
    println!("  权限:           {:?}", manifest.permissions);
    match manifest.entry_point_path(&module_dir) {
        Some(entry) if entry.exists() => println!("  入口:           {}", entry.display()),
        Some(entry) => println!("  入口:           {} (⚠️ 文件不存在)", entry.display()),
        None => println!("  入口:           无（仅界面声明）"),
    }
    println!();

    match ManifestLoader::check_version(&manifest, &host.version) {
        Ok(()) => {
            println!("✅ 清单有效，与内核版本 {} 兼容", host.version);
            Ok(())
        }
        Err(e) => {
            println!("❌ {}", e);
            Err(Box::new(e))
        }
    }
}

/// 打印版本信息
fn print_version() {
    println!();
    println!("Panel Core - 服务器面板插件内核");
    println!("═══════════════════════════════════════");
    println!("  版本:             {}", panel_core::VERSION);
    println!("  工作进程协议:     {}", panel_core::PROTOCOL);
    println!();
    println!("构建信息:");
    println!("  目标平台:         {}", std::env::consts::ARCH);
    println!("  操作系统:         {}", std::env::consts::OS);
    println!("═══════════════════════════════════════");
    println!();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => {
            let mut config = load_config(&cli.config).await?;
            if let Some(level) = cli.log_level {
                config.logging.level = level;
            }
            config.dev_mode |= cli.dev;
            run_start(config).await
        }
        Commands::Version => {
            print_version();
            Ok(())
        }
        Commands::CheckConfig { config } => {
            check_config(config.as_deref().unwrap_or(&cli.config)).await
        }
        Commands::CheckManifest { path } => {
            let config = load_config(&cli.config).await?;
            check_manifest(&path, &config.host).await
        }
    }
}
