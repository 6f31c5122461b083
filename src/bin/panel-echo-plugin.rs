//! 回显插件
//!
//! 最小的外部模块工作进程，用于演示与端到端测试。
//! 工作目录（模块目录）中的标记文件可以改变它的行为：
//!
//! - `no-lifecycle`：握手时不声明 `lifecycle` 能力
//! - `fail-init`：`init` 返回错误
//!
//! HTTP 路由（挂载在 `<prefix>/ext/<id>` 下）：
//!
//! - `GET /echo`：回显请求
//! - `GET /files`：列出数据目录
//! - `GET|PUT|DELETE /files/<path>`：读写数据目录中的文件
//! - `GET|PUT /settings/<key>`：读写模块设置
//! - `POST /notify`：发送通知

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::info;

use panel_core::api::plugin::{serve_plugin, PluginModule, RemoteCapabilities};
use panel_core::module::bridge::{CapabilityApi, NotificationLevel};
use panel_core::module::runtime::{InitParams, ProxyRequest, ProxyResponse, LIFECYCLE_CAPABILITY};
use panel_core::utils::{CoreError, Result};
use panel_core::{FrontendRoute, Logger, LoggerConfig, MenuItem};

#[derive(Default)]
struct EchoPlugin {
    module_id: OnceCell<String>,
    starts: AtomicUsize,
}

impl EchoPlugin {
    fn id(&self) -> &str {
        self.module_id.get().map(String::as_str).unwrap_or("echo")
    }

    async fn route(&self, host: &RemoteCapabilities, request: ProxyRequest) -> Result<ProxyResponse> {
        let path = request.path.trim_start_matches('/');
        let (head, rest) = path.split_once('/').unwrap_or((path, ""));

        let response = match (request.method.as_str(), head) {
            ("GET", "echo") => reply(
                200,
                json!({
                    "module_id": self.id(),
                    "method": request.method,
                    "path": request.path,
                    "query": request.query,
                    "body": request.body,
                    "starts": self.starts.load(Ordering::SeqCst),
                }),
            ),
            ("GET", "files") if rest.is_empty() => reply(200, json!(host.list_files("").await?)),
            ("GET", "files") => {
                let data = host.read_file(rest).await?;
                reply(200, json!(String::from_utf8_lossy(&data)))
            }
            ("PUT", "files") => {
                host.write_file(rest, request.body.as_bytes()).await?;
                reply(200, json!({ "written": rest }))
            }
            ("DELETE", "files") => {
                host.delete_file(rest).await?;
                reply(200, json!({ "deleted": rest }))
            }
            ("GET", "settings") => reply(200, json!({ "value": host.get_setting(rest).await? })),
            ("PUT", "settings") => {
                host.set_setting(rest, &request.body).await?;
                reply(200, json!({ "key": rest }))
            }
            ("POST", "notify") => {
                host.notify(NotificationLevel::Info, "回显", &request.body).await?;
                reply(202, json!({ "queued": true }))
            }
            _ => reply(404, json!({ "message": format!("未找到路由: {}", request.path) })),
        };
        Ok(response)
    }
}

fn reply(status: u16, body: serde_json::Value) -> ProxyResponse {
    ProxyResponse {
        status,
        headers: Default::default(),
        body,
    }
}

#[async_trait]
impl PluginModule for EchoPlugin {
    fn capabilities(&self) -> Vec<String> {
        if Path::new("no-lifecycle").exists() {
            vec!["http".to_string()]
        } else {
            vec![LIFECYCLE_CAPABILITY.to_string(), "http".to_string()]
        }
    }

    async fn init(&self, host: &RemoteCapabilities, params: InitParams) -> Result<()> {
        if Path::new("fail-init").exists() {
            return Err(CoreError::InitFailed("fail-init 标记存在".to_string()));
        }
        info!(module_id = %params.module_id, data_dir = %params.data_dir.display(), "初始化");
        let _ = self.module_id.set(params.module_id);
        if host.get_setting("greeting").await?.is_none() {
            host.set_setting("greeting", "hello").await?;
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let starts = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
        info!(module_id = %self.id(), starts, "启动");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        info!(module_id = %self.id(), "停止");
        Ok(())
    }

    async fn menus(&self) -> Vec<MenuItem> {
        vec![MenuItem::new(self.id(), "回显", format!("/{}", self.id()), 50)]
    }

    async fn frontend_routes(&self) -> Vec<FrontendRoute> {
        vec![FrontendRoute::new(format!("/{}", self.id()), "EchoView", 50)]
    }

    async fn handle_http(&self, host: &RemoteCapabilities, request: ProxyRequest) -> Result<ProxyResponse> {
        // 能力调用失败时返回 400，而不是让宿主报 502
        Ok(self
            .route(host, request)
            .await
            .unwrap_or_else(|e| reply(400, json!({ "message": e.to_string() }))))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 标准输出是 IPC 通道，日志只能写到标准错误
    let _guard = Logger::try_init(
        LoggerConfig::builder()
            .level(std::env::var("PANEL_PLUGIN_LOG").unwrap_or_else(|_| "warn".to_string()))
            .console_stderr(true)
            .ansi_colors(false)
            .build(),
    );

    serve_plugin(EchoPlugin::default()).await
}
