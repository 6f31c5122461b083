//! 工作进程产物加载器
//!
//! 外部模块的入口是一个可执行文件。宿主以管道方式启动它，先握手，
//! 再把生命周期钩子、界面查询和 HTTP 请求转发给它。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    methods, BridgeHandler, HandshakeParams, HandshakeReply, InitParams, ProxyRequest,
    ProxyResponse, PROTOCOL,
};
use crate::api::ipc::IpcPeer;
use crate::module::capability::{Module, ModuleContext, SharedModule};
use crate::module::loader::{ArtifactLoader, ArtifactRequest};
use crate::module::manifest::ExternalManifest;
use crate::module::metadata::{FrontendRoute, MenuItem, ModuleDescriptor, SettingField};
use crate::utils::{error_code, CoreError, Result};

/// 关闭时等待工作进程退出的时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// 工作进程产物加载器
#[derive(Debug, Clone)]
pub struct ProcessArtifactLoader {
    handshake_timeout: Duration,
}

impl ProcessArtifactLoader {
    /// 创建加载器
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }
}

impl Default for ProcessArtifactLoader {
    fn default() -> Self {
        Self::new(Duration::from_millis(5000))
    }
}

#[async_trait]
impl ArtifactLoader for ProcessArtifactLoader {
    async fn load(&self, request: ArtifactRequest<'_>) -> Result<SharedModule> {
        let module_id = request.manifest.id.clone();
        let load_failure = |reason: String| CoreError::ArtifactLoadFailure {
            module_id: module_id.clone(),
            reason,
        };

        let mut child = Command::new(&request.entry_point)
            .current_dir(request.module_dir)
            .env("PANEL_MODULE_ID", &module_id)
            .env("PANEL_MODULE_DATA_DIR", request.bridge.data_dir())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| load_failure(format!("启动 {} 失败: {}", request.entry_point.display(), e)))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(load_failure("无法获取工作进程标准输入输出".to_string()));
        };

        let peer = IpcPeer::new(stdin);
        peer.start(stdout, Arc::new(BridgeHandler::new(request.bridge.clone())));

        let params = serde_json::to_value(HandshakeParams {
            protocol: PROTOCOL.to_string(),
            module_id: module_id.clone(),
            host_version: request.host.version.clone(),
        })?;
        let reply = match peer
            .call_with_timeout(methods::HANDSHAKE, params, self.handshake_timeout)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                let _ = child.kill().await;
                return Err(load_failure(format!("握手失败: {}", e)));
            }
        };

        let checked = serde_json::from_value::<HandshakeReply>(reply)
            .map_err(|e| format!("握手应答无法解析: {}", e))
            .and_then(|reply| reply.check());
        if let Err(reason) = checked {
            let _ = child.kill().await;
            return Err(CoreError::CapabilitySymbolMismatch { module_id, reason });
        }

        info!(module_id = %module_id, pid = ?child.id(), "工作进程握手完成");
        Ok(Arc::new(ProcessModule {
            descriptor: request.manifest.descriptor(),
            manifest: request.manifest.clone(),
            peer,
            child: Mutex::new(Some(child)),
        }))
    }
}

/// 运行在工作进程中的模块
pub struct ProcessModule {
    descriptor: ModuleDescriptor,
    manifest: ExternalManifest,
    peer: IpcPeer,
    child: Mutex<Option<Child>>,
}

impl ProcessModule {
    /// 工作进程是否仍然连接
    pub fn is_alive(&self) -> bool {
        !self.peer.is_closed()
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.peer.call(method, params).await
    }
}

#[async_trait]
impl Module for ProcessModule {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn init(&self, ctx: &ModuleContext) -> Result<()> {
        let params = serde_json::to_value(InitParams {
            module_id: ctx.module_id.clone(),
            data_dir: ctx.data_dir.clone(),
            config_dir: ctx.config_dir.clone(),
        })?;
        self.call(methods::INIT, params).await.map(|_| ())
    }

    async fn migrate(&self, _ctx: &ModuleContext) -> Result<()> {
        self.call(methods::MIGRATE, json!({})).await.map(|_| ())
    }

    async fn start(&self) -> Result<()> {
        self.call(methods::START, json!({})).await.map(|_| ())
    }

    async fn stop(&self) -> Result<()> {
        self.call(methods::STOP, json!({})).await.map(|_| ())
    }

    /// 通知工作进程退出，超时则强制结束
    async fn shutdown(&self) -> Result<()> {
        if self.is_alive() {
            if let Err(e) = self
                .peer
                .call_with_timeout(methods::SHUTDOWN, json!({}), SHUTDOWN_GRACE)
                .await
            {
                debug!(module_id = %self.descriptor.id, error = %e, "工作进程未确认关闭");
            }
        }

        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(module_id = %self.descriptor.id, %status, "工作进程已退出")
                }
                _ => {
                    warn!(module_id = %self.descriptor.id, "工作进程未按时退出，强制结束");
                    child.kill().await?;
                }
            }
        }
        Ok(())
    }

    fn routes(&self) -> Option<Router> {
        let router = Router::new()
            .route("/", any(proxy_http))
            .route("/*path", any(proxy_http))
            .with_state(self.peer.clone());
        Some(router)
    }

    async fn menus(&self) -> Vec<MenuItem> {
        match self.call(methods::MENUS, json!({})).await {
            Ok(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                warn!(module_id = %self.descriptor.id, error = %e, "菜单应答无法解析，使用清单声明");
                self.manifest.menus.clone()
            }),
            Err(_) => self.manifest.menus.clone(),
        }
    }

    async fn frontend_routes(&self) -> Vec<FrontendRoute> {
        match self.call(methods::FRONTEND_ROUTES, json!({})).await {
            Ok(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                warn!(module_id = %self.descriptor.id, error = %e, "前端路由应答无法解析，使用清单声明");
                self.manifest.routes.clone()
            }),
            Err(_) => self.manifest.routes.clone(),
        }
    }

    fn settings_schema(&self) -> Vec<SettingField> {
        self.manifest.settings.clone()
    }
}

/// 把 HTTP 请求转发给工作进程
async fn proxy_http(
    State(peer): State<IpcPeer>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = ProxyRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        headers: headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect(),
        body: String::from_utf8_lossy(&body).into_owned(),
    };

    let reply = match serde_json::to_value(&request) {
        Ok(params) => peer.call(methods::HTTP, params).await,
        Err(e) => Err(e.into()),
    };

    let response = reply.and_then(|value| Ok(serde_json::from_value::<ProxyResponse>(value)?));
    match response {
        Ok(proxied) => into_response(proxied),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "code": error_code::IPC_FAILED, "message": e.to_string() })),
        )
            .into_response(),
    }
}

fn into_response(proxied: ProxyResponse) -> Response {
    let status = StatusCode::from_u16(proxied.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = match proxied.body {
        Value::String(text) => (status, text).into_response(),
        other => (status, Json(other)).into_response(),
    };
    for (name, value) in proxied.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}
