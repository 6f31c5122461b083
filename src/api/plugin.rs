//! 工作进程 SDK
//!
//! 外部模块作者实现 [`PluginModule`]，在 `main` 中调用 [`serve_plugin`]，
//! 即可作为工作进程被宿主加载。标准输出是 IPC 通道，日志必须写到标准错误。
//!
//! # 示例
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use panel_core::api::plugin::{serve_plugin, PluginModule, RemoteCapabilities};
//! use panel_core::module::runtime::InitParams;
//! use panel_core::utils::Result;
//!
//! struct Hello;
//!
//! #[async_trait]
//! impl PluginModule for Hello {
//!     async fn init(&self, _host: &RemoteCapabilities, _params: InitParams) -> Result<()> {
//!         Ok(())
//!     }
//!     async fn start(&self) -> Result<()> {
//!         Ok(())
//!     }
//!     async fn stop(&self) -> Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     serve_plugin(Hello).await
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, info};

use super::ipc::{IpcHandler, IpcPeer};
use crate::module::bridge::{CapabilityApi, HttpResponse, NotificationLevel};
use crate::module::metadata::{FrontendRoute, MenuItem};
use crate::module::runtime::{
    methods, FileParams, HandshakeParams, HandshakeReply, HttpGetParams, InitParams,
    NotifyParams, ProxyRequest, ProxyResponse, SettingParams, LIFECYCLE_CAPABILITY, PROTOCOL,
};
use crate::utils::{CoreError, Result};

/// 确认关闭后留给响应写出的时间
const EXIT_GRACE: Duration = Duration::from_millis(50);

/// 工作进程模块接口
#[async_trait]
pub trait PluginModule: Send + Sync + 'static {
    /// 握手时声明的能力，必须包含 `lifecycle`
    fn capabilities(&self) -> Vec<String> {
        vec![LIFECYCLE_CAPABILITY.to_string()]
    }

    /// 初始化
    async fn init(&self, host: &RemoteCapabilities, params: InitParams) -> Result<()>;

    /// 数据迁移
    async fn migrate(&self, _host: &RemoteCapabilities) -> Result<()> {
        Ok(())
    }

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// 进程退出前调用
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn menus(&self) -> Vec<MenuItem> {
        vec![]
    }

    async fn frontend_routes(&self) -> Vec<FrontendRoute> {
        vec![]
    }

    /// 处理宿主转发的 HTTP 请求
    async fn handle_http(&self, _host: &RemoteCapabilities, request: ProxyRequest) -> Result<ProxyResponse> {
        Ok(ProxyResponse {
            status: 404,
            headers: Default::default(),
            body: json!({ "message": format!("未找到路由: {} {}", request.method, request.path) }),
        })
    }
}

// ============================================================================
// 宿主能力代理
// ============================================================================

/// 通过 IPC 调用宿主能力
#[derive(Clone)]
pub struct RemoteCapabilities {
    peer: IpcPeer,
}

impl RemoteCapabilities {
    pub fn new(peer: IpcPeer) -> Self {
        Self { peer }
    }

    async fn call<T: serde::de::DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let value = self.peer.call(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn call_unit(&self, method: &str, params: Value) -> Result<()> {
        self.peer.call(method, params).await.map(|_| ())
    }
}

#[async_trait]
impl CapabilityApi for RemoteCapabilities {
    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let params = serde_json::to_value(SettingParams {
            key: key.to_string(),
            value: None,
        })?;
        self.call(methods::SETTINGS_GET, params).await
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let params = serde_json::to_value(SettingParams {
            key: key.to_string(),
            value: Some(value.to_string()),
        })?;
        self.call_unit(methods::SETTINGS_SET, params).await
    }

    async fn delete_setting(&self, key: &str) -> Result<()> {
        let params = serde_json::to_value(SettingParams {
            key: key.to_string(),
            value: None,
        })?;
        self.call_unit(methods::SETTINGS_DELETE, params).await
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let params = serde_json::to_value(FileParams {
            path: path.to_string(),
            data: None,
        })?;
        self.call(methods::FILES_READ, params).await
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let params = serde_json::to_value(FileParams {
            path: path.to_string(),
            data: Some(data.to_vec()),
        })?;
        self.call_unit(methods::FILES_WRITE, params).await
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        let params = serde_json::to_value(FileParams {
            path: path.to_string(),
            data: None,
        })?;
        self.call_unit(methods::FILES_DELETE, params).await
    }

    async fn list_files(&self, dir: &str) -> Result<Vec<String>> {
        let params = serde_json::to_value(FileParams {
            path: dir.to_string(),
            data: None,
        })?;
        self.call(methods::FILES_LIST, params).await
    }

    async fn http_get(&self, url: &str, headers: &HashMap<String, String>) -> Result<HttpResponse> {
        let params = serde_json::to_value(HttpGetParams {
            url: url.to_string(),
            headers: headers.clone(),
        })?;
        self.call(methods::HTTP_GET, params).await
    }

    async fn notify(&self, level: NotificationLevel, title: &str, message: &str) -> Result<()> {
        let params = serde_json::to_value(NotifyParams {
            level,
            title: title.to_string(),
            message: message.to_string(),
        })?;
        self.call_unit(methods::NOTIFY, params).await
    }
}

// ============================================================================
// 宿主请求分发
// ============================================================================

struct PluginHandler<P> {
    plugin: Arc<P>,
    host: RemoteCapabilities,
    exit: watch::Sender<bool>,
}

#[async_trait]
impl<P: PluginModule> IpcHandler for PluginHandler<P> {
    async fn handle(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            methods::HANDSHAKE => {
                let hello: HandshakeParams = serde_json::from_value(params)?;
                if hello.protocol != PROTOCOL {
                    return Err(CoreError::Ipc(format!(
                        "不支持的协议版本 '{}'",
                        hello.protocol
                    )));
                }
                debug!(module_id = %hello.module_id, host_version = %hello.host_version, "握手");
                Ok(serde_json::to_value(HandshakeReply {
                    protocol: PROTOCOL.to_string(),
                    capabilities: self.plugin.capabilities(),
                })?)
            }
            methods::INIT => {
                let params: InitParams = serde_json::from_value(params)?;
                self.plugin.init(&self.host, params).await?;
                Ok(Value::Null)
            }
            methods::MIGRATE => {
                self.plugin.migrate(&self.host).await?;
                Ok(Value::Null)
            }
            methods::START => {
                self.plugin.start().await?;
                Ok(Value::Null)
            }
            methods::STOP => {
                self.plugin.stop().await?;
                Ok(Value::Null)
            }
            methods::SHUTDOWN => {
                let result = self.plugin.shutdown().await;
                self.exit.send_replace(true);
                result.map(|_| Value::Null)
            }
            methods::MENUS => Ok(serde_json::to_value(self.plugin.menus().await)?),
            methods::FRONTEND_ROUTES => Ok(serde_json::to_value(self.plugin.frontend_routes().await)?),
            methods::HTTP => {
                let request: ProxyRequest = serde_json::from_value(params)?;
                Ok(serde_json::to_value(self.plugin.handle_http(&self.host, request).await?)?)
            }
            other => Err(CoreError::NotImplemented(format!("未知方法: {}", other))),
        }
    }
}

/// 在标准输入输出上运行工作进程
///
/// 宿主发出 `shutdown` 或关闭管道后返回。
pub async fn serve_plugin<P: PluginModule>(plugin: P) -> Result<()> {
    serve_plugin_on(plugin, tokio::io::stdin(), tokio::io::stdout()).await
}

/// 在给定的读写端上运行工作进程
pub async fn serve_plugin_on<P, R, W>(plugin: P, reader: R, writer: W) -> Result<()>
where
    P: PluginModule,
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + 'static,
{
    let peer = IpcPeer::new(writer);
    let (exit, mut exit_rx) = watch::channel(false);
    let handler = PluginHandler {
        plugin: Arc::new(plugin),
        host: RemoteCapabilities::new(peer.clone()),
        exit,
    };
    let reader_task = peer.start(reader, Arc::new(handler));

    tokio::select! {
        _ = async {
            let _ = exit_rx.wait_for(|exit| *exit).await;
        } => {
            info!("收到关闭请求，工作进程退出");
            tokio::time::sleep(EXIT_GRACE).await;
        }
        _ = peer.closed() => {
            info!("宿主已断开连接");
        }
    }
    reader_task.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ipc::RejectAll;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        starts: AtomicUsize,
    }

    #[async_trait]
    impl PluginModule for Arc<Counter> {
        async fn init(&self, host: &RemoteCapabilities, _params: InitParams) -> Result<()> {
            host.set_setting("ready", "yes").await
        }
        async fn start(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
    }

    struct RecordSettings(std::sync::Mutex<Vec<String>>);

    #[async_trait]
    impl IpcHandler for Arc<RecordSettings> {
        async fn handle(&self, method: &str, params: Value) -> Result<Value> {
            self.0.lock().unwrap().push(format!("{} {}", method, params["key"]));
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn test_plugin_lifecycle_over_duplex() {
        let (host_io, plugin_io) = tokio::io::duplex(64 * 1024);
        let (plugin_read, plugin_write) = tokio::io::split(plugin_io);
        let (host_read, host_write) = tokio::io::split(host_io);

        let counter = Arc::new(Counter::default());
        let server = tokio::spawn(serve_plugin_on(counter.clone(), plugin_read, plugin_write));

        let recorded = Arc::new(RecordSettings(std::sync::Mutex::new(vec![])));
        let host = IpcPeer::new(host_write);
        host.start(host_read, Arc::new(recorded.clone()));

        let reply: HandshakeReply = serde_json::from_value(
            host.call(
                methods::HANDSHAKE,
                json!({ "protocol": PROTOCOL, "module_id": "demo", "host_version": "1.0.0" }),
            )
            .await
            .unwrap(),
        )
        .unwrap();
        assert!(reply.check().is_ok());

        host.call(
            methods::INIT,
            json!({ "module_id": "demo", "data_dir": "/tmp/demo", "config_dir": "/tmp/.config/demo" }),
        )
        .await
        .unwrap();
        host.call(methods::START, json!({})).await.unwrap();
        assert_eq!(counter.starts.load(Ordering::SeqCst), 1);
        assert_eq!(
            recorded.0.lock().unwrap().as_slice(),
            ["settings.set \"ready\"".to_string()]
        );

        let response: ProxyResponse = serde_json::from_value(
            host.call(methods::HTTP, json!({ "method": "GET", "path": "/nope" }))
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(response.status, 404);

        host.call(methods::SHUTDOWN, json!({})).await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handshake_rejects_unknown_protocol() {
        let (host_io, plugin_io) = tokio::io::duplex(8 * 1024);
        let (plugin_read, plugin_write) = tokio::io::split(plugin_io);
        let (host_read, host_write) = tokio::io::split(host_io);
        tokio::spawn(serve_plugin_on(
            Arc::new(Counter::default()),
            plugin_read,
            plugin_write,
        ));

        let host = IpcPeer::new(host_write);
        host.start(host_read, Arc::new(RejectAll));
        let err = host
            .call(
                methods::HANDSHAKE,
                json!({ "protocol": "other/9", "module_id": "demo", "host_version": "1.0.0" }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Ipc(_)));
    }
}
