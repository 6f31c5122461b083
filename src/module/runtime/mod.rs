//! 工作进程运行时
//!
//! 外部模块以独立进程运行，通过 [`crate::api::ipc`] 与宿主通信。
//! 本模块定义双方共用的方法名与参数结构，以及宿主侧把工作进程的
//! 能力请求转发给 [`CapabilityBridge`] 的处理器。

pub mod process;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::api::ipc::IpcHandler;
use crate::module::bridge::{CapabilityApi, CapabilityBridge, NotificationLevel};
use crate::utils::{CoreError, Result};

pub use process::{ProcessArtifactLoader, ProcessModule};

/// 工作进程协议版本
pub const PROTOCOL: &str = "panel-module/1";

/// 握手时工作进程必须声明的能力
pub const LIFECYCLE_CAPABILITY: &str = "lifecycle";

/// 方法名
pub mod methods {
    // 宿主 → 工作进程
    pub const HANDSHAKE: &str = "handshake";
    pub const INIT: &str = "init";
    pub const MIGRATE: &str = "migrate";
    pub const START: &str = "start";
    pub const STOP: &str = "stop";
    pub const SHUTDOWN: &str = "shutdown";
    pub const MENUS: &str = "menus";
    pub const FRONTEND_ROUTES: &str = "frontend_routes";
    pub const HTTP: &str = "http";

    // 工作进程 → 宿主
    pub const SETTINGS_GET: &str = "settings.get";
    pub const SETTINGS_SET: &str = "settings.set";
    pub const SETTINGS_DELETE: &str = "settings.delete";
    pub const FILES_READ: &str = "files.read";
    pub const FILES_WRITE: &str = "files.write";
    pub const FILES_DELETE: &str = "files.delete";
    pub const FILES_LIST: &str = "files.list";
    pub const HTTP_GET: &str = "http.get";
    pub const NOTIFY: &str = "notify";
}

// ============================================================================
// 参数结构
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeParams {
    pub protocol: String,
    pub module_id: String,
    pub host_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeReply {
    pub protocol: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl HandshakeReply {
    /// 校验握手应答
    pub fn check(&self) -> std::result::Result<(), String> {
        if self.protocol != PROTOCOL {
            return Err(format!(
                "协议版本不匹配: 期望 '{}', 实际 '{}'",
                PROTOCOL, self.protocol
            ));
        }
        if !self.capabilities.iter().any(|c| c == LIFECYCLE_CAPABILITY) {
            return Err(format!("未声明 '{}' 能力", LIFECYCLE_CAPABILITY));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitParams {
    pub module_id: String,
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingParams {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileParams {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpGetParams {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyParams {
    #[serde(default)]
    pub level: NotificationLevel,
    pub title: String,
    #[serde(default)]
    pub message: String,
}

/// 转发给工作进程的 HTTP 请求
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

/// 工作进程返回的 HTTP 响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyResponse {
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

fn default_status() -> u16 {
    200
}

fn parse<T: serde::de::DeserializeOwned>(method: &str, params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|e| CoreError::Ipc(format!("方法 '{}' 参数无效: {}", method, e)))
}

// ============================================================================
// 宿主侧处理器
// ============================================================================

/// 把工作进程的能力请求转发给能力桥
pub struct BridgeHandler {
    bridge: CapabilityBridge,
}

impl BridgeHandler {
    pub fn new(bridge: CapabilityBridge) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl IpcHandler for BridgeHandler {
    async fn handle(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            methods::SETTINGS_GET => {
                let p: SettingParams = parse(method, params)?;
                Ok(json!(self.bridge.get_setting(&p.key).await?))
            }
            methods::SETTINGS_SET => {
                let p: SettingParams = parse(method, params)?;
                let value = p.value.unwrap_or_default();
                self.bridge.set_setting(&p.key, &value).await?;
                Ok(Value::Null)
            }
            methods::SETTINGS_DELETE => {
                let p: SettingParams = parse(method, params)?;
                self.bridge.delete_setting(&p.key).await?;
                Ok(Value::Null)
            }
            methods::FILES_READ => {
                let p: FileParams = parse(method, params)?;
                Ok(json!(self.bridge.read_file(&p.path).await?))
            }
            methods::FILES_WRITE => {
                let p: FileParams = parse(method, params)?;
                let data = p.data.unwrap_or_default();
                self.bridge.write_file(&p.path, &data).await?;
                Ok(Value::Null)
            }
            methods::FILES_DELETE => {
                let p: FileParams = parse(method, params)?;
                self.bridge.delete_file(&p.path).await?;
                Ok(Value::Null)
            }
            methods::FILES_LIST => {
                let p: FileParams = parse(method, params)?;
                Ok(json!(self.bridge.list_files(&p.path).await?))
            }
            methods::HTTP_GET => {
                let p: HttpGetParams = parse(method, params)?;
                Ok(serde_json::to_value(self.bridge.http_get(&p.url, &p.headers).await?)?)
            }
            methods::NOTIFY => {
                let p: NotifyParams = parse(method, params)?;
                self.bridge.notify(p.level, &p.title, &p.message).await?;
                Ok(Value::Null)
            }
            other => Err(CoreError::NotImplemented(format!(
                "模块 '{}' 请求了未知能力 '{}'",
                self.bridge.module_id(),
                other
            ))),
        }
    }
}
