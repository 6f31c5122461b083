//! IPC 进程间通信
//!
//! 宿主与外部模块工作进程之间通过子进程的标准输入输出通信。
//!
//! # 消息协议
//!
//! - 每条消息是一个 JSON 对象，以换行符（`\n`）结尾
//! - 请求：`{"type":"request","id":"...","method":"...","params":{...}}`
//! - 响应：`{"type":"response","id":"...","success":true,"data":...}`
//! - 双方都可以发起请求，响应通过 `id` 与请求配对
//!
//! ```text
//! ┌────────────┐   stdin  (request / response)   ┌──────────────┐
//! │   宿主     │ ──────────────────────────────► │  工作进程    │
//! │  IpcPeer   │ ◄────────────────────────────── │  IpcPeer     │
//! └────────────┘   stdout (request / response)   └──────────────┘
//! ```
//!
//! 收到的每个请求都在独立任务中处理，因此一方在处理请求时
//! 仍然可以向另一方发起请求。

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::utils::{generate_uuid, CoreError, Result};

// ============================================================================
// 消息定义
// ============================================================================

/// IPC 请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcRequest {
    /// 请求 ID
    pub id: String,
    /// 方法名
    pub method: String,
    /// 参数
    #[serde(default)]
    pub params: Value,
}

impl IpcRequest {
    /// 创建请求，自动生成 ID
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            id: generate_uuid(),
            method: method.into(),
            params,
        }
    }
}

/// IPC 响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcResponse {
    /// 对应的请求 ID
    pub id: String,
    /// 是否成功
    pub success: bool,
    /// 响应数据
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// 错误信息
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    /// 创建成功响应
    pub fn success(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// 创建错误响应
    pub fn error(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// 转换为调用结果
    pub fn into_result(self) -> Result<Value> {
        if self.success {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(CoreError::Ipc(
                self.error.unwrap_or_else(|| "未知错误".to_string()),
            ))
        }
    }
}

/// IPC 消息帧
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IpcFrame {
    Request(IpcRequest),
    Response(IpcResponse),
}

impl IpcFrame {
    /// 序列化为 JSON 行（以换行符结尾）
    pub fn to_line(&self) -> Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// 从 JSON 行解析
    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

// ============================================================================
// 请求处理
// ============================================================================

/// 对端请求处理器
#[async_trait]
pub trait IpcHandler: Send + Sync + 'static {
    /// 处理一个请求，返回响应数据
    async fn handle(&self, method: &str, params: Value) -> Result<Value>;
}

/// 拒绝所有请求的处理器
pub struct RejectAll;

#[async_trait]
impl IpcHandler for RejectAll {
    async fn handle(&self, method: &str, _params: Value) -> Result<Value> {
        Err(CoreError::NotImplemented(format!("未知方法: {}", method)))
    }
}

// ============================================================================
// 通信端点
// ============================================================================

type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

struct PeerInner {
    writer: Mutex<BoxedWriter>,
    pending: StdMutex<HashMap<String, oneshot::Sender<IpcResponse>>>,
    closed: watch::Sender<bool>,
}

/// IPC 通信端点
///
/// 克隆开销很小，所有克隆共享同一条连接。
#[derive(Clone)]
pub struct IpcPeer {
    inner: Arc<PeerInner>,
}

impl IpcPeer {
    /// 基于写入端创建端点
    ///
    /// 需要再调用 [`IpcPeer::start`] 开始读取对端消息。
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(PeerInner {
                writer: Mutex::new(Box::pin(writer)),
                pending: StdMutex::new(HashMap::new()),
                closed,
            }),
        }
    }

    /// 启动读取任务
    ///
    /// 读取到 EOF 或出错时任务结束，端点被标记为关闭，所有等待中的调用失败。
    pub fn start<R>(&self, reader: R, handler: Arc<dyn IpcHandler>) -> JoinHandle<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let peer = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        peer.dispatch(&line, &handler);
                    }
                    Ok(None) => {
                        debug!("IPC 对端关闭连接");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "IPC 读取失败");
                        break;
                    }
                }
            }
            peer.mark_closed();
        })
    }

    fn dispatch(&self, line: &str, handler: &Arc<dyn IpcHandler>) {
        match IpcFrame::from_line(line) {
            Ok(IpcFrame::Response(response)) => {
                let sender = self.lock_pending().remove(&response.id);
                match sender {
                    Some(sender) => {
                        let _ = sender.send(response);
                    }
                    None => warn!(request_id = %response.id, "收到未知请求的响应"),
                }
            }
            Ok(IpcFrame::Request(request)) => {
                trace!(request_id = %request.id, method = %request.method, "收到 IPC 请求");
                let peer = self.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    let response = match handler.handle(&request.method, request.params).await {
                        Ok(data) => IpcResponse::success(request.id, data),
                        Err(e) => IpcResponse::error(request.id, e.to_string()),
                    };
                    if let Err(e) = peer.send_frame(&IpcFrame::Response(response)).await {
                        debug!(error = %e, "IPC 响应发送失败");
                    }
                });
            }
            Err(e) => warn!(error = %e, "无法解析 IPC 消息"),
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<IpcResponse>>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mark_closed(&self) {
        self.inner.closed.send_replace(true);
        // 丢弃发送端，等待中的调用会收到关闭错误
        self.lock_pending().clear();
    }

    async fn send_frame(&self, frame: &IpcFrame) -> Result<()> {
        let line = frame.to_line()?;
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// 是否已关闭
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// 等待连接关闭
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// 发起请求并等待响应
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.exchange(method, params, None).await
    }

    /// 发起请求，超时返回 `Timeout`
    ///
    /// 超时的请求会从等待表中移除，迟到的响应被丢弃。
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.exchange(method, params, Some(timeout)).await
    }

    async fn exchange(&self, method: &str, params: Value, timeout: Option<Duration>) -> Result<Value> {
        if self.is_closed() {
            return Err(CoreError::Ipc("连接已关闭".to_string()));
        }

        let request = IpcRequest::new(method, params);
        let id = request.id.clone();
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id.clone(), tx);
        if self.is_closed() {
            self.lock_pending().remove(&id);
            return Err(CoreError::Ipc("连接已关闭".to_string()));
        }

        if let Err(e) = self.send_frame(&IpcFrame::Request(request)).await {
            self.lock_pending().remove(&id);
            return Err(CoreError::Ipc(format!("发送请求 '{}' 失败: {}", method, e)));
        }

        let reply = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.lock_pending().remove(&id);
                    return Err(CoreError::Timeout(format!(
                        "'{}' 超过 {:?} 未响应",
                        method, limit
                    )));
                }
            },
            None => rx.await,
        };

        match reply {
            Ok(response) => response.into_result(),
            Err(_) => Err(CoreError::Ipc(format!("等待 '{}' 响应时连接关闭", method))),
        }
    }
}
