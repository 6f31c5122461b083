//! 能力接口桥
//!
//! 外部模块访问宿主的唯一通道。每个外部模块在初始化时获得一个
//! [`CapabilityBridge`]，它只提供以下能力：
//!
//! - 字符串设置的读写删（在存储中以 `<module_id>.<key>` 命名空间隔离）
//! - 以模块数据目录为根的文件读写、删除和列举
//! - 携带自定义请求头的出站 HTTP GET
//! - 发送通知

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::utils::{CoreError, Result};

// ============================================================================
// 能力接口
// ============================================================================

/// 出站 HTTP 响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

/// 通知级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

/// 通知
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// 发出通知的模块
    pub source: String,
    pub level: NotificationLevel,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// 外部模块可用的宿主能力
///
/// 宿主侧由 [`CapabilityBridge`] 实现，工作进程侧由
/// `api::plugin::RemoteCapabilities` 通过进程间通信转发。
#[async_trait]
pub trait CapabilityApi: Send + Sync {
    /// 读取设置
    async fn get_setting(&self, key: &str) -> Result<Option<String>>;

    /// 写入设置
    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;

    /// 删除设置
    async fn delete_setting(&self, key: &str) -> Result<()>;

    /// 读取数据目录下的文件
    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    /// 写入数据目录下的文件，必要时创建父目录
    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()>;

    /// 删除数据目录下的文件
    async fn delete_file(&self, path: &str) -> Result<()>;

    /// 列举数据目录下某个子目录的条目，空字符串表示数据目录本身
    async fn list_files(&self, dir: &str) -> Result<Vec<String>>;

    /// 出站 HTTP GET
    async fn http_get(&self, url: &str, headers: &HashMap<String, String>) -> Result<HttpResponse>;

    /// 发送通知
    async fn notify(&self, level: NotificationLevel, title: &str, message: &str) -> Result<()>;
}

// ============================================================================
// 设置存储
// ============================================================================

/// 设置存储后端
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// 读取键
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// 写入键
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// 删除键，不存在时静默成功
    async fn delete(&self, key: &str) -> Result<()>;

    /// 列出某前缀下的所有键值
    async fn list_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>>;

    /// 删除某前缀下的所有键
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;
}

/// 内存设置存储
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    values: RwLock<BTreeMap<String, String>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values.write().await.remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        Ok(filter_prefix(&*self.values.read().await, prefix))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.values.write().await.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}

/// JSON 文件设置存储
///
/// 全部设置保存在一个 JSON 对象文件中，每次修改先写临时文件再重命名。
/// 写入成功后才更新内存中的值，失败时内存与磁盘保持一致。
#[derive(Debug)]
pub struct FileSettingsStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FileSettingsStore {
    /// 打开存储文件，不存在时从空集合开始
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), count = values.len(), "加载设置存储");
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// 存储文件路径
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, values: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(values)?;
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for FileSettingsStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().await;
        let mut next = values.clone();
        next.insert(key.to_string(), value.to_string());
        self.persist(&next).await?;
        *values = next;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock().await;
        if !values.contains_key(key) {
            return Ok(());
        }
        let mut next = values.clone();
        next.remove(key);
        self.persist(&next).await?;
        *values = next;
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        Ok(filter_prefix(&*self.values.lock().await, prefix))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let mut values = self.values.lock().await;
        let mut next = values.clone();
        next.retain(|k, _| !k.starts_with(prefix));
        if next.len() != values.len() {
            self.persist(&next).await?;
            *values = next;
        }
        Ok(())
    }
}

fn filter_prefix(values: &BTreeMap<String, String>, prefix: &str) -> BTreeMap<String, String> {
    values
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// 模块设置在存储中的命名空间前缀
pub fn settings_prefix(module_id: &str) -> String {
    format!("{}.", module_id)
}

// ============================================================================
// 通知
// ============================================================================

/// 通知分发器
///
/// 每条通知都会写入日志，并广播给所有订阅者。
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<Notification>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Notifier {
    /// 创建通知分发器
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// 订阅通知
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    /// 发送通知
    pub fn notify(&self, notification: Notification) {
        match notification.level {
            NotificationLevel::Error => error!(
                source = %notification.source,
                title = %notification.title,
                "{}", notification.message
            ),
            NotificationLevel::Warning => warn!(
                source = %notification.source,
                title = %notification.title,
                "{}", notification.message
            ),
            _ => info!(
                source = %notification.source,
                title = %notification.title,
                "{}", notification.message
            ),
        }
        // 没有订阅者时发送失败，可以忽略
        let _ = self.sender.send(notification);
    }
}

// ============================================================================
// 宿主侧实现
// ============================================================================

/// 宿主侧能力桥
#[derive(Clone)]
pub struct CapabilityBridge {
    module_id: String,
    data_dir: PathBuf,
    store: Arc<dyn SettingsStore>,
    notifier: Notifier,
    http: reqwest::Client,
}

impl CapabilityBridge {
    /// 创建能力桥
    pub fn new(
        module_id: impl Into<String>,
        data_dir: impl Into<PathBuf>,
        store: Arc<dyn SettingsStore>,
        notifier: Notifier,
        http: reqwest::Client,
    ) -> Self {
        Self {
            module_id: module_id.into(),
            data_dir: data_dir.into(),
            store,
            notifier,
            http,
        }
    }

    /// 所属模块 ID
    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    /// 沙箱根目录
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn setting_key(&self, key: &str) -> Result<String> {
        if key.trim().is_empty() {
            return Err(CoreError::InvalidSettings("设置键不能为空".to_string()));
        }
        Ok(format!("{}.{}", self.module_id, key))
    }

    /// 将相对路径解析到数据目录下
    ///
    /// 绝对路径以及包含 `..`、根或前缀组件的路径都会被拒绝。
    pub fn resolve_path(&self, relative: &str) -> Result<PathBuf> {
        let path = Path::new(relative);
        let escapes = path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if path.is_absolute() || escapes {
            return Err(CoreError::PathOutsideSandbox(relative.to_string()));
        }
        Ok(self.data_dir.join(path))
    }
}

#[async_trait]
impl CapabilityApi for CapabilityBridge {
    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.store.get(&self.setting_key(key)?).await
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.store.set(&self.setting_key(key)?, value).await
    }

    async fn delete_setting(&self, key: &str) -> Result<()> {
        self.store.delete(&self.setting_key(key)?).await
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve_path(path)?;
        Ok(tokio::fs::read(full).await?)
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        if path.trim().is_empty() {
            return Err(CoreError::PathOutsideSandbox(path.to_string()));
        }
        let full = self.resolve_path(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(full, data).await?;
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        if path.trim().is_empty() {
            return Err(CoreError::PathOutsideSandbox(path.to_string()));
        }
        let full = self.resolve_path(path)?;
        tokio::fs::remove_file(full).await?;
        Ok(())
    }

    async fn list_files(&self, dir: &str) -> Result<Vec<String>> {
        let full = self.resolve_path(dir)?;
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&full).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Ok(relative) = path.strip_prefix(&self.data_dir) {
                names.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
        names.sort();
        Ok(names)
    }

    async fn http_get(&self, url: &str, headers: &HashMap<String, String>) -> Result<HttpResponse> {
        debug!(module_id = %self.module_id, url = %url, "出站 HTTP GET");
        let mut request = self.http.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.text().await?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    async fn notify(&self, level: NotificationLevel, title: &str, message: &str) -> Result<()> {
        self.notifier.notify(Notification {
            source: self.module_id.clone(),
            level,
            title: title.to_string(),
            message: message.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }
}
