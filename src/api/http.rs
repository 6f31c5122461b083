//! 模块管理 HTTP 接口
//!
//! 提供模块列表、启用/禁用、安装/卸载、设置读写以及界面聚合查询。
//! 所有路由挂载在 `<api_prefix>/modules` 下。

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::module::manager::{ModuleList, ModuleManager, ModuleSettings};
use crate::module::metadata::{FrontendRoute, MenuItem, ModuleInfo};
use crate::utils::CoreError;

/// 接口错误响应
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip)]
    pub status_code: u16,
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self {
            code: err.error_code().to_string(),
            message: err.to_string(),
            status_code: err.status_code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// 安装请求
#[derive(Debug, Deserialize)]
pub struct InstallRequest {
    /// 本地目录或 URL
    pub source: String,
}

/// 操作结果
#[derive(Debug, Serialize, Deserialize)]
pub struct ActionResponse {
    pub id: String,
    pub success: bool,
}

impl ActionResponse {
    fn ok(id: String) -> Self {
        Self { id, success: true }
    }
}

/// 构建模块管理路由
///
/// 返回的路由不带前缀，由调用方嵌套到 `api_prefix` 下。
pub fn management_router(manager: Arc<ModuleManager>) -> Router {
    Router::new()
        .route("/modules", get(list_modules))
        .route("/modules/menus", get(menus))
        .route("/modules/frontend-routes", get(frontend_routes))
        .route("/modules/install", post(install))
        .route("/modules/:id", get(get_module).delete(uninstall))
        .route("/modules/:id/enable", post(enable))
        .route("/modules/:id/disable", post(disable))
        .route("/modules/:id/settings", get(get_settings).put(update_settings))
        .with_state(manager)
}

/// GET /modules
async fn list_modules(State(manager): State<Arc<ModuleManager>>) -> Json<ModuleList> {
    Json(manager.list_modules().await)
}

/// GET /modules/:id
async fn get_module(
    State(manager): State<Arc<ModuleManager>>,
    Path(id): Path<String>,
) -> ApiResult<ModuleInfo> {
    Ok(Json(manager.get_module(&id).await?))
}

/// POST /modules/:id/enable
async fn enable(
    State(manager): State<Arc<ModuleManager>>,
    Path(id): Path<String>,
) -> ApiResult<ActionResponse> {
    manager.enable(&id).await?;
    Ok(Json(ActionResponse::ok(id)))
}

/// POST /modules/:id/disable
async fn disable(
    State(manager): State<Arc<ModuleManager>>,
    Path(id): Path<String>,
) -> ApiResult<ActionResponse> {
    manager.disable(&id).await?;
    Ok(Json(ActionResponse::ok(id)))
}

/// POST /modules/install
async fn install(
    State(manager): State<Arc<ModuleManager>>,
    Json(request): Json<InstallRequest>,
) -> ApiResult<ModuleInfo> {
    info!(source = %request.source, "收到模块安装请求");
    let module = manager.install(&request.source).await.map_err(|e| {
        warn!(source = %request.source, error = %e, "模块安装失败");
        e
    })?;
    Ok(Json(module))
}

/// DELETE /modules/:id
async fn uninstall(
    State(manager): State<Arc<ModuleManager>>,
    Path(id): Path<String>,
) -> ApiResult<ActionResponse> {
    manager.uninstall(&id).await?;
    Ok(Json(ActionResponse::ok(id)))
}

/// GET /modules/:id/settings
async fn get_settings(
    State(manager): State<Arc<ModuleManager>>,
    Path(id): Path<String>,
) -> ApiResult<ModuleSettings> {
    Ok(Json(manager.get_settings(&id).await?))
}

/// PUT /modules/:id/settings
async fn update_settings(
    State(manager): State<Arc<ModuleManager>>,
    Path(id): Path<String>,
    Json(values): Json<BTreeMap<String, String>>,
) -> ApiResult<ModuleSettings> {
    Ok(Json(manager.update_settings(&id, values).await?))
}

/// GET /modules/menus
async fn menus(State(manager): State<Arc<ModuleManager>>) -> Json<Vec<MenuItem>> {
    Json(manager.collect_menus().await)
}

/// GET /modules/frontend-routes
async fn frontend_routes(State(manager): State<Arc<ModuleManager>>) -> Json<Vec<FrontendRoute>> {
    Json(manager.collect_frontend_routes().await)
}
