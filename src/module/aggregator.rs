//! 路由与界面聚合
//!
//! 只按 Order 遍历启用的模块，合并它们贡献的 HTTP 路由、菜单和前端路由。
//! 调用方只需持有注册表的共享锁。

use axum::Router;
use tracing::debug;

use super::metadata::{FrontendRoute, MenuItem};
use super::registry::{ModuleEntry, ModuleSlot, Registry};

/// Order 中的模块槽位
///
/// 尚未进入 Order 的模块（注册后未能解析）不参与聚合。
fn slots_in_order(registry: &Registry) -> impl Iterator<Item = &ModuleSlot> {
    registry.order().iter().filter_map(|id| registry.get(id))
}

/// 外部模块路由挂载的子路径
pub const EXTERNAL_ROUTE_SEGMENT: &str = "ext";

/// 挂载所有启用模块的路由
///
/// 内置模块的路由直接合并到 `prefix` 下；外部模块的路由嵌套在
/// `<prefix>/ext/<id>` 下。
pub fn mount_routes(registry: &Registry, prefix: &str) -> Router {
    let mut builtin = Router::new();
    let mut app = Router::new();

    for slot in slots_in_order(registry) {
        if !slot.enabled {
            continue;
        }
        let Some(routes) = slot.entry.instance().and_then(|m| m.routes()) else {
            continue;
        };

        match slot.entry {
            ModuleEntry::Builtin(_) => {
                debug!(module_id = %slot.descriptor.id, prefix = %prefix, "挂载内置模块路由");
                builtin = builtin.merge(routes);
            }
            ModuleEntry::External(_) => {
                let path = format!("{}/{}/{}", prefix, EXTERNAL_ROUTE_SEGMENT, slot.descriptor.id);
                debug!(module_id = %slot.descriptor.id, path = %path, "挂载外部模块路由");
                app = app.nest(&path, routes);
            }
        }
    }

    if prefix.is_empty() || prefix == "/" {
        app.merge(builtin)
    } else {
        app.nest(prefix, builtin)
    }
}

/// 收集菜单
///
/// 没有运行实例的外部模块使用清单中的声明。结果按 `order` 稳定排序。
pub async fn collect_menus(registry: &Registry) -> Vec<MenuItem> {
    let mut menus = Vec::new();
    for slot in slots_in_order(registry) {
        if !slot.enabled {
            continue;
        }
        match (&slot.entry, slot.entry.instance()) {
            (_, Some(instance)) => menus.extend(instance.menus().await),
            (ModuleEntry::External(ext), None) => menus.extend(ext.manifest.menus.iter().cloned()),
            (ModuleEntry::Builtin(_), None) => {}
        }
    }
    menus.sort_by_key(|m| m.order);
    menus
}

/// 收集前端路由
///
/// 规则与 [`collect_menus`] 相同。
pub async fn collect_frontend_routes(registry: &Registry) -> Vec<FrontendRoute> {
    let mut routes = Vec::new();
    for slot in slots_in_order(registry) {
        if !slot.enabled {
            continue;
        }
        match (&slot.entry, slot.entry.instance()) {
            (_, Some(instance)) => routes.extend(instance.frontend_routes().await),
            (ModuleEntry::External(ext), None) => {
                routes.extend(ext.manifest.routes.iter().cloned())
            }
            (ModuleEntry::Builtin(_), None) => {}
        }
    }
    routes.sort_by_key(|r| r.order);
    routes
}
