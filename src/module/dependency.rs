//! 模块依赖管理
//!
//! 本模块提供模块依赖关系图和确定性的拓扑排序。
//!
//! 每个节点携带一个注册序号。Kahn 算法在多个节点同时就绪时，
//! 总是先输出序号最小的节点，因此相同的注册顺序总会得到相同的启动顺序。
//!
//! # 示例
//!
//! ```rust
//! use panel_core::module::dependency::DependencyGraph;
//!
//! let mut graph = DependencyGraph::new();
//! graph.add_module("docker", 0);
//! graph.add_module("database", 1);
//! graph.add_dependency("database", "docker");
//!
//! assert_eq!(graph.get_dependencies("database"), vec!["docker".to_string()]);
//! assert_eq!(graph.topological_sort().unwrap(), vec!["docker", "database"]);
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::utils::{CoreError, Result};

/// 模块依赖关系图
///
/// 正向边：模块 → 它依赖的模块；反向边：模块 → 依赖它的模块。
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// 注册序号：模块 ID -> seq
    seqs: HashMap<String, u64>,
    /// 正向边：模块 ID -> 该模块依赖的模块列表
    edges: HashMap<String, Vec<String>>,
    /// 反向边：模块 ID -> 依赖该模块的模块列表
    reverse_edges: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// 创建一个空的依赖图
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加模块节点
    ///
    /// 如果模块已存在，只更新其注册序号。
    pub fn add_module(&mut self, module_id: &str, seq: u64) {
        self.seqs.insert(module_id.to_string(), seq);
        self.edges.entry(module_id.to_string()).or_default();
        self.reverse_edges.entry(module_id.to_string()).or_default();
    }

    /// 添加依赖关系：`module_id` 依赖 `dependency_id`
    ///
    /// 两端都必须已经是图中的节点，否则返回 `false` 且不做修改。
    pub fn add_dependency(&mut self, module_id: &str, dependency_id: &str) -> bool {
        if !self.contains_module(module_id) || !self.contains_module(dependency_id) {
            return false;
        }

        if let Some(deps) = self.edges.get_mut(module_id) {
            if !deps.iter().any(|d| d == dependency_id) {
                deps.push(dependency_id.to_string());
            }
        }
        if let Some(dependents) = self.reverse_edges.get_mut(dependency_id) {
            if !dependents.iter().any(|d| d == module_id) {
                dependents.push(module_id.to_string());
            }
        }
        true
    }

    /// 获取模块的直接依赖
    pub fn get_dependencies(&self, module_id: &str) -> Vec<String> {
        self.edges.get(module_id).cloned().unwrap_or_default()
    }

    /// 获取直接依赖该模块的模块
    pub fn get_dependents(&self, module_id: &str) -> Vec<String> {
        self.reverse_edges.get(module_id).cloned().unwrap_or_default()
    }

    fn seq_of(&self, module_id: &str) -> u64 {
        self.seqs.get(module_id).copied().unwrap_or(u64::MAX)
    }

    /// 按注册序号排列的全部节点
    fn nodes_by_seq(&self) -> Vec<&String> {
        let mut nodes: Vec<&String> = self.seqs.keys().collect();
        nodes.sort_by_key(|id| (self.seq_of(id), (*id).clone()));
        nodes
    }

    /// 查找循环依赖
    ///
    /// 如果存在循环，返回闭合的循环路径（首尾相同）。
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for node in self.nodes_by_seq() {
            if let Some(cycle) = self.find_cycle_util(node, &mut visited, &mut rec_stack, &mut path)
            {
                return Some(cycle);
            }
        }

        None
    }

    fn find_cycle_util(
        &self,
        node: &str,
        visited: &mut HashSet<String>,
        rec_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        if rec_stack.contains(node) {
            let cycle_start = path.iter().position(|n| n == node).unwrap_or(0);
            let mut cycle: Vec<String> = path[cycle_start..].to_vec();
            cycle.push(node.to_string());
            return Some(cycle);
        }

        if !visited.insert(node.to_string()) {
            return None;
        }

        rec_stack.insert(node.to_string());
        path.push(node.to_string());

        if let Some(neighbors) = self.edges.get(node) {
            for neighbor in neighbors {
                if let Some(cycle) = self.find_cycle_util(neighbor, visited, rec_stack, path) {
                    return Some(cycle);
                }
            }
        }

        path.pop();
        rec_stack.remove(node);
        None
    }

    /// 拓扑排序（Kahn 算法）
    ///
    /// 依赖总是排在依赖方之前；同时就绪的节点按注册序号输出。
    ///
    /// # Errors
    ///
    /// 输出节点数少于图中节点数时返回 `CircularDependency`，
    /// 消息中包含一条循环路径。
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        // 入度 = 该模块依赖的模块数
        let mut in_degree: HashMap<&str, usize> = self
            .edges
            .iter()
            .map(|(node, deps)| (node.as_str(), deps.len()))
            .collect();

        let mut ready: BTreeSet<(u64, &str)> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(node, _)| (self.seq_of(node), *node))
            .collect();

        let mut result = Vec::with_capacity(self.edges.len());

        while let Some(entry) = ready.pop_first() {
            let (_, node) = entry;
            result.push(node.to_string());

            if let Some(dependents) = self.reverse_edges.get(node) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.insert((self.seq_of(dependent), dependent.as_str()));
                        }
                    }
                }
            }
        }

        if result.len() != self.edges.len() {
            let cycle = self
                .find_cycle()
                .map(|c| c.join(" -> "))
                .unwrap_or_else(|| "无法完成拓扑排序".to_string());
            return Err(CoreError::CircularDependency(cycle));
        }

        Ok(result)
    }

    /// 是否为空图
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// 节点数量
    pub fn module_count(&self) -> usize {
        self.edges.len()
    }

    /// 是否包含某模块
    pub fn contains_module(&self, module_id: &str) -> bool {
        self.edges.contains_key(module_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(nodes: &[&str], deps: &[(&str, &str)]) -> DependencyGraph {
        let mut g = DependencyGraph::new();
        for (seq, id) in nodes.iter().enumerate() {
            g.add_module(id, seq as u64);
        }
        for (module, dep) in deps {
            assert!(g.add_dependency(module, dep));
        }
        g
    }

    fn pos(order: &[String], id: &str) -> usize {
        order.iter().position(|x| x == id).unwrap()
    }

    #[test]
    fn test_add_dependency_requires_nodes() {
        let mut g = DependencyGraph::new();
        g.add_module("a", 0);
        assert!(!g.add_dependency("a", "missing"));
        assert!(g.get_dependencies("a").is_empty());
        assert!(!g.contains_module("missing"));
    }

    #[test]
    fn test_add_dependency_dedup() {
        let mut g = graph(&["a", "b"], &[("a", "b")]);
        g.add_dependency("a", "b");
        assert_eq!(g.get_dependencies("a"), vec!["b".to_string()]);
        assert_eq!(g.get_dependents("b"), vec!["a".to_string()]);
    }

    #[test]
    fn test_topological_sort_respects_dependencies() {
        let g = graph(
            &["sites", "apps", "nginx", "database", "docker"],
            &[
                ("sites", "nginx"),
                ("sites", "database"),
                ("apps", "docker"),
                ("database", "docker"),
                ("nginx", "docker"),
            ],
        );
        let order = g.topological_sort().unwrap();
        assert_eq!(order.len(), 5);
        assert!(pos(&order, "docker") < pos(&order, "database"));
        assert!(pos(&order, "docker") < pos(&order, "nginx"));
        assert!(pos(&order, "docker") < pos(&order, "apps"));
        assert!(pos(&order, "database") < pos(&order, "sites"));
        assert!(pos(&order, "nginx") < pos(&order, "sites"));
    }

    #[test]
    fn test_tie_break_by_registration_seq() {
        let g = graph(&["c", "a", "b"], &[]);
        assert_eq!(g.topological_sort().unwrap(), vec!["c", "a", "b"]);

        // b 与 a 都依赖 root，就绪后按序号输出
        let g = graph(&["b", "root", "a"], &[("b", "root"), ("a", "root")]);
        assert_eq!(g.topological_sort().unwrap(), vec!["root", "b", "a"]);
    }

    #[test]
    fn test_sort_is_deterministic() {
        let g = graph(
            &["x1", "x2", "x3", "x4", "x5", "x6"],
            &[("x4", "x1"), ("x5", "x2"), ("x6", "x3")],
        );
        let first = g.topological_sort().unwrap();
        for _ in 0..20 {
            assert_eq!(g.clone().topological_sort().unwrap(), first);
        }
        assert_eq!(first, vec!["x1", "x2", "x3", "x4", "x5", "x6"]);
    }

    #[test]
    fn test_cycle_detected() {
        let g = graph(&["a", "b", "c"], &[("a", "b"), ("b", "a")]);
        assert!(g.find_cycle().is_some());
        match g.topological_sort() {
            Err(CoreError::CircularDependency(msg)) => {
                assert!(msg.contains('a'));
                assert!(msg.contains('b'));
                assert!(msg.contains("->"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_find_cycle_is_closed_path() {
        let g = graph(&["a", "b", "c"], &[("a", "b"), ("b", "c"), ("c", "a")]);
        let cycle = g.find_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
    }
}
