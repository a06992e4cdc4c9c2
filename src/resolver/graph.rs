//! 连线图
//!
//! 以模块身份为节点、连线为有向边（依赖方 -> 提供方）的图结构，
//! 同时维护反向边，用于活动连线检查与刷新时的依赖闭包计算。
//!
//! # 示例
//!
//! ```rust
//! use chips_bundles::resolver::{ModuleId, WiringGraph};
//! use semver::Version;
//!
//! let a = ModuleId::new("a", Version::new(1, 0, 0), 1);
//! let b = ModuleId::new("b", Version::new(1, 0, 0), 2);
//!
//! let mut graph = WiringGraph::new();
//! graph.add_dependency(&b, &a);
//!
//! assert_eq!(graph.get_dependents(&a), vec![b.clone()]);
//! assert!(graph.has_dependents(&a));
//! ```

use std::collections::{BTreeSet, HashMap, VecDeque};

use super::module::ModuleId;

/// 模块连线图
#[derive(Debug, Clone, Default)]
pub struct WiringGraph {
    /// 正向边：依赖方 -> 提供方列表
    edges: HashMap<ModuleId, Vec<ModuleId>>,
    /// 反向边：提供方 -> 依赖方列表
    reverse_edges: HashMap<ModuleId, Vec<ModuleId>>,
}

impl WiringGraph {
    /// 创建一个空图
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加节点，已存在时不重复添加
    pub fn add_module(&mut self, module: &ModuleId) {
        self.edges.entry(module.clone()).or_default();
        self.reverse_edges.entry(module.clone()).or_default();
    }

    /// 添加依赖边：`requirer` 连线到 `provider`
    ///
    /// 自连线不记录。
    pub fn add_dependency(&mut self, requirer: &ModuleId, provider: &ModuleId) {
        if requirer == provider {
            return;
        }
        self.add_module(requirer);
        self.add_module(provider);

        let deps = self.edges.entry(requirer.clone()).or_default();
        if !deps.contains(provider) {
            deps.push(provider.clone());
        }

        let rev_deps = self.reverse_edges.entry(provider.clone()).or_default();
        if !rev_deps.contains(requirer) {
            rev_deps.push(requirer.clone());
        }
    }

    /// 移除模块的出边
    ///
    /// 指向该模块的入边保留：其它模块持有的连线在各自销毁前仍然有效。
    pub fn remove_module(&mut self, module: &ModuleId) {
        if let Some(deps) = self.edges.remove(module) {
            for dep in deps {
                let now_orphan = match self.reverse_edges.get_mut(&dep) {
                    Some(rev_deps) => {
                        rev_deps.retain(|d| d != module);
                        rev_deps.is_empty() && !self.edges.contains_key(&dep)
                    }
                    None => false,
                };
                // 已移除的提供方在最后一条入边消失时一并清除
                if now_orphan {
                    self.reverse_edges.remove(&dep);
                }
            }
        }

        let keep = self
            .reverse_edges
            .get(module)
            .map(|rev| !rev.is_empty())
            .unwrap_or(false);
        if !keep {
            self.reverse_edges.remove(module);
        }
    }

    /// 直接提供方
    pub fn get_dependencies(&self, module: &ModuleId) -> Vec<ModuleId> {
        self.edges.get(module).cloned().unwrap_or_default()
    }

    /// 直接依赖方
    pub fn get_dependents(&self, module: &ModuleId) -> Vec<ModuleId> {
        self.reverse_edges.get(module).cloned().unwrap_or_default()
    }

    /// 是否仍有模块连线到该模块
    pub fn has_dependents(&self, module: &ModuleId) -> bool {
        self.reverse_edges
            .get(module)
            .map(|rev| !rev.is_empty())
            .unwrap_or(false)
    }

    /// 传递依赖方闭包（不含起点本身，除非处在环上）
    pub fn get_all_dependents(&self, roots: &[ModuleId]) -> BTreeSet<ModuleId> {
        let mut result = BTreeSet::new();
        let mut queue: VecDeque<ModuleId> = roots.iter().cloned().collect();

        while let Some(node) = queue.pop_front() {
            if let Some(dependents) = self.reverse_edges.get(&node) {
                for dependent in dependents {
                    if result.insert(dependent.clone()) {
                        queue.push_back(dependent.clone());
                    }
                }
            }
        }

        result
    }

    /// 是否包含该节点
    pub fn contains_module(&self, module: &ModuleId) -> bool {
        self.edges.contains_key(module) || self.reverse_edges.contains_key(module)
    }

    /// 节点数量
    pub fn module_count(&self) -> usize {
        self.edges.len()
    }

    /// 图是否为空
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty() && self.reverse_edges.is_empty()
    }
}
