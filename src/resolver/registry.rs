//! 模块注册表
//!
//! 持有所有已知模块（已解析或未解析）及其连线，
//! 为类加载组件生成委派描述，并承载懒激活的单次触发钩子。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::{debug, info, trace};

use super::capability::{Namespace, Wire};
use super::classloading::{ClassLoadingSpec, ClassLoadingUnit};
use super::graph::WiringGraph;
use super::module::{ModuleId, ResolverModule};
use crate::utils::{CoreError, Result};

/// 懒激活钩子：首次从模块加载类时调用一次
pub type ActivationHook = Arc<dyn Fn(ModuleId) -> BoxFuture<'static, ()> + Send + Sync>;

/// 注册表条目
pub(crate) struct ModuleEntry {
    pub(crate) module: Arc<ResolverModule>,
    pub(crate) wires: Vec<Wire>,
    pub(crate) resolved: bool,
    /// 已被更新或卸载取代，不再作为新解析的提供方
    pub(crate) stale: bool,
    /// 宿主上已附加的 fragment
    pub(crate) fragments: Vec<ModuleId>,
    /// fragment 当前附加的宿主
    pub(crate) host: Option<ModuleId>,
    unit: Option<Arc<ClassLoadingUnit>>,
    hook: Option<ActivationHook>,
    hook_fired: Arc<AtomicBool>,
}

impl ModuleEntry {
    fn new(module: ResolverModule) -> Self {
        Self {
            module: Arc::new(module),
            wires: Vec::new(),
            resolved: false,
            stale: false,
            fragments: Vec::new(),
            host: None,
            unit: None,
            hook: None,
            hook_fired: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// 注册表内部状态，解析器在写锁下整体操作
#[derive(Default)]
pub(crate) struct RegistryState {
    pub(crate) entries: HashMap<ModuleId, ModuleEntry>,
    pub(crate) graph: WiringGraph,
}

impl RegistryState {
    /// 提交一个模块的解析结果
    pub(crate) fn commit(&mut self, id: &ModuleId, wires: Vec<Wire>, fragments: Vec<ModuleId>) {
        for wire in &wires {
            self.graph.add_dependency(&wire.requirer, &wire.provider);
        }
        self.graph.add_module(id);

        for fragment in &fragments {
            if let Some(entry) = self.entries.get_mut(fragment) {
                entry.resolved = true;
                entry.host = Some(id.clone());
            }
        }

        if let Some(entry) = self.entries.get_mut(id) {
            trace!(module = %id, wires = wires.len(), fragments = fragments.len(), "提交连线");
            entry.wires = wires;
            entry.fragments = fragments;
            entry.resolved = true;
            entry.unit = None;
        }
    }

    /// 生成类加载描述
    fn build_spec(&self, id: &ModuleId) -> Result<ClassLoadingSpec> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| CoreError::ModuleNotFound(id.to_string()))?;
        if !entry.resolved {
            return Err(CoreError::ClassNotFound {
                module: id.to_string(),
                class_name: "*".to_string(),
            });
        }

        let mut package_delegation = BTreeMap::new();
        let mut required_bundles = Vec::new();
        for wire in &entry.wires {
            match wire.requirement.namespace {
                Namespace::Package => {
                    package_delegation
                        .entry(wire.capability.name.clone())
                        .or_insert_with(|| wire.provider.clone());
                }
                Namespace::Bundle => {
                    self.collect_required(&wire.provider, &mut required_bundles);
                }
                Namespace::Host => {}
            }
        }

        for required in &required_bundles {
            for package in self.exported_packages(required) {
                package_delegation
                    .entry(package)
                    .or_insert_with(|| required.clone());
            }
        }

        let mut local_packages: BTreeSet<String> = self.exported_packages(id).into_iter().collect();
        let mut content_roots = entry.module.content_roots.clone();
        let mut native_libraries = entry.module.native_libraries.clone();
        for fragment in &entry.fragments {
            if let Some(fragment_entry) = self.entries.get(fragment) {
                local_packages.extend(fragment_entry.module.exports().map(|c| c.name.clone()));
                content_roots.extend(fragment_entry.module.content_roots.iter().cloned());
                for (name, path) in &fragment_entry.module.native_libraries {
                    native_libraries
                        .entry(name.clone())
                        .or_insert_with(|| path.clone());
                }
            }
        }

        Ok(ClassLoadingSpec {
            module: id.clone(),
            package_delegation,
            required_bundles,
            local_packages,
            content_roots,
            native_libraries,
        })
    }

    /// 依赖 bundle 及其再导出链
    fn collect_required(&self, provider: &ModuleId, out: &mut Vec<ModuleId>) {
        if out.contains(provider) {
            return;
        }
        out.push(provider.clone());
        if let Some(entry) = self.entries.get(provider) {
            for wire in &entry.wires {
                if wire.requirement.namespace == Namespace::Bundle && wire.requirement.reexport {
                    self.collect_required(&wire.provider, out);
                }
            }
        }
    }

    /// 模块及其 fragment 导出的包
    fn exported_packages(&self, id: &ModuleId) -> Vec<String> {
        let Some(entry) = self.entries.get(id) else {
            return Vec::new();
        };
        let mut packages: Vec<String> = entry.module.exports().map(|c| c.name.clone()).collect();
        for fragment in &entry.fragments {
            if let Some(fragment_entry) = self.entries.get(fragment) {
                packages.extend(fragment_entry.module.exports().map(|c| c.name.clone()));
            }
        }
        packages
    }
}

/// 模块注册表
#[derive(Default)]
pub struct ModuleRegistry {
    pub(crate) state: RwLock<RegistryState>,
}

impl ModuleRegistry {
    /// 创建空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册模块
    ///
    /// # Errors
    ///
    /// 身份已存在时返回 `Internal`（身份由单调计数生成，不应冲突）
    pub async fn add_module(&self, module: ResolverModule) -> Result<ModuleId> {
        let id = module.id.clone();
        let mut state = self.state.write().await;
        if state.entries.contains_key(&id) {
            return Err(CoreError::Internal(format!("模块身份冲突: {}", id)));
        }
        state.entries.insert(id.clone(), ModuleEntry::new(module));
        debug!(module = %id, "模块已注册");
        Ok(id)
    }

    /// 移除模块及其出边
    ///
    /// 指向该模块的连线不受影响，由 bundle 层的活动连线检查负责回收时机。
    pub async fn remove_module(&self, id: &ModuleId) -> Result<Arc<ResolverModule>> {
        let mut state = self.state.write().await;
        let entry = state
            .entries
            .remove(id)
            .ok_or_else(|| CoreError::ModuleNotFound(id.to_string()))?;
        state.graph.remove_module(id);

        if let Some(ref host) = entry.host {
            if let Some(host_entry) = state.entries.get_mut(host) {
                host_entry.fragments.retain(|f| f != id);
                host_entry.unit = None;
            }
        }
        for fragment in &entry.fragments {
            if let Some(fragment_entry) = state.entries.get_mut(fragment) {
                fragment_entry.host = None;
                fragment_entry.resolved = false;
            }
        }

        debug!(module = %id, "模块已移除");
        Ok(entry.module)
    }

    /// 查找模块
    pub async fn get_module(&self, id: &ModuleId) -> Option<Arc<ResolverModule>> {
        self.state
            .read()
            .await
            .entries
            .get(id)
            .map(|e| Arc::clone(&e.module))
    }

    /// 模块的出向连线
    pub async fn get_wires(&self, id: &ModuleId) -> Vec<Wire> {
        self.state
            .read()
            .await
            .entries
            .get(id)
            .map(|e| e.wires.clone())
            .unwrap_or_default()
    }

    /// 所有模块身份（有序）
    pub async fn get_module_identifiers(&self) -> Vec<ModuleId> {
        let state = self.state.read().await;
        let mut ids: Vec<ModuleId> = state.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 模块是否已解析（fragment 表示已附加）
    pub async fn is_resolved(&self, id: &ModuleId) -> bool {
        self.state
            .read()
            .await
            .entries
            .get(id)
            .map(|e| e.resolved)
            .unwrap_or(false)
    }

    /// 标记模块过期
    pub async fn mark_stale(&self, id: &ModuleId) {
        if let Some(entry) = self.state.write().await.entries.get_mut(id) {
            entry.stale = true;
            debug!(module = %id, "模块已标记为过期");
        }
    }

    /// 模块是否已过期
    pub async fn is_stale(&self, id: &ModuleId) -> bool {
        self.state
            .read()
            .await
            .entries
            .get(id)
            .map(|e| e.stale)
            .unwrap_or(false)
    }

    /// 是否还有其它模块连线到该模块
    pub async fn has_active_wires(&self, id: &ModuleId) -> bool {
        self.state.read().await.graph.has_dependents(id)
    }

    /// 直接依赖方
    pub async fn direct_dependents(&self, id: &ModuleId) -> Vec<ModuleId> {
        self.state.read().await.graph.get_dependents(id)
    }

    /// 传递依赖方闭包
    pub async fn dependents_closure(&self, roots: &[ModuleId]) -> BTreeSet<ModuleId> {
        self.state.read().await.graph.get_all_dependents(roots)
    }

    /// 宿主上附加的 fragment
    pub async fn fragments_of(&self, host: &ModuleId) -> Vec<ModuleId> {
        self.state
            .read()
            .await
            .entries
            .get(host)
            .map(|e| e.fragments.clone())
            .unwrap_or_default()
    }

    /// fragment 附加的宿主
    pub async fn host_of(&self, fragment: &ModuleId) -> Option<ModuleId> {
        self.state
            .read()
            .await
            .entries
            .get(fragment)
            .and_then(|e| e.host.clone())
    }

    /// 从宿主上分离全部 fragment，返回被分离的 fragment
    pub async fn detach_fragments(&self, host: &ModuleId) -> Vec<ModuleId> {
        let mut state = self.state.write().await;
        let fragments = match state.entries.get_mut(host) {
            Some(entry) => {
                entry.unit = None;
                std::mem::take(&mut entry.fragments)
            }
            None => return Vec::new(),
        };
        for fragment in &fragments {
            if let Some(entry) = state.entries.get_mut(fragment) {
                entry.host = None;
                entry.resolved = false;
            }
        }
        fragments
    }

    /// 生成模块的类加载描述
    pub async fn class_loading_spec(&self, id: &ModuleId) -> Result<ClassLoadingSpec> {
        self.state.read().await.build_spec(id)
    }

    /// 物化（或取回已物化的）类加载单元
    pub async fn class_loading_unit(&self, id: &ModuleId) -> Result<Arc<ClassLoadingUnit>> {
        let mut state = self.state.write().await;
        if let Some(unit) = state.entries.get(id).and_then(|e| e.unit.clone()) {
            return Ok(unit);
        }

        let spec = state.build_spec(id)?;
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| CoreError::ModuleNotFound(id.to_string()))?;
        let unit = Arc::new(ClassLoadingUnit::new(entry.module.unit_id.clone(), spec));
        entry.unit = Some(Arc::clone(&unit));
        debug!(module = %id, unit_id = %unit.id(), "类加载单元已物化");
        Ok(unit)
    }

    /// 安装懒激活钩子（重新安装会重置触发标记）
    pub async fn set_activation_hook(&self, id: &ModuleId, hook: ActivationHook) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| CoreError::ModuleNotFound(id.to_string()))?;
        entry.hook = Some(hook);
        entry.hook_fired = Arc::new(AtomicBool::new(false));
        Ok(())
    }

    /// 移除懒激活钩子
    pub async fn clear_activation_hook(&self, id: &ModuleId) {
        if let Some(entry) = self.state.write().await.entries.get_mut(id) {
            entry.hook = None;
        }
    }

    /// 从模块加载类
    ///
    /// 返回定义该类的模块；定义模块带有未触发的懒激活钩子时，
    /// 在返回前调用它，每个钩子只触发一次。
    pub async fn load_class(&self, id: &ModuleId, class_name: &str) -> Result<ModuleId> {
        let loader = match self.host_of(id).await {
            Some(host) => host,
            None => id.clone(),
        };
        let unit = self.class_loading_unit(&loader).await?;
        let defining = unit
            .defining_module(class_name)
            .ok_or_else(|| CoreError::ClassNotFound {
                module: id.to_string(),
                class_name: class_name.to_string(),
            })?;

        let hook = {
            let state = self.state.read().await;
            state.entries.get(&defining).and_then(|entry| {
                let hook = entry.hook.as_ref()?;
                entry
                    .hook_fired
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .ok()
                    .map(|_| Arc::clone(hook))
            })
        };

        if let Some(hook) = hook {
            info!(module = %defining, class = %class_name, "首次类加载触发懒激活");
            hook(defining.clone()).await;
        }

        Ok(defining)
    }

    /// 模块数量
    pub async fn count(&self) -> usize {
        self.state.read().await.entries.len()
    }
}
