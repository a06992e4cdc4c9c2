//! bundle 管理器
//!
//! 按 ID 与位置索引全部 bundle，负责安装、revision 构建、
//! 批量解析后的状态同步，以及卸载后的延迟回收。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use super::bundle::{Bundle, BundleKind};
use super::deployment::Deployment;
use super::metadata::BundleManifest;
use super::revision::Revision;
use super::service::ServiceRegistry;
use super::state::{BundleState, StateMask};
use super::storage::{BundleRecord, BundleStorage};
use super::validator::{BundleValidator, InstalledIdentity};
use crate::framework::event::{BundleEventKind, EventDispatcher};
use crate::resolver::{ModuleId, ModuleRegistry, ResolutionReport, Resolver};
use crate::utils::{BundleId, CoreError, IdGenerator, Result, SYSTEM_BUNDLE_ID};

/// bundle 管理器
pub struct BundleManager {
    ids: Arc<IdGenerator>,
    /// 包括已卸载但尚未回收的 bundle
    bundles: RwLock<BTreeMap<BundleId, Arc<Bundle>>>,
    /// 未卸载 bundle 的位置索引
    locations: RwLock<HashMap<String, BundleId>>,
    install_lock: Mutex<()>,
    registry: Arc<ModuleRegistry>,
    resolver: Resolver,
    services: Arc<ServiceRegistry>,
    events: Arc<EventDispatcher>,
    storage: Arc<dyn BundleStorage>,
    validator: BundleValidator,
    initial_start_level: AtomicU32,
}

impl BundleManager {
    pub fn new(
        ids: Arc<IdGenerator>,
        registry: Arc<ModuleRegistry>,
        services: Arc<ServiceRegistry>,
        events: Arc<EventDispatcher>,
        storage: Arc<dyn BundleStorage>,
        validator: BundleValidator,
        initial_start_level: u32,
    ) -> Self {
        Self {
            ids,
            bundles: RwLock::new(BTreeMap::new()),
            locations: RwLock::new(HashMap::new()),
            install_lock: Mutex::new(()),
            resolver: Resolver::new(Arc::clone(&registry)),
            registry,
            services,
            events,
            storage,
            validator,
            initial_start_level: AtomicU32::new(initial_start_level),
        }
    }

    // ==================== 访问器 ====================

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    pub fn ids(&self) -> &Arc<IdGenerator> {
        &self.ids
    }

    pub fn initial_start_level(&self) -> u32 {
        self.initial_start_level.load(Ordering::SeqCst)
    }

    pub fn set_initial_start_level(&self, level: u32) {
        self.initial_start_level.store(level.max(1), Ordering::SeqCst);
    }

    // ==================== 查询 ====================

    pub async fn get_bundle_by_id(&self, bundle_id: BundleId) -> Option<Arc<Bundle>> {
        self.bundles.read().await.get(&bundle_id).cloned()
    }

    /// 按 ID 查找，不存在时返回 `BundleNotFound`
    pub async fn bundle(&self, bundle_id: BundleId) -> Result<Arc<Bundle>> {
        self.get_bundle_by_id(bundle_id)
            .await
            .ok_or(CoreError::BundleNotFound(bundle_id))
    }

    pub async fn get_bundle_by_location(&self, location: &str) -> Option<Arc<Bundle>> {
        let bundle_id = *self.locations.read().await.get(location)?;
        self.get_bundle_by_id(bundle_id).await
    }

    /// 状态在掩码内的 bundle，按 ID 升序
    pub async fn get_bundles(&self, mask: StateMask) -> Vec<Arc<Bundle>> {
        self.bundles
            .read()
            .await
            .values()
            .filter(|b| mask.contains(b.state()))
            .cloned()
            .collect()
    }

    /// 指定符号名的未卸载 bundle
    pub async fn get_bundles_by_name(&self, symbolic_name: &str) -> Vec<Arc<Bundle>> {
        self.get_bundles(StateMask::INSTALLED_ANY)
            .await
            .into_iter()
            .filter(|b| b.symbolic_name() == symbolic_name)
            .collect()
    }

    /// 模块所属的 bundle
    pub async fn bundle_of_module(&self, module: &ModuleId) -> Option<Arc<Bundle>> {
        let bundle_id = self.registry.get_module(module).await?.bundle_id;
        self.get_bundle_by_id(bundle_id).await
    }

    async fn installed_identities(&self) -> Vec<InstalledIdentity> {
        let mut identities = Vec::new();
        for bundle in self.get_bundles(StateMask::INSTALLED_ANY).await {
            identities.push(InstalledIdentity {
                bundle_id: bundle.id(),
                symbolic_name: bundle.symbolic_name().to_string(),
                version: bundle.version().await,
            });
        }
        identities
    }

    // ==================== 安装 ====================

    /// 注册系统 bundle 并立即解析
    pub(crate) async fn register_system_bundle(&self, bundle: Arc<Bundle>) -> Result<()> {
        let revision = bundle.current_revision().await;
        self.registry.add_module(revision.to_resolver_module()).await?;
        self.resolver.resolve(revision.module_id()).await?;

        self.locations
            .write()
            .await
            .insert(bundle.location().to_string(), SYSTEM_BUNDLE_ID);
        self.bundles.write().await.insert(SYSTEM_BUNDLE_ID, Arc::clone(&bundle));
        bundle.set_state(BundleState::Resolved);
        debug!(module = %revision.module_id(), "系统 bundle 已注册");
        Ok(())
    }

    /// 安装 bundle
    ///
    /// 位置已安装时直接返回已有 bundle。
    ///
    /// # Errors
    ///
    /// 清单非法、校验失败或存储失败时返回错误，且不留下任何注册信息
    #[instrument(skip(self, deployment), fields(location = %deployment.location))]
    pub async fn install_bundle(&self, deployment: Deployment) -> Result<Arc<Bundle>> {
        let _guard = self.install_lock.lock().await;

        if let Some(existing) = self.get_bundle_by_location(&deployment.location).await {
            debug!(bundle_id = existing.id(), "位置已安装，返回已有 bundle");
            return Ok(existing);
        }

        let manifest = BundleManifest::parse(deployment.headers.clone())?;
        let (symbolic_name, manifest) = match manifest.symbolic_name() {
            Some(name) => (name.to_string(), manifest),
            None => {
                // 缺少符号名时的完整检查在校验阶段报告
                let name = BundleValidator::legacy_symbolic_name(&deployment.location);
                (name, manifest)
            }
        };

        let installed = self.installed_identities().await;
        if let Err(e) = self
            .validator
            .validate(&deployment.location, &symbolic_name, &manifest, &installed, None)
        {
            warn!(error = %e, "安装校验失败");
            return Err(e);
        }

        let bundle_id = self.ids.next_bundle_id();
        let mut record = BundleRecord::new(
            bundle_id,
            deployment.location.clone(),
            deployment.start_level.unwrap_or_else(|| self.initial_start_level()),
        );
        let previous_id = self.restore_record(&mut record).await;
        self.storage.save(&record).await?;

        let manifest = if manifest.symbolic_name().is_none() {
            manifest.with_symbolic_name(symbolic_name.clone())
        } else {
            manifest
        };
        let kind = if manifest.fragment_host().is_some() {
            BundleKind::Fragment
        } else {
            BundleKind::Host
        };
        let location = deployment.location.clone();
        let revision = Revision::new(
            bundle_id,
            &symbolic_name,
            Arc::new(manifest),
            Arc::new(deployment),
            self.ids.next_revision(),
            0,
        );

        if let Err(e) = self.registry.add_module(revision.to_resolver_module()).await {
            // 与旧记录同 ID 时保存只是覆盖了它，不能删除
            if previous_id != Some(bundle_id) {
                self.discard_storage(bundle_id).await;
            }
            return Err(e);
        }

        let bundle = Arc::new(Bundle::new(location.clone(), kind, revision, record.start_level));
        bundle.set_persistently_started(record.persistently_started);
        bundle.set_uses_activation_policy(record.use_activation_policy);

        self.bundles.write().await.insert(bundle_id, Arc::clone(&bundle));
        self.locations.write().await.insert(location, bundle_id);
        bundle.set_state(BundleState::Installed);
        if let Some(previous_id) = previous_id.filter(|id| *id != bundle_id) {
            self.discard_storage(previous_id).await;
        }
        info!(bundle_id, symbolic_name = %symbolic_name, kind = %kind, "bundle 已安装");
        self.events
            .fire_bundle(BundleEventKind::Installed, bundle_id, &symbolic_name)
            .await;
        Ok(bundle)
    }

    /// 沿用同一位置此前留下的持久记录，返回该记录的 ID
    ///
    /// 旧记录由调用方在安装成功后删除。
    async fn restore_record(&self, record: &mut BundleRecord) -> Option<BundleId> {
        let previous = match self.storage.list().await {
            Ok(records) => records
                .into_iter()
                .find(|r| r.location == record.location),
            Err(e) => {
                warn!(error = %e, "读取持久记录失败");
                None
            }
        }?;
        debug!(previous_id = previous.bundle_id, "沿用持久记录");
        record.start_level = previous.start_level;
        record.persistently_started = previous.persistently_started;
        record.use_activation_policy = previous.use_activation_policy;
        Some(previous.bundle_id)
    }

    async fn discard_storage(&self, bundle_id: BundleId) {
        if let Err(e) = self.storage.delete(bundle_id).await {
            warn!(bundle_id, error = %e, "删除持久记录失败");
        }
    }

    /// 把 bundle 的当前标记写入存储
    pub async fn persist(&self, bundle: &Bundle) -> Result<()> {
        if bundle.is_system() || bundle.state() == BundleState::Uninstalled {
            return Ok(());
        }
        let record = BundleRecord {
            bundle_id: bundle.id(),
            location: bundle.location().to_string(),
            start_level: bundle.start_level(),
            persistently_started: bundle.is_persistently_started(),
            use_activation_policy: bundle.uses_activation_policy(),
            last_modified: bundle.last_modified().await,
        };
        self.storage.save(&record).await
    }

    // ==================== revision ====================

    /// 为更新构建并注册新的当前 revision
    ///
    /// 旧 revision 保留在历史中：已解析的旧模块标记为过期，未解析的直接移除。
    ///
    /// # Errors
    ///
    /// 符号名或 bundle 种类改变、清单非法或校验失败时返回错误，bundle 保持原样
    pub(crate) async fn install_revision(&self, bundle: &Bundle, deployment: Deployment) -> Result<()> {
        let manifest = BundleManifest::parse(deployment.headers.clone())?;
        let manifest = match manifest.symbolic_name() {
            Some(name) if name != bundle.symbolic_name() => {
                return Err(CoreError::ValidationFailed {
                    location: deployment.location.clone(),
                    reason: format!("更新不能改变符号名: '{}' -> '{}'", bundle.symbolic_name(), name),
                });
            }
            Some(_) => manifest,
            None => manifest.with_symbolic_name(bundle.symbolic_name()),
        };
        if manifest.fragment_host().is_some() != bundle.is_fragment() {
            return Err(CoreError::ValidationFailed {
                location: deployment.location.clone(),
                reason: "更新不能改变 bundle 种类".to_string(),
            });
        }

        let installed = self.installed_identities().await;
        self.validator.validate(
            &deployment.location,
            bundle.symbolic_name(),
            &manifest,
            &installed,
            Some(bundle.id()),
        )?;

        let previous = bundle.current_revision().await;
        let revision = Revision::new(
            bundle.id(),
            bundle.symbolic_name(),
            Arc::new(manifest),
            Arc::new(deployment),
            self.ids.next_revision(),
            previous.update_count() + 1,
        );
        self.registry.add_module(revision.to_resolver_module()).await?;
        self.retire_module(previous.module_id()).await;

        info!(
            bundle_id = bundle.id(),
            module = %revision.module_id(),
            update_count = revision.update_count(),
            "新 revision 已注册"
        );
        bundle.push_revision(revision).await;
        Ok(())
    }

    /// 以新的模块身份重建当前 revision，丢弃全部历史 revision
    pub(crate) async fn renew_revision(&self, bundle: &Bundle) -> Result<()> {
        let current = bundle.current_revision().await;
        let renewed = current.renewed(self.ids.next_revision());
        self.registry.add_module(renewed.to_resolver_module()).await?;

        for old in bundle.replace_revisions(renewed).await {
            self.drop_module(old.module_id()).await;
        }
        bundle.touch().await;
        Ok(())
    }

    /// 模块不再是当前 revision
    async fn retire_module(&self, module: &ModuleId) {
        if self.registry.is_resolved(module).await {
            self.registry.mark_stale(module).await;
        } else if self.registry.remove_module(module).await.is_ok() {
            debug!(module = %module, "移除未解析的旧模块");
        }
    }

    /// 从注册表移除模块，附加在上面的 fragment 回到 INSTALLED
    async fn drop_module(&self, module: &ModuleId) {
        let detached = self.registry.detach_fragments(module).await;
        if self.registry.remove_module(module).await.is_ok() {
            debug!(module = %module, "模块已移除");
        }
        self.mark_unresolved(&detached).await;
    }

    /// 已解析的 bundle 的模块身份回到未解析
    pub(crate) async fn mark_unresolved(&self, modules: &[ModuleId]) {
        for module in modules {
            let Some(bundle) = self.bundle_of_module(module).await else {
                continue;
            };
            if bundle.state() == BundleState::Resolved && &bundle.module_id().await == module {
                bundle.set_state(BundleState::Installed);
                self.events
                    .fire_bundle(BundleEventKind::Unresolved, bundle.id(), bundle.symbolic_name())
                    .await;
            }
        }
    }

    /// 从宿主上分离 fragment，返回被分离的 fragment
    pub(crate) async fn detach_fragments(&self, bundle: &Bundle) -> Vec<ModuleId> {
        let detached = self.registry.detach_fragments(&bundle.module_id().await).await;
        self.mark_unresolved(&detached).await;
        detached
    }

    // ==================== 解析 ====================

    /// 批量解析 bundle，单个失败不影响其它 bundle
    pub async fn resolve_bundles(&self, bundles: &[Arc<Bundle>]) -> ResolutionReport {
        let mut modules = Vec::new();
        for bundle in bundles {
            if bundle.state() == BundleState::Installed {
                modules.push(bundle.module_id().await);
            }
        }
        if modules.is_empty() {
            return ResolutionReport::default();
        }

        let report = self.resolver.resolve_all(&modules).await;
        self.apply_resolution(&report).await;
        for (module, reason) in &report.failures {
            warn!(module = %module, reason = %reason, "bundle 解析失败");
        }
        report
    }

    /// 解析单个 bundle，已解析时直接返回
    ///
    /// # Errors
    ///
    /// 必选需求无法满足时返回 `ResolutionFailed`，bundle 保持 INSTALLED
    pub async fn resolve_bundle(&self, bundle: &Arc<Bundle>) -> Result<()> {
        bundle.ensure_installed()?;
        if bundle.state().is_resolved() {
            return Ok(());
        }

        let module = bundle.module_id().await;
        let report = self.resolver.resolve_all(std::slice::from_ref(&module)).await;
        self.apply_resolution(&report).await;
        match report.failure(&module) {
            Some(reason) => Err(CoreError::ResolutionFailed {
                module: module.to_string(),
                report: reason.to_string(),
            }),
            None if bundle.state().is_resolved() => Ok(()),
            None => Err(CoreError::ResolutionFailed {
                module: module.to_string(),
                report: "没有可附加的宿主".to_string(),
            }),
        }
    }

    /// 把解析结果同步到 bundle 状态
    async fn apply_resolution(&self, report: &ResolutionReport) {
        let fragments = report.attached_fragments.iter().map(|(fragment, _)| fragment);
        for module in report.resolved.iter().chain(fragments) {
            let Some(bundle) = self.bundle_of_module(module).await else {
                continue;
            };
            if bundle.state() == BundleState::Installed && &bundle.module_id().await == module {
                bundle.set_state(BundleState::Resolved);
                info!(bundle_id = bundle.id(), module = %module, "bundle 已解析");
                self.events
                    .fire_bundle(BundleEventKind::Resolved, bundle.id(), bundle.symbolic_name())
                    .await;
            }
        }
    }

    // ==================== 卸载与回收 ====================

    /// 卸载的注册表部分：释放位置、转为 UNINSTALLED、移除或标记模块
    ///
    /// 调用方负责先停止 bundle。返回 bundle 是否已被立即回收。
    pub(crate) async fn remove_bundle(&self, bundle: &Arc<Bundle>) -> Result<bool> {
        bundle.ensure_installed()?;
        self.locations.write().await.remove(bundle.location());
        bundle.set_state(BundleState::Uninstalled);
        info!(bundle_id = bundle.id(), symbolic_name = %bundle.symbolic_name(), "bundle 已卸载");
        self.events
            .fire_bundle(BundleEventKind::Uninstalled, bundle.id(), bundle.symbolic_name())
            .await;

        for module in bundle.module_ids().await {
            self.retire_module(&module).await;
        }
        self.discard_storage(bundle.id()).await;

        if self.has_external_dependents(bundle).await {
            debug!(bundle_id = bundle.id(), "仍有其它模块连线，延迟回收");
            return Ok(false);
        }
        self.purge_bundle(bundle).await;
        Ok(true)
    }

    /// 是否有其它 bundle 的模块连线到该 bundle 的任一 revision
    ///
    /// fragment 附加在未过期的已解析宿主上也算作连线，宿主刷新前不能回收。
    pub async fn has_external_dependents(&self, bundle: &Bundle) -> bool {
        let own = bundle.module_ids().await;
        for module in &own {
            for dependent in self.registry.direct_dependents(module).await {
                if !own.contains(&dependent) {
                    return true;
                }
            }
            if let Some(host) = self.registry.host_of(module).await {
                if !own.contains(&host)
                    && self.registry.is_resolved(&host).await
                    && !self.registry.is_stale(&host).await
                {
                    return true;
                }
            }
        }
        false
    }

    /// 物理移除已卸载的 bundle
    pub(crate) async fn purge_bundle(&self, bundle: &Bundle) {
        for module in bundle.module_ids().await {
            self.drop_module(&module).await;
        }
        self.bundles.write().await.remove(&bundle.id());
        info!(bundle_id = bundle.id(), "bundle 已回收");
    }

    /// 等待回收的 bundle：已卸载未回收，或带有旧 revision
    pub async fn removal_pending(&self) -> Vec<Arc<Bundle>> {
        let mut pending = Vec::new();
        for bundle in self.get_bundles(StateMask::ALL).await {
            if bundle.state() == BundleState::Uninstalled || bundle.has_superseded_revisions().await {
                pending.push(bundle);
            }
        }
        pending
    }

    /// 回收不再被连线的已卸载 bundle 与旧 revision，直到没有进展
    ///
    /// 返回被回收的 bundle ID。
    pub async fn collect_garbage(&self) -> Vec<BundleId> {
        let mut purged = Vec::new();
        loop {
            let mut progress = false;
            for bundle in self.removal_pending().await {
                if bundle.state() == BundleState::Uninstalled {
                    if !self.has_external_dependents(&bundle).await {
                        self.purge_bundle(&bundle).await;
                        purged.push(bundle.id());
                        progress = true;
                    }
                    continue;
                }

                let current = bundle.module_id().await;
                for module in bundle.module_ids().await {
                    if module == current || self.registry.has_active_wires(&module).await {
                        continue;
                    }
                    self.drop_module(&module).await;
                    if bundle.remove_revision(&module).await {
                        debug!(bundle_id = bundle.id(), module = %module, "旧 revision 已回收");
                        progress = true;
                    }
                }
            }
            if !progress {
                break;
            }
        }
        purged
    }

    /// bundle 数量（含等待回收的）
    pub async fn count(&self) -> usize {
        self.bundles.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::metadata::headers;
    use crate::bundle::storage::MemoryStorage;
    use crate::core::ValidationProfile;

    fn manager_with(storage: Arc<dyn BundleStorage>) -> BundleManager {
        let ids = Arc::new(IdGenerator::new());
        BundleManager::new(
            Arc::clone(&ids),
            Arc::new(ModuleRegistry::new()),
            Arc::new(ServiceRegistry::new(ids)),
            Arc::new(EventDispatcher::new()),
            storage,
            BundleValidator::new(ValidationProfile::Lenient),
            1,
        )
    }

    fn manager() -> BundleManager {
        manager_with(Arc::new(MemoryStorage::new()))
    }

    fn deployment(name: &str, version: &str) -> Deployment {
        Deployment::new(format!("mem:{}-{}", name, version))
            .header(headers::MANIFEST_VERSION, "2")
            .header(headers::SYMBOLIC_NAME, name)
            .header(headers::VERSION, version)
    }

    #[tokio::test]
    async fn test_install_is_idempotent_per_location() {
        let manager = manager();
        let first = manager.install_bundle(deployment("a", "1.0.0")).await.unwrap();
        let second = manager.install_bundle(deployment("a", "1.0.0")).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(first.state(), BundleState::Installed);
        assert_eq!(manager.count().await, 1);
        assert!(manager.get_bundle_by_location("mem:a-1.0.0").await.is_some());
    }

    #[tokio::test]
    async fn test_validation_failure_leaves_nothing_behind() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = manager_with(storage.clone());
        let bad = deployment("bad", "1.0.0").header(headers::IMPORT_PACKAGE, "java.lang");
        assert!(matches!(
            manager.install_bundle(bad).await,
            Err(CoreError::ValidationFailed { .. })
        ));
        assert_eq!(manager.count().await, 0);
        assert!(storage.list().await.unwrap().is_empty());
        assert_eq!(manager.registry().count().await, 0);

        manager.install_bundle(deployment("dup", "1.0.0")).await.unwrap();
        let clash = Deployment::new("mem:elsewhere")
            .header(headers::SYMBOLIC_NAME, "dup")
            .header(headers::VERSION, "1.0.0");
        assert!(matches!(
            manager.install_bundle(clash).await,
            Err(CoreError::DuplicateBundle { .. })
        ));
    }

    #[tokio::test]
    async fn test_fragment_kind_and_legacy_name() {
        let manager = manager();
        let fragment = manager
            .install_bundle(deployment("frag", "1.0.0").header(headers::FRAGMENT_HOST, "host"))
            .await
            .unwrap();
        assert_eq!(fragment.kind(), BundleKind::Fragment);

        let legacy = manager
            .install_bundle(Deployment::new("file:/opt/old-tool"))
            .await
            .unwrap();
        assert_eq!(legacy.symbolic_name(), "old-tool");
    }

    #[tokio::test]
    async fn test_resolve_bundles_reports_per_bundle() {
        let manager = manager();
        let api = manager
            .install_bundle(deployment("api", "1.0.0").header(headers::EXPORT_PACKAGE, "p;version=1.0"))
            .await
            .unwrap();
        let user = manager
            .install_bundle(deployment("user", "1.0.0").header(headers::IMPORT_PACKAGE, "p"))
            .await
            .unwrap();
        let broken = manager
            .install_bundle(deployment("broken", "1.0.0").header(headers::IMPORT_PACKAGE, "missing"))
            .await
            .unwrap();

        let report = manager
            .resolve_bundles(&[Arc::clone(&user), Arc::clone(&broken)])
            .await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(api.state(), BundleState::Resolved);
        assert_eq!(user.state(), BundleState::Resolved);
        assert_eq!(broken.state(), BundleState::Installed);
        assert!(matches!(
            manager.resolve_bundle(&broken).await,
            Err(CoreError::ResolutionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_removal_deferred_while_wired() {
        let manager = manager();
        let api = manager
            .install_bundle(deployment("api", "1.0.0").header(headers::EXPORT_PACKAGE, "p"))
            .await
            .unwrap();
        let user = manager
            .install_bundle(deployment("user", "1.0.0").header(headers::IMPORT_PACKAGE, "p"))
            .await
            .unwrap();
        manager.resolve_bundle(&user).await.unwrap();

        assert!(!manager.remove_bundle(&api).await.unwrap());
        assert_eq!(api.state(), BundleState::Uninstalled);
        assert!(manager.get_bundles(StateMask::INSTALLED_ANY).await.iter().all(|b| b.id() != api.id()));
        assert!(manager.get_bundle_by_id(api.id()).await.is_some());
        assert!(manager.collect_garbage().await.is_empty());

        assert!(manager.remove_bundle(&user).await.unwrap());
        assert_eq!(manager.collect_garbage().await, vec![api.id()]);
        assert_eq!(manager.count().await, 0);
        assert_eq!(manager.registry().count().await, 0);
    }

    #[tokio::test]
    async fn test_update_revision_keeps_identity() {
        let manager = manager();
        let bundle = manager.install_bundle(deployment("app", "1.0.0")).await.unwrap();
        manager.resolve_bundle(&bundle).await.unwrap();
        let old = bundle.module_id().await;

        manager
            .install_revision(&bundle, deployment("app", "1.1.0"))
            .await
            .unwrap();
        assert_eq!(bundle.revisions().await.len(), 2);
        assert!(manager.registry().is_stale(&old).await);

        let renamed = deployment("other", "2.0.0");
        assert!(manager.install_revision(&bundle, renamed).await.is_err());

        // 旧 revision 没有连线，回收后只剩当前 revision
        manager.collect_garbage().await;
        assert_eq!(bundle.revisions().await.len(), 1);
        assert_eq!(bundle.version().await, semver::Version::new(1, 1, 0));
    }

    #[tokio::test]
    async fn test_record_restored_for_same_location() {
        let storage = Arc::new(MemoryStorage::new());
        let first = manager_with(storage.clone());
        let bundle = first.install_bundle(deployment("keep", "1.0.0")).await.unwrap();
        bundle.set_persistently_started(true);
        bundle.set_start_level(3);
        first.persist(&bundle).await.unwrap();

        let second = manager_with(storage.clone());
        second.ids().next_bundle_id();
        let again = second.install_bundle(deployment("keep", "1.0.0")).await.unwrap();
        assert_ne!(again.id(), bundle.id());
        assert!(again.is_persistently_started());
        assert_eq!(again.start_level(), 3);
        assert_eq!(storage.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_install_keeps_previous_record() {
        let storage = Arc::new(MemoryStorage::new());
        let mut previous = BundleRecord::new(7, "mem:keep-1.0.0", 4);
        previous.persistently_started = true;
        storage.save(&previous).await.unwrap();

        let manager = manager_with(storage.clone());
        let bad = deployment("keep", "1.0.0").header(headers::IMPORT_PACKAGE, "java.lang");
        assert!(manager.install_bundle(bad).await.is_err());

        let records = storage.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bundle_id, 7);
        assert!(records[0].persistently_started);

        let bundle = manager.install_bundle(deployment("keep", "1.0.0")).await.unwrap();
        assert!(bundle.is_persistently_started());
        assert_eq!(bundle.start_level(), 4);
        let records = storage.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bundle_id, bundle.id());
    }
}
