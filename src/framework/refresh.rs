//! 刷新扫描
//!
//! 从目标 bundle 出发，沿连线图收集全部依赖方（以及附加的 fragment 与宿主），
//! 停止其中运行的 bundle，回收已卸载的 bundle，重建其余 bundle 的 revision，
//! 然后重新解析并重启原先运行的 bundle。

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use super::event::FrameworkEventKind;
use super::system::SYSTEM_BUNDLE_NAME;
use super::FrameworkInner;
use crate::bundle::{Bundle, BundleState, StartOptions};
use crate::resolver::ModuleId;
use crate::utils::{BundleId, CoreError, SYSTEM_BUNDLE_ID};

impl FrameworkInner {
    /// 刷新一组 bundle 及其依赖方，`None` 表示全部等待回收的 bundle
    ///
    /// 返回参与刷新的 bundle ID（升序）。
    #[instrument(skip(self))]
    pub(crate) async fn refresh_bundles(self: &Arc<Self>, targets: Option<Vec<BundleId>>) -> Vec<BundleId> {
        let roots = match targets {
            Some(ids) => {
                let mut roots = Vec::new();
                for id in ids {
                    if let Some(bundle) = self.manager.get_bundle_by_id(id).await {
                        roots.push(bundle);
                    }
                }
                roots
            }
            None => self.manager.removal_pending().await,
        };

        let members = self.refresh_closure(roots).await;
        if members.is_empty() {
            debug!("没有需要刷新的 bundle");
            return Vec::new();
        }
        let ids: Vec<BundleId> = members.iter().map(|b| b.id()).collect();
        info!(bundles = ?ids, "开始刷新");

        // 降序停止，记住需要重启的 bundle
        let mut restart = Vec::new();
        for bundle in members.iter().rev() {
            let _guard = bundle.lock_lifecycle().await;
            if bundle.state().is_stoppable() {
                restart.push(Arc::clone(bundle));
                if let Err(e) = self.deactivate(bundle).await {
                    self.report_error(bundle, &e).await;
                }
            }
        }

        let mut reresolve = Vec::new();
        for bundle in &members {
            let _guard = bundle.lock_lifecycle().await;
            match bundle.state() {
                BundleState::Uninstalled => self.manager.purge_bundle(bundle).await,
                BundleState::Resolved => {
                    reresolve.push(Arc::clone(bundle));
                    if let Err(e) = self.refresh_locked(bundle).await {
                        self.report_error(bundle, &e).await;
                    }
                }
                BundleState::Installed if bundle.has_superseded_revisions().await => {
                    if let Err(e) = self.manager.renew_revision(bundle).await {
                        self.report_error(bundle, &e).await;
                    }
                }
                _ => {}
            }
        }

        let report = self.manager.resolve_bundles(&reresolve).await;
        for (module, reason) in &report.failures {
            if let Some(bundle) = self.manager.bundle_of_module(module).await {
                let error = CoreError::ResolutionFailed {
                    module: module.to_string(),
                    report: reason.clone(),
                };
                self.report_error(&bundle, &error).await;
            }
        }

        restart.reverse();
        for bundle in &restart {
            let _guard = bundle.lock_lifecycle().await;
            if bundle.state() == BundleState::Uninstalled {
                continue;
            }
            let options = StartOptions {
                transient: true,
                activation_policy: bundle.uses_activation_policy(),
            };
            if let Err(e) = self.start_locked(bundle, options).await {
                self.report_error(bundle, &e).await;
            }
        }

        self.manager
            .events()
            .fire_framework(
                FrameworkEventKind::PackagesRefreshed,
                SYSTEM_BUNDLE_ID,
                SYSTEM_BUNDLE_NAME,
                None,
            )
            .await;
        info!(refreshed = ids.len(), restarted = restart.len(), "刷新完成");
        ids
    }

    /// 依赖方闭包（按 ID 升序），不含系统 bundle
    async fn refresh_closure(&self, roots: Vec<Arc<Bundle>>) -> Vec<Arc<Bundle>> {
        let registry = self.manager.registry();
        let mut members: BTreeSet<BundleId> = BTreeSet::new();
        let mut pending: Vec<Arc<Bundle>> = roots;

        while let Some(bundle) = pending.pop() {
            if bundle.is_system() || !members.insert(bundle.id()) {
                continue;
            }

            let modules = bundle.module_ids().await;
            let mut related: BTreeSet<ModuleId> = registry.dependents_closure(&modules).await;
            for module in &modules {
                related.extend(registry.fragments_of(module).await);
                if let Some(host) = registry.host_of(module).await {
                    related.insert(host);
                }
            }

            for module in related {
                if let Some(other) = self.manager.bundle_of_module(&module).await {
                    if !members.contains(&other.id()) {
                        pending.push(other);
                    }
                }
            }
        }

        let mut closure = Vec::new();
        for id in members {
            if id == SYSTEM_BUNDLE_ID {
                continue;
            }
            if let Some(bundle) = self.manager.get_bundle_by_id(id).await {
                closure.push(bundle);
            }
        }
        closure
    }
}
