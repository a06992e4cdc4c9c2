//! 启动级别
//!
//! 框架当前级别在停止时为 0。调整级别时逐级移动：
//! 提升时按 ID 升序启动该级别上持久启动的 bundle，
//! 降低时按 ID 降序停止该级别上的 bundle。

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info};

use super::event::FrameworkEventKind;
use super::system::SYSTEM_BUNDLE_NAME;
use super::FrameworkInner;
use crate::bundle::{Bundle, StartOptions, StateMask};
use crate::utils::{CoreError, Result, SYSTEM_BUNDLE_ID};

impl FrameworkInner {
    /// 把框架级别移动到 `target`，逐级执行；单个 bundle 的失败以框架错误事件报告
    pub(crate) async fn change_start_level(self: &Arc<Self>, target: u32) {
        let _guard = self.level_lock.lock().await;
        let from = self.active_level();
        if from == target {
            return;
        }
        info!(from, to = target, "调整启动级别");

        while self.active_level() < target {
            let level = self.active_level() + 1;
            self.active_level.store(level, Ordering::SeqCst);
            self.start_level_bundles(level).await;
        }
        while self.active_level() > target {
            let level = self.active_level();
            self.stop_level_bundles(level).await;
            self.active_level.store(level - 1, Ordering::SeqCst);
        }

        self.manager
            .events()
            .fire_framework(
                FrameworkEventKind::StartLevelChanged,
                SYSTEM_BUNDLE_ID,
                SYSTEM_BUNDLE_NAME,
                Some(format!("{} -> {}", from, target)),
            )
            .await;
    }

    /// 参与启动级别管理的 bundle（不含系统 bundle 与 fragment）
    async fn level_members(&self, level: u32) -> Vec<Arc<Bundle>> {
        self.manager
            .get_bundles(StateMask::INSTALLED_ANY)
            .await
            .into_iter()
            .filter(|b| !b.is_system() && !b.is_fragment() && b.start_level() == level)
            .collect()
    }

    async fn start_level_bundles(self: &Arc<Self>, level: u32) {
        for bundle in self.level_members(level).await {
            if !bundle.is_persistently_started() {
                continue;
            }
            debug!(bundle_id = bundle.id(), level, "按启动级别启动");
            let _guard = bundle.lock_lifecycle().await;
            let options = StartOptions {
                transient: true,
                activation_policy: bundle.uses_activation_policy(),
            };
            if let Err(e) = self.start_locked(&bundle, options).await {
                self.report_error(&bundle, &e).await;
            }
        }
    }

    async fn stop_level_bundles(&self, level: u32) {
        for bundle in self.level_members(level).await.into_iter().rev() {
            if !bundle.state().is_stoppable() {
                continue;
            }
            debug!(bundle_id = bundle.id(), level, "按启动级别停止");
            let _guard = bundle.lock_lifecycle().await;
            if let Err(e) = self.deactivate(&bundle).await {
                self.report_error(&bundle, &e).await;
            }
        }
    }

    /// 修改 bundle 的启动级别，跨越框架当前级别时随之启动或停止
    pub(crate) async fn set_bundle_start_level(self: &Arc<Self>, bundle: &Arc<Bundle>, level: u32) -> Result<()> {
        if bundle.is_system() || level == 0 {
            return Err(CoreError::illegal_state(bundle.id(), "启动级别 0 保留给系统 bundle"));
        }

        let _levels = self.level_lock.lock().await;
        let _guard = bundle.lock_lifecycle().await;
        bundle.ensure_installed()?;
        let previous = bundle.start_level();
        bundle.set_start_level(level);
        bundle.touch().await;
        self.manager.persist(bundle).await?;
        info!(bundle_id = bundle.id(), from = previous, to = level, "bundle 启动级别已修改");

        if bundle.is_fragment() {
            return Ok(());
        }
        let active = self.active_level();
        if level > active && bundle.state().is_stoppable() {
            if let Err(e) = self.deactivate(bundle).await {
                self.report_error(bundle, &e).await;
            }
        } else if level <= active && bundle.is_persistently_started() && !bundle.state().is_stoppable() {
            let options = StartOptions {
                transient: true,
                activation_policy: bundle.uses_activation_policy(),
            };
            if let Err(e) = self.start_locked(bundle, options).await {
                self.report_error(bundle, &e).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::bundle::metadata::headers;
    use crate::bundle::{BundleState, Deployment, StartOptions};
    use crate::framework::event::{Event, EventCallback, EventFilter, FrameworkEventKind};
    use crate::framework::Framework;
    use crate::CoreConfig;
    use std::sync::{Arc, Mutex};

    fn at_level(name: &str, level: u32) -> Deployment {
        Deployment::new(format!("mem:{}", name))
            .header(headers::SYMBOLIC_NAME, name)
            .header(headers::VERSION, "1.0.0")
            .start_level(level)
    }

    #[tokio::test]
    async fn test_levels_start_and_stop_in_order() {
        let framework = Framework::builder().build().await.unwrap();
        framework.start().await.unwrap();

        let low = framework.install_bundle(at_level("low", 2)).await.unwrap();
        let high = framework.install_bundle(at_level("high", 3)).await.unwrap();
        for bundle in [&low, &high] {
            framework.start_bundle(bundle.id(), StartOptions::default()).await.unwrap();
            assert_eq!(bundle.state(), BundleState::Installed);
        }

        let changes = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&changes);
        let callback: EventCallback = Arc::new(move |event: Event| {
            if matches!(event.as_framework(), Some(e) if e.kind == FrameworkEventKind::StartLevelChanged) {
                *sink.lock().unwrap() += 1;
            }
        });
        framework.subscribe(EventFilter::Framework, callback).await;

        framework.set_start_level(3).await.unwrap();
        assert_eq!(framework.start_level(), 3);
        assert_eq!(low.state(), BundleState::Active);
        assert_eq!(high.state(), BundleState::Active);

        framework.set_start_level(2).await.unwrap();
        assert_eq!(low.state(), BundleState::Active);
        assert_eq!(high.state(), BundleState::Resolved);
        // 按级别停止不清除持久启动标记
        assert!(high.is_persistently_started());
        assert_eq!(*changes.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_bundle_level_change_crosses_active_level() {
        let config = CoreConfig::builder().beginning_start_level(2).build();
        let framework = Framework::builder().config(config).build().await.unwrap();
        framework.start().await.unwrap();

        let bundle = framework.install_bundle(at_level("moving", 1)).await.unwrap();
        framework.start_bundle(bundle.id(), StartOptions::default()).await.unwrap();
        assert_eq!(bundle.state(), BundleState::Active);

        framework.set_bundle_start_level(bundle.id(), 4).await.unwrap();
        assert_eq!(bundle.state(), BundleState::Resolved);
        assert_eq!(bundle.start_level(), 4);

        framework.set_bundle_start_level(bundle.id(), 2).await.unwrap();
        assert_eq!(bundle.state(), BundleState::Active);

        assert!(framework.set_bundle_start_level(bundle.id(), 0).await.is_err());
    }
}
