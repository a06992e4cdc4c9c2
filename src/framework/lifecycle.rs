//! bundle 生命周期操作
//!
//! 每个操作在 bundle 的生命周期锁下执行，状态转换与事件顺序：
//!
//! - 启动：RESOLVED → STARTING → ACTIVE，激活器失败时经 STOPPING 回到 RESOLVED
//! - 懒启动：RESOLVED → STARTING（等待首次类加载）
//! - 停止：ACTIVE/STARTING → STOPPING → RESOLVED，清理总是先于报告停止钩子的错误
//! - 更新：停止 → INSTALLED → 新 revision → UPDATED → 按需重启
//! - 卸载：停止 → UNINSTALLED，无外部连线时立即回收

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error, info, instrument, warn};

use super::event::BundleEventKind;
use super::FrameworkInner;
use crate::bundle::{
    Bundle, BundleContext, BundleKind, BundleState, Deployment, StartOptions, StopOptions,
};
use crate::resolver::{ActivationHook, ModuleId};
use crate::utils::{CoreError, Result};

impl FrameworkInner {
    // ==================== 启动 ====================

    /// 启动 bundle；系统 bundle 表示启动框架
    pub(crate) async fn start_bundle(self: &Arc<Self>, bundle: &Arc<Bundle>, options: StartOptions) -> Result<()> {
        match bundle.kind() {
            BundleKind::Fragment => return Err(fragment_error(bundle, "start")),
            BundleKind::System => return self.startup().await,
            BundleKind::Host => {}
        }
        let _guard = bundle.lock_lifecycle().await;
        self.start_locked(bundle, options).await
    }

    /// 持有生命周期锁时的启动流程
    ///
    /// 非瞬时启动先记录持久启动标记；启动级别不足时瞬时启动失败，
    /// 非瞬时启动推迟到框架级别提升时。
    #[instrument(skip(self, bundle), fields(bundle_id = bundle.id()))]
    pub(crate) async fn start_locked(self: &Arc<Self>, bundle: &Arc<Bundle>, options: StartOptions) -> Result<()> {
        bundle.ensure_installed()?;
        if bundle.state() == BundleState::Active {
            debug!("bundle 已处于 ACTIVE");
            return Ok(());
        }

        if !options.transient {
            bundle.set_persistently_started(true);
            bundle.set_uses_activation_policy(options.activation_policy);
            self.manager.persist(bundle).await?;
        }

        let framework_level = self.active_level();
        if bundle.start_level() > framework_level {
            if options.transient {
                return Err(CoreError::StartLevel {
                    bundle_id: bundle.id(),
                    bundle_level: bundle.start_level(),
                    framework_level,
                });
            }
            debug!(bundle_level = bundle.start_level(), framework_level, "启动级别不足，推迟启动");
            return Ok(());
        }

        self.manager.resolve_bundle(bundle).await?;

        let lazy = options.activation_policy && bundle.current_revision().await.manifest().is_lazy();
        if lazy {
            if bundle.is_lazy_pending() {
                return Ok(());
            }
            return self.prepare_lazy(bundle).await;
        }

        if bundle.take_lazy_pending() {
            self.manager
                .registry()
                .clear_activation_hook(&bundle.module_id().await)
                .await;
        }
        self.activate(bundle).await
    }

    /// 懒启动：创建上下文、进入 STARTING，并安装首次类加载钩子
    async fn prepare_lazy(self: &Arc<Self>, bundle: &Arc<Bundle>) -> Result<()> {
        let module = bundle.module_id().await;
        let inner = Arc::downgrade(self);
        let target = Arc::downgrade(bundle);
        let hook: ActivationHook = Arc::new(move |_: ModuleId| -> BoxFuture<'static, ()> {
            let inner = inner.clone();
            let target = target.clone();
            Box::pin(async move {
                if let (Some(inner), Some(bundle)) = (inner.upgrade(), target.upgrade()) {
                    inner.trigger_lazy_activation(&bundle).await;
                }
            })
        });
        self.manager.registry().set_activation_hook(&module, hook).await?;

        if let Err(e) = self.ensure_context(bundle).await {
            self.manager.registry().clear_activation_hook(&module).await;
            return Err(e);
        }
        bundle.set_lazy_pending(true);
        bundle.set_state(BundleState::Starting);
        info!(bundle_id = bundle.id(), module = %module, "等待首次类加载触发激活");
        self.manager
            .events()
            .fire_bundle(BundleEventKind::LazyActivation, bundle.id(), bundle.symbolic_name())
            .await;
        Ok(())
    }

    /// 首次类加载触发的激活，只有消费到懒激活标记的调用方执行
    pub(crate) async fn trigger_lazy_activation(self: &Arc<Self>, bundle: &Arc<Bundle>) {
        let _guard = bundle.lock_lifecycle().await;
        if !bundle.take_lazy_pending() {
            return;
        }
        if let Err(e) = self.activate(bundle).await {
            self.report_error(bundle, &e).await;
        }
    }

    /// STARTING → 激活器 start → ACTIVE
    ///
    /// 激活器失败时 bundle 经 STOPPING 回到 RESOLVED，并返回包装后的原始错误。
    async fn activate(&self, bundle: &Arc<Bundle>) -> Result<()> {
        let events = self.manager.events();
        bundle.set_state(BundleState::Starting);
        events
            .fire_bundle(BundleEventKind::Starting, bundle.id(), bundle.symbolic_name())
            .await;

        match self.run_activator(bundle).await {
            Ok(()) => {
                bundle.set_state(BundleState::Active);
                info!(bundle_id = bundle.id(), symbolic_name = %bundle.symbolic_name(), "bundle 已启动");
                events
                    .fire_bundle(BundleEventKind::Started, bundle.id(), bundle.symbolic_name())
                    .await;
                Ok(())
            }
            Err(e) => {
                error!(bundle_id = bundle.id(), error = %e, "bundle 激活失败");
                bundle.set_state(BundleState::Stopping);
                events
                    .fire_bundle(BundleEventKind::Stopping, bundle.id(), bundle.symbolic_name())
                    .await;
                self.cleanup(bundle).await;
                bundle.set_state(BundleState::Resolved);
                events
                    .fire_bundle(BundleEventKind::Stopped, bundle.id(), bundle.symbolic_name())
                    .await;
                Err(e)
            }
        }
    }

    async fn run_activator(&self, bundle: &Arc<Bundle>) -> Result<()> {
        let context = self.ensure_context(bundle).await?;
        let revision = bundle.current_revision().await;
        let Some(class_name) = revision.manifest().activator_class_name() else {
            return Ok(());
        };

        let mut activator = self.activators.create(bundle.symbolic_name(), class_name).await?;
        match activator.start(Arc::clone(&context)).await {
            Ok(()) => {
                bundle.set_activator(Some(activator)).await;
                Ok(())
            }
            Err(source) => {
                if let Err(stop_error) = activator.stop(context).await {
                    warn!(bundle_id = bundle.id(), error = %stop_error, "启动失败后的停止钩子也失败");
                }
                Err(CoreError::ActivationFailed {
                    symbolic_name: bundle.symbolic_name().to_string(),
                    source,
                })
            }
        }
    }

    /// 取得现有上下文，没有时创建
    async fn ensure_context(&self, bundle: &Arc<Bundle>) -> Result<Arc<BundleContext>> {
        if let Some(context) = bundle.context().await {
            return Ok(context);
        }
        let context = self.new_context(bundle);
        bundle.attach_context(Arc::clone(&context)).await?;
        Ok(context)
    }

    /// 停止时的资源清理：服务、使用记录、监听器、上下文、懒激活钩子
    async fn cleanup(&self, bundle: &Arc<Bundle>) {
        let services = self.manager.services();
        let unregistered = services.unregister_all(bundle).await;
        let released = services.release_all(bundle).await;
        let listeners = self.manager.events().unsubscribe_all(bundle.id()).await;
        if let Some(context) = bundle.detach_context().await {
            context.invalidate();
        }
        bundle.set_lazy_pending(false);
        self.manager
            .registry()
            .clear_activation_hook(&bundle.module_id().await)
            .await;
        debug!(bundle_id = bundle.id(), unregistered, released, listeners, "bundle 资源已清理");
    }

    // ==================== 停止 ====================

    /// 停止 bundle；系统 bundle 表示异步停止框架
    pub(crate) async fn stop_bundle(self: &Arc<Self>, bundle: &Arc<Bundle>, options: StopOptions) -> Result<()> {
        match bundle.kind() {
            BundleKind::Fragment => return Err(fragment_error(bundle, "stop")),
            BundleKind::System => {
                self.request_stop();
                return Ok(());
            }
            BundleKind::Host => {}
        }

        let _guard = bundle.lock_lifecycle().await;
        bundle.ensure_installed()?;
        if !options.transient {
            bundle.set_persistently_started(false);
            self.manager.persist(bundle).await?;
        }
        self.deactivate(bundle).await
    }

    /// ACTIVE/STARTING → STOPPING → RESOLVED，其它状态不做任何事
    ///
    /// 停止钩子的错误在清理完成、状态稳定后返回。
    pub(crate) async fn deactivate(&self, bundle: &Arc<Bundle>) -> Result<()> {
        let previous = bundle.state();
        if !previous.is_stoppable() {
            return Ok(());
        }

        let events = self.manager.events();
        bundle.set_state(BundleState::Stopping);
        events
            .fire_bundle(BundleEventKind::Stopping, bundle.id(), bundle.symbolic_name())
            .await;

        let mut failure = None;
        if previous == BundleState::Active {
            if let (Some(mut activator), Some(context)) = (bundle.take_activator().await, bundle.context().await) {
                if let Err(e) = activator.stop(context).await {
                    error!(bundle_id = bundle.id(), error = %e, "停止钩子失败");
                    failure = Some(e);
                }
            }
        }

        self.cleanup(bundle).await;
        bundle.set_state(BundleState::Resolved);
        info!(bundle_id = bundle.id(), symbolic_name = %bundle.symbolic_name(), "bundle 已停止");
        events
            .fire_bundle(BundleEventKind::Stopped, bundle.id(), bundle.symbolic_name())
            .await;

        match failure {
            Some(source) => Err(CoreError::DeactivationFailed {
                symbolic_name: bundle.symbolic_name().to_string(),
                source,
            }),
            None => Ok(()),
        }
    }

    // ==================== 更新 ====================

    /// 更新 bundle
    ///
    /// 内容来源依次为：传入的部署、清单中的更新位置、当前 revision 的部署。
    /// 重启失败以框架错误事件报告。
    #[instrument(skip(self, bundle, deployment), fields(bundle_id = bundle.id()))]
    pub(crate) async fn update_bundle(
        self: &Arc<Self>,
        bundle: &Arc<Bundle>,
        deployment: Option<Deployment>,
    ) -> Result<()> {
        match bundle.kind() {
            BundleKind::Fragment => return Err(fragment_error(bundle, "update")),
            BundleKind::System => {
                return Err(CoreError::illegal_state(bundle.id(), "系统 bundle 不支持更新"));
            }
            BundleKind::Host => {}
        }

        let _guard = bundle.lock_lifecycle().await;
        bundle.ensure_installed()?;
        let deployment = match deployment {
            Some(deployment) => deployment,
            None => self.update_source(bundle).await?,
        };

        let was_active = matches!(
            bundle.state(),
            BundleState::Starting | BundleState::Active | BundleState::Stopping
        );
        if let Err(e) = self.deactivate(bundle).await {
            self.report_error(bundle, &e).await;
        }

        let events = self.manager.events();
        if bundle.state() == BundleState::Resolved {
            bundle.set_state(BundleState::Installed);
            events
                .fire_bundle(BundleEventKind::Unresolved, bundle.id(), bundle.symbolic_name())
                .await;
        }

        if let Err(e) = self.manager.install_revision(bundle, deployment).await {
            warn!(error = %e, "更新失败，保留当前 revision");
            if self.manager.registry().is_resolved(&bundle.module_id().await).await {
                bundle.set_state(BundleState::Resolved);
                events
                    .fire_bundle(BundleEventKind::Resolved, bundle.id(), bundle.symbolic_name())
                    .await;
            }
            if was_active {
                self.restart(bundle).await;
            }
            return Err(e);
        }

        info!(version = %bundle.version().await, "bundle 已更新");
        events
            .fire_bundle(BundleEventKind::Updated, bundle.id(), bundle.symbolic_name())
            .await;
        if was_active {
            self.restart(bundle).await;
        }
        Ok(())
    }

    /// 没有传入部署时的更新来源
    async fn update_source(&self, bundle: &Bundle) -> Result<Deployment> {
        let revision = bundle.current_revision().await;
        match revision.manifest().update_location() {
            Some(descriptor) => {
                debug!(descriptor, "从更新位置加载");
                let mut deployment = Deployment::from_descriptor(descriptor).await?;
                deployment.location = bundle.location().to_string();
                Ok(deployment)
            }
            None => Ok(revision.deployment().as_ref().clone()),
        }
    }

    /// 操作中断后的重启，失败以框架错误事件报告
    async fn restart(self: &Arc<Self>, bundle: &Arc<Bundle>) {
        let options = StartOptions {
            transient: true,
            activation_policy: bundle.uses_activation_policy(),
        };
        if let Err(e) = self.start_locked(bundle, options).await {
            self.report_error(bundle, &e).await;
        }
    }

    // ==================== 卸载与刷新 ====================

    /// 卸载 bundle，先执行停止流程
    pub(crate) async fn uninstall_bundle(&self, bundle: &Arc<Bundle>) -> Result<()> {
        if bundle.is_system() {
            return Err(CoreError::illegal_state(bundle.id(), "系统 bundle 不能卸载"));
        }

        let _guard = bundle.lock_lifecycle().await;
        bundle.ensure_installed()?;
        if let Err(e) = self.deactivate(bundle).await {
            self.report_error(bundle, &e).await;
        }
        let purged = self.manager.remove_bundle(bundle).await?;
        debug!(bundle_id = bundle.id(), purged, "卸载完成");
        Ok(())
    }

    /// 刷新单个 RESOLVED 的 bundle
    pub(crate) async fn refresh_bundle(&self, bundle: &Arc<Bundle>) -> Result<()> {
        if bundle.is_system() {
            return Err(CoreError::illegal_state(bundle.id(), "系统 bundle 不能刷新"));
        }
        let _guard = bundle.lock_lifecycle().await;
        self.refresh_locked(bundle).await
    }

    /// RESOLVED → INSTALLED：丢弃旧 revision，以新的模块身份重建当前 revision
    pub(crate) async fn refresh_locked(&self, bundle: &Arc<Bundle>) -> Result<()> {
        if bundle.state() != BundleState::Resolved {
            return Err(CoreError::illegal_state(
                bundle.id(),
                format!("只有 RESOLVED 的 bundle 可以刷新，当前为 {}", bundle.state()),
            ));
        }
        if !bundle.is_fragment() {
            self.manager.detach_fragments(bundle).await;
        }
        self.manager.renew_revision(bundle).await?;

        bundle.set_state(BundleState::Installed);
        info!(bundle_id = bundle.id(), module = %bundle.module_id().await, "bundle 已刷新");
        self.manager
            .events()
            .fire_bundle(BundleEventKind::Unresolved, bundle.id(), bundle.symbolic_name())
            .await;
        Ok(())
    }
}

fn fragment_error(bundle: &Bundle, operation: &str) -> CoreError {
    CoreError::FragmentOperation {
        bundle_id: bundle.id(),
        operation: operation.to_string(),
    }
}
