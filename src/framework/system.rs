//! 系统 bundle
//!
//! 系统 bundle 代表运行时本身，ID 固定为 0，导出配置中的系统包。
//! 它的启动与停止就是框架的启动与停止。

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use super::event::{BundleEventKind, FrameworkEventKind};
use super::{FrameworkInner, StopHandle};
use crate::bundle::metadata::headers;
use crate::bundle::{Bundle, BundleKind, BundleManifest, BundleState, Deployment, Revision, StateMask};
use crate::core::FrameworkConfig;
use crate::utils::{CoreError, IdGenerator, Result, SYSTEM_BUNDLE_ID};

/// 系统 bundle 符号名
pub const SYSTEM_BUNDLE_NAME: &str = "system.bundle";

/// 系统 bundle 位置
pub const SYSTEM_BUNDLE_LOCATION: &str = "System Bundle";

/// 构建系统 bundle，状态为 UNINSTALLED，由管理器注册
pub(crate) fn system_bundle(config: &FrameworkConfig, ids: &IdGenerator) -> Result<Bundle> {
    let mut deployment = Deployment::new(SYSTEM_BUNDLE_LOCATION)
        .header(headers::MANIFEST_VERSION, "2")
        .header(headers::SYMBOLIC_NAME, SYSTEM_BUNDLE_NAME)
        .header(headers::VERSION, env!("CARGO_PKG_VERSION"));
    if !config.system_packages.is_empty() {
        deployment = deployment.header(headers::EXPORT_PACKAGE, config.system_packages.join(","));
    }

    let manifest = BundleManifest::parse(deployment.headers.clone())?;
    let revision = Revision::new(
        SYSTEM_BUNDLE_ID,
        SYSTEM_BUNDLE_NAME,
        Arc::new(manifest),
        Arc::new(deployment),
        ids.next_revision(),
        0,
    );
    Ok(Bundle::new(SYSTEM_BUNDLE_LOCATION, BundleKind::System, revision, 0))
}

impl FrameworkInner {
    // ==================== 启动 ====================

    /// 启动框架
    ///
    /// 已运行时直接返回；正在启动或停止时返回 `IllegalState`。
    #[instrument(skip(self))]
    pub(crate) async fn startup(self: &Arc<Self>) -> Result<()> {
        match self.system.state() {
            BundleState::Active => return Ok(()),
            BundleState::Starting | BundleState::Stopping => {
                return Err(CoreError::illegal_state(SYSTEM_BUNDLE_ID, "框架正在启动或停止"));
            }
            _ => {}
        }
        if !self
            .system
            .compare_and_set_state(BundleState::Resolved, BundleState::Starting)
        {
            return Err(CoreError::illegal_state(SYSTEM_BUNDLE_ID, "框架状态已改变"));
        }
        self.state_tx.send_replace(BundleState::Starting);
        info!("框架启动中");
        self.manager
            .events()
            .fire_bundle(BundleEventKind::Starting, SYSTEM_BUNDLE_ID, SYSTEM_BUNDLE_NAME)
            .await;

        if self.system.context().await.is_none() {
            self.system.attach_context(self.new_context(&self.system)).await?;
        }

        if let Err(e) = self.start_plugins().await {
            self.release_system_context().await;
            self.set_system_state(BundleState::Resolved);
            return Err(e);
        }

        self.install_configured_bundles().await;
        self.resolve_installed().await;
        self.change_start_level(self.config.framework.beginning_start_level.max(1))
            .await;

        self.set_system_state(BundleState::Active);
        info!(start_level = self.active_level(), "框架已启动");
        let events = self.manager.events();
        events
            .fire_bundle(BundleEventKind::Started, SYSTEM_BUNDLE_ID, SYSTEM_BUNDLE_NAME)
            .await;
        events
            .fire_framework(FrameworkEventKind::Started, SYSTEM_BUNDLE_ID, SYSTEM_BUNDLE_NAME, None)
            .await;
        Ok(())
    }

    /// 按顺序启动插件，失败时逆序停止已启动的插件
    async fn start_plugins(self: &Arc<Self>) -> Result<()> {
        let framework = self.handle();
        for (index, plugin) in self.plugins.iter().enumerate() {
            debug!(plugin = plugin.name(), "启动插件");
            if let Err(e) = plugin.start(&framework).await {
                error!(plugin = plugin.name(), error = %e, "插件启动失败");
                for started in self.plugins[..index].iter().rev() {
                    if let Err(stop_error) = started.stop(&framework).await {
                        warn!(plugin = started.name(), error = %stop_error, "回滚时插件停止失败");
                    }
                }
                return Err(CoreError::InitFailed(format!("插件 '{}' 启动失败: {}", plugin.name(), e)));
            }
        }
        Ok(())
    }

    /// 安装 `bundle_dirs` 中的描述文件，并标记需要自动启动的 bundle
    async fn install_configured_bundles(&self) {
        let auto_start: BTreeSet<&str> = self
            .config
            .bundles
            .auto_start
            .iter()
            .map(String::as_str)
            .collect();

        for dir in &self.config.bundles.bundle_dirs {
            let deployments = match Deployment::scan_dir(dir).await {
                Ok(deployments) => deployments,
                Err(e) => {
                    self.report_error(&self.system, &e).await;
                    continue;
                }
            };
            for deployment in deployments {
                let flagged = deployment.auto_start;
                match self.manager.install_bundle(deployment).await {
                    Ok(bundle) => {
                        if flagged && !bundle.is_fragment() && !bundle.is_persistently_started() {
                            self.mark_auto_start(&bundle).await;
                        }
                    }
                    Err(e) => self.report_error(&self.system, &e).await,
                }
            }
        }

        if auto_start.is_empty() {
            return;
        }
        for bundle in self.manager.get_bundles(StateMask::INSTALLED_ANY).await {
            if bundle.is_system() || bundle.is_fragment() || bundle.is_persistently_started() {
                continue;
            }
            if auto_start.contains(bundle.symbolic_name()) {
                self.mark_auto_start(&bundle).await;
            }
        }
    }

    async fn mark_auto_start(&self, bundle: &Bundle) {
        bundle.set_persistently_started(true);
        debug!(bundle_id = bundle.id(), "标记为自动启动");
        if let Err(e) = self.manager.persist(bundle).await {
            self.report_error(bundle, &e).await;
        }
    }

    /// 批量解析全部 INSTALLED 的 bundle，失败记为警告事件
    async fn resolve_installed(&self) {
        let installed = self.manager.get_bundles(BundleState::Installed.into()).await;
        if installed.is_empty() {
            return;
        }
        let report = self.manager.resolve_bundles(&installed).await;
        for (module, reason) in &report.failures {
            let bundle = self.manager.bundle_of_module(module).await;
            let (bundle_id, name) = match &bundle {
                Some(bundle) => (bundle.id(), bundle.symbolic_name()),
                None => (SYSTEM_BUNDLE_ID, SYSTEM_BUNDLE_NAME),
            };
            self.manager
                .events()
                .fire_framework(
                    FrameworkEventKind::Warning,
                    bundle_id,
                    name,
                    Some(format!("{} 无法解析: {}", module, reason)),
                )
                .await;
        }
    }

    // ==================== 停止 ====================

    /// 在后台任务中停止框架
    ///
    /// 框架处于 ACTIVE 时在返回前就进入 STOPPING，之后的 `wait_for_stop` 一定会等待。
    /// 框架正在启动时等待启动完成后再停止；正在停止时等待那次停止结束。
    pub(crate) fn request_stop(self: &Arc<Self>) -> StopHandle {
        let inner = Arc::clone(self);
        if inner.begin_stopping() {
            let handle = tokio::spawn(async move { inner.shutdown().await });
            return StopHandle { handle };
        }

        let handle = tokio::spawn(async move {
            let mut rx = inner.state_tx.subscribe();
            loop {
                if inner.begin_stopping() {
                    inner.shutdown().await;
                    return;
                }
                let current = inner.system.state();
                let settled = match current {
                    BundleState::Starting | BundleState::Stopping => {
                        rx.wait_for(|s| *s != current).await.is_ok()
                    }
                    _ => false,
                };
                if !settled || current == BundleState::Stopping {
                    debug!(state = %current, "框架未运行，停止请求结束");
                    return;
                }
            }
        });
        StopHandle { handle }
    }

    /// ACTIVE → STOPPING，成功时立即通知等待者
    fn begin_stopping(&self) -> bool {
        if !self
            .system
            .compare_and_set_state(BundleState::Active, BundleState::Stopping)
        {
            return false;
        }
        self.state_tx.send_replace(BundleState::Stopping);
        true
    }

    /// 停止序列：启动级别降到 0，逆序停止插件，系统 bundle 回到 RESOLVED
    async fn shutdown(self: &Arc<Self>) {
        info!("框架停止中");
        let events = self.manager.events();
        events
            .fire_bundle(BundleEventKind::Stopping, SYSTEM_BUNDLE_ID, SYSTEM_BUNDLE_NAME)
            .await;

        self.change_start_level(0).await;

        let framework = self.handle();
        for plugin in self.plugins.iter().rev() {
            debug!(plugin = plugin.name(), "停止插件");
            if let Err(e) = plugin.stop(&framework).await {
                let error = CoreError::Other(e.context(format!("插件 '{}' 停止失败", plugin.name())));
                self.report_error(&self.system, &error).await;
            }
        }

        self.release_system_context().await;

        events
            .fire_bundle(BundleEventKind::Stopped, SYSTEM_BUNDLE_ID, SYSTEM_BUNDLE_NAME)
            .await;
        events
            .fire_framework(FrameworkEventKind::Stopped, SYSTEM_BUNDLE_ID, SYSTEM_BUNDLE_NAME, None)
            .await;
        self.set_system_state(BundleState::Resolved);
        info!("框架已停止");
    }

    /// 释放系统 bundle 的服务并销毁其上下文，框架级订阅保留
    async fn release_system_context(&self) {
        let services = self.manager.services();
        services.unregister_all(&self.system).await;
        services.release_all(&self.system).await;
        if let Some(context) = self.system.detach_context().await {
            context.invalidate();
        }
    }
}
