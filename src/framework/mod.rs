//! 框架
//!
//! [`Framework`] 是运行时的对外入口：持有系统 bundle、bundle 管理器、
//! 激活器注册表与插件，并提供完整的生命周期操作集合。
//!
//! # 示例
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use chips_bundles::{CoreConfig, Deployment, Framework, StartOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let framework = Framework::builder().config(CoreConfig::default()).build().await?;
//!     framework.start().await?;
//!
//!     let bundle = framework
//!         .install_bundle(
//!             Deployment::new("mem:hello")
//!                 .header("Bundle-SymbolicName", "hello")
//!                 .header("Bundle-Version", "1.0.0"),
//!         )
//!         .await?;
//!     framework.start_bundle(bundle.id(), StartOptions::default()).await?;
//!
//!     framework.stop();
//!     framework.wait_for_stop(Duration::from_secs(5)).await;
//!     Ok(())
//! }
//! ```

pub mod event;
mod lifecycle;
mod refresh;
mod start_level;
mod system;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bundle::{
    ActivatorRegistry, Bundle, BundleContext, BundleManager, BundleState, BundleStorage, BundleValidator,
    Deployment, FileStorage, MemoryStorage, ServiceRegistry, StartOptions, StateMask, StopOptions,
};
use crate::core::CoreConfig;
use crate::resolver::ModuleRegistry;
use crate::utils::{BundleId, CoreError, IdGenerator, Result};
use event::{EventCallback, EventDispatcher, EventFilter};

pub use event::{BundleEvent, BundleEventKind, DispatchStats, Event, FrameworkEvent, FrameworkEventKind};
pub use system::{SYSTEM_BUNDLE_LOCATION, SYSTEM_BUNDLE_NAME};

// ============================================================================
// 插件与停止句柄
// ============================================================================

/// 框架插件
///
/// 插件按注册顺序在 bundle 启动前启动，按相反顺序在 bundle 全部停止后停止。
#[async_trait]
pub trait FrameworkPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self, framework: &Framework) -> anyhow::Result<()>;

    async fn stop(&self, framework: &Framework) -> anyhow::Result<()>;
}

/// `wait_for_stop` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStatus {
    /// 框架已停止
    Stopped,
    /// 等待超时，框架仍在转换状态
    WaitTimedOut,
    /// 框架处于运行状态
    Running,
}

/// 异步停止任务的句柄
///
/// 停止一旦开始不可取消。
pub struct StopHandle {
    handle: JoinHandle<()>,
}

impl StopHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// 等待停止任务结束
    pub async fn join(self) -> Result<()> {
        self.handle
            .await
            .map_err(|e| CoreError::Internal(format!("停止任务异常结束: {}", e)))
    }
}

// ============================================================================
// 框架
// ============================================================================

pub(crate) struct FrameworkInner {
    pub(crate) config: CoreConfig,
    pub(crate) manager: Arc<BundleManager>,
    pub(crate) activators: Arc<ActivatorRegistry>,
    pub(crate) plugins: Vec<Arc<dyn FrameworkPlugin>>,
    pub(crate) properties: Arc<BTreeMap<String, String>>,
    pub(crate) system: Arc<Bundle>,
    /// 当前生效的启动级别，停止时为 0
    pub(crate) active_level: AtomicU32,
    /// 串行化启动级别调整
    pub(crate) level_lock: Mutex<()>,
    pub(crate) state_tx: watch::Sender<BundleState>,
}

impl FrameworkInner {
    pub(crate) fn handle(self: &Arc<Self>) -> Framework {
        Framework {
            inner: Arc::clone(self),
        }
    }

    pub(crate) fn active_level(&self) -> u32 {
        self.active_level.load(Ordering::SeqCst)
    }

    /// 修改系统 bundle 状态并通知等待者
    pub(crate) fn set_system_state(&self, state: BundleState) {
        self.system.set_state(state);
        self.state_tx.send_replace(state);
    }

    pub(crate) fn new_context(&self, bundle: &Arc<Bundle>) -> Arc<BundleContext> {
        Arc::new(BundleContext::new(
            bundle,
            Arc::clone(self.manager.services()),
            Arc::clone(self.manager.events()),
            Arc::clone(self.manager.registry()),
            Arc::clone(&self.properties),
        ))
    }

    /// 框架发起的操作中出现的错误以框架事件报告
    pub(crate) async fn report_error(&self, bundle: &Bundle, error: &CoreError) {
        tracing::error!(bundle_id = bundle.id(), error = %error, code = error.error_code(), "框架操作失败");
        self.manager
            .events()
            .fire_framework(
                FrameworkEventKind::Error,
                bundle.id(),
                bundle.symbolic_name(),
                Some(error.to_string()),
            )
            .await;
    }
}

/// 框架句柄，可廉价克隆
#[derive(Clone)]
pub struct Framework {
    inner: Arc<FrameworkInner>,
}

impl Framework {
    pub fn builder() -> FrameworkBuilder {
        FrameworkBuilder::new()
    }

    // ==================== 框架生命周期 ====================

    /// 启动框架
    ///
    /// 依次启动插件、安装 `bundle_dirs` 中的描述文件、批量解析，
    /// 再把启动级别提升到 `beginning_start_level`。
    pub async fn start(&self) -> Result<()> {
        self.inner.startup().await
    }

    /// 异步停止框架，立即返回
    pub fn stop(&self) -> StopHandle {
        self.inner.request_stop()
    }

    /// 等待框架停止
    ///
    /// 只在框架处于 STARTING 或 STOPPING 时等待，否则立即返回。
    pub async fn wait_for_stop(&self, timeout: Duration) -> StopStatus {
        let mut rx = self.inner.state_tx.subscribe();
        let transitional = |s: &BundleState| matches!(s, BundleState::Starting | BundleState::Stopping);

        let current = *rx.borrow();
        if transitional(&current) {
            match tokio::time::timeout(timeout, rx.wait_for(|s| !transitional(s))).await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) => return StopStatus::Stopped,
                Err(_) => {
                    debug!(?timeout, "等待框架停止超时");
                    return StopStatus::WaitTimedOut;
                }
            }
        }

        match self.inner.system.state() {
            BundleState::Active => StopStatus::Running,
            BundleState::Starting | BundleState::Stopping => StopStatus::WaitTimedOut,
            _ => StopStatus::Stopped,
        }
    }

    /// 框架状态（系统 bundle 的状态）
    pub fn state(&self) -> BundleState {
        self.inner.system.state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == BundleState::Active
    }

    // ==================== bundle 生命周期 ====================

    /// 安装 bundle，同一位置重复安装返回已有 bundle
    pub async fn install_bundle(&self, deployment: Deployment) -> Result<Arc<Bundle>> {
        self.inner.manager.install_bundle(deployment).await
    }

    pub async fn start_bundle(&self, bundle_id: BundleId, options: StartOptions) -> Result<()> {
        let bundle = self.inner.manager.bundle(bundle_id).await?;
        self.inner.start_bundle(&bundle, options).await
    }

    pub async fn stop_bundle(&self, bundle_id: BundleId, options: StopOptions) -> Result<()> {
        let bundle = self.inner.manager.bundle(bundle_id).await?;
        self.inner.stop_bundle(&bundle, options).await
    }

    /// 更新 bundle，`deployment` 为空时使用更新位置或原内容
    pub async fn update_bundle(&self, bundle_id: BundleId, deployment: Option<Deployment>) -> Result<()> {
        let bundle = self.inner.manager.bundle(bundle_id).await?;
        self.inner.update_bundle(&bundle, deployment).await
    }

    pub async fn uninstall_bundle(&self, bundle_id: BundleId) -> Result<()> {
        let bundle = self.inner.manager.bundle(bundle_id).await?;
        self.inner.uninstall_bundle(&bundle).await
    }

    /// 刷新单个已解析的 bundle
    pub async fn refresh_bundle(&self, bundle_id: BundleId) -> Result<()> {
        let bundle = self.inner.manager.bundle(bundle_id).await?;
        self.inner.refresh_bundle(&bundle).await
    }

    /// 刷新一组 bundle 及其依赖方，`None` 表示全部等待回收的 bundle
    ///
    /// 返回被刷新的 bundle ID。
    pub async fn refresh_bundles(&self, bundle_ids: Option<Vec<BundleId>>) -> Vec<BundleId> {
        self.inner.refresh_bundles(bundle_ids).await
    }

    /// 解析 bundle，`None` 表示全部未解析的 bundle；全部成功时返回 true
    pub async fn resolve_bundles(&self, bundle_ids: Option<Vec<BundleId>>) -> bool {
        let bundles = match bundle_ids {
            Some(ids) => {
                let mut bundles = Vec::new();
                for id in ids {
                    if let Some(bundle) = self.inner.manager.get_bundle_by_id(id).await {
                        bundles.push(bundle);
                    }
                }
                bundles
            }
            None => self.inner.manager.get_bundles(BundleState::Installed.into()).await,
        };
        let report = self.inner.manager.resolve_bundles(&bundles).await;
        let all_resolved = bundles.iter().all(|b| b.state().is_resolved());
        report.is_success() && all_resolved
    }

    /// 回收不再被连线的已卸载 bundle 与旧 revision
    pub async fn collect_garbage(&self) -> Vec<BundleId> {
        self.inner.manager.collect_garbage().await
    }

    // ==================== 启动级别 ====================

    pub fn start_level(&self) -> u32 {
        self.inner.active_level()
    }

    /// 调整框架启动级别
    ///
    /// # Errors
    ///
    /// 框架未处于 ACTIVE 时返回 `IllegalState`
    pub async fn set_start_level(&self, level: u32) -> Result<()> {
        if !self.is_active() {
            return Err(CoreError::illegal_state(self.inner.system.id(), "框架未运行"));
        }
        if level == 0 {
            return Err(CoreError::illegal_state(self.inner.system.id(), "启动级别 0 只能通过停止框架达到"));
        }
        self.inner.change_start_level(level).await;
        Ok(())
    }

    pub async fn set_bundle_start_level(&self, bundle_id: BundleId, level: u32) -> Result<()> {
        let bundle = self.inner.manager.bundle(bundle_id).await?;
        self.inner.set_bundle_start_level(&bundle, level).await
    }

    /// 新安装 bundle 的启动级别
    pub fn set_initial_bundle_start_level(&self, level: u32) {
        self.inner.manager.set_initial_start_level(level);
    }

    // ==================== 查询 ====================

    pub async fn get_bundle(&self, bundle_id: BundleId) -> Option<Arc<Bundle>> {
        self.inner.manager.get_bundle_by_id(bundle_id).await
    }

    pub async fn get_bundle_by_location(&self, location: &str) -> Option<Arc<Bundle>> {
        self.inner.manager.get_bundle_by_location(location).await
    }

    /// 状态在掩码内的 bundle（含系统 bundle），按 ID 升序
    pub async fn get_bundles(&self, mask: StateMask) -> Vec<Arc<Bundle>> {
        self.inner.manager.get_bundles(mask).await
    }

    pub fn system_bundle(&self) -> &Arc<Bundle> {
        &self.inner.system
    }

    /// 系统 bundle 的上下文，框架运行时有效
    pub async fn context(&self) -> Option<Arc<BundleContext>> {
        self.inner.system.context().await
    }

    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.inner.properties.get(key).map(String::as_str)
    }

    pub fn manager(&self) -> &Arc<BundleManager> {
        &self.inner.manager
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        self.inner.manager.registry()
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        self.inner.manager.services()
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        self.inner.manager.events()
    }

    pub fn activators(&self) -> &Arc<ActivatorRegistry> {
        &self.inner.activators
    }

    /// 以框架名义订阅事件
    pub async fn subscribe(&self, filter: EventFilter, callback: EventCallback) -> String {
        self.events().subscribe(self.inner.system.id(), filter, callback).await
    }
}

// ============================================================================
// 构建器
// ============================================================================

/// 框架构建器
#[derive(Default)]
pub struct FrameworkBuilder {
    config: CoreConfig,
    storage: Option<Arc<dyn BundleStorage>>,
    activators: Option<Arc<ActivatorRegistry>>,
    plugins: Vec<Arc<dyn FrameworkPlugin>>,
}

impl FrameworkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    /// 指定存储，缺省按 `storage_dir` 选择文件或内存存储
    pub fn storage(mut self, storage: Arc<dyn BundleStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn activators(mut self, activators: Arc<ActivatorRegistry>) -> Self {
        self.activators = Some(activators);
        self
    }

    pub fn plugin(mut self, plugin: Arc<dyn FrameworkPlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// 构建框架，系统 bundle 处于 RESOLVED
    pub async fn build(self) -> Result<Framework> {
        self.config.validate()?;
        let framework_config = &self.config.framework;

        let storage: Arc<dyn BundleStorage> = match (self.storage, &framework_config.storage_dir) {
            (Some(storage), _) => storage,
            (None, Some(dir)) => Arc::new(FileStorage::open(dir).await?),
            (None, None) => Arc::new(MemoryStorage::new()),
        };

        let ids = Arc::new(IdGenerator::new());
        let registry = Arc::new(ModuleRegistry::new());
        let events = Arc::new(EventDispatcher::new());
        let services = Arc::new(ServiceRegistry::new(Arc::clone(&ids)));
        let manager = Arc::new(BundleManager::new(
            Arc::clone(&ids),
            registry,
            services,
            events,
            storage,
            BundleValidator::new(framework_config.validation_profile),
            framework_config.initial_bundle_start_level,
        ));

        let system = Arc::new(system::system_bundle(framework_config, &ids)?);
        manager.register_system_bundle(Arc::clone(&system)).await?;

        let (state_tx, _) = watch::channel(system.state());
        let inner = FrameworkInner {
            properties: Arc::new(framework_config.properties.clone()),
            config: self.config,
            manager,
            activators: self.activators.unwrap_or_default(),
            plugins: self.plugins,
            system,
            active_level: AtomicU32::new(0),
            level_lock: Mutex::new(()),
            state_tx,
        };
        info!(plugins = inner.plugins.len(), "框架已创建");
        Ok(Framework {
            inner: Arc::new(inner),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_registers_system_bundle() {
        let framework = Framework::builder().build().await.unwrap();
        let system = framework.system_bundle();
        assert_eq!(system.id(), 0);
        assert_eq!(system.symbolic_name(), SYSTEM_BUNDLE_NAME);
        assert_eq!(framework.state(), BundleState::Resolved);
        assert_eq!(framework.start_level(), 0);
        assert_eq!(framework.get_bundles(StateMask::ALL).await.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_stop_returns_immediately_when_settled() {
        let framework = Framework::builder().build().await.unwrap();
        assert_eq!(
            framework.wait_for_stop(Duration::from_secs(60)).await,
            StopStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_set_start_level_requires_running_framework() {
        let framework = Framework::builder().build().await.unwrap();
        assert!(framework.set_start_level(3).await.is_err());
    }
}
