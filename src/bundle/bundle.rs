//! bundle 对象
//!
//! 一个 bundle 持有不变的身份（ID、符号名、位置）、生命周期状态、
//! revision 历史（最新在前）以及服务归属记录。
//! 状态转换由框架的生命周期操作在 bundle 级互斥锁下执行。

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::trace;

use super::activator::BundleActivator;
use super::context::BundleContext;
use super::revision::Revision;
use super::state::BundleState;
use crate::resolver::ModuleId;
use crate::utils::{BundleId, CoreError, Result, ServiceId};

/// bundle 种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleKind {
    /// 代表运行时本身的系统 bundle
    System,
    Host,
    /// 没有独立生命周期，附加到宿主上
    Fragment,
}

impl fmt::Display for BundleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BundleKind::System => "system",
            BundleKind::Host => "host",
            BundleKind::Fragment => "fragment",
        };
        write!(f, "{}", name)
    }
}

/// 启动选项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOptions {
    /// 瞬时启动：不记录持久启动标记，启动级别不足时直接失败
    pub transient: bool,
    /// 遵循清单声明的激活策略（懒激活）
    pub activation_policy: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            transient: false,
            activation_policy: true,
        }
    }
}

impl StartOptions {
    pub fn transient() -> Self {
        Self {
            transient: true,
            ..Self::default()
        }
    }

    /// 忽略懒激活策略，立即激活
    pub fn eager(mut self) -> Self {
        self.activation_policy = false;
        self
    }
}

/// 停止选项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopOptions {
    /// 瞬时停止：保留持久启动标记
    pub transient: bool,
}

impl StopOptions {
    pub fn transient() -> Self {
        Self { transient: true }
    }
}

/// bundle 的只读快照，用于列表展示与序列化
#[derive(Debug, Clone, Serialize)]
pub struct BundleInfo {
    pub id: BundleId,
    pub symbolic_name: String,
    pub version: String,
    pub location: String,
    pub kind: BundleKind,
    pub state: BundleState,
    pub start_level: u32,
    pub persistently_started: bool,
    pub revisions: usize,
    pub last_modified: DateTime<Utc>,
}

/// bundle
pub struct Bundle {
    id: BundleId,
    symbolic_name: String,
    location: String,
    kind: BundleKind,
    state: AtomicU32,
    lifecycle: Mutex<()>,
    revisions: RwLock<Vec<Arc<Revision>>>,
    registered_services: RwLock<BTreeSet<ServiceId>>,
    services_in_use: RwLock<HashMap<ServiceId, usize>>,
    persistently_started: AtomicBool,
    use_activation_policy: AtomicBool,
    start_level: AtomicU32,
    lazy_pending: AtomicBool,
    context: RwLock<Option<Arc<BundleContext>>>,
    activator: Mutex<Option<Box<dyn BundleActivator>>>,
    last_modified: RwLock<DateTime<Utc>>,
}

impl Bundle {
    /// 创建 bundle，初始状态为 UNINSTALLED，注册完成后由管理器转为 INSTALLED
    pub fn new(location: impl Into<String>, kind: BundleKind, revision: Revision, start_level: u32) -> Self {
        Self {
            id: revision.bundle_id(),
            symbolic_name: revision.module_id().symbolic_name.clone(),
            location: location.into(),
            kind,
            state: AtomicU32::new(BundleState::Uninstalled.bits()),
            lifecycle: Mutex::new(()),
            revisions: RwLock::new(vec![Arc::new(revision)]),
            registered_services: RwLock::new(BTreeSet::new()),
            services_in_use: RwLock::new(HashMap::new()),
            persistently_started: AtomicBool::new(false),
            use_activation_policy: AtomicBool::new(true),
            start_level: AtomicU32::new(start_level),
            lazy_pending: AtomicBool::new(false),
            context: RwLock::new(None),
            activator: Mutex::new(None),
            last_modified: RwLock::new(Utc::now()),
        }
    }

    // ==================== 身份 ====================

    pub fn id(&self) -> BundleId {
        self.id
    }

    pub fn symbolic_name(&self) -> &str {
        &self.symbolic_name
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn kind(&self) -> BundleKind {
        self.kind
    }

    pub fn is_fragment(&self) -> bool {
        self.kind == BundleKind::Fragment
    }

    pub fn is_system(&self) -> bool {
        self.kind == BundleKind::System
    }

    // ==================== 状态 ====================

    pub fn state(&self) -> BundleState {
        BundleState::from_bits(self.state.load(Ordering::SeqCst)).unwrap_or(BundleState::Uninstalled)
    }

    pub(crate) fn set_state(&self, state: BundleState) {
        let previous = self.state.swap(state.bits(), Ordering::SeqCst);
        trace!(bundle_id = self.id, from = previous, to = %state, "状态转换");
    }

    /// 仅当当前状态为 `from` 时转换为 `to`
    pub(crate) fn compare_and_set_state(&self, from: BundleState, to: BundleState) -> bool {
        self.state
            .compare_exchange(from.bits(), to.bits(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// 获取生命周期锁，同一 bundle 的生命周期操作串行执行
    pub(crate) async fn lock_lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().await
    }

    /// 状态为 UNINSTALLED 时返回 `IllegalState`
    pub(crate) fn ensure_installed(&self) -> Result<()> {
        if self.state() == BundleState::Uninstalled {
            return Err(CoreError::illegal_state(self.id, "bundle 已卸载"));
        }
        Ok(())
    }

    // ==================== revision ====================

    /// 当前 revision
    pub async fn current_revision(&self) -> Arc<Revision> {
        let revisions = self.revisions.read().await;
        // revision 列表创建时非空，之后只在头部插入或保留头部
        Arc::clone(&revisions[0])
    }

    /// 全部 revision，最新在前
    pub async fn revisions(&self) -> Vec<Arc<Revision>> {
        self.revisions.read().await.clone()
    }

    /// 当前版本
    pub async fn version(&self) -> Version {
        self.current_revision().await.version().clone()
    }

    /// 当前 revision 的模块身份
    pub async fn module_id(&self) -> ModuleId {
        self.current_revision().await.module_id().clone()
    }

    /// 全部 revision 的模块身份
    pub async fn module_ids(&self) -> Vec<ModuleId> {
        self.revisions
            .read()
            .await
            .iter()
            .map(|r| r.module_id().clone())
            .collect()
    }

    /// 加入新的当前 revision，旧 revision 保留在历史中
    pub(crate) async fn push_revision(&self, revision: Revision) {
        self.revisions.write().await.insert(0, Arc::new(revision));
        self.touch().await;
    }

    /// 用新 revision 替换当前 revision，并丢弃全部历史，返回被丢弃的 revision
    pub(crate) async fn replace_revisions(&self, revision: Revision) -> Vec<Arc<Revision>> {
        let mut revisions = self.revisions.write().await;
        std::mem::replace(&mut *revisions, vec![Arc::new(revision)])
    }

    /// 丢弃指定 revision（不能是当前 revision）
    pub(crate) async fn remove_revision(&self, module: &ModuleId) -> bool {
        let mut revisions = self.revisions.write().await;
        let before = revisions.len();
        let current = revisions[0].module_id().clone();
        revisions.retain(|r| r.module_id() == &current || r.module_id() != module);
        before != revisions.len()
    }

    /// 是否存在被取代的旧 revision
    pub async fn has_superseded_revisions(&self) -> bool {
        self.revisions.read().await.len() > 1
    }

    // ==================== 服务归属 ====================

    pub async fn add_registered_service(&self, service_id: ServiceId) {
        self.registered_services.write().await.insert(service_id);
    }

    pub async fn remove_registered_service(&self, service_id: ServiceId) -> bool {
        self.registered_services.write().await.remove(&service_id)
    }

    /// 本 bundle 注册的服务
    pub async fn registered_services(&self) -> Vec<ServiceId> {
        self.registered_services.read().await.iter().copied().collect()
    }

    /// 使用计数加一
    pub async fn add_service_in_use(&self, service_id: ServiceId) -> usize {
        let mut in_use = self.services_in_use.write().await;
        let count = in_use.entry(service_id).or_insert(0);
        *count += 1;
        *count
    }

    /// 使用计数减一，归零时移除，返回剩余计数
    pub async fn remove_service_in_use(&self, service_id: ServiceId) -> usize {
        let mut in_use = self.services_in_use.write().await;
        match in_use.get_mut(&service_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                in_use.remove(&service_id);
                0
            }
            None => 0,
        }
    }

    /// 清除对某个服务的全部使用
    pub(crate) async fn clear_service_in_use(&self, service_id: ServiceId) {
        self.services_in_use.write().await.remove(&service_id);
    }

    /// 正在使用的服务及计数
    pub async fn services_in_use(&self) -> HashMap<ServiceId, usize> {
        self.services_in_use.read().await.clone()
    }

    // ==================== 启动标记 ====================

    pub fn is_persistently_started(&self) -> bool {
        self.persistently_started.load(Ordering::SeqCst)
    }

    pub(crate) fn set_persistently_started(&self, started: bool) {
        self.persistently_started.store(started, Ordering::SeqCst);
    }

    /// 持久启动时是否遵循激活策略
    pub fn uses_activation_policy(&self) -> bool {
        self.use_activation_policy.load(Ordering::SeqCst)
    }

    pub(crate) fn set_uses_activation_policy(&self, value: bool) {
        self.use_activation_policy.store(value, Ordering::SeqCst);
    }

    pub fn start_level(&self) -> u32 {
        self.start_level.load(Ordering::SeqCst)
    }

    pub(crate) fn set_start_level(&self, level: u32) {
        self.start_level.store(level, Ordering::SeqCst);
    }

    /// 是否在等待首次类加载触发激活
    pub fn is_lazy_pending(&self) -> bool {
        self.lazy_pending.load(Ordering::SeqCst)
    }

    pub(crate) fn set_lazy_pending(&self, pending: bool) {
        self.lazy_pending.store(pending, Ordering::SeqCst);
    }

    /// 消费懒激活标记，只有一个调用方得到 true
    pub(crate) fn take_lazy_pending(&self) -> bool {
        self.lazy_pending
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    // ==================== 上下文与激活器 ====================

    /// 当前有效的上下文
    pub async fn context(&self) -> Option<Arc<BundleContext>> {
        self.context.read().await.clone()
    }

    /// 绑定上下文
    ///
    /// # Errors
    ///
    /// 已存在上下文时返回 `IllegalState`
    pub(crate) async fn attach_context(&self, context: Arc<BundleContext>) -> Result<()> {
        let mut slot = self.context.write().await;
        if slot.is_some() {
            return Err(CoreError::illegal_state(self.id, "上下文已存在"));
        }
        *slot = Some(context);
        Ok(())
    }

    /// 解除并返回上下文
    pub(crate) async fn detach_context(&self) -> Option<Arc<BundleContext>> {
        self.context.write().await.take()
    }

    pub(crate) async fn set_activator(&self, activator: Option<Box<dyn BundleActivator>>) {
        *self.activator.lock().await = activator;
    }

    pub(crate) async fn take_activator(&self) -> Option<Box<dyn BundleActivator>> {
        self.activator.lock().await.take()
    }

    // ==================== 其它 ====================

    pub async fn last_modified(&self) -> DateTime<Utc> {
        *self.last_modified.read().await
    }

    pub(crate) async fn touch(&self) {
        *self.last_modified.write().await = Utc::now();
    }

    /// 只读快照
    pub async fn info(&self) -> BundleInfo {
        let revisions = self.revisions.read().await;
        BundleInfo {
            id: self.id,
            symbolic_name: self.symbolic_name.clone(),
            version: revisions[0].version().to_string(),
            location: self.location.clone(),
            kind: self.kind,
            state: self.state(),
            start_level: self.start_level(),
            persistently_started: self.is_persistently_started(),
            revisions: revisions.len(),
            last_modified: *self.last_modified.read().await,
        }
    }
}

impl fmt::Debug for Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bundle")
            .field("id", &self.id)
            .field("symbolic_name", &self.symbolic_name)
            .field("location", &self.location)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.symbolic_name, self.id)
    }
}
