//! bundle 上下文
//!
//! 上下文在 bundle 启动（或懒启动）时创建，停止时销毁。
//! 销毁后的任何调用都返回 `InvalidContext`。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::debug;

use super::bundle::Bundle;
use super::service::{ServiceObject, ServiceReference, ServiceRegistry};
use crate::framework::event::{EventCallback, EventDispatcher, EventFilter};
use crate::resolver::{ModuleId, ModuleRegistry};
use crate::utils::{BundleId, CoreError, Result, ServiceId};

/// bundle 作用域的上下文
pub struct BundleContext {
    bundle_id: BundleId,
    bundle: Weak<Bundle>,
    valid: AtomicBool,
    services: Arc<ServiceRegistry>,
    events: Arc<EventDispatcher>,
    modules: Arc<ModuleRegistry>,
    properties: Arc<BTreeMap<String, String>>,
}

impl BundleContext {
    pub(crate) fn new(
        bundle: &Arc<Bundle>,
        services: Arc<ServiceRegistry>,
        events: Arc<EventDispatcher>,
        modules: Arc<ModuleRegistry>,
        properties: Arc<BTreeMap<String, String>>,
    ) -> Self {
        Self {
            bundle_id: bundle.id(),
            bundle: Arc::downgrade(bundle),
            valid: AtomicBool::new(true),
            services,
            events,
            modules,
            properties,
        }
    }

    pub fn bundle_id(&self) -> BundleId {
        self.bundle_id
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn check_valid(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(CoreError::InvalidContext(self.bundle_id))
        }
    }

    /// 所属 bundle
    pub fn bundle(&self) -> Result<Arc<Bundle>> {
        self.check_valid()?;
        self.bundle
            .upgrade()
            .ok_or(CoreError::InvalidContext(self.bundle_id))
    }

    /// 框架属性
    pub fn property(&self, key: &str) -> Result<Option<String>> {
        self.check_valid()?;
        Ok(self.properties.get(key).cloned())
    }

    // ==================== 服务 ====================

    /// 以本 bundle 名义注册服务
    pub async fn register_service(
        &self,
        interfaces: Vec<String>,
        properties: BTreeMap<String, String>,
        object: ServiceObject,
    ) -> Result<ServiceReference> {
        let bundle = self.bundle()?;
        Ok(self.services.register(&bundle, interfaces, properties, object).await)
    }

    /// 注销本 bundle 注册的服务
    pub async fn unregister_service(&self, service_id: ServiceId) -> Result<()> {
        let bundle = self.bundle()?;
        if !bundle.registered_services().await.contains(&service_id) {
            return Err(CoreError::ServiceNotFound(service_id));
        }
        self.services.unregister(service_id).await
    }

    pub async fn get_service_references(&self, interface: Option<&str>) -> Result<Vec<ServiceReference>> {
        self.check_valid()?;
        Ok(self.services.get_references(interface).await)
    }

    pub async fn get_service_reference(&self, interface: &str) -> Result<Option<ServiceReference>> {
        self.check_valid()?;
        Ok(self.services.get_reference(interface).await)
    }

    /// 获取服务对象，计入本 bundle 的使用记录
    pub async fn get_service(&self, service_id: ServiceId) -> Result<ServiceObject> {
        let bundle = self.bundle()?;
        self.services.get_service(&bundle, service_id).await
    }

    pub async fn unget_service(&self, service_id: ServiceId) -> Result<bool> {
        let bundle = self.bundle()?;
        Ok(self.services.unget_service(&bundle, service_id).await)
    }

    // ==================== 监听器 ====================

    /// 添加事件监听器，上下文销毁时自动移除
    pub async fn add_listener(&self, filter: EventFilter, callback: EventCallback) -> Result<String> {
        self.check_valid()?;
        Ok(self.events.subscribe(self.bundle_id, filter, callback).await)
    }

    pub async fn remove_listener(&self, subscription_id: &str) -> Result<bool> {
        self.check_valid()?;
        Ok(self.events.unsubscribe(subscription_id).await)
    }

    // ==================== 类加载 ====================

    /// 通过本 bundle 的类加载单元加载类，返回定义类的模块
    pub async fn load_class(&self, class_name: &str) -> Result<ModuleId> {
        let bundle = self.bundle()?;
        let module = bundle.module_id().await;
        self.modules.load_class(&module, class_name).await
    }

    /// 销毁上下文，之后的调用全部失败
    pub(crate) fn invalidate(&self) {
        if self.valid.swap(false, Ordering::SeqCst) {
            debug!(bundle_id = self.bundle_id, "上下文已销毁");
        }
    }
}
