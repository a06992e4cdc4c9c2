//! 服务归属记录
//!
//! 服务对象本身不透明，注册表只维护所有者与使用者的关系，
//! 并在每次变化时同步 bundle 上的注册集合与使用计数。

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::bundle::Bundle;
use crate::utils::{BundleId, CoreError, IdGenerator, Result, ServiceId};

/// 不透明的服务对象
pub type ServiceObject = Arc<dyn Any + Send + Sync>;

/// 服务排序属性
pub const SERVICE_RANKING: &str = "service.ranking";

/// 服务引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceReference {
    pub id: ServiceId,
    pub owner: BundleId,
    pub interfaces: Vec<String>,
    pub properties: BTreeMap<String, String>,
    pub ranking: i32,
}

impl ServiceReference {
    pub fn provides(&self, interface: &str) -> bool {
        self.interfaces.iter().any(|i| i == interface)
    }
}

struct Registration {
    reference: ServiceReference,
    object: ServiceObject,
    owner: Weak<Bundle>,
    /// 使用者 -> (bundle, 计数)
    users: HashMap<BundleId, (Weak<Bundle>, usize)>,
}

/// 服务注册表
pub struct ServiceRegistry {
    ids: Arc<IdGenerator>,
    registrations: RwLock<BTreeMap<ServiceId, Registration>>,
}

impl ServiceRegistry {
    pub fn new(ids: Arc<IdGenerator>) -> Self {
        Self {
            ids,
            registrations: RwLock::new(BTreeMap::new()),
        }
    }

    /// 注册服务
    pub async fn register(
        &self,
        owner: &Arc<Bundle>,
        interfaces: Vec<String>,
        properties: BTreeMap<String, String>,
        object: ServiceObject,
    ) -> ServiceReference {
        let ranking = properties
            .get(SERVICE_RANKING)
            .and_then(|r| r.trim().parse::<i32>().ok())
            .unwrap_or(0);
        let reference = ServiceReference {
            id: self.ids.next_service_id(),
            owner: owner.id(),
            interfaces,
            properties,
            ranking,
        };

        self.registrations.write().await.insert(
            reference.id,
            Registration {
                reference: reference.clone(),
                object,
                owner: Arc::downgrade(owner),
                users: HashMap::new(),
            },
        );
        owner.add_registered_service(reference.id).await;
        info!(service_id = reference.id, bundle_id = owner.id(), interfaces = ?reference.interfaces, "服务已注册");
        reference
    }

    /// 注销服务，同时清理所有者与使用者的记录
    ///
    /// # Errors
    ///
    /// 服务不存在时返回 `ServiceNotFound`
    pub async fn unregister(&self, service_id: ServiceId) -> Result<()> {
        let registration = self
            .registrations
            .write()
            .await
            .remove(&service_id)
            .ok_or(CoreError::ServiceNotFound(service_id))?;

        if let Some(owner) = registration.owner.upgrade() {
            owner.remove_registered_service(service_id).await;
        }
        for (user, _) in registration.users.values() {
            if let Some(user) = user.upgrade() {
                user.clear_service_in_use(service_id).await;
            }
        }
        debug!(service_id, owner = registration.reference.owner, "服务已注销");
        Ok(())
    }

    /// 注销某个 bundle 注册的全部服务，返回数量
    pub async fn unregister_all(&self, owner: &Bundle) -> usize {
        let mut count = 0;
        for service_id in owner.registered_services().await {
            if self.unregister(service_id).await.is_ok() {
                count += 1;
            } else {
                owner.remove_registered_service(service_id).await;
            }
        }
        count
    }

    /// 获取服务对象，使用计数加一
    pub async fn get_service(&self, consumer: &Arc<Bundle>, service_id: ServiceId) -> Result<ServiceObject> {
        let object = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(&service_id)
                .ok_or(CoreError::ServiceNotFound(service_id))?;
            let user = registration
                .users
                .entry(consumer.id())
                .or_insert_with(|| (Arc::downgrade(consumer), 0));
            user.1 += 1;
            Arc::clone(&registration.object)
        };
        consumer.add_service_in_use(service_id).await;
        Ok(object)
    }

    /// 释放一次服务使用，返回此前是否在使用
    pub async fn unget_service(&self, consumer: &Bundle, service_id: ServiceId) -> bool {
        let released = {
            let mut registrations = self.registrations.write().await;
            match registrations.get_mut(&service_id) {
                Some(registration) => match registration.users.get_mut(&consumer.id()) {
                    Some(user) if user.1 > 1 => {
                        user.1 -= 1;
                        true
                    }
                    Some(_) => {
                        registration.users.remove(&consumer.id());
                        true
                    }
                    None => false,
                },
                None => false,
            }
        };
        if released {
            consumer.remove_service_in_use(service_id).await;
        }
        released
    }

    /// 释放某个 bundle 对全部服务的使用，返回释放的服务数量
    pub async fn release_all(&self, consumer: &Bundle) -> usize {
        let in_use = consumer.services_in_use().await;
        {
            let mut registrations = self.registrations.write().await;
            for service_id in in_use.keys() {
                if let Some(registration) = registrations.get_mut(service_id) {
                    registration.users.remove(&consumer.id());
                }
            }
        }
        for service_id in in_use.keys() {
            consumer.clear_service_in_use(*service_id).await;
        }
        in_use.len()
    }

    /// 服务引用，按排序值降序、ID 升序
    pub async fn get_references(&self, interface: Option<&str>) -> Vec<ServiceReference> {
        let mut references: Vec<ServiceReference> = self
            .registrations
            .read()
            .await
            .values()
            .filter(|r| interface.map_or(true, |i| r.reference.provides(i)))
            .map(|r| r.reference.clone())
            .collect();
        references.sort_by(|a, b| b.ranking.cmp(&a.ranking).then(a.id.cmp(&b.id)));
        references
    }

    /// 最优的服务引用
    pub async fn get_reference(&self, interface: &str) -> Option<ServiceReference> {
        self.get_references(Some(interface)).await.into_iter().next()
    }

    /// 服务的使用者
    pub async fn users_of(&self, service_id: ServiceId) -> Vec<BundleId> {
        let registrations = self.registrations.read().await;
        let mut users: Vec<BundleId> = registrations
            .get(&service_id)
            .map(|r| r.users.keys().copied().collect())
            .unwrap_or_default();
        users.sort_unstable();
        users
    }

    pub async fn count(&self) -> usize {
        self.registrations.read().await.len()
    }
}
