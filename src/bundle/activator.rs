//! bundle 激活器
//!
//! 激活器由清单中的 `Bundle-Activator` 类名在 [`ActivatorRegistry`] 中查找工厂创建，
//! 启动时调用 `start`，停止时调用 `stop`。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::context::BundleContext;
use crate::utils::{CoreError, Result};

/// bundle 激活器接口
#[async_trait]
pub trait BundleActivator: Send + Sync {
    /// bundle 启动
    async fn start(&mut self, context: Arc<BundleContext>) -> anyhow::Result<()>;

    /// bundle 停止
    async fn stop(&mut self, context: Arc<BundleContext>) -> anyhow::Result<()>;
}

/// 激活器工厂，构造失败视为激活失败
pub type ActivatorFactory = Arc<dyn Fn() -> anyhow::Result<Box<dyn BundleActivator>> + Send + Sync>;

/// 激活器注册表：类名 -> 工厂
#[derive(Default)]
pub struct ActivatorRegistry {
    factories: RwLock<HashMap<String, ActivatorFactory>>,
}

impl ActivatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工厂，已存在时替换
    pub async fn register(&self, class_name: impl Into<String>, factory: ActivatorFactory) {
        let class_name = class_name.into();
        debug!(class = %class_name, "注册激活器");
        self.factories.write().await.insert(class_name, factory);
    }

    /// 以闭包注册工厂
    pub async fn register_fn<F>(&self, class_name: impl Into<String>, factory: F)
    where
        F: Fn() -> anyhow::Result<Box<dyn BundleActivator>> + Send + Sync + 'static,
    {
        self.register(class_name, Arc::new(factory)).await;
    }

    pub async fn unregister(&self, class_name: &str) -> bool {
        self.factories.write().await.remove(class_name).is_some()
    }

    pub async fn contains(&self, class_name: &str) -> bool {
        self.factories.read().await.contains_key(class_name)
    }

    /// 创建激活器实例
    ///
    /// # Errors
    ///
    /// 类名未注册时返回 `ActivatorNotFound`，工厂失败时返回 `ActivationFailed`
    pub async fn create(&self, symbolic_name: &str, class_name: &str) -> Result<Box<dyn BundleActivator>> {
        let factory = self
            .factories
            .read()
            .await
            .get(class_name)
            .cloned()
            .ok_or_else(|| CoreError::ActivatorNotFound(class_name.to_string()))?;

        factory().map_err(|source| CoreError::ActivationFailed {
            symbolic_name: symbolic_name.to_string(),
            source,
        })
    }
}
