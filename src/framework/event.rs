//! 事件分发
//!
//! bundle 事件与框架事件按注册顺序同步分发给回调。
//! 每个订阅记录所属 bundle，bundle 上下文销毁时可以一次性移除。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::utils::{generate_uuid, BundleId};

/// bundle 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BundleEventKind {
    Installed,
    Resolved,
    LazyActivation,
    Starting,
    Started,
    Stopping,
    Stopped,
    Updated,
    Unresolved,
    Uninstalled,
}

/// 框架事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameworkEventKind {
    Started,
    Error,
    PackagesRefreshed,
    StartLevelChanged,
    Stopped,
    Warning,
}

/// bundle 事件
#[derive(Debug, Clone, Serialize)]
pub struct BundleEvent {
    pub event_id: String,
    pub kind: BundleEventKind,
    pub bundle_id: BundleId,
    pub symbolic_name: String,
    pub timestamp: DateTime<Utc>,
}

/// 框架事件
#[derive(Debug, Clone, Serialize)]
pub struct FrameworkEvent {
    pub event_id: String,
    pub kind: FrameworkEventKind,
    /// 相关 bundle（框架自身为 0）
    pub bundle_id: BundleId,
    pub symbolic_name: String,
    /// 错误或警告的描述
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// 运行时事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    Bundle(BundleEvent),
    Framework(FrameworkEvent),
}

impl Event {
    /// 构造 bundle 事件
    pub fn bundle(kind: BundleEventKind, bundle_id: BundleId, symbolic_name: impl Into<String>) -> Self {
        Event::Bundle(BundleEvent {
            event_id: generate_uuid(),
            kind,
            bundle_id,
            symbolic_name: symbolic_name.into(),
            timestamp: Utc::now(),
        })
    }

    /// 构造框架事件
    pub fn framework(
        kind: FrameworkEventKind,
        bundle_id: BundleId,
        symbolic_name: impl Into<String>,
        message: Option<String>,
    ) -> Self {
        Event::Framework(FrameworkEvent {
            event_id: generate_uuid(),
            kind,
            bundle_id,
            symbolic_name: symbolic_name.into(),
            message,
            timestamp: Utc::now(),
        })
    }

    pub fn bundle_id(&self) -> BundleId {
        match self {
            Event::Bundle(e) => e.bundle_id,
            Event::Framework(e) => e.bundle_id,
        }
    }

    pub fn as_bundle(&self) -> Option<&BundleEvent> {
        match self {
            Event::Bundle(e) => Some(e),
            Event::Framework(_) => None,
        }
    }

    pub fn as_framework(&self) -> Option<&FrameworkEvent> {
        match self {
            Event::Framework(e) => Some(e),
            Event::Bundle(_) => None,
        }
    }
}

/// 订阅关心的事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Bundle,
    Framework,
}

impl EventFilter {
    fn matches(self, event: &Event) -> bool {
        matches!(
            (self, event),
            (EventFilter::All, _)
                | (EventFilter::Bundle, Event::Bundle(_))
                | (EventFilter::Framework, Event::Framework(_))
        )
    }
}

/// 事件回调
///
/// 回调在发布者的任务中同步执行，应尽快返回。
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

#[derive(Clone)]
struct Subscription {
    subscription_id: String,
    owner: BundleId,
    filter: EventFilter,
    callback: EventCallback,
}

/// 分发统计
#[derive(Debug, Clone, Default)]
pub struct DispatchStats {
    pub bundle_events: u64,
    pub framework_events: u64,
    pub deliveries: u64,
    pub last_dispatch_at: Option<DateTime<Utc>>,
}

/// 事件分发器
#[derive(Default)]
pub struct EventDispatcher {
    subscriptions: RwLock<Vec<Subscription>>,
    stats: RwLock<DispatchStats>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅事件，返回订阅 ID
    pub async fn subscribe(&self, owner: BundleId, filter: EventFilter, callback: EventCallback) -> String {
        let subscription_id = generate_uuid();
        self.subscriptions.write().await.push(Subscription {
            subscription_id: subscription_id.clone(),
            owner,
            filter,
            callback,
        });
        debug!(subscription_id = %subscription_id, owner, ?filter, "事件订阅成功");
        subscription_id
    }

    /// 取消订阅，返回订阅是否存在
    pub async fn unsubscribe(&self, subscription_id: &str) -> bool {
        let mut subscriptions = self.subscriptions.write().await;
        let before = subscriptions.len();
        subscriptions.retain(|s| s.subscription_id != subscription_id);
        before != subscriptions.len()
    }

    /// 移除某个 bundle 的全部订阅，返回移除数量
    pub async fn unsubscribe_all(&self, owner: BundleId) -> usize {
        let mut subscriptions = self.subscriptions.write().await;
        let before = subscriptions.len();
        subscriptions.retain(|s| s.owner != owner);
        let removed = before - subscriptions.len();
        if removed > 0 {
            debug!(owner, removed, "移除 bundle 的全部订阅");
        }
        removed
    }

    /// 发布事件，返回投递次数
    pub async fn publish(&self, event: Event) -> usize {
        let targets: Vec<EventCallback> = self
            .subscriptions
            .read()
            .await
            .iter()
            .filter(|s| s.filter.matches(&event))
            .map(|s| Arc::clone(&s.callback))
            .collect();

        trace!(bundle_id = event.bundle_id(), targets = targets.len(), "分发事件");
        for callback in &targets {
            callback(event.clone());
        }

        let mut stats = self.stats.write().await;
        match event {
            Event::Bundle(_) => stats.bundle_events += 1,
            Event::Framework(_) => stats.framework_events += 1,
        }
        stats.deliveries += targets.len() as u64;
        stats.last_dispatch_at = Some(Utc::now());
        targets.len()
    }

    /// 发布 bundle 事件
    pub async fn fire_bundle(&self, kind: BundleEventKind, bundle_id: BundleId, symbolic_name: &str) {
        self.publish(Event::bundle(kind, bundle_id, symbolic_name)).await;
    }

    /// 发布框架事件
    pub async fn fire_framework(
        &self,
        kind: FrameworkEventKind,
        bundle_id: BundleId,
        symbolic_name: &str,
        message: Option<String>,
    ) {
        self.publish(Event::framework(kind, bundle_id, symbolic_name, message))
            .await;
    }

    /// 当前订阅数量
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    pub async fn stats(&self) -> DispatchStats {
        self.stats.read().await.clone()
    }
}
