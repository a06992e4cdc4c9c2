//! 标识符分配
//!
//! bundle、revision、服务使用进程内单调递增的计数器分配标识，
//! 计数器由 [`IdGenerator`] 持有，随框架实例的生命周期存在，从不复用。
//! 事件和类加载单元使用 UUID v4。

use std::sync::atomic::{AtomicU64, Ordering};

/// bundle 标识符（0 保留给系统 bundle）
pub type BundleId = u64;

/// 服务标识符
pub type ServiceId = u64;

/// 系统 bundle 的固定标识
pub const SYSTEM_BUNDLE_ID: BundleId = 0;

/// 单调计数器集合
#[derive(Debug)]
pub struct IdGenerator {
    next_bundle: AtomicU64,
    next_revision: AtomicU64,
    next_service: AtomicU64,
}

impl IdGenerator {
    /// 创建新的计数器集合
    pub fn new() -> Self {
        Self {
            next_bundle: AtomicU64::new(SYSTEM_BUNDLE_ID + 1),
            next_revision: AtomicU64::new(1),
            next_service: AtomicU64::new(1),
        }
    }

    /// 分配下一个 bundle 标识
    pub fn next_bundle_id(&self) -> BundleId {
        self.next_bundle.fetch_add(1, Ordering::SeqCst)
    }

    /// 分配下一个全局 revision 计数
    pub fn next_revision(&self) -> u64 {
        self.next_revision.fetch_add(1, Ordering::SeqCst)
    }

    /// 分配下一个服务标识
    pub fn next_service_id(&self) -> ServiceId {
        self.next_service.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// 生成 UUID v4 格式的 ID
///
/// 用于事件 ID 与类加载单元 ID
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_bundle_ids_start_after_system() {
        let ids = IdGenerator::new();
        assert_eq!(ids.next_bundle_id(), 1);
        assert_eq!(ids.next_bundle_id(), 2);
    }

    #[test]
    fn test_counters_are_independent() {
        let ids = IdGenerator::new();
        assert_eq!(ids.next_revision(), 1);
        assert_eq!(ids.next_service_id(), 1);
        assert_eq!(ids.next_revision(), 2);
    }

    #[test]
    fn test_concurrent_allocation_never_collides() {
        let ids = Arc::new(IdGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || (0..100).map(|_| ids.next_revision()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "revision 计数重复");
            }
        }
        assert_eq!(seen.len(), 800);
    }

    #[test]
    fn test_generate_uuid() {
        let uuid = generate_uuid();
        assert_eq!(uuid.len(), 36);
        assert!(uuid.contains('-'));
    }
}
