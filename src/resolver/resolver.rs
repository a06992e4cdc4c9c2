//! 依赖解析器
//!
//! 把未解析模块的需求匹配到能力上并生成连线。
//!
//! 算法为不动点迭代：待解析集合中的模块互为候选提供方，
//! 每轮剔除存在无法满足的必选需求的模块，直到集合不再变化，
//! 然后一次性提交剩余模块的全部连线。每个模块要么全部连线，要么零连线。
//!
//! 提供方选择顺序：已解析优先，其次版本最高，再次 bundle ID 最小，
//! 最后 revision 计数最小。

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use super::capability::{Capability, Namespace, Requirement, Wire};
use super::module::ModuleId;
use super::registry::{ModuleRegistry, RegistryState};
use crate::utils::{BundleId, CoreError, Result};

/// 一次解析的结果
#[derive(Debug, Clone, Default)]
pub struct ResolutionReport {
    /// 本次新解析的宿主模块
    pub resolved: Vec<ModuleId>,
    /// 本次附加的 (fragment, 宿主)
    pub attached_fragments: Vec<(ModuleId, ModuleId)>,
    /// 解析失败的模块及原因
    pub failures: BTreeMap<ModuleId, String>,
}

impl ResolutionReport {
    /// 模块是否在本次解析中失败
    pub fn failure(&self, id: &ModuleId) -> Option<&str> {
        self.failures.get(id).map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// 候选提供方能力
#[derive(Debug, Clone)]
struct ProviderCapability {
    module: ModuleId,
    bundle_id: BundleId,
    resolved: bool,
    capability: Capability,
}

/// 依赖解析器
#[derive(Clone)]
pub struct Resolver {
    registry: Arc<ModuleRegistry>,
}

impl Resolver {
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// 解析单个模块
    ///
    /// 已解析的模块直接返回成功。
    ///
    /// # Errors
    ///
    /// 模块无法解析时返回 `ResolutionFailed`，附带未满足需求的报告
    pub async fn resolve(&self, id: &ModuleId) -> Result<ResolutionReport> {
        let report = self.resolve_all(std::slice::from_ref(id)).await;
        match report.failure(id) {
            Some(reason) => Err(CoreError::ResolutionFailed {
                module: id.to_string(),
                report: reason.to_string(),
            }),
            None => Ok(report),
        }
    }

    /// 批量解析
    ///
    /// 单个模块失败不影响同批其它模块。
    pub async fn resolve_all(&self, ids: &[ModuleId]) -> ResolutionReport {
        let mut state = self.registry.state.write().await;
        let mut report = ResolutionReport::default();

        let mut requested = BTreeSet::new();
        let mut requested_fragments = Vec::new();
        for id in ids {
            match state.entries.get(id) {
                None => {
                    report.failures.insert(id.clone(), "模块未注册".to_string());
                }
                Some(entry) if entry.resolved => {
                    trace!(module = %id, "模块已解析，跳过");
                }
                Some(entry) if entry.stale => {
                    report.failures.insert(id.clone(), "模块已过期，需要刷新".to_string());
                }
                Some(entry) => match entry.module.host_requirement {
                    Some(ref host_requirement) => {
                        let hosts = candidate_hosts(&state, host_requirement);
                        if hosts.is_empty() {
                            report.failures.insert(
                                id.clone(),
                                format!("没有可附加的宿主: {}", host_requirement),
                            );
                        } else {
                            requested.extend(hosts);
                            requested_fragments.push(id.clone());
                        }
                    }
                    None => {
                        requested.insert(id.clone());
                    }
                },
            }
        }

        if requested.is_empty() {
            return report;
        }

        // 其它未解析模块也作为候选提供方参与迭代
        let mut pending: BTreeSet<ModuleId> = state
            .entries
            .iter()
            .filter(|(_, e)| !e.resolved && !e.stale && !e.module.is_fragment())
            .map(|(id, _)| id.clone())
            .collect();
        pending.extend(requested.iter().cloned());
        debug!(requested = requested.len(), candidates = pending.len(), "开始解析");

        let mut excluded: HashSet<(ModuleId, ModuleId)> = HashSet::new();
        let attachments = loop {
            let attachments = compute_attachments(&state, &pending, &excluded);
            let providers = provider_index(&state, &pending, &attachments);
            let mut changed = false;

            for id in pending.clone() {
                if let Some(reason) = singleton_conflict(&state, &requested, &id) {
                    debug!(module = %id, reason = %reason, "单例冲突");
                    pending.remove(&id);
                    if requested.contains(&id) {
                        report.failures.insert(id, reason);
                    }
                    changed = true;
                }
            }

            for id in pending.clone() {
                let mut unsatisfied = Vec::new();
                for (origin, requirement) in effective_requirements(&state, &id, &attachments) {
                    if requirement.is_optional()
                        || select_provider(&providers, &id, requirement).is_some()
                    {
                        continue;
                    }
                    if origin != id {
                        // fragment 的需求无法满足时只放弃附加，不连累宿主
                        debug!(fragment = %origin, host = %id, requirement = %requirement, "放弃附加 fragment");
                        excluded.insert((origin, id.clone()));
                        changed = true;
                    } else {
                        unsatisfied.push(requirement.to_string());
                    }
                }

                if !unsatisfied.is_empty() {
                    let reason = format!("未满足的需求: {}", unsatisfied.join(", "));
                    trace!(module = %id, reason = %reason, "候选模块被剔除");
                    pending.remove(&id);
                    if requested.contains(&id) {
                        report.failures.insert(id, reason);
                    }
                    changed = true;
                }
            }

            if !changed {
                break attachments;
            }
        };

        // 只提交请求的模块及其经由连线需要的候选模块
        let providers = provider_index(&state, &pending, &attachments);
        let mut planned: BTreeMap<ModuleId, (Vec<Wire>, Vec<ModuleId>)> = BTreeMap::new();
        let mut queue: Vec<ModuleId> = requested
            .iter()
            .filter(|id| pending.contains(*id))
            .cloned()
            .collect();
        while let Some(id) = queue.pop() {
            if planned.contains_key(&id) {
                continue;
            }
            let wires: Vec<Wire> = effective_requirements(&state, &id, &attachments)
                .into_iter()
                .filter_map(|(_, requirement)| {
                    let provider = select_provider(&providers, &id, requirement)?;
                    (provider.module != id).then(|| Wire {
                        requirer: id.clone(),
                        requirement: requirement.clone(),
                        provider: provider.module.clone(),
                        capability: provider.capability.clone(),
                    })
                })
                .collect();
            for wire in &wires {
                if pending.contains(&wire.provider) && !planned.contains_key(&wire.provider) {
                    queue.push(wire.provider.clone());
                }
            }
            let fragments = attachments.get(&id).cloned().unwrap_or_default();
            planned.insert(id, (wires, fragments));
        }

        for (id, (wires, fragments)) in planned {
            for fragment in &fragments {
                report.attached_fragments.push((fragment.clone(), id.clone()));
            }
            state.commit(&id, wires, fragments);
            report.resolved.push(id);
        }

        for fragment in requested_fragments {
            let attached = state
                .entries
                .get(&fragment)
                .map(|e| e.resolved)
                .unwrap_or(false);
            if !attached {
                report
                    .failures
                    .entry(fragment)
                    .or_insert_with(|| "没有宿主成功解析".to_string());
            }
        }

        if report.failures.is_empty() {
            info!(resolved = report.resolved.len(), "解析完成");
        } else {
            warn!(
                resolved = report.resolved.len(),
                failed = report.failures.len(),
                "解析完成，部分模块失败"
            );
        }
        report
    }
}

/// fragment 可附加的未解析宿主
fn candidate_hosts(state: &RegistryState, host_requirement: &Requirement) -> Vec<ModuleId> {
    state
        .entries
        .iter()
        .filter(|(_, e)| !e.resolved && !e.stale && !e.module.is_fragment())
        .filter(|(_, e)| e.module.capabilities.iter().any(|c| host_requirement.matches(c)))
        .map(|(id, _)| id.clone())
        .collect()
}

/// 为每个未附加的 fragment 选择待解析集合中版本最高的宿主
fn compute_attachments(
    state: &RegistryState,
    pending: &BTreeSet<ModuleId>,
    excluded: &HashSet<(ModuleId, ModuleId)>,
) -> BTreeMap<ModuleId, Vec<ModuleId>> {
    let mut attachments: BTreeMap<ModuleId, Vec<ModuleId>> = BTreeMap::new();
    let mut fragments: Vec<&ModuleId> = state
        .entries
        .iter()
        .filter(|(_, e)| e.module.is_fragment() && !e.stale && e.host.is_none())
        .map(|(id, _)| id)
        .collect();
    fragments.sort();

    for fragment in fragments {
        let Some(requirement) = state
            .entries
            .get(fragment)
            .and_then(|e| e.module.host_requirement.as_ref())
        else {
            continue;
        };

        let best = pending
            .iter()
            .filter(|host| !excluded.contains(&(fragment.clone(), (*host).clone())))
            .filter_map(|host| state.entries.get(host).map(|e| (host, e)))
            .filter(|(_, e)| e.module.capabilities.iter().any(|c| requirement.matches(c)))
            .max_by(|(a, ea), (b, eb)| {
                a.version
                    .cmp(&b.version)
                    .then_with(|| eb.module.bundle_id.cmp(&ea.module.bundle_id))
            })
            .map(|(host, _)| host.clone());

        if let Some(host) = best {
            trace!(fragment = %fragment, host = %host, "暂定附加");
            attachments.entry(host).or_default().push(fragment.clone());
        }
    }

    attachments
}

/// 可作为提供方的能力：已解析且未过期的模块，加上待解析集合
fn provider_index(
    state: &RegistryState,
    pending: &BTreeSet<ModuleId>,
    attachments: &BTreeMap<ModuleId, Vec<ModuleId>>,
) -> Vec<ProviderCapability> {
    let mut index = Vec::new();
    for (id, entry) in &state.entries {
        if entry.module.is_fragment() || entry.stale {
            continue;
        }
        let fragments = if entry.resolved {
            entry.fragments.as_slice()
        } else if pending.contains(id) {
            attachments.get(id).map(Vec::as_slice).unwrap_or_default()
        } else {
            continue;
        };

        let fragment_caps = fragments
            .iter()
            .filter_map(|f| state.entries.get(f))
            .flat_map(|f| f.module.exports().cloned().collect::<Vec<_>>());

        for capability in entry.module.capabilities.iter().cloned().chain(fragment_caps) {
            index.push(ProviderCapability {
                module: id.clone(),
                bundle_id: entry.module.bundle_id,
                resolved: entry.resolved,
                capability,
            });
        }
    }
    index
}

/// 宿主自身需求加上暂定附加 fragment 的需求，附带需求来源
fn effective_requirements<'a>(
    state: &'a RegistryState,
    id: &ModuleId,
    attachments: &BTreeMap<ModuleId, Vec<ModuleId>>,
) -> Vec<(ModuleId, &'a Requirement)> {
    let mut requirements = Vec::new();
    if let Some(entry) = state.entries.get(id) {
        requirements.extend(entry.module.requirements.iter().map(|r| (id.clone(), r)));
    }
    for fragment in attachments.get(id).into_iter().flatten() {
        if let Some(entry) = state.entries.get(fragment) {
            requirements.extend(entry.module.requirements.iter().map(|r| (fragment.clone(), r)));
        }
    }
    requirements
}

/// 为需求选择提供方
///
/// 包导入优先连到其它模块，没有其它提供方时回落到自身导出（不生成连线）。
fn select_provider<'a>(
    providers: &'a [ProviderCapability],
    requirer: &ModuleId,
    requirement: &Requirement,
) -> Option<&'a ProviderCapability> {
    let matching = providers
        .iter()
        .filter(|p| p.capability.namespace != Namespace::Host)
        .filter(|p| requirement.matches(&p.capability));

    let (own, others): (Vec<_>, Vec<_>) = matching.partition(|p| p.module == *requirer);
    let best = others.into_iter().min_by(|a, b| provider_order(a, b));
    match (best, requirement.namespace) {
        (Some(best), _) => Some(best),
        (None, Namespace::Package) => own.into_iter().next(),
        (None, _) => None,
    }
}

fn provider_order(a: &ProviderCapability, b: &ProviderCapability) -> Ordering {
    b.resolved
        .cmp(&a.resolved)
        .then_with(|| b.capability.version.cmp(&a.capability.version))
        .then_with(|| a.bundle_id.cmp(&b.bundle_id))
        .then_with(|| a.module.revision.cmp(&b.module.revision))
}

/// 单例冲突：同名单例已解析，或本次请求中有更优的同名单例
fn singleton_conflict(
    state: &RegistryState,
    requested: &BTreeSet<ModuleId>,
    id: &ModuleId,
) -> Option<String> {
    let entry = state.entries.get(id)?;
    if !entry.module.singleton {
        return None;
    }

    let rival = state.entries.iter().find(|(other, e)| {
        *other != id
            && e.module.singleton
            && other.symbolic_name == id.symbolic_name
            && !e.stale
            && (e.resolved
                || (requested.contains(*other)
                    && (other.version > id.version
                        || (other.version == id.version && other.revision < id.revision))))
    });

    rival.map(|(other, _)| format!("单例 '{}' 已由 {} 占用", id.symbolic_name, other))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::module::ResolverModule;
    use crate::resolver::version::{parse_version, VersionRange};
    use semver::Version;

    struct Fixture {
        registry: Arc<ModuleRegistry>,
        resolver: Resolver,
        next: u64,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(ModuleRegistry::new());
            let resolver = Resolver::new(Arc::clone(&registry));
            Self {
                registry,
                resolver,
                next: 1,
            }
        }

        async fn add(&mut self, build: impl FnOnce(ResolverModule) -> ResolverModule, name: &str, version: &str) -> ModuleId {
            let rev = self.next;
            self.next += 1;
            let module = ResolverModule::new(
                ModuleId::new(name, parse_version(version).unwrap(), rev),
                rev,
            );
            self.registry.add_module(build(module)).await.unwrap()
        }
    }

    fn export(name: &str, version: &str) -> Capability {
        Capability::package(name, parse_version(version).unwrap())
    }

    fn import(name: &str, range: &str) -> Requirement {
        Requirement::package(name, VersionRange::parse(range).unwrap())
    }

    #[tokio::test]
    async fn test_simple_import_wires_to_exporter() {
        let mut fx = Fixture::new();
        let a = fx.add(|m| m.with_capability(export("p", "1.0.0")), "a", "1.0").await;
        let b = fx.add(|m| m.with_requirement(import("p", "[1.0,2.0)")), "b", "1.0").await;

        let report = fx.resolver.resolve(&b).await.unwrap();
        assert!(report.resolved.contains(&b));
        assert!(fx.registry.is_resolved(&b).await);

        let wires = fx.registry.get_wires(&b).await;
        assert_eq!(wires.len(), 1);
        assert_eq!(wires[0].provider, a);
        assert_eq!(wires[0].capability.name, "p");

        // 提供方被同批解析
        let report = fx.resolver.resolve_all(&[a.clone()]).await;
        assert!(report.resolved.is_empty());
        assert!(fx.registry.is_resolved(&a).await);
    }

    #[tokio::test]
    async fn test_resolution_is_all_or_nothing() {
        let mut fx = Fixture::new();
        fx.add(|m| m.with_capability(export("p", "1.0")), "a", "1.0").await;
        let m = fx
            .add(|m| m.with_requirement(import("p", "1.0")).with_requirement(import("missing", "1.0")), "m", "1.0")
            .await;

        let err = fx.resolver.resolve(&m).await.unwrap_err();
        match err {
            CoreError::ResolutionFailed { report, .. } => assert!(report.contains("missing")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!fx.registry.is_resolved(&m).await);
        assert!(fx.registry.get_wires(&m).await.is_empty());
    }

    #[tokio::test]
    async fn test_optional_requirement_skipped() {
        let mut fx = Fixture::new();
        let m = fx.add(|m| m.with_requirement(import("nowhere", "1.0").optional()), "m", "1.0").await;
        fx.resolver.resolve(&m).await.unwrap();
        assert!(fx.registry.get_wires(&m).await.is_empty());
    }

    #[tokio::test]
    async fn test_failure_propagates_through_batch() {
        let mut fx = Fixture::new();
        let a = fx
            .add(|m| m.with_capability(export("a.api", "1.0")).with_requirement(import("gone", "1.0")), "a", "1.0")
            .await;
        let b = fx.add(|m| m.with_requirement(import("a.api", "1.0")), "b", "1.0").await;
        let c = fx.add(|m| m.with_capability(export("c.api", "1.0")), "c", "1.0").await;

        let report = fx.resolver.resolve_all(&[a.clone(), b.clone(), c.clone()]).await;
        assert!(report.failure(&a).is_some());
        assert!(report.failure(&b).is_some());
        assert_eq!(report.resolved, vec![c.clone()]);
    }

    #[tokio::test]
    async fn test_cycle_resolves_together() {
        let mut fx = Fixture::new();
        let a = fx
            .add(|m| m.with_capability(export("a.api", "1.0")).with_requirement(import("b.api", "1.0")), "a", "1.0")
            .await;
        let b = fx
            .add(|m| m.with_capability(export("b.api", "1.0")).with_requirement(import("a.api", "1.0")), "b", "1.0")
            .await;

        let report = fx.resolver.resolve_all(&[a.clone()]).await;
        assert!(report.failures.is_empty());
        assert!(fx.registry.is_resolved(&a).await);
        assert!(fx.registry.is_resolved(&b).await);
    }

    #[tokio::test]
    async fn test_tie_break_prefers_highest_version_then_lowest_bundle() {
        let mut fx = Fixture::new();
        let low = fx.add(|m| m.with_capability(export("p", "1.0")), "low", "1.0").await;
        let high_first = fx.add(|m| m.with_capability(export("p", "1.5")), "hi1", "1.0").await;
        let _high_second = fx.add(|m| m.with_capability(export("p", "1.5")), "hi2", "1.0").await;
        let user = fx.add(|m| m.with_requirement(import("p", "[1.0,2.0)")), "user", "1.0").await;

        fx.resolver.resolve_all(&[low.clone()]).await;
        fx.resolver.resolve(&user).await.unwrap();
        // 已解析的低版本优先于未解析的高版本
        assert_eq!(fx.registry.get_wires(&user).await[0].provider, low);

        let user2 = fx.add(|m| m.with_requirement(import("p", "[1.2,2.0)")), "user2", "1.0").await;
        fx.resolver.resolve(&user2).await.unwrap();
        assert_eq!(fx.registry.get_wires(&user2).await[0].provider, high_first);
    }

    #[tokio::test]
    async fn test_self_export_fallback() {
        let mut fx = Fixture::new();
        let solo = fx
            .add(|m| m.with_capability(export("p", "1.0")).with_requirement(import("p", "1.0")), "solo", "1.0")
            .await;
        fx.resolver.resolve(&solo).await.unwrap();
        assert!(fx.registry.get_wires(&solo).await.is_empty());

        let other = fx.add(|m| m.with_capability(export("p", "1.0")), "other", "1.0").await;
        let both = fx
            .add(|m| m.with_capability(export("p", "1.0")).with_requirement(import("p", "1.0")), "both", "1.0")
            .await;
        fx.resolver.resolve_all(&[other.clone()]).await;
        fx.resolver.resolve(&both).await.unwrap();
        let wires = fx.registry.get_wires(&both).await;
        assert_eq!(wires.len(), 1);
        assert_ne!(wires[0].provider, both);
    }

    #[tokio::test]
    async fn test_stale_module_is_not_a_provider() {
        let mut fx = Fixture::new();
        let a = fx.add(|m| m.with_capability(export("p", "1.0")), "a", "1.0").await;
        fx.resolver.resolve(&a).await.unwrap();
        fx.registry.mark_stale(&a).await;

        let b = fx.add(|m| m.with_requirement(import("p", "1.0")), "b", "1.0").await;
        assert!(fx.resolver.resolve(&b).await.is_err());
    }

    #[tokio::test]
    async fn test_require_bundle() {
        let mut fx = Fixture::new();
        let lib = fx.add(|m| m, "lib", "2.1").await;
        let app = fx
            .add(|m| m.with_requirement(Requirement::bundle("lib", VersionRange::parse("[2.0,3.0)").unwrap())), "app", "1.0")
            .await;
        fx.resolver.resolve(&app).await.unwrap();
        let wires = fx.registry.get_wires(&app).await;
        assert_eq!(wires[0].provider, lib);
        assert_eq!(wires[0].requirement.namespace, Namespace::Bundle);
    }

    #[tokio::test]
    async fn test_fragment_attaches_to_highest_version_host() {
        let mut fx = Fixture::new();
        let h1 = fx.add(|m| m, "host", "1.0").await;
        let h2 = fx.add(|m| m, "host", "2.0").await;
        let frag = fx
            .add(|m| m.with_capability(export("frag.api", "1.0")).with_host(Requirement::host("host", VersionRange::any())), "frag", "1.0")
            .await;

        let report = fx.resolver.resolve_all(&[h1.clone(), h2.clone()]).await;
        assert_eq!(report.attached_fragments, vec![(frag.clone(), h2.clone())]);
        assert_eq!(fx.registry.host_of(&frag).await, Some(h2.clone()));
        assert!(fx.registry.fragments_of(&h1).await.is_empty());

        // fragment 的导出包经由宿主对外提供
        let user = fx.add(|m| m.with_requirement(import("frag.api", "1.0")), "user", "1.0").await;
        fx.resolver.resolve(&user).await.unwrap();
        assert_eq!(fx.registry.get_wires(&user).await[0].provider, h2);
    }

    #[tokio::test]
    async fn test_unsatisfied_fragment_does_not_fail_host() {
        let mut fx = Fixture::new();
        let host = fx.add(|m| m, "host", "1.0").await;
        let frag = fx
            .add(|m| m.with_requirement(import("absent", "1.0")).with_host(Requirement::host("host", VersionRange::any())), "frag", "1.0")
            .await;

        let report = fx.resolver.resolve_all(&[host.clone(), frag.clone()]).await;
        assert!(fx.registry.is_resolved(&host).await);
        assert!(!fx.registry.is_resolved(&frag).await);
        assert!(report.failure(&frag).is_some());
    }

    #[tokio::test]
    async fn test_singleton_only_one_resolves() {
        let mut fx = Fixture::new();
        let s1 = fx.add(|m| m.with_singleton(true), "single", "1.0").await;
        let s2 = fx.add(|m| m.with_singleton(true), "single", "2.0").await;

        let report = fx.resolver.resolve_all(&[s1.clone(), s2.clone()]).await;
        assert_eq!(report.resolved, vec![s2.clone()]);
        assert!(report.failure(&s1).unwrap().contains("单例"));

        // 已解析的单例阻止后来者
        let s3 = fx.add(|m| m.with_singleton(true), "single", "3.0").await;
        assert!(fx.resolver.resolve(&s3).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_module_reported() {
        let fx = Fixture::new();
        let ghost = ModuleId::new("ghost", Version::new(1, 0, 0), 99);
        let report = fx.resolver.resolve_all(&[ghost.clone()]).await;
        assert!(report.failure(&ghost).is_some());
    }
}
