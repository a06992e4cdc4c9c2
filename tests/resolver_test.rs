//! # 依赖解析集成测试
//!
//! 直接使用模块注册表与解析器：
//! - 版本范围选择提供方
//! - Require-Bundle 再导出链与类加载委派
//! - 内容根中的资源查找
//! - 可选需求与批量解析

use std::sync::Arc;

use chips_bundles::resolver::ResolverModule;
use chips_bundles::{Capability, ModuleId, ModuleRegistry, Requirement, Resolver, VersionRange};
use semver::Version;
use tempfile::TempDir;

fn module(name: &str, version: &str, revision: u64) -> ResolverModule {
    ResolverModule::new(
        ModuleId::new(name, Version::parse(version).unwrap(), revision),
        revision,
    )
}

fn export(name: &str, version: &str) -> Capability {
    Capability::package(name, Version::parse(version).unwrap())
}

fn import(name: &str, range: &str) -> Requirement {
    Requirement::package(name, VersionRange::parse(range).unwrap())
}

fn setup() -> (Arc<ModuleRegistry>, Resolver) {
    let registry = Arc::new(ModuleRegistry::new());
    let resolver = Resolver::new(Arc::clone(&registry));
    (registry, resolver)
}

#[tokio::test]
async fn test_range_picks_matching_provider() {
    let (registry, resolver) = setup();
    let old = registry
        .add_module(module("log.v1", "1.4.0", 1).with_capability(export("acme.log", "1.4.0")))
        .await
        .unwrap();
    let new = registry
        .add_module(module("log.v2", "2.1.0", 2).with_capability(export("acme.log", "2.1.0")))
        .await
        .unwrap();
    let legacy = registry
        .add_module(module("legacy", "1.0.0", 3).with_requirement(import("acme.log", "[1.0,2.0)")))
        .await
        .unwrap();
    let modern = registry
        .add_module(module("modern", "1.0.0", 4).with_requirement(import("acme.log", "2.0")))
        .await
        .unwrap();

    let report = resolver.resolve_all(&[legacy.clone(), modern.clone()]).await;
    assert!(report.is_success());

    assert_eq!(registry.get_wires(&legacy).await[0].provider, old);
    assert_eq!(registry.get_wires(&modern).await[0].provider, new);
    assert_eq!(registry.direct_dependents(&old).await, vec![legacy]);
}

#[tokio::test]
async fn test_unsatisfiable_range_reports_requirement() {
    let (registry, resolver) = setup();
    registry
        .add_module(module("log", "1.4.0", 1).with_capability(export("acme.log", "1.4.0")))
        .await
        .unwrap();
    let app = registry
        .add_module(module("app", "1.0.0", 2).with_requirement(import("acme.log", "[3.0,4.0)")))
        .await
        .unwrap();

    let err = resolver.resolve(&app).await.unwrap_err();
    assert!(err.to_string().contains("acme.log"));
    assert!(!registry.is_resolved(&app).await);
    assert!(registry.get_wires(&app).await.is_empty());
}

#[tokio::test]
async fn test_optional_import_wired_only_when_available() {
    let (registry, resolver) = setup();
    let app = registry
        .add_module(module("app", "1.0.0", 1).with_requirement(import("acme.extra", "").optional()))
        .await
        .unwrap();
    resolver.resolve(&app).await.unwrap();
    assert!(registry.get_wires(&app).await.is_empty());

    let extra = registry
        .add_module(module("extra", "1.0.0", 2).with_capability(export("acme.extra", "1.0.0")))
        .await
        .unwrap();
    let late = registry
        .add_module(module("late", "1.0.0", 3).with_requirement(import("acme.extra", "").optional()))
        .await
        .unwrap();
    resolver.resolve(&late).await.unwrap();
    assert_eq!(registry.get_wires(&late).await[0].provider, extra);
}

#[tokio::test]
async fn test_reexport_chain_visible_to_requirer() {
    let (registry, resolver) = setup();
    let base = registry
        .add_module(module("base", "1.0.0", 1).with_capability(export("base.api", "1.0.0")))
        .await
        .unwrap();
    let mid = registry
        .add_module(
            module("mid", "1.0.0", 2)
                .with_capability(export("mid.api", "1.0.0"))
                .with_requirement(Requirement::bundle("base", VersionRange::any()).reexported()),
        )
        .await
        .unwrap();
    let app = registry
        .add_module(module("app", "1.0.0", 3).with_requirement(Requirement::bundle("mid", VersionRange::any())))
        .await
        .unwrap();

    let report = resolver.resolve(&app).await.unwrap();
    assert_eq!(report.resolved.len(), 3);

    let spec = registry.class_loading_spec(&app).await.unwrap();
    assert_eq!(spec.required_bundles, vec![mid.clone(), base.clone()]);
    assert_eq!(spec.package_delegation.get("base.api"), Some(&base));

    let defining = registry.load_class(&app, "base.api.Logger").await.unwrap();
    assert_eq!(defining, base);
}

#[tokio::test]
async fn test_resource_lookup_in_content_roots() {
    let dir = TempDir::new().unwrap();
    let classes = dir.path().join("classes");
    tokio::fs::create_dir_all(classes.join("acme/impl")).await.unwrap();
    tokio::fs::write(classes.join("acme/impl/Worker.class"), b"\xca\xfe\xba\xbe")
        .await
        .unwrap();
    tokio::fs::write(classes.join("plugin.properties"), "name=worker")
        .await
        .unwrap();

    let (registry, resolver) = setup();
    let worker = registry
        .add_module(module("worker", "1.0.0", 1).with_content_roots(vec![classes.clone()]))
        .await
        .unwrap();
    resolver.resolve(&worker).await.unwrap();

    let unit = registry.class_loading_unit(&worker).await.unwrap();
    assert_eq!(unit.find_resource("plugin.properties"), Some(classes.join("plugin.properties")));
    assert!(unit.find_resource("missing.txt").is_none());

    assert_eq!(registry.load_class(&worker, "acme.impl.Worker").await.unwrap(), worker);
    assert!(registry.load_class(&worker, "acme.impl.Missing").await.is_err());
}

#[tokio::test]
async fn test_batch_failure_is_isolated() {
    let (registry, resolver) = setup();
    let api = registry
        .add_module(module("api", "1.0.0", 1).with_capability(export("acme.api", "1.0.0")))
        .await
        .unwrap();
    let good = registry
        .add_module(module("good", "1.0.0", 2).with_requirement(import("acme.api", "")))
        .await
        .unwrap();
    let bad = registry
        .add_module(module("bad", "1.0.0", 3).with_requirement(import("acme.nowhere", "")))
        .await
        .unwrap();

    let report = resolver.resolve_all(&[good.clone(), bad.clone()]).await;
    assert!(!report.is_success());
    assert!(report.failure(&bad).is_some());
    assert!(report.failure(&good).is_none());
    assert!(registry.is_resolved(&good).await);
    assert!(registry.is_resolved(&api).await);
    assert!(!registry.is_resolved(&bad).await);
}
