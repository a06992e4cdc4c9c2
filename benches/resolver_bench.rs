//! 依赖解析性能基准测试
//!
//! 使用 Criterion 框架进行性能测试，包括：
//! - 版本范围与清单解析基准
//! - 不同规模的批量解析基准
//! - 类加载委派查找基准
//! - 框架安装并启动 bundle 的完整流程基准

use std::sync::Arc;

use chips_bundles::bundle::headers;
use chips_bundles::resolver::ResolverModule;
use chips_bundles::{
    BundleManifest, Capability, Deployment, Framework, ModuleId, ModuleRegistry, Requirement, Resolver,
    StartOptions, VersionRange,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use semver::Version;

// ============================================================================
// 测试辅助
// ============================================================================

/// 构建一条长度为 `size` 的导入链：模块 i 导入模块 i-1 导出的包
async fn chain_registry(size: usize) -> (Arc<ModuleRegistry>, Vec<ModuleId>) {
    let registry = Arc::new(ModuleRegistry::new());
    let mut ids = Vec::with_capacity(size);
    for i in 0..size {
        let id = ModuleId::new(format!("bench.m{}", i), Version::new(1, 0, i as u64), i as u64 + 1);
        let mut module = ResolverModule::new(id, i as u64 + 1)
            .with_capability(Capability::package(format!("bench.p{}", i), Version::new(1, 0, 0)));
        if i > 0 {
            module = module.with_requirement(Requirement::package(
                format!("bench.p{}", i - 1),
                VersionRange::any(),
            ));
        }
        ids.push(registry.add_module(module).await.unwrap());
    }
    (registry, ids)
}

// ============================================================================
// 解析基准测试
// ============================================================================

/// 版本范围与清单头部解析
fn parsing_benchmark(c: &mut Criterion) {
    c.bench_function("version_range_parse", |b| {
        b.iter(|| VersionRange::parse(black_box("[1.2.3,2.0.0)")).unwrap());
    });

    let mut manifest_headers = std::collections::BTreeMap::new();
    manifest_headers.insert(headers::MANIFEST_VERSION.to_string(), "2".to_string());
    manifest_headers.insert(headers::SYMBOLIC_NAME.to_string(), "bench.bundle".to_string());
    manifest_headers.insert(headers::VERSION.to_string(), "1.0.0".to_string());
    manifest_headers.insert(
        headers::EXPORT_PACKAGE.to_string(),
        "bench.api;version=1.0.0,bench.spi;version=1.0.0".to_string(),
    );
    manifest_headers.insert(
        headers::IMPORT_PACKAGE.to_string(),
        "bench.log;version=\"[1.0,2.0)\",bench.util;resolution:=optional".to_string(),
    );
    c.bench_function("manifest_parse", |b| {
        b.iter(|| BundleManifest::parse(black_box(manifest_headers.clone())).unwrap());
    });
}

/// 不同长度的依赖链批量解析
fn resolve_chain_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("resolve_chain");

    for size in [10usize, 50, 200].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.to_async(&rt).iter(|| async move {
                let (registry, ids) = chain_registry(size).await;
                let resolver = Resolver::new(registry);
                let last = ids.last().cloned().unwrap();
                resolver.resolve(black_box(&last)).await.unwrap()
            });
        });
    }

    group.finish();
}

/// 已解析模块上的类加载委派查找
fn load_class_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (registry, ids) = rt.block_on(async {
        let (registry, ids) = chain_registry(20).await;
        let resolver = Resolver::new(Arc::clone(&registry));
        resolver.resolve_all(&ids).await;
        (registry, ids)
    });
    let last = ids.last().cloned().unwrap();

    c.bench_function("load_class_delegated", |b| {
        b.to_async(&rt).iter(|| async {
            registry
                .load_class(black_box(&last), black_box("bench.p18.Service"))
                .await
                .unwrap()
        });
    });
}

// ============================================================================
// 框架基准测试
// ============================================================================

/// 安装一对提供方与使用方并启动使用方
fn framework_flow_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("framework_install_and_start", |b| {
        b.to_async(&rt).iter(|| async {
            let framework = Framework::builder().build().await.unwrap();
            framework.start().await.unwrap();
            framework
                .install_bundle(
                    Deployment::new("mem:bench.api")
                        .header(headers::SYMBOLIC_NAME, "bench.api")
                        .header(headers::EXPORT_PACKAGE, "bench.api"),
                )
                .await
                .unwrap();
            let app = framework
                .install_bundle(
                    Deployment::new("mem:bench.app")
                        .header(headers::SYMBOLIC_NAME, "bench.app")
                        .header(headers::IMPORT_PACKAGE, "bench.api"),
                )
                .await
                .unwrap();
            framework
                .start_bundle(app.id(), StartOptions::default())
                .await
                .unwrap();
            framework.stop().join().await.unwrap();
        });
    });
}

// ============================================================================
// 基准测试组
// ============================================================================

criterion_group!(
    name = parsing_benches;
    config = Criterion::default().sample_size(200);
    targets = parsing_benchmark
);

criterion_group!(
    name = resolver_benches;
    config = Criterion::default().sample_size(50);
    targets = resolve_chain_benchmark, load_class_benchmark
);

criterion_group!(
    name = framework_benches;
    config = Criterion::default().sample_size(30);
    targets = framework_flow_benchmark
);

criterion_main!(parsing_benches, resolver_benches, framework_benches);
