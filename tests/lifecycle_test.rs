//! # bundle 生命周期集成测试
//!
//! 通过公开 API 验证完整流程：
//! - 安装 → 解析 → 连线 → 启动 → 停止
//! - fragment 附加与全有或全无的解析
//! - 激活失败时的事件与回滚
//! - 仍被连线时的卸载与刷新回收

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chips_bundles::bundle::headers;
use chips_bundles::{
    ActivatorRegistry, BundleActivator, BundleContext, BundleEventKind, BundleState, CoreError, Deployment,
    Event, EventCallback, EventFilter, Framework, FrameworkEventKind, StartOptions, StateMask, StopOptions,
};

// ============================================================================
// 测试辅助
// ============================================================================

/// 启动时注册一个服务的激活器
struct GreeterActivator {
    started: Arc<AtomicUsize>,
    fail: bool,
}

#[async_trait]
impl BundleActivator for GreeterActivator {
    async fn start(&mut self, context: Arc<BundleContext>) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("greeter 初始化失败");
        }
        context
            .register_service(
                vec!["acme.Greeter".to_string()],
                Default::default(),
                Arc::new(String::from("hello")),
            )
            .await?;
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&mut self, _context: Arc<BundleContext>) -> anyhow::Result<()> {
        Ok(())
    }
}

async fn running_framework() -> (Framework, Arc<AtomicUsize>) {
    let started = Arc::new(AtomicUsize::new(0));
    let activators = Arc::new(ActivatorRegistry::new());
    let counter = Arc::clone(&started);
    activators
        .register_fn("acme.GreeterActivator", move || {
            Ok(Box::new(GreeterActivator {
                started: Arc::clone(&counter),
                fail: false,
            }) as Box<dyn BundleActivator>)
        })
        .await;
    activators
        .register_fn("acme.BrokenActivator", || {
            Ok(Box::new(GreeterActivator {
                started: Arc::new(AtomicUsize::new(0)),
                fail: true,
            }) as Box<dyn BundleActivator>)
        })
        .await;

    let framework = Framework::builder().activators(activators).build().await.unwrap();
    framework.start().await.unwrap();
    (framework, started)
}

fn bundle(name: &str) -> Deployment {
    Deployment::new(format!("mem:{}", name))
        .header(headers::MANIFEST_VERSION, "2")
        .header(headers::SYMBOLIC_NAME, name)
        .header(headers::VERSION, "1.0.0")
}

/// 记录非系统 bundle 的事件
async fn record_events(framework: &Framework) -> Arc<Mutex<Vec<(u64, BundleEventKind)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: EventCallback = Arc::new(move |event: Event| {
        if let Some(event) = event.as_bundle() {
            if event.bundle_id != 0 {
                sink.lock().unwrap().push((event.bundle_id, event.kind));
            }
        }
    });
    framework.subscribe(EventFilter::Bundle, callback).await;
    seen
}

// ============================================================================
// 解析与连线
// ============================================================================

#[tokio::test]
async fn test_import_wires_to_exporter() {
    let (framework, _) = running_framework().await;

    let api = framework
        .install_bundle(bundle("acme.api").header(headers::EXPORT_PACKAGE, "acme.api;version=1.0.0"))
        .await
        .unwrap();
    let app = framework
        .install_bundle(bundle("acme.app").header(headers::IMPORT_PACKAGE, "acme.api;version=\"[1.0,2.0)\""))
        .await
        .unwrap();
    assert_eq!(api.state(), BundleState::Installed);
    assert_eq!(app.state(), BundleState::Installed);

    assert!(framework.resolve_bundles(Some(vec![app.id()])).await);
    assert_eq!(app.state(), BundleState::Resolved);
    assert_eq!(api.state(), BundleState::Resolved);

    let wires = framework.registry().get_wires(&app.module_id().await).await;
    assert_eq!(wires.len(), 1);
    assert_eq!(wires[0].provider, api.module_id().await);
    assert_eq!(wires[0].capability.name, "acme.api");
}

#[tokio::test]
async fn test_class_load_delegates_to_provider() {
    let (framework, _) = running_framework().await;

    let api = framework
        .install_bundle(bundle("acme.api").header(headers::EXPORT_PACKAGE, "acme.api"))
        .await
        .unwrap();
    let app = framework
        .install_bundle(
            bundle("acme.app")
                .header(headers::IMPORT_PACKAGE, "acme.api")
                .header(headers::ACTIVATOR, "acme.GreeterActivator"),
        )
        .await
        .unwrap();
    framework.start_bundle(app.id(), StartOptions::default()).await.unwrap();

    let context = app.context().await.unwrap();
    let defining = context.load_class("acme.api.Greeter").await.unwrap();
    assert_eq!(defining, api.module_id().await);
}

#[tokio::test]
async fn test_fragment_attaches_to_host() {
    let (framework, _) = running_framework().await;
    let seen = record_events(&framework).await;

    let fragment = framework
        .install_bundle(
            bundle("acme.host.nls")
                .header(headers::FRAGMENT_HOST, "acme.host")
                .header(headers::EXPORT_PACKAGE, "acme.host.nls"),
        )
        .await
        .unwrap();
    let host = framework.install_bundle(bundle("acme.host")).await.unwrap();
    assert!(fragment.is_fragment());

    // 只启动宿主，fragment 随宿主解析而附加
    framework.start_bundle(host.id(), StartOptions::default()).await.unwrap();
    assert_eq!(host.state(), BundleState::Active);
    assert_eq!(fragment.state(), BundleState::Resolved);
    assert!(seen
        .lock()
        .unwrap()
        .iter()
        .all(|(id, kind)| *id != fragment.id() || *kind != BundleEventKind::Starting));

    let registry = framework.registry();
    assert_eq!(
        registry.host_of(&fragment.module_id().await).await,
        Some(host.module_id().await)
    );

    // 宿主对外提供 fragment 贡献的包
    let user = framework
        .install_bundle(bundle("acme.user").header(headers::IMPORT_PACKAGE, "acme.host.nls"))
        .await
        .unwrap();
    assert!(framework.resolve_bundles(Some(vec![user.id()])).await);
    let wires = registry.get_wires(&user.module_id().await).await;
    assert_eq!(wires[0].provider, host.module_id().await);

    assert!(matches!(
        framework.start_bundle(fragment.id(), StartOptions::default()).await,
        Err(CoreError::FragmentOperation { .. })
    ));
}

#[tokio::test]
async fn test_resolution_is_all_or_nothing() {
    let (framework, _) = running_framework().await;

    let api = framework
        .install_bundle(bundle("acme.api").header(headers::EXPORT_PACKAGE, "acme.api"))
        .await
        .unwrap();
    let broken = framework
        .install_bundle(
            bundle("acme.broken")
                .header(headers::EXPORT_PACKAGE, "acme.broken")
                .header(headers::IMPORT_PACKAGE, "acme.missing"),
        )
        .await
        .unwrap();
    let app = framework
        .install_bundle(bundle("acme.app").header(headers::IMPORT_PACKAGE, "acme.api,acme.broken"))
        .await
        .unwrap();

    let err = framework
        .start_bundle(app.id(), StartOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ResolutionFailed { .. }));

    for bundle in [&api, &broken, &app] {
        assert_eq!(bundle.state(), BundleState::Installed);
    }
    assert!(framework.registry().get_wires(&app.module_id().await).await.is_empty());
    // 持久启动标记在解析失败前已记录
    assert!(app.is_persistently_started());
}

// ============================================================================
// 安装
// ============================================================================

#[tokio::test]
async fn test_install_same_location_is_idempotent() {
    let (framework, _) = running_framework().await;
    let seen = record_events(&framework).await;

    let first = framework.install_bundle(bundle("acme.once")).await.unwrap();
    let second = framework
        .install_bundle(bundle("acme.once").header(headers::VERSION, "9.9.9"))
        .await
        .unwrap();
    assert_eq!(first.id(), second.id());
    assert_eq!(first.version().await, semver::Version::new(1, 0, 0));
    assert_eq!(framework.get_bundles(StateMask::INSTALLED_ANY).await.len(), 2);

    let installs = seen
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, kind)| *kind == BundleEventKind::Installed)
        .count();
    assert_eq!(installs, 1);
}

#[tokio::test]
async fn test_invalid_manifest_leaves_nothing_behind() {
    let (framework, _) = running_framework().await;

    let err = framework
        .install_bundle(bundle("acme.bad").header(headers::IMPORT_PACKAGE, "java.lang"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), chips_bundles::error_code::INSTALL_VALIDATION_FAILED);
    assert!(framework.get_bundle_by_location("mem:acme.bad").await.is_none());
    assert_eq!(framework.get_bundles(StateMask::ALL).await.len(), 1);
}

// ============================================================================
// 启动与停止
// ============================================================================

#[tokio::test]
async fn test_start_registers_services_and_stop_releases_them() {
    let (framework, started) = running_framework().await;
    let greeter = framework
        .install_bundle(bundle("acme.greeter").header(headers::ACTIVATOR, "acme.GreeterActivator"))
        .await
        .unwrap();
    let seen = record_events(&framework).await;

    framework.start_bundle(greeter.id(), StartOptions::default()).await.unwrap();
    assert_eq!(greeter.state(), BundleState::Active);
    assert_eq!(started.load(Ordering::SeqCst), 1);

    let reference = framework.services().get_reference("acme.Greeter").await.unwrap();
    assert_eq!(reference.owner, greeter.id());

    framework
        .stop_bundle(greeter.id(), StopOptions::default())
        .await
        .unwrap();
    assert_eq!(greeter.state(), BundleState::Resolved);
    assert!(framework.services().get_reference("acme.Greeter").await.is_none());

    let kinds: Vec<BundleEventKind> = seen.lock().unwrap().iter().map(|(_, kind)| *kind).collect();
    assert_eq!(
        kinds,
        vec![
            BundleEventKind::Resolved,
            BundleEventKind::Starting,
            BundleEventKind::Started,
            BundleEventKind::Stopping,
            BundleEventKind::Stopped,
        ]
    );
}

#[tokio::test]
async fn test_activation_failure_fires_error_and_rolls_back() {
    let (framework, _) = running_framework().await;
    let broken = framework
        .install_bundle(bundle("acme.broken").header(headers::ACTIVATOR, "acme.BrokenActivator"))
        .await
        .unwrap();
    let seen = record_events(&framework).await;

    let err = framework
        .start_bundle(broken.id(), StartOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ActivationFailed { .. }));
    assert_eq!(broken.state(), BundleState::Resolved);
    assert!(broken.context().await.is_none());

    let kinds: Vec<BundleEventKind> = seen.lock().unwrap().iter().map(|(_, kind)| *kind).collect();
    assert_eq!(
        kinds,
        vec![
            BundleEventKind::Resolved,
            BundleEventKind::Starting,
            BundleEventKind::Stopping,
            BundleEventKind::Stopped,
        ]
    );
}

#[tokio::test]
async fn test_lazy_bundle_activates_on_first_class_load() {
    let (framework, started) = running_framework().await;
    let lazy = framework
        .install_bundle(
            bundle("acme.lazy")
                .header(headers::EXPORT_PACKAGE, "acme.lazy")
                .header(headers::ACTIVATOR, "acme.GreeterActivator")
                .header(headers::ACTIVATION_POLICY, "lazy"),
        )
        .await
        .unwrap();

    framework.start_bundle(lazy.id(), StartOptions::default()).await.unwrap();
    assert_eq!(lazy.state(), BundleState::Starting);
    assert!(lazy.is_lazy_pending());
    assert_eq!(started.load(Ordering::SeqCst), 0);

    framework
        .registry()
        .load_class(&lazy.module_id().await, "acme.lazy.Impl")
        .await
        .unwrap();
    assert_eq!(lazy.state(), BundleState::Active);
    assert_eq!(started.load(Ordering::SeqCst), 1);
}

// ============================================================================
// 卸载与刷新
// ============================================================================

#[tokio::test]
async fn test_uninstall_wired_provider_then_refresh() {
    let (framework, _) = running_framework().await;

    let api = framework
        .install_bundle(bundle("acme.api").header(headers::EXPORT_PACKAGE, "acme.api"))
        .await
        .unwrap();
    let app = framework
        .install_bundle(
            bundle("acme.app")
                .header(headers::IMPORT_PACKAGE, "acme.api")
                .header(headers::ACTIVATOR, "acme.GreeterActivator"),
        )
        .await
        .unwrap();
    framework.start_bundle(app.id(), StartOptions::default()).await.unwrap();
    let api_module = api.module_id().await;

    framework.uninstall_bundle(api.id()).await.unwrap();
    assert_eq!(api.state(), BundleState::Uninstalled);
    // 仍被 app 连线，模块保留为过期状态
    assert!(framework.registry().is_stale(&api_module).await);
    assert_eq!(app.state(), BundleState::Active);
    assert!(framework.get_bundle_by_location("mem:acme.api").await.is_none());

    let refreshed_events = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&refreshed_events);
    let callback: EventCallback = Arc::new(move |event: Event| {
        if matches!(event.as_framework(), Some(e) if e.kind == FrameworkEventKind::PackagesRefreshed) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    framework.subscribe(EventFilter::Framework, callback).await;

    let refreshed = framework.refresh_bundles(None).await;
    assert_eq!(refreshed, vec![api.id(), app.id()]);
    assert_eq!(refreshed_events.load(Ordering::SeqCst), 1);
    assert!(framework.get_bundle(api.id()).await.is_none());
    assert!(framework.registry().get_module(&api_module).await.is_none());
    assert_eq!(app.state(), BundleState::Installed);

    // 重新安装提供方后 app 可以再次启动
    framework
        .install_bundle(bundle("acme.api").header(headers::EXPORT_PACKAGE, "acme.api"))
        .await
        .unwrap();
    framework.start_bundle(app.id(), StartOptions::default()).await.unwrap();
    assert_eq!(app.state(), BundleState::Active);
}

#[tokio::test]
async fn test_uninstall_unwired_bundle_purges_immediately() {
    let (framework, _) = running_framework().await;
    let lonely = framework.install_bundle(bundle("acme.lonely")).await.unwrap();
    let module = lonely.module_id().await;

    framework.uninstall_bundle(lonely.id()).await.unwrap();
    assert!(framework.get_bundle(lonely.id()).await.is_none());
    assert!(framework.registry().get_module(&module).await.is_none());
    assert!(framework.uninstall_bundle(lonely.id()).await.is_err());
}

#[tokio::test]
async fn test_uninstalled_fragment_stays_attached_until_refresh() {
    let (framework, _) = running_framework().await;
    let fragment = framework
        .install_bundle(
            bundle("acme.host.nls")
                .header(headers::FRAGMENT_HOST, "acme.host")
                .header(headers::EXPORT_PACKAGE, "acme.host.nls"),
        )
        .await
        .unwrap();
    let host = framework.install_bundle(bundle("acme.host")).await.unwrap();
    framework.start_bundle(host.id(), StartOptions::default()).await.unwrap();

    let registry = framework.registry();
    let host_module = host.module_id().await;
    let fragment_module = fragment.module_id().await;
    let local = registry.class_loading_spec(&host_module).await.unwrap().local_packages;
    assert!(local.contains("acme.host.nls"));

    framework.uninstall_bundle(fragment.id()).await.unwrap();
    assert_eq!(fragment.state(), BundleState::Uninstalled);
    assert_eq!(host.state(), BundleState::Active);
    // 宿主未刷新前 fragment 仍附加，贡献的包保持可见
    assert!(framework.get_bundle(fragment.id()).await.is_some());
    assert!(registry.is_stale(&fragment_module).await);
    assert_eq!(registry.host_of(&fragment_module).await, Some(host_module.clone()));
    let local = registry.class_loading_spec(&host_module).await.unwrap().local_packages;
    assert!(local.contains("acme.host.nls"));
    assert!(framework.collect_garbage().await.is_empty());

    let refreshed = framework.refresh_bundles(None).await;
    assert_eq!(refreshed, vec![fragment.id(), host.id()]);
    assert!(framework.get_bundle(fragment.id()).await.is_none());
    assert!(registry.get_module(&fragment_module).await.is_none());
    assert_eq!(host.state(), BundleState::Active);
    let local = registry
        .class_loading_spec(&host.module_id().await)
        .await
        .unwrap()
        .local_packages;
    assert!(!local.contains("acme.host.nls"));
}

#[tokio::test]
async fn test_system_bundle_cannot_be_uninstalled_or_updated() {
    let (framework, _) = running_framework().await;
    assert!(matches!(
        framework.uninstall_bundle(0).await,
        Err(CoreError::IllegalState { .. })
    ));
    assert!(matches!(
        framework.update_bundle(0, None).await,
        Err(CoreError::IllegalState { .. })
    ));
    assert!(framework.is_active());
}

// ============================================================================
// 并发
// ============================================================================

/// 统计启动与停止次数的激活器
struct CountingActivator {
    starts: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
}

#[async_trait]
impl BundleActivator for CountingActivator {
    async fn start(&mut self, _context: Arc<BundleContext>) -> anyhow::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn stop(&mut self, _context: Arc<BundleContext>) -> anyhow::Result<()> {
        tokio::task::yield_now().await;
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// 事件序列是否是合法的状态路径
fn is_valid_path(kinds: &[BundleEventKind]) -> bool {
    use BundleEventKind::*;
    let mut previous = Resolved;
    for kind in kinds {
        let allowed = matches!(
            (previous, *kind),
            (Resolved, Starting)
                | (Starting, Started)
                | (Starting, Stopping)
                | (Started, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Starting)
        );
        if !allowed {
            return false;
        }
        previous = *kind;
    }
    true
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_start_and_stop_serialize() {
    let starts = Arc::new(AtomicUsize::new(0));
    let stops = Arc::new(AtomicUsize::new(0));
    let activators = Arc::new(ActivatorRegistry::new());
    let (start_counter, stop_counter) = (Arc::clone(&starts), Arc::clone(&stops));
    activators
        .register_fn("acme.CountingActivator", move || {
            Ok(Box::new(CountingActivator {
                starts: Arc::clone(&start_counter),
                stops: Arc::clone(&stop_counter),
            }) as Box<dyn BundleActivator>)
        })
        .await;
    let framework = Framework::builder().activators(activators).build().await.unwrap();
    framework.start().await.unwrap();

    let target = framework
        .install_bundle(bundle("acme.racy").header(headers::ACTIVATOR, "acme.CountingActivator"))
        .await
        .unwrap();
    assert!(framework.resolve_bundles(Some(vec![target.id()])).await);
    let seen = record_events(&framework).await;

    for _ in 0..50 {
        let starter = framework.clone();
        let stopper = framework.clone();
        let id = target.id();
        let start = tokio::spawn(async move { starter.start_bundle(id, StartOptions::default()).await });
        let stop = tokio::spawn(async move { stopper.stop_bundle(id, StopOptions::default()).await });
        start.await.unwrap().unwrap();
        stop.await.unwrap().unwrap();

        let state = target.state();
        assert!(
            state == BundleState::Active || state == BundleState::Resolved,
            "非法的最终状态 {:?}",
            state
        );
        let running = usize::from(state == BundleState::Active);
        assert_eq!(
            starts.load(Ordering::SeqCst),
            stops.load(Ordering::SeqCst) + running
        );
    }

    framework
        .stop_bundle(target.id(), StopOptions::default())
        .await
        .unwrap();
    assert_eq!(target.state(), BundleState::Resolved);
    assert_eq!(starts.load(Ordering::SeqCst), stops.load(Ordering::SeqCst));

    let kinds: Vec<BundleEventKind> = seen
        .lock()
        .unwrap()
        .iter()
        .filter(|(id, _)| *id == target.id())
        .map(|(_, kind)| *kind)
        .collect();
    assert!(!kinds.is_empty());
    assert!(is_valid_path(&kinds), "非法的事件序列 {:?}", kinds);
}
