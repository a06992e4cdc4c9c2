//! # Chips Bundles - 薯片动态模块运行时
//!
//! 管理可安装的 bundle：解析它们声明的包导入/导出契约，
//! 构建模块间的连线图，并驱动每个 bundle 走完生命周期状态机。
//!
//! - **bundle 生命周期**: 安装、解析、启动、停止、更新、卸载、刷新
//! - **依赖解析**: 能力/需求匹配、fragment 附加、全有或全无的连线提交
//! - **模块注册表**: 连线图、类加载委派描述、懒激活钩子
//! - **框架**: 系统 bundle、启动级别、插件、异步停止与等待
//! - **服务归属**: 服务注册与使用记录随 bundle 停止自动清理
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use chips_bundles::{CoreConfig, Deployment, Framework, StartOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let framework = Framework::builder().config(CoreConfig::default()).build().await?;
//!     framework.start().await?;
//!
//!     let api = framework
//!         .install_bundle(
//!             Deployment::new("mem:api")
//!                 .header("Bundle-SymbolicName", "acme.api")
//!                 .header("Export-Package", "acme.api;version=1.0.0"),
//!         )
//!         .await?;
//!     let app = framework
//!         .install_bundle(
//!             Deployment::new("mem:app")
//!                 .header("Bundle-SymbolicName", "acme.app")
//!                 .header("Import-Package", "acme.api;version=\"[1.0,2.0)\""),
//!         )
//!         .await?;
//!
//!     // 启动时解析 app，api 作为提供方一并解析
//!     framework.start_bundle(app.id(), StartOptions::default()).await?;
//!     println!("{} -> {}", app, api.state());
//!     Ok(())
//! }
//! ```
//!
//! ## 模块结构
//!
//! - `resolver` - 能力/需求模型、模块注册表与依赖解析器
//! - `bundle` - bundle、revision、元数据、服务、存储与管理器
//! - `framework` - 框架句柄、生命周期操作、事件、启动级别与刷新
//! - `core` - 运行时配置
//! - `utils` - 错误类型、ID 分配与日志

#![warn(rustdoc::missing_crate_level_docs)]

pub mod bundle;
pub mod core;
pub mod framework;
pub mod resolver;
pub mod utils;

// 重导出常用类型，方便使用
pub use bundle::{
    ActivatorRegistry, Bundle, BundleActivator, BundleContext, BundleInfo, BundleKind, BundleManager,
    BundleManifest, BundleState, BundleStorage, Deployment, FileStorage, MemoryStorage, Revision,
    ServiceObject, ServiceReference, ServiceRegistry, StartOptions, StateMask, StopOptions,
};

pub use framework::event::{EventCallback, EventDispatcher, EventFilter};
pub use framework::{
    BundleEvent, BundleEventKind, Event, Framework, FrameworkBuilder, FrameworkEvent, FrameworkEventKind,
    FrameworkPlugin, StopHandle, StopStatus, SYSTEM_BUNDLE_LOCATION, SYSTEM_BUNDLE_NAME,
};

pub use resolver::{
    Capability, ClassLoadingSpec, ClassLoadingUnit, ModuleId, ModuleRegistry, Namespace, Requirement,
    ResolutionPolicy, ResolutionReport, Resolver, VersionRange, Wire,
};

pub use utils::logger::{LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};
pub use utils::{error_code, generate_uuid, BundleId, CoreError, Result, ServiceId, SYSTEM_BUNDLE_ID};

pub use core::config::{BundleConfig, CoreConfig, CoreConfigBuilder, FrameworkConfig, LogConfig, ValidationProfile};

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
