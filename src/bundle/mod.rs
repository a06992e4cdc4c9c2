//! bundle 模块
//!
//! 包含 bundle 元数据、revision、生命周期状态、服务归属、
//! 安装校验、持久化与 bundle 管理器。

pub mod activator;
#[allow(clippy::module_inception)]
pub mod bundle;
pub mod context;
pub mod deployment;
pub mod manager;
pub mod metadata;
pub mod parser;
pub mod revision;
pub mod service;
pub mod state;
pub mod storage;
pub mod validator;

pub use activator::{ActivatorFactory, ActivatorRegistry, BundleActivator};
pub use bundle::{Bundle, BundleInfo, BundleKind, StartOptions, StopOptions};
pub use context::BundleContext;
pub use deployment::{BundleDescriptor, Deployment, DESCRIPTOR_FILE};
pub use manager::BundleManager;
pub use metadata::{headers, BundleManifest, NativeLibrary};
pub use parser::{HeaderClause, ManifestParser};
pub use revision::Revision;
pub use service::{ServiceObject, ServiceReference, ServiceRegistry, SERVICE_RANKING};
pub use state::{BundleState, StateMask};
pub use storage::{BundleRecord, BundleStorage, FileStorage, MemoryStorage};
pub use validator::{BundleValidator, InstalledIdentity, ValidationError, ValidationErrorCode, ValidationResult};
