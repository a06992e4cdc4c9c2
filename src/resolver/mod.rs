//! 解析层
//!
//! 能力/需求模型、模块注册表、连线图与依赖解析器，
//! 以及交给类加载组件的委派描述。

pub mod capability;
pub mod classloading;
pub mod graph;
pub mod module;
pub mod registry;
#[allow(clippy::module_inception)]
pub mod resolver;
pub mod version;

pub use capability::{Capability, Namespace, Requirement, ResolutionPolicy, Wire};
pub use classloading::{package_of, ClassLoadingSpec, ClassLoadingUnit};
pub use graph::WiringGraph;
pub use module::{ModuleId, ResolverModule};
pub use registry::{ActivationHook, ModuleRegistry};
pub use resolver::{ResolutionReport, Resolver};
pub use version::{parse_version, VersionRange};
