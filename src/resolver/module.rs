//! 解析器模块
//!
//! 每个 revision 对应一个解析器模块，模块身份由
//! (符号名, 版本, 全局 revision 计数) 组成，计数单调递增，身份从不复用。

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use semver::Version;

use super::capability::{Capability, Namespace, Requirement};
use crate::utils::BundleId;

/// 模块身份
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId {
    pub symbolic_name: String,
    pub version: Version,
    pub revision: u64,
}

impl ModuleId {
    pub fn new(symbolic_name: impl Into<String>, version: Version, revision: u64) -> Self {
        Self {
            symbolic_name: symbolic_name.into(),
            version,
            revision,
        }
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.symbolic_name, self.version, self.revision)
    }
}

/// 解析器看到的模块：能力、需求、内容根与本地库
#[derive(Debug, Clone)]
pub struct ResolverModule {
    pub id: ModuleId,
    pub bundle_id: BundleId,
    pub capabilities: Vec<Capability>,
    pub requirements: Vec<Requirement>,
    /// 非空表示该模块是 fragment
    pub host_requirement: Option<Requirement>,
    pub singleton: bool,
    pub content_roots: Vec<PathBuf>,
    pub native_libraries: BTreeMap<String, PathBuf>,
    /// 对应类加载单元的标识
    pub unit_id: String,
}

impl ResolverModule {
    /// 创建模块，自动附带 bundle 身份与宿主身份能力
    pub fn new(id: ModuleId, bundle_id: BundleId) -> Self {
        let capabilities = vec![
            Capability::bundle(id.symbolic_name.clone(), id.version.clone()),
            Capability::host(id.symbolic_name.clone(), id.version.clone()),
        ];
        Self {
            id,
            bundle_id,
            capabilities,
            requirements: Vec::new(),
            host_requirement: None,
            singleton: false,
            content_roots: Vec::new(),
            native_libraries: BTreeMap::new(),
            unit_id: crate::utils::generate_uuid(),
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_requirement(mut self, requirement: Requirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    /// 声明为 fragment，并移除宿主/bundle 身份能力
    pub fn with_host(mut self, requirement: Requirement) -> Self {
        self.capabilities
            .retain(|c| c.namespace == Namespace::Package);
        self.host_requirement = Some(requirement);
        self
    }

    pub fn with_singleton(mut self, singleton: bool) -> Self {
        self.singleton = singleton;
        self
    }

    pub fn with_content_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.content_roots = roots;
        self
    }

    pub fn with_native_library(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.native_libraries.insert(name.into(), path.into());
        self
    }

    pub fn is_fragment(&self) -> bool {
        self.host_requirement.is_some()
    }

    /// 导出的包能力
    pub fn exports(&self) -> impl Iterator<Item = &Capability> {
        self.capabilities
            .iter()
            .filter(|c| c.namespace == Namespace::Package)
    }

    /// 模块是否导出该包
    pub fn exports_package(&self, package: &str) -> bool {
        self.exports().any(|c| c.name == package)
    }
}
