//! 能力、需求与连线
//!
//! 能力由模块提供（导出包、bundle 身份、宿主身份），
//! 需求由模块声明（导入包、依赖 bundle、fragment 宿主）。
//! 解析成功后每个被满足的需求生成一条不可变的 [`Wire`]。

use std::collections::BTreeMap;
use std::fmt;

use semver::Version;

use super::module::ModuleId;
use super::version::VersionRange;

/// 能力命名空间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    /// 包导出 / 导入
    Package,
    /// bundle 身份（Require-Bundle）
    Bundle,
    /// 宿主身份（Fragment-Host）
    Host,
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Package => write!(f, "package"),
            Namespace::Bundle => write!(f, "bundle"),
            Namespace::Host => write!(f, "host"),
        }
    }
}

/// 模块提供的能力
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub namespace: Namespace,
    pub name: String,
    pub version: Version,
    pub attributes: BTreeMap<String, String>,
}

impl Capability {
    /// 包导出能力
    pub fn package(name: impl Into<String>, version: Version) -> Self {
        Self {
            namespace: Namespace::Package,
            name: name.into(),
            version,
            attributes: BTreeMap::new(),
        }
    }

    /// bundle 身份能力
    pub fn bundle(symbolic_name: impl Into<String>, version: Version) -> Self {
        Self {
            namespace: Namespace::Bundle,
            name: symbolic_name.into(),
            version,
            attributes: BTreeMap::new(),
        }
    }

    /// 宿主身份能力
    pub fn host(symbolic_name: impl Into<String>, version: Version) -> Self {
        Self {
            namespace: Namespace::Host,
            name: symbolic_name.into(),
            version,
            attributes: BTreeMap::new(),
        }
    }

    /// 附加任意属性
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{};version={}", self.namespace, self.name, self.version)
    }
}

/// 需求的解析策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResolutionPolicy {
    #[default]
    Mandatory,
    Optional,
}

/// 模块声明的需求
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Requirement {
    pub namespace: Namespace,
    pub name: String,
    pub version_range: VersionRange,
    /// 必须与能力属性逐一相等
    pub attributes: BTreeMap<String, String>,
    pub policy: ResolutionPolicy,
    /// Require-Bundle 的 `visibility:=reexport`
    pub reexport: bool,
}

impl Requirement {
    /// 包导入需求
    pub fn package(name: impl Into<String>, version_range: VersionRange) -> Self {
        Self::new(Namespace::Package, name, version_range)
    }

    /// bundle 依赖需求
    pub fn bundle(symbolic_name: impl Into<String>, version_range: VersionRange) -> Self {
        Self::new(Namespace::Bundle, symbolic_name, version_range)
    }

    /// fragment 宿主需求
    pub fn host(symbolic_name: impl Into<String>, version_range: VersionRange) -> Self {
        Self::new(Namespace::Host, symbolic_name, version_range)
    }

    fn new(namespace: Namespace, name: impl Into<String>, version_range: VersionRange) -> Self {
        Self {
            namespace,
            name: name.into(),
            version_range,
            attributes: BTreeMap::new(),
            policy: ResolutionPolicy::Mandatory,
            reexport: false,
        }
    }

    /// 标记为可选
    pub fn optional(mut self) -> Self {
        self.policy = ResolutionPolicy::Optional;
        self
    }

    /// 标记为再导出
    pub fn reexported(mut self) -> Self {
        self.reexport = true;
        self
    }

    /// 附加属性过滤
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn is_optional(&self) -> bool {
        self.policy == ResolutionPolicy::Optional
    }

    /// 能力是否满足该需求：命名空间、名称、版本范围与属性全部匹配
    pub fn matches(&self, capability: &Capability) -> bool {
        self.namespace == capability.namespace
            && self.name == capability.name
            && self.version_range.includes(&capability.version)
            && self
                .attributes
                .iter()
                .all(|(key, value)| capability.attributes.get(key) == Some(value))
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{};version=\"{}\"", self.namespace, self.name, self.version_range)?;
        for (key, value) in &self.attributes {
            write!(f, ";{}={}", key, value)?;
        }
        if self.is_optional() {
            write!(f, ";resolution:=optional")?;
        }
        Ok(())
    }
}

/// 需求到能力的连线，创建后不再修改
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wire {
    pub requirer: ModuleId,
    pub requirement: Requirement,
    pub provider: ModuleId,
    pub capability: Capability,
}

impl fmt::Display for Wire {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} ({})",
            self.requirer, self.provider, self.capability
        )
    }
}
