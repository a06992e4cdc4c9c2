//! bundle 元数据视图
//!
//! 把原始清单头部转换为结构化的能力与需求，只读使用。

use std::collections::BTreeMap;

use semver::Version;

use super::parser::{HeaderClause, ManifestParser};
use crate::resolver::{parse_version, Capability, Requirement, VersionRange};
use crate::utils::{CoreError, Result};

/// 常用清单头部名称
pub mod headers {
    pub const MANIFEST_VERSION: &str = "Bundle-ManifestVersion";
    pub const SYMBOLIC_NAME: &str = "Bundle-SymbolicName";
    pub const VERSION: &str = "Bundle-Version";
    pub const EXPORT_PACKAGE: &str = "Export-Package";
    pub const IMPORT_PACKAGE: &str = "Import-Package";
    pub const REQUIRE_BUNDLE: &str = "Require-Bundle";
    pub const FRAGMENT_HOST: &str = "Fragment-Host";
    pub const ACTIVATOR: &str = "Bundle-Activator";
    pub const ACTIVATION_POLICY: &str = "Bundle-ActivationPolicy";
    pub const CLASS_PATH: &str = "Bundle-ClassPath";
    pub const NATIVE_CODE: &str = "Bundle-NativeCode";
    pub const UPDATE_LOCATION: &str = "Bundle-UpdateLocation";
}

/// 本地库声明
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeLibrary {
    /// 库名（去掉 `lib` 前缀与扩展名）
    pub name: String,
    /// bundle 内的相对路径
    pub path: String,
    pub attributes: BTreeMap<String, String>,
}

/// 结构化的 bundle 清单
#[derive(Debug, Clone)]
pub struct BundleManifest {
    headers: BTreeMap<String, String>,
    manifest_version: u32,
    symbolic_name: Option<String>,
    singleton: bool,
    version: Version,
    exports: Vec<Capability>,
    imports: Vec<Requirement>,
    required_bundles: Vec<Requirement>,
    fragment_host: Option<Requirement>,
    activator: Option<String>,
    lazy: bool,
    class_path: Vec<String>,
    native_code: Vec<NativeLibrary>,
    update_location: Option<String>,
}

impl BundleManifest {
    /// 从原始头部构建
    ///
    /// # Errors
    ///
    /// 头部格式或版本非法时返回 `InvalidHeader` / `InvalidVersion`
    pub fn parse(headers: BTreeMap<String, String>) -> Result<Self> {
        let get = |name: &str| headers.get(name).map(|v| v.trim()).filter(|v| !v.is_empty());

        let manifest_version = match get(headers::MANIFEST_VERSION) {
            Some(v) => v.parse::<u32>().map_err(|_| CoreError::InvalidHeader {
                header: headers::MANIFEST_VERSION.to_string(),
                reason: format!("'{}' 不是整数", v),
            })?,
            None => 1,
        };

        let (symbolic_name, singleton) = match get(headers::SYMBOLIC_NAME) {
            Some(value) => {
                let clause = ManifestParser::parse_single(headers::SYMBOLIC_NAME, value)?;
                let singleton = clause.directive("singleton") == Some("true");
                (clause.paths.into_iter().next(), singleton)
            }
            None => (None, false),
        };

        let version = parse_version(get(headers::VERSION).unwrap_or(""))?;

        let mut exports = Vec::new();
        if let Some(value) = get(headers::EXPORT_PACKAGE) {
            for clause in ManifestParser::parse_clauses(headers::EXPORT_PACKAGE, value)? {
                exports.extend(export_capabilities(clause)?);
            }
        }

        let mut imports = Vec::new();
        if let Some(value) = get(headers::IMPORT_PACKAGE) {
            for clause in ManifestParser::parse_clauses(headers::IMPORT_PACKAGE, value)? {
                imports.extend(import_requirements(clause)?);
            }
        }

        let mut required_bundles = Vec::new();
        if let Some(value) = get(headers::REQUIRE_BUNDLE) {
            for clause in ManifestParser::parse_clauses(headers::REQUIRE_BUNDLE, value)? {
                required_bundles.extend(bundle_requirements(clause)?);
            }
        }

        let fragment_host = match get(headers::FRAGMENT_HOST) {
            Some(value) => {
                let clause = ManifestParser::parse_single(headers::FRAGMENT_HOST, value)?;
                let range = VersionRange::parse(clause.attribute("bundle-version").unwrap_or(""))?;
                clause
                    .paths
                    .into_iter()
                    .next()
                    .map(|host| Requirement::host(host, range))
            }
            None => None,
        };

        let lazy = match get(headers::ACTIVATION_POLICY) {
            Some(value) => {
                ManifestParser::parse_single(headers::ACTIVATION_POLICY, value)?.paths[0] == "lazy"
            }
            None => false,
        };

        let class_path = match get(headers::CLASS_PATH) {
            Some(value) => ManifestParser::parse_clauses(headers::CLASS_PATH, value)?
                .into_iter()
                .flat_map(|c| c.paths)
                .collect(),
            None => vec![".".to_string()],
        };

        let mut native_code = Vec::new();
        if let Some(value) = get(headers::NATIVE_CODE) {
            for clause in ManifestParser::parse_clauses(headers::NATIVE_CODE, value)? {
                for path in &clause.paths {
                    native_code.push(NativeLibrary {
                        name: library_name(path),
                        path: path.clone(),
                        attributes: clause.attributes.clone(),
                    });
                }
            }
        }

        Ok(Self {
            manifest_version,
            symbolic_name,
            singleton,
            version,
            exports,
            imports,
            required_bundles,
            fragment_host,
            activator: get(headers::ACTIVATOR).map(str::to_string),
            lazy,
            class_path,
            native_code,
            update_location: get(headers::UPDATE_LOCATION).map(str::to_string),
            headers,
        })
    }

    /// 为缺少符号名的旧式清单补上符号名
    pub fn with_symbolic_name(mut self, symbolic_name: impl Into<String>) -> Self {
        self.symbolic_name = Some(symbolic_name.into());
        self
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn manifest_version(&self) -> u32 {
        self.manifest_version
    }

    pub fn symbolic_name(&self) -> Option<&str> {
        self.symbolic_name.as_deref()
    }

    pub fn is_singleton(&self) -> bool {
        self.singleton
    }

    pub fn bundle_version(&self) -> &Version {
        &self.version
    }

    pub fn exports(&self) -> &[Capability] {
        &self.exports
    }

    pub fn imports(&self) -> &[Requirement] {
        &self.imports
    }

    pub fn required_bundles(&self) -> &[Requirement] {
        &self.required_bundles
    }

    pub fn fragment_host(&self) -> Option<&Requirement> {
        self.fragment_host.as_ref()
    }

    pub fn activator_class_name(&self) -> Option<&str> {
        self.activator.as_deref()
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    pub fn class_path(&self) -> &[String] {
        &self.class_path
    }

    pub fn native_code(&self) -> &[NativeLibrary] {
        &self.native_code
    }

    pub fn update_location(&self) -> Option<&str> {
        self.update_location.as_deref()
    }
}

fn export_capabilities(clause: HeaderClause) -> Result<Vec<Capability>> {
    let version = clause
        .attribute("version")
        .or_else(|| clause.attribute("specification-version"))
        .map(parse_version)
        .transpose()?
        .unwrap_or_else(|| Version::new(0, 0, 0));

    Ok(clause
        .paths
        .iter()
        .map(|package| {
            let mut capability = Capability::package(package.clone(), version.clone());
            for (key, value) in &clause.attributes {
                if key != "version" && key != "specification-version" {
                    capability.attributes.insert(key.clone(), value.clone());
                }
            }
            capability
        })
        .collect())
}

fn import_requirements(clause: HeaderClause) -> Result<Vec<Requirement>> {
    let range = VersionRange::parse(
        clause
            .attribute("version")
            .or_else(|| clause.attribute("specification-version"))
            .unwrap_or(""),
    )?;
    let optional = clause.directive("resolution") == Some("optional");

    Ok(clause
        .paths
        .iter()
        .map(|package| {
            let mut requirement = Requirement::package(package.clone(), range.clone());
            for (key, value) in &clause.attributes {
                if key != "version" && key != "specification-version" {
                    requirement.attributes.insert(key.clone(), value.clone());
                }
            }
            if optional {
                requirement = requirement.optional();
            }
            requirement
        })
        .collect())
}

fn bundle_requirements(clause: HeaderClause) -> Result<Vec<Requirement>> {
    let range = VersionRange::parse(clause.attribute("bundle-version").unwrap_or(""))?;
    let optional = clause.directive("resolution") == Some("optional");
    let reexport = clause.directive("visibility") == Some("reexport");

    Ok(clause
        .paths
        .iter()
        .map(|name| {
            let mut requirement = Requirement::bundle(name.clone(), range.clone());
            if optional {
                requirement = requirement.optional();
            }
            if reexport {
                requirement = requirement.reexported();
            }
            requirement
        })
        .collect())
}

/// `lib/libzip.so` -> `zip`
fn library_name(path: &str) -> String {
    let file = path.rsplit('/').next().unwrap_or(path);
    let stem = file.split('.').next().unwrap_or(file);
    stem.strip_prefix("lib").unwrap_or(stem).to_string()
}
