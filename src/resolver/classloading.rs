//! 类加载边界
//!
//! 解析完成后，注册表为每个模块生成 [`ClassLoadingSpec`]：
//! 包到提供方的委派表、本地包、内容根与本地库映射。
//! 类加载引擎据此物化 [`ClassLoadingUnit`]。本模块不加载任何字节码，
//! 只回答"某个类由哪个模块定义"。

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use super::module::ModuleId;

/// 模块的类加载描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassLoadingSpec {
    pub module: ModuleId,
    /// 包 -> 提供方模块（导入包优先于依赖 bundle 带来的包）
    pub package_delegation: BTreeMap<String, ModuleId>,
    /// 依赖的 bundle（含再导出链），按声明顺序
    pub required_bundles: Vec<ModuleId>,
    /// 本模块及已附加 fragment 导出的包
    pub local_packages: BTreeSet<String>,
    /// 本模块内容根在前，fragment 内容根在后
    pub content_roots: Vec<PathBuf>,
    /// 本地库名 -> 路径
    pub native_libraries: BTreeMap<String, PathBuf>,
}

/// 物化的类加载单元
#[derive(Debug, Clone)]
pub struct ClassLoadingUnit {
    id: String,
    spec: ClassLoadingSpec,
}

impl ClassLoadingUnit {
    pub fn new(id: impl Into<String>, spec: ClassLoadingSpec) -> Self {
        Self {
            id: id.into(),
            spec,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn spec(&self) -> &ClassLoadingSpec {
        &self.spec
    }

    pub fn module(&self) -> &ModuleId {
        &self.spec.module
    }

    /// 包的委派提供方
    pub fn find_package_provider(&self, package: &str) -> Option<&ModuleId> {
        self.spec.package_delegation.get(package)
    }

    /// 在内容根中查找资源
    pub fn find_resource(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        self.spec
            .content_roots
            .iter()
            .map(|root| root.join(relative))
            .find(|candidate| candidate.is_file())
    }

    /// 本地库路径
    pub fn native_library(&self, name: &str) -> Option<&PathBuf> {
        self.spec.native_libraries.get(name)
    }

    /// 类的定义模块
    ///
    /// 委派表优先；其次是本地导出包；最后在内容根中查找 `.class` 资源。
    pub fn defining_module(&self, class_name: &str) -> Option<ModuleId> {
        let package = package_of(class_name);
        if let Some(provider) = self.find_package_provider(package) {
            return Some(provider.clone());
        }
        if self.spec.local_packages.contains(package) {
            return Some(self.spec.module.clone());
        }
        let resource = format!("{}.class", class_name.replace('.', "/"));
        self.find_resource(&resource)
            .map(|_| self.spec.module.clone())
    }
}

/// 取类名所在的包，默认包返回空字符串
pub fn package_of(class_name: &str) -> &str {
    class_name
        .rsplit_once('.')
        .map(|(package, _)| package)
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::Version;

    fn spec(dir: Option<&Path>) -> ClassLoadingSpec {
        let module = ModuleId::new("app", Version::new(1, 0, 0), 4);
        let mut package_delegation = BTreeMap::new();
        package_delegation.insert(
            "com.acme.api".to_string(),
            ModuleId::new("api", Version::new(1, 0, 0), 1),
        );
        ClassLoadingSpec {
            module,
            package_delegation,
            required_bundles: vec![],
            local_packages: ["com.acme.app".to_string()].into_iter().collect(),
            content_roots: dir.map(|d| vec![d.to_path_buf()]).unwrap_or_default(),
            native_libraries: [("zip".to_string(), PathBuf::from("/lib/libzip.so"))]
                .into_iter()
                .collect(),
        }
    }

    #[test]
    fn test_package_of() {
        assert_eq!(package_of("com.acme.Foo"), "com.acme");
        assert_eq!(package_of("Foo"), "");
    }

    #[test]
    fn test_defining_module_prefers_delegation() {
        let unit = ClassLoadingUnit::new("u1", spec(None));
        assert_eq!(
            unit.defining_module("com.acme.api.Service").map(|m| m.symbolic_name),
            Some("api".to_string())
        );
        assert_eq!(
            unit.defining_module("com.acme.app.Main").map(|m| m.symbolic_name),
            Some("app".to_string())
        );
        assert!(unit.defining_module("org.other.Thing").is_none());
        assert_eq!(unit.native_library("zip"), Some(&PathBuf::from("/lib/libzip.so")));
    }

    #[test]
    fn test_defining_module_from_content_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("com/acme/internal")).unwrap();
        std::fs::write(dir.path().join("com/acme/internal/Impl.class"), b"\xca\xfe").unwrap();

        let unit = ClassLoadingUnit::new("u2", spec(Some(dir.path())));
        assert!(unit.find_resource("/com/acme/internal/Impl.class").is_some());
        assert_eq!(
            unit.defining_module("com.acme.internal.Impl").map(|m| m.revision),
            Some(4)
        );
    }
}
