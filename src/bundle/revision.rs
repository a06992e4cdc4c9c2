//! bundle revision
//!
//! revision 是 bundle 在某一时刻的依赖声明快照，创建后不可变。
//! 每个 revision 拥有自己的解析器模块身份与类加载单元标识。

use std::path::PathBuf;
use std::sync::Arc;

use semver::Version;

use super::deployment::Deployment;
use super::metadata::BundleManifest;
use crate::resolver::{ModuleId, ResolverModule};
use crate::utils::{generate_uuid, BundleId};

/// 不可变的 revision
#[derive(Debug, Clone)]
pub struct Revision {
    bundle_id: BundleId,
    counter: u64,
    update_count: u32,
    manifest: Arc<BundleManifest>,
    deployment: Arc<Deployment>,
    module_id: ModuleId,
    unit_id: String,
    content_roots: Vec<PathBuf>,
}

impl Revision {
    /// 创建 revision
    ///
    /// `counter` 为全局单调计数，`update_count` 为该 bundle 的更新次数。
    pub fn new(
        bundle_id: BundleId,
        symbolic_name: &str,
        manifest: Arc<BundleManifest>,
        deployment: Arc<Deployment>,
        counter: u64,
        update_count: u32,
    ) -> Self {
        let module_id = ModuleId::new(symbolic_name, manifest.bundle_version().clone(), counter);
        let content_roots = class_path_roots(&manifest, &deployment);
        Self {
            bundle_id,
            counter,
            update_count,
            manifest,
            deployment,
            module_id,
            unit_id: generate_uuid(),
            content_roots,
        }
    }

    /// 以新的全局计数重建（刷新使用），内容与更新次数不变
    pub fn renewed(&self, counter: u64) -> Self {
        Self::new(
            self.bundle_id,
            &self.module_id.symbolic_name,
            Arc::clone(&self.manifest),
            Arc::clone(&self.deployment),
            counter,
            self.update_count,
        )
    }

    pub fn bundle_id(&self) -> BundleId {
        self.bundle_id
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn update_count(&self) -> u32 {
        self.update_count
    }

    pub fn version(&self) -> &Version {
        self.manifest.bundle_version()
    }

    pub fn manifest(&self) -> &Arc<BundleManifest> {
        &self.manifest
    }

    pub fn deployment(&self) -> &Arc<Deployment> {
        &self.deployment
    }

    pub fn module_id(&self) -> &ModuleId {
        &self.module_id
    }

    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    pub fn content_roots(&self) -> &[PathBuf] {
        &self.content_roots
    }

    pub fn is_fragment(&self) -> bool {
        self.manifest.fragment_host().is_some()
    }

    /// 构建提交给注册表的解析器模块
    pub fn to_resolver_module(&self) -> ResolverModule {
        let mut module = ResolverModule::new(self.module_id.clone(), self.bundle_id)
            .with_singleton(self.manifest.is_singleton())
            .with_content_roots(self.content_roots.clone());
        module.unit_id = self.unit_id.clone();

        for capability in self.manifest.exports() {
            module = module.with_capability(capability.clone());
        }
        for requirement in self
            .manifest
            .imports()
            .iter()
            .chain(self.manifest.required_bundles())
        {
            module = module.with_requirement(requirement.clone());
        }
        for library in self.manifest.native_code() {
            let path = self
                .deployment
                .content_roots
                .first()
                .map(|root| root.join(&library.path))
                .unwrap_or_else(|| PathBuf::from(&library.path));
            if !module.native_libraries.contains_key(&library.name) {
                module = module.with_native_library(library.name.clone(), path);
            }
        }
        if let Some(host) = self.manifest.fragment_host() {
            module = module.with_host(host.clone());
        }
        module
    }
}

/// 按 Bundle-ClassPath 展开内容根
fn class_path_roots(manifest: &BundleManifest, deployment: &Deployment) -> Vec<PathBuf> {
    let mut roots = Vec::new();
    for entry in manifest.class_path() {
        for base in &deployment.content_roots {
            let root = if entry == "." {
                base.clone()
            } else {
                base.join(entry.trim_start_matches('/'))
            };
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
    }
    roots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::metadata::headers;
    use crate::resolver::Namespace;

    fn revision(counter: u64) -> Revision {
        let deployment = Deployment::new("mem:app")
            .header(headers::SYMBOLIC_NAME, "app")
            .header(headers::VERSION, "1.4.0")
            .header(headers::EXPORT_PACKAGE, "app.api")
            .header(headers::IMPORT_PACKAGE, "base.api")
            .header(headers::CLASS_PATH, ".,lib/extra")
            .header(headers::NATIVE_CODE, "native/libfast.so")
            .content_root("/opt/app");
        let manifest = BundleManifest::parse(deployment.headers.clone()).unwrap();
        Revision::new(5, "app", Arc::new(manifest), Arc::new(deployment), counter, 0)
    }

    #[test]
    fn test_module_identity_follows_counter() {
        let first = revision(10);
        assert_eq!(first.module_id().to_string(), "app:1.4.0#10");

        let renewed = first.renewed(11);
        assert_eq!(renewed.module_id().revision, 11);
        assert_eq!(renewed.update_count(), first.update_count());
        assert_ne!(renewed.unit_id(), first.unit_id());
    }

    #[test]
    fn test_content_roots_from_class_path() {
        let rev = revision(1);
        assert_eq!(
            rev.content_roots(),
            &[PathBuf::from("/opt/app"), PathBuf::from("/opt/app/lib/extra")]
        );
    }

    #[test]
    fn test_resolver_module() {
        let rev = revision(1);
        let module = rev.to_resolver_module();
        assert_eq!(module.bundle_id, 5);
        assert_eq!(module.unit_id, rev.unit_id());
        assert!(module.exports_package("app.api"));
        assert_eq!(module.requirements.len(), 1);
        assert_eq!(module.requirements[0].namespace, Namespace::Package);
        assert_eq!(
            module.native_libraries.get("fast"),
            Some(&PathBuf::from("/opt/app/native/libfast.so"))
        );
        assert!(!module.is_fragment());
    }
}
