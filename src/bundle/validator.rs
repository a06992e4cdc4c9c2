//! 安装校验
//!
//! 安装与更新前检查清单：符号名格式、禁止的 `java.*` 包、
//! 重复的导入声明，以及符号名加版本的唯一性。
//! 部分检查是否作用于旧式（manifest 版本 1）清单由 [`ValidationProfile`] 决定。

use std::collections::HashSet;
use std::fmt;

use semver::Version;
use tracing::debug;

use super::metadata::BundleManifest;
use super::parser::ManifestParser;
use crate::core::ValidationProfile;
use crate::utils::{BundleId, CoreError, Result};

/// 校验错误详情
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// 出错的头部
    pub header: String,
    pub message: String,
    pub code: ValidationErrorCode,
}

impl ValidationError {
    pub fn new(header: impl Into<String>, message: impl Into<String>, code: ValidationErrorCode) -> Self {
        Self {
            header: header.into(),
            message: message.into(),
            code,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.code, self.header, self.message)
    }
}

/// 校验错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorCode {
    MissingHeader,
    InvalidFormat,
    ForbiddenPackage,
    DuplicateImport,
}

impl fmt::Display for ValidationErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationErrorCode::MissingHeader => write!(f, "MISSING_HEADER"),
            ValidationErrorCode::InvalidFormat => write!(f, "INVALID_FORMAT"),
            ValidationErrorCode::ForbiddenPackage => write!(f, "FORBIDDEN_PACKAGE"),
            ValidationErrorCode::DuplicateImport => write!(f, "DUPLICATE_IMPORT"),
        }
    }
}

/// 校验结果
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// 转换为 Result
    pub fn into_result(self, location: &str) -> Result<()> {
        if self.is_valid() {
            return Ok(());
        }
        let messages: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        Err(CoreError::ValidationFailed {
            location: location.to_string(),
            reason: messages.join("; "),
        })
    }
}

/// 已安装 bundle 的身份，用于唯一性检查
#[derive(Debug, Clone)]
pub struct InstalledIdentity {
    pub bundle_id: BundleId,
    pub symbolic_name: String,
    pub version: Version,
}

/// bundle 校验器
#[derive(Debug, Clone, Default)]
pub struct BundleValidator {
    profile: ValidationProfile,
}

impl BundleValidator {
    pub fn new(profile: ValidationProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> ValidationProfile {
        self.profile
    }

    /// 是否对该清单执行完整检查
    fn full_checks(&self, manifest: &BundleManifest) -> bool {
        self.profile == ValidationProfile::Strict || manifest.manifest_version() >= 2
    }

    /// 检查清单本身
    pub fn validate_manifest(&self, manifest: &BundleManifest) -> ValidationResult {
        use super::metadata::headers;

        let mut result = ValidationResult::default();
        let full = self.full_checks(manifest);

        match manifest.symbolic_name() {
            Some(name) if !ManifestParser::is_valid_name(name) => {
                result.add_error(ValidationError::new(
                    headers::SYMBOLIC_NAME,
                    format!("非法的符号名 '{}'", name),
                    ValidationErrorCode::InvalidFormat,
                ));
            }
            None if full => {
                result.add_error(ValidationError::new(
                    headers::SYMBOLIC_NAME,
                    "缺少符号名",
                    ValidationErrorCode::MissingHeader,
                ));
            }
            _ => {}
        }

        for capability in manifest.exports() {
            check_package(&mut result, headers::EXPORT_PACKAGE, &capability.name);
        }

        let mut seen = HashSet::new();
        for requirement in manifest.imports() {
            check_package(&mut result, headers::IMPORT_PACKAGE, &requirement.name);
            if full && !seen.insert(requirement.name.as_str()) {
                result.add_error(ValidationError::new(
                    headers::IMPORT_PACKAGE,
                    format!("重复导入包 '{}'", requirement.name),
                    ValidationErrorCode::DuplicateImport,
                ));
            }
        }

        if full {
            let mut required = HashSet::new();
            for requirement in manifest.required_bundles() {
                if !required.insert(requirement.name.as_str()) {
                    result.add_error(ValidationError::new(
                        headers::REQUIRE_BUNDLE,
                        format!("重复依赖 bundle '{}'", requirement.name),
                        ValidationErrorCode::DuplicateImport,
                    ));
                }
            }
        }

        result
    }

    /// 完整校验：清单检查与唯一性检查
    ///
    /// `exclude` 为正在更新的 bundle 自身。
    ///
    /// # Errors
    ///
    /// 清单不合法时返回 `ValidationFailed`，身份重复时返回 `DuplicateBundle`
    pub fn validate(
        &self,
        location: &str,
        symbolic_name: &str,
        manifest: &BundleManifest,
        installed: &[InstalledIdentity],
        exclude: Option<BundleId>,
    ) -> Result<()> {
        self.validate_manifest(manifest).into_result(location)?;

        let version = manifest.bundle_version();
        let duplicate = installed.iter().any(|other| {
            Some(other.bundle_id) != exclude
                && other.symbolic_name == symbolic_name
                && &other.version == version
        });
        if duplicate {
            return Err(CoreError::DuplicateBundle {
                symbolic_name: symbolic_name.to_string(),
                version: version.to_string(),
            });
        }

        debug!(location, symbolic_name, profile = ?self.profile, "校验通过");
        Ok(())
    }

    /// 为缺少符号名的旧式清单从位置推导符号名
    pub fn legacy_symbolic_name(location: &str) -> String {
        let last = location
            .trim_end_matches(['/', '\\'])
            .rsplit(['/', '\\', ':'])
            .next()
            .unwrap_or(location);
        let stem = last.strip_suffix(".yaml").unwrap_or(last);
        let name: String = stem
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        let name = name.trim_matches('.');
        if name.is_empty() {
            "bundle".to_string()
        } else {
            name.to_string()
        }
    }
}

fn check_package(result: &mut ValidationResult, header: &str, package: &str) {
    if package == "java" || package.starts_with("java.") {
        result.add_error(ValidationError::new(
            header,
            format!("不允许声明 '{}'", package),
            ValidationErrorCode::ForbiddenPackage,
        ));
    } else if !ManifestParser::is_valid_name(package) {
        result.add_error(ValidationError::new(
            header,
            format!("非法的包名 '{}'", package),
            ValidationErrorCode::InvalidFormat,
        ));
    }
}
