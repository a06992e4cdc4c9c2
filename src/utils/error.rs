//! 运行时错误类型定义
//!
//! 本模块定义了 bundle 运行时中使用的所有错误类型。

use thiserror::Error;

/// 运行时核心错误类型
#[derive(Error, Debug)]
pub enum CoreError {
    // ==================== 元数据与校验错误 ====================

    /// 无效的 bundle 元数据
    #[error("无效的 bundle 元数据: {0}")]
    InvalidMetadata(String),

    /// 清单头部格式错误
    #[error("清单头部 '{header}' 格式错误: {reason}")]
    InvalidHeader {
        header: String,
        reason: String,
    },

    /// 版本或版本范围格式错误
    #[error("无效的版本: '{0}'")]
    InvalidVersion(String),

    /// 安装校验失败
    #[error("bundle 校验失败: '{location}' - {reason}")]
    ValidationFailed {
        location: String,
        reason: String,
    },

    /// 相同符号名与版本的 bundle 已安装
    #[error("bundle 已存在: {symbolic_name} {version}")]
    DuplicateBundle {
        symbolic_name: String,
        version: String,
    },

    // ==================== 解析错误 ====================

    /// 必选需求无法满足
    #[error("模块 '{module}' 无法解析: {report}")]
    ResolutionFailed {
        module: String,
        report: String,
    },

    // ==================== 生命周期错误 ====================

    /// 激活器启动失败
    #[error("bundle '{symbolic_name}' 激活失败")]
    ActivationFailed {
        symbolic_name: String,
        #[source]
        source: anyhow::Error,
    },

    /// 激活器停止失败（清理已完成）
    #[error("bundle '{symbolic_name}' 停止钩子失败")]
    DeactivationFailed {
        symbolic_name: String,
        #[source]
        source: anyhow::Error,
    },

    /// 当前状态不允许该操作
    #[error("bundle {bundle_id} 状态非法: {reason}")]
    IllegalState {
        bundle_id: u64,
        reason: String,
    },

    /// 启动级别不足
    #[error("bundle {bundle_id} 的启动级别 {bundle_level} 高于框架当前级别 {framework_level}")]
    StartLevel {
        bundle_id: u64,
        bundle_level: u32,
        framework_level: u32,
    },

    /// 对 fragment 执行了不支持的操作
    #[error("fragment bundle {bundle_id} 不支持操作: {operation}")]
    FragmentOperation {
        bundle_id: u64,
        operation: String,
    },

    /// bundle 不存在
    #[error("bundle 未找到: {0}")]
    BundleNotFound(u64),

    /// 解析器模块不存在
    #[error("模块未找到: '{0}'")]
    ModuleNotFound(String),

    /// 激活器未注册
    #[error("激活器未注册: '{0}'")]
    ActivatorNotFound(String),

    /// 类无法加载
    #[error("类 '{class_name}' 无法从模块 '{module}' 加载")]
    ClassNotFound {
        module: String,
        class_name: String,
    },

    // ==================== 服务与上下文错误 ====================

    /// 服务不存在
    #[error("服务未找到: {0}")]
    ServiceNotFound(u64),

    /// bundle 上下文已失效
    #[error("bundle {0} 的上下文已失效")]
    InvalidContext(u64),

    // ==================== 存储与配置错误 ====================

    /// 持久化存储错误
    #[error("存储错误: {0}")]
    Storage(String),

    /// 配置加载失败
    #[error("配置加载失败: {0}")]
    ConfigLoadFailed(String),

    /// 配置值无效
    #[error("配置值无效: '{key}' - {reason}")]
    InvalidConfigValue {
        key: String,
        reason: String,
    },

    // ==================== IO 和序列化错误 ====================

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化/反序列化错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 序列化/反序列化错误
    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// 版本解析错误
    #[error("版本解析错误: {0}")]
    VersionParse(#[from] semver::Error),

    // ==================== 通用错误 ====================

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),

    /// 初始化失败
    #[error("初始化失败: {0}")]
    InitFailed(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// 运行时操作结果类型别名
pub type Result<T> = std::result::Result<T, CoreError>;

/// 错误码常量
pub mod error_code {
    // 安装错误 (INSTALL-xxx)
    pub const INSTALL_INVALID_METADATA: &str = "INSTALL-001";
    pub const INSTALL_VALIDATION_FAILED: &str = "INSTALL-002";
    pub const INSTALL_DUPLICATE_BUNDLE: &str = "INSTALL-003";

    // 解析错误 (RESOLVE-xxx)
    pub const RESOLVE_UNSATISFIED: &str = "RESOLVE-001";
    pub const RESOLVE_MODULE_NOT_FOUND: &str = "RESOLVE-002";
    pub const RESOLVE_CLASS_NOT_FOUND: &str = "RESOLVE-003";

    // 生命周期错误 (BUNDLE-xxx)
    pub const BUNDLE_NOT_FOUND: &str = "BUNDLE-001";
    pub const BUNDLE_ILLEGAL_STATE: &str = "BUNDLE-002";
    pub const BUNDLE_ACTIVATION_FAILED: &str = "BUNDLE-003";
    pub const BUNDLE_DEACTIVATION_FAILED: &str = "BUNDLE-004";
    pub const BUNDLE_START_LEVEL: &str = "BUNDLE-005";
    pub const BUNDLE_FRAGMENT_OPERATION: &str = "BUNDLE-006";

    // 服务错误 (SERVICE-xxx)
    pub const SERVICE_NOT_FOUND: &str = "SERVICE-001";
    pub const SERVICE_INVALID_CONTEXT: &str = "SERVICE-002";

    // 配置错误 (CONFIG-xxx)
    pub const CONFIG_LOAD_FAILED: &str = "CONFIG-001";
    pub const CONFIG_INVALID_VALUE: &str = "CONFIG-002";

    // 存储错误 (STORAGE-xxx)
    pub const STORAGE_FAILED: &str = "STORAGE-001";
}

impl CoreError {
    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InvalidMetadata(_)
            | CoreError::InvalidHeader { .. }
            | CoreError::InvalidVersion(_) => error_code::INSTALL_INVALID_METADATA,
            CoreError::ValidationFailed { .. } => error_code::INSTALL_VALIDATION_FAILED,
            CoreError::DuplicateBundle { .. } => error_code::INSTALL_DUPLICATE_BUNDLE,
            CoreError::ResolutionFailed { .. } => error_code::RESOLVE_UNSATISFIED,
            CoreError::ModuleNotFound(_) => error_code::RESOLVE_MODULE_NOT_FOUND,
            CoreError::ClassNotFound { .. } => error_code::RESOLVE_CLASS_NOT_FOUND,
            CoreError::BundleNotFound(_) => error_code::BUNDLE_NOT_FOUND,
            CoreError::IllegalState { .. } => error_code::BUNDLE_ILLEGAL_STATE,
            CoreError::ActivationFailed { .. } | CoreError::ActivatorNotFound(_) => {
                error_code::BUNDLE_ACTIVATION_FAILED
            }
            CoreError::DeactivationFailed { .. } => error_code::BUNDLE_DEACTIVATION_FAILED,
            CoreError::StartLevel { .. } => error_code::BUNDLE_START_LEVEL,
            CoreError::FragmentOperation { .. } => error_code::BUNDLE_FRAGMENT_OPERATION,
            CoreError::ServiceNotFound(_) => error_code::SERVICE_NOT_FOUND,
            CoreError::InvalidContext(_) => error_code::SERVICE_INVALID_CONTEXT,
            CoreError::ConfigLoadFailed(_) => error_code::CONFIG_LOAD_FAILED,
            CoreError::InvalidConfigValue { .. } => error_code::CONFIG_INVALID_VALUE,
            CoreError::Storage(_) => error_code::STORAGE_FAILED,
            _ => "UNKNOWN",
        }
    }

    /// 便捷构造状态非法错误
    pub fn illegal_state(bundle_id: u64, reason: impl Into<String>) -> Self {
        CoreError::IllegalState {
            bundle_id,
            reason: reason.into(),
        }
    }

    /// 是否为调用方可通过修正状态重试的错误
    pub fn is_illegal_state(&self) -> bool {
        matches!(
            self,
            CoreError::IllegalState { .. }
                | CoreError::InvalidContext(_)
                | CoreError::FragmentOperation { .. }
        )
    }
}
