//! 运行时配置
//!
//! 定义运行时的配置结构和加载逻辑。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::utils::{CoreError, Result};

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出到文件
    #[serde(default)]
    pub file_output: bool,

    /// 日志文件目录
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json_format: bool,

    /// 日志轮转策略
    #[serde(default = "default_rotation")]
    pub rotation: String,

    /// 保留日志文件数
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

fn default_max_files() -> usize {
    7
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: false,
            log_dir: None,
            json_format: false,
            rotation: default_rotation(),
            max_files: default_max_files(),
        }
    }
}

/// 安装校验档位
///
/// `Lenient` 下，清单版本 1 的 bundle 跳过重复导入与缺失符号名检查。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationProfile {
    /// 宽松（默认）
    #[default]
    Lenient,
    /// 严格：所有检查适用于所有 bundle
    Strict,
}

/// 框架配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameworkConfig {
    /// 持久化目录（None 表示内存存储）
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,

    /// 框架启动后的目标启动级别
    #[serde(default = "default_start_level")]
    pub beginning_start_level: u32,

    /// 新安装 bundle 的启动级别
    #[serde(default = "default_start_level")]
    pub initial_bundle_start_level: u32,

    /// 停止超时（毫秒），供 wait_for_stop 调用方参考
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// 安装校验档位
    #[serde(default)]
    pub validation_profile: ValidationProfile,

    /// 系统 bundle 导出的包（Export-Package 子句）
    #[serde(default)]
    pub system_packages: Vec<String>,

    /// 框架属性，可通过 bundle 上下文读取
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

fn default_start_level() -> u32 {
    1
}

fn default_stop_timeout_ms() -> u64 {
    30000
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            storage_dir: None,
            beginning_start_level: default_start_level(),
            initial_bundle_start_level: default_start_level(),
            stop_timeout_ms: default_stop_timeout_ms(),
            validation_profile: ValidationProfile::default(),
            system_packages: vec![],
            properties: BTreeMap::new(),
        }
    }
}

/// bundle 部署配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleConfig {
    /// 启动时扫描 bundle.yaml 描述文件的目录
    #[serde(default)]
    pub bundle_dirs: Vec<PathBuf>,

    /// 额外需要自动启动的符号名
    #[serde(default)]
    pub auto_start: Vec<String>,
}

/// 运行时配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    /// 配置文件路径
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// 日志配置
    #[serde(default)]
    pub logging: LogConfig,

    /// 框架配置
    #[serde(default)]
    pub framework: FrameworkConfig,

    /// bundle 部署配置
    #[serde(default)]
    pub bundles: BundleConfig,

    /// 是否为开发模式
    #[serde(default)]
    pub dev_mode: bool,
}

impl CoreConfig {
    /// 创建配置构建器
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::new()
    }

    /// 从文件加载配置（按扩展名选择 JSON 或 YAML）
    pub async fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            CoreError::ConfigLoadFailed(format!("{}: {}", path.display(), e))
        })?;

        let mut config: CoreConfig = if path.extension().map(|e| e == "json").unwrap_or(false) {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        config.config_path = Some(path);
        config.validate()?;
        Ok(config)
    }

    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        const LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "warning", "error"];
        if !LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(CoreError::InvalidConfigValue {
                key: "logging.level".to_string(),
                reason: format!("未知日志级别 '{}'", self.logging.level),
            });
        }
        if self.logging.file_output && self.logging.log_dir.is_none() {
            return Err(CoreError::InvalidConfigValue {
                key: "logging.log_dir".to_string(),
                reason: "启用文件日志时必须指定目录".to_string(),
            });
        }
        if self.framework.initial_bundle_start_level == 0 {
            return Err(CoreError::InvalidConfigValue {
                key: "framework.initial_bundle_start_level".to_string(),
                reason: "启动级别 0 保留给框架自身".to_string(),
            });
        }
        if self.framework.stop_timeout_ms == 0 {
            return Err(CoreError::InvalidConfigValue {
                key: "framework.stop_timeout_ms".to_string(),
                reason: "超时必须大于 0".to_string(),
            });
        }
        Ok(())
    }

    /// 合并另一个配置（用于覆盖）
    pub fn merge(&mut self, other: CoreConfig) {
        // 只覆盖非默认值的配置
        if other.logging.level != default_log_level() {
            self.logging.level = other.logging.level;
        }
        if other.logging.file_output {
            self.logging.file_output = true;
            self.logging.log_dir = other.logging.log_dir;
        }
        if other.logging.json_format {
            self.logging.json_format = true;
        }
        if other.framework.storage_dir.is_some() {
            self.framework.storage_dir = other.framework.storage_dir;
        }
        if other.framework.beginning_start_level != default_start_level() {
            self.framework.beginning_start_level = other.framework.beginning_start_level;
        }
        if other.framework.initial_bundle_start_level != default_start_level() {
            self.framework.initial_bundle_start_level = other.framework.initial_bundle_start_level;
        }
        if other.framework.stop_timeout_ms != default_stop_timeout_ms() {
            self.framework.stop_timeout_ms = other.framework.stop_timeout_ms;
        }
        if other.framework.validation_profile != ValidationProfile::default() {
            self.framework.validation_profile = other.framework.validation_profile;
        }
        self.framework
            .system_packages
            .extend(other.framework.system_packages);
        self.framework.properties.extend(other.framework.properties);
        self.bundles.bundle_dirs.extend(other.bundles.bundle_dirs);
        self.bundles.auto_start.extend(other.bundles.auto_start);
        if other.dev_mode {
            self.dev_mode = true;
        }
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct CoreConfigBuilder {
    config: CoreConfig,
}

impl CoreConfigBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self {
            config: CoreConfig::default(),
        }
    }

    /// 设置配置文件路径
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.config_path = Some(path.into());
        self
    }

    /// 设置日志级别
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// 启用文件日志
    pub fn file_logging(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.config.logging.file_output = true;
        self.config.logging.log_dir = Some(log_dir.into());
        self
    }

    /// 启用 JSON 格式日志
    pub fn json_logging(mut self) -> Self {
        self.config.logging.json_format = true;
        self
    }

    /// 设置持久化目录
    pub fn storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.framework.storage_dir = Some(dir.into());
        self
    }

    /// 设置框架目标启动级别
    pub fn beginning_start_level(mut self, level: u32) -> Self {
        self.config.framework.beginning_start_level = level;
        self
    }

    /// 设置新 bundle 的初始启动级别
    pub fn initial_bundle_start_level(mut self, level: u32) -> Self {
        self.config.framework.initial_bundle_start_level = level;
        self
    }

    /// 设置停止超时
    pub fn stop_timeout_ms(mut self, timeout: u64) -> Self {
        self.config.framework.stop_timeout_ms = timeout;
        self
    }

    /// 设置校验档位
    pub fn validation_profile(mut self, profile: ValidationProfile) -> Self {
        self.config.framework.validation_profile = profile;
        self
    }

    /// 添加系统包导出
    pub fn system_package(mut self, clause: impl Into<String>) -> Self {
        self.config.framework.system_packages.push(clause.into());
        self
    }

    /// 设置框架属性
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config
            .framework
            .properties
            .insert(key.into(), value.into());
        self
    }

    /// 添加 bundle 目录
    pub fn bundle_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.bundles.bundle_dirs.push(dir.into());
        self
    }

    /// 添加自动启动的符号名
    pub fn auto_start(mut self, symbolic_name: impl Into<String>) -> Self {
        self.config.bundles.auto_start.push(symbolic_name.into());
        self
    }

    /// 启用开发模式
    pub fn dev_mode(mut self) -> Self {
        self.config.dev_mode = true;
        self
    }

    /// 构建配置
    pub fn build(self) -> CoreConfig {
        self.config
    }
}
