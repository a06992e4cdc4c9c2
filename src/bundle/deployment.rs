//! 部署来源
//!
//! 一次部署提供位置字符串、清单头部、有序内容根，
//! 以及可选的自动启动与启动级别提示。部署可以由 `bundle.yaml` 描述文件加载。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::utils::{CoreError, Result};

/// 描述文件名
pub const DESCRIPTOR_FILE: &str = "bundle.yaml";

/// 一次部署
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub location: String,
    pub headers: BTreeMap<String, String>,
    pub content_roots: Vec<PathBuf>,
    pub auto_start: bool,
    pub start_level: Option<u32>,
}

impl Deployment {
    /// 创建只有位置与头部的部署
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            headers: BTreeMap::new(),
            content_roots: Vec::new(),
            auto_start: false,
            start_level: None,
        }
    }

    /// 设置头部
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// 添加内容根
    pub fn content_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.content_roots.push(root.into());
        self
    }

    /// 标记自动启动
    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// 设置启动级别提示
    pub fn start_level(mut self, level: u32) -> Self {
        self.start_level = Some(level);
        self
    }

    /// 从 `bundle.yaml` 描述文件加载
    ///
    /// 内容根相对于描述文件所在目录；缺省位置为描述文件路径。
    pub async fn from_descriptor(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;
        let descriptor: BundleDescriptor = serde_yaml::from_str(&content)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let content_roots = if descriptor.content.is_empty() {
            vec![base.to_path_buf()]
        } else {
            descriptor.content.iter().map(|root| base.join(root)).collect()
        };

        Ok(Self {
            location: descriptor
                .location
                .unwrap_or_else(|| path.display().to_string()),
            headers: descriptor.headers,
            content_roots,
            auto_start: descriptor.auto_start,
            start_level: descriptor.start_level,
        })
    }

    /// 扫描目录下一层子目录中的描述文件（目录本身也检查）
    ///
    /// 结果按路径排序；无法解析的描述文件记录警告后跳过。
    pub async fn scan_dir(dir: impl AsRef<Path>) -> Result<Vec<Self>> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(CoreError::InvalidConfigValue {
                key: "bundles.bundle_dirs".to_string(),
                reason: format!("'{}' 不是目录", dir.display()),
            });
        }

        let mut candidates = vec![dir.join(DESCRIPTOR_FILE)];
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                candidates.push(entry.path().join(DESCRIPTOR_FILE));
            }
        }
        candidates.sort();

        let mut deployments = Vec::new();
        for candidate in candidates {
            if !candidate.is_file() {
                continue;
            }
            match Self::from_descriptor(&candidate).await {
                Ok(deployment) => {
                    debug!(path = %candidate.display(), location = %deployment.location, "发现 bundle 描述文件");
                    deployments.push(deployment);
                }
                Err(e) => {
                    warn!(path = %candidate.display(), error = %e, "跳过无法解析的描述文件");
                }
            }
        }
        Ok(deployments)
    }
}

/// `bundle.yaml` 描述文件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleDescriptor {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub content: Vec<PathBuf>,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub start_level: Option<u32>,
}
