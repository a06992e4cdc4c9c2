//! bundle 持久状态
//!
//! 每个 bundle 一条记录：位置、启动级别、持久启动标记与修改时间。
//! 提供内存实现与文件实现（每个 bundle 一个 JSON 文件）。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::utils::{BundleId, CoreError, Result};

/// bundle 持久记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRecord {
    pub bundle_id: BundleId,
    pub location: String,
    pub start_level: u32,
    pub persistently_started: bool,
    #[serde(default = "default_true")]
    pub use_activation_policy: bool,
    pub last_modified: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl BundleRecord {
    pub fn new(bundle_id: BundleId, location: impl Into<String>, start_level: u32) -> Self {
        Self {
            bundle_id,
            location: location.into(),
            start_level,
            persistently_started: false,
            use_activation_policy: true,
            last_modified: Utc::now(),
        }
    }
}

/// 持久化接口
#[async_trait]
pub trait BundleStorage: Send + Sync {
    /// 写入（或覆盖）记录
    async fn save(&self, record: &BundleRecord) -> Result<()>;

    async fn load(&self, bundle_id: BundleId) -> Result<Option<BundleRecord>>;

    /// 删除记录，不存在时不报错
    async fn delete(&self, bundle_id: BundleId) -> Result<()>;

    /// 全部记录，按 bundle ID 升序
    async fn list(&self) -> Result<Vec<BundleRecord>>;
}

/// 内存存储
#[derive(Default)]
pub struct MemoryStorage {
    records: RwLock<BTreeMap<BundleId, BundleRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BundleStorage for MemoryStorage {
    async fn save(&self, record: &BundleRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.bundle_id, record.clone());
        Ok(())
    }

    async fn load(&self, bundle_id: BundleId) -> Result<Option<BundleRecord>> {
        Ok(self.records.read().await.get(&bundle_id).cloned())
    }

    async fn delete(&self, bundle_id: BundleId) -> Result<()> {
        self.records.write().await.remove(&bundle_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<BundleRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

/// 文件存储：`<dir>/bundle-<id>.json`
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// 打开存储目录，不存在时创建
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| storage_error(&dir, e))?;
        debug!(dir = %dir.display(), "打开 bundle 存储目录");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, bundle_id: BundleId) -> PathBuf {
        self.dir.join(format!("bundle-{}.json", bundle_id))
    }
}

fn storage_error(path: &Path, error: impl std::fmt::Display) -> CoreError {
    CoreError::Storage(format!("{}: {}", path.display(), error))
}

#[async_trait]
impl BundleStorage for FileStorage {
    async fn save(&self, record: &BundleRecord) -> Result<()> {
        let path = self.record_path(record.bundle_id);
        let content = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| storage_error(&path, e))
    }

    async fn load(&self, bundle_id: BundleId) -> Result<Option<BundleRecord>> {
        let path = self.record_path(bundle_id);
        match tokio::fs::read(&path).await {
            Ok(content) => Ok(Some(serde_json::from_slice(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error(&path, e)),
        }
    }

    async fn delete(&self, bundle_id: BundleId) -> Result<()> {
        let path = self.record_path(bundle_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error(&path, e)),
        }
    }

    async fn list(&self) -> Result<Vec<BundleRecord>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| storage_error(&self.dir, e))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<BundleRecord>(&content) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "跳过损坏的 bundle 记录"),
            }
        }
        records.sort_by_key(|r| r.bundle_id);
        Ok(records)
    }
}
