//! 响应缓存模块
//!
//! 以请求参数为键、固定TTL的文件系统缓存。每个条目是一个JSON文件，
//! 文件名为 SHA-256(命名空间 + 排序后的参数) 的十六进制串。

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// TTL上限（约100年）
const MAX_TTL_SECS: u64 = 3_153_600_000;

/// 缓存条目
#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    expires_at: DateTime<Utc>,
    value: serde_json::Value,
}

/// 文件系统响应缓存
pub struct ResponseCache {
    dir: PathBuf,
    ttl: Duration,
}

impl ResponseCache {
    /// 创建缓存，`ttl_secs` 为0时不缓存任何内容
    pub fn new(dir: impl Into<PathBuf>, ttl_secs: u64) -> Result<Self> {
        let dir = dir.into();
        if ttl_secs > 0 {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(Self {
            dir,
            ttl: Duration::seconds(ttl_secs.min(MAX_TTL_SECS) as i64),
        })
    }

    /// 是否启用
    pub fn enabled(&self) -> bool {
        self.ttl > Duration::zero()
    }

    /// 缓存目录
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 计算缓存键
    pub fn key(namespace: &str, params: &[(String, String)]) -> String {
        let mut params = params.to_vec();
        params.sort();

        let mut hasher = Sha256::new();
        hasher.update(namespace.as_bytes());
        for (k, v) in &params {
            hasher.update(b"\x1f");
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    /// 读取缓存，缺失、损坏或过期时返回 None（过期条目会被删除）
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.enabled() {
            return None;
        }

        let path = self.entry_path(key);
        let content = std::fs::read_to_string(&path).ok()?;
        let entry: CacheEntry = match serde_json::from_str(&content) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("缓存条目损坏 {}: {}", path.display(), e);
                self.invalidate(key);
                return None;
            }
        };

        if entry.expires_at <= Utc::now() {
            self.invalidate(key);
            return None;
        }

        serde_json::from_value(entry.value).ok()
    }

    /// 写入缓存（先写临时文件再重命名）
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }

        let entry = CacheEntry {
            expires_at: Utc::now() + self.ttl,
            value: serde_json::to_value(value)?,
        };
        let path = self.entry_path(key);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", key, uuid::Uuid::new_v4().simple()));
        std::fs::write(&tmp, serde_json::to_vec(&entry)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// 删除单个条目
    pub fn invalidate(&self, key: &str) {
        let _ = std::fs::remove_file(self.entry_path(key));
    }

    /// 清理所有过期条目，返回删除的数量
    pub fn purge_expired(&self) -> usize {
        if !self.dir.exists() {
            return 0;
        }

        let now = Utc::now();
        let mut removed = 0;
        for entry in WalkDir::new(&self.dir).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("扫描缓存目录时出错: {}", e);
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some("json")
            {
                continue;
            }

            let expired = std::fs::read_to_string(path)
                .ok()
                .and_then(|content| serde_json::from_str::<CacheEntry>(&content).ok())
                .map(|entry| entry.expires_at <= now)
                .unwrap_or(true);

            if expired && std::fs::remove_file(path).is_ok() {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!("已清理 {} 个过期缓存条目", removed);
        }
        removed
    }

    /// 清空缓存
    pub fn clear(&self) -> Result<()> {
        if self.dir.exists() {
            for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
                let entry = entry?;
                if entry.file_type().is_file() {
                    std::fs::remove_file(entry.path())?;
                }
            }
        }
        Ok(())
    }
}
