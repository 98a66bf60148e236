//! 配置文件管理模块

use crate::core::models::AppConfig;
use anyhow::{bail, Result};
use std::path::PathBuf;

/// 配置管理器
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// 创建配置管理器
    pub fn new(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    /// 获取默认配置路径
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("edu", "columbia", "cohd")
            .map(|d| d.config_dir().join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    }

    /// 配置文件路径
    pub fn path(&self) -> &PathBuf {
        &self.config_path
    }

    /// 加载配置，文件不存在时使用默认配置
    pub fn load(&self) -> Result<AppConfig> {
        let config = if self.config_path.exists() {
            let content = std::fs::read_to_string(&self.config_path)?;
            serde_json::from_str(&content)?
        } else {
            AppConfig::default()
        };
        validate(&config)?;
        Ok(config)
    }

    /// 保存配置
    pub fn save(&self, config: &AppConfig) -> Result<()> {
        // 确保目录存在
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.config_path, content)?;
        Ok(())
    }

    /// 重置为默认配置
    pub fn reset(&self) -> Result<()> {
        self.save(&AppConfig::default())
    }
}

fn validate(config: &AppConfig) -> Result<()> {
    if !(0.0..1.0).contains(&config.default_confidence) {
        bail!(
            "default_confidence 必须位于 [0, 1) 区间: {}",
            config.default_confidence
        );
    }
    if config.node_normalizer_url.trim().is_empty() {
        bail!("node_normalizer_url 不能为空");
    }
    Ok(())
}
