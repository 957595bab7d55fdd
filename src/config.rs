//! 应用配置模块
//!
//! 所有配置保存在数据目录的 `config.json` 中，按节（`sync`、`cache`、`log`）存放，
//! 每节读取失败时使用默认值。

use crate::core::executor::ExecutorConfig;
use crate::logging::LogConfig;
use crate::storage::TrashBin;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "config.json";
/// 默认数据目录名
pub const APP_DIR_NAME: &str = "bucketsync";

fn read_config(config_dir: &Path) -> serde_json::Value {
    fs::read_to_string(config_dir.join(CONFIG_FILE))
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_else(|| serde_json::json!({}))
}

/// 读取配置中的一节，不存在或格式错误时返回默认值
pub fn load_section<T: DeserializeOwned + Default>(config_dir: &Path, section: &str) -> T {
    read_config(config_dir)
        .get(section)
        .and_then(|value| serde_json::from_value(value.clone()).ok())
        .unwrap_or_default()
}

/// 数据目录：默认 `<系统配置目录>/bucketsync`，可在其 `config.json` 中用 `data_path` 重定向
pub fn data_dir() -> PathBuf {
    let default_dir = crate::dirs::config_dir()
        .map(|p| p.join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(".bucketsync"));

    read_config(&default_dir)
        .get("data_path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .filter(|p| p.is_dir())
        .inspect(|p| tracing::debug!("使用自定义数据路径: {:?}", p))
        .unwrap_or(default_dir)
}

/// 同步执行配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    /// 同时执行的动作数
    pub concurrency_limit: usize,
    /// 瞬时错误重试前的等待（毫秒）
    pub retry_delay_ms: u64,
    /// 远程列举翻页间隔（毫秒）
    pub list_page_delay_ms: u64,
    /// 每页对象数
    pub list_page_size: usize,
    /// 远程删除时对象移入的前缀
    pub remote_trash_prefix: String,
    /// 本地删除时的回收目录，未设置时使用系统回收站
    pub local_trash_dir: Option<PathBuf>,
    /// 扫描时排除的路径（glob）
    pub exclude_patterns: Vec<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            concurrency_limit: 1,
            retry_delay_ms: 500,
            list_page_delay_ms: 100,
            list_page_size: 1000,
            remote_trash_prefix: ".sync-trash/".to_string(),
            local_trash_dir: None,
            exclude_patterns: Vec::new(),
        }
    }
}

impl SyncSettings {
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "sync")
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            concurrency_limit: self.concurrency_limit.max(1),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.list_page_delay_ms)
    }

    pub fn trash_bin(&self) -> TrashBin {
        match &self.local_trash_dir {
            Some(dir) => TrashBin::Directory(dir.clone()),
            None => TrashBin::System,
        }
    }
}

/// 缓存配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// 远程列举缓存的最大条目数
    pub max_entries: u64,
    /// 存储客户端缓存 TTL（秒）
    pub operator_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 64,
            operator_ttl_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "cache")
    }
}

/// 完整配置
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub sync: SyncSettings,
    pub cache: CacheConfig,
    pub log: LogConfig,
}

impl AppConfig {
    pub fn load(config_dir: &Path) -> Self {
        Self {
            sync: SyncSettings::load(config_dir),
            cache: CacheConfig::load(config_dir),
            log: LogConfig::load(config_dir),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(dir.path());
        assert_eq!(config.sync, SyncSettings::default());
        assert_eq!(config.cache.max_entries, 64);
        assert!(config.log.enabled);
    }

    #[test]
    fn test_partial_section_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"sync": {"concurrencyLimit": 4, "localTrashDir": "/tmp/bin"}, "cache": "broken"}"#,
        )
        .unwrap();

        let config = AppConfig::load(dir.path());
        assert_eq!(config.sync.concurrency_limit, 4);
        assert_eq!(config.sync.list_page_delay_ms, 100);
        assert_eq!(
            config.sync.trash_bin(),
            TrashBin::Directory(PathBuf::from("/tmp/bin"))
        );
        assert_eq!(config.cache, CacheConfig::default());
    }

    #[test]
    fn test_sync_section_reads_excludes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"sync": {"concurrencyLimit": 8, "excludePatterns": ["*.tmp", ".git/**"]}}"#,
        )
        .unwrap();

        let sync = SyncSettings::load(dir.path());
        assert_eq!(sync.exclude_patterns, vec!["*.tmp", ".git/**"]);
        assert_eq!(sync.executor_config().concurrency_limit, 8);
    }
}
