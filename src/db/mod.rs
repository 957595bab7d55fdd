//! JSON 文档存储
//!
//! 每个逻辑存储对应数据目录下的一个 JSON 文件，值挂在固定的键下，
//! 例如 `sync-plans.json` 的 `"sync-plans"`、`s3-config.json` 的 `"s3-instances"`。

pub mod models;
pub use models::*;

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;

/// 同步计划文档
pub const PLANS_DOCUMENT: &str = "sync-plans.json";
pub const PLANS_KEY: &str = "sync-plans";
/// 存储实例文档
pub const INSTANCES_DOCUMENT: &str = "s3-config.json";
pub const INSTANCES_KEY: &str = "s3-instances";

/// 基于目录的 JSON 文档存储
#[derive(Debug, Clone)]
pub struct JsonDocumentStore {
    dir: PathBuf,
}

impl JsonDocumentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn read_document(&self, document: &str) -> Result<serde_json::Value> {
        let path = self.dir.join(document);
        if !path.exists() {
            return Ok(serde_json::json!({}));
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("读取文档失败: {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("文档不是合法 JSON: {}", document))
    }

    /// 读取文档中 `key` 下的原始值，文档或键不存在时返回 `None`
    pub fn get_raw(&self, document: &str, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.read_document(document)?.get(key).cloned())
    }

    /// 写入 `key` 下的值，文档中的其它键保持不变
    ///
    /// 先写临时文件再重命名，避免写到一半的文档。
    pub fn put<T: Serialize>(&self, document: &str, key: &str, value: &T) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("创建数据目录失败: {}", self.dir.display()))?;

        let mut root = self.read_document(document).unwrap_or_else(|e| {
            tracing::warn!("现有文档无法解析，将被覆盖: {:#}", e);
            serde_json::json!({})
        });
        if !root.is_object() {
            root = serde_json::json!({});
        }
        root[key] = serde_json::to_value(value)?;

        let path = self.dir.join(document);
        let tmp = self.dir.join(format!(".{}.tmp", document));
        fs::write(&tmp, serde_json::to_string_pretty(&root)?)
            .with_context(|| format!("写入文档失败: {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("替换文档失败: {}", path.display()))?;
        Ok(())
    }
}
