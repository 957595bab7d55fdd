pub mod local;
pub mod s3;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

pub use local::{FileEntry, TrashBin};
pub use s3::OpendalStore;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, delete, list 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;
/// 流式传输的分块大小
pub const TRANSFER_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// 字节流（上传/下载都以流的形式传递，避免整文件进内存）
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// 列举接口返回的单个对象
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    /// 完整对象键（含前缀）
    pub key: String,
    pub size: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// 一页列举结果，字段与 ListObjectsV2 响应保持一致
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListObjectsPage {
    pub objects: Vec<RemoteObject>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
}

/// S3 兼容对象存储接口
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// 列举一页对象；`continuation_token` 为上一页返回的令牌
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<&str>,
    ) -> Result<ListObjectsPage>;

    /// 以流的形式读取对象
    async fn get_object(&self, bucket: &str, key: &str) -> Result<ByteStream>;

    /// 以流的形式写入对象
    async fn put_object(&self, bucket: &str, key: &str, body: ByteStream) -> Result<()>;

    /// 永久删除对象（同步流程不直接调用，删除一律走 `trash_object`）
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    /// 将对象移入回收前缀，返回回收后的对象键
    async fn trash_object(&self, bucket: &str, key: &str) -> Result<String>;

    /// 回收前缀，列举时应忽略该前缀下的对象
    fn trash_prefix(&self) -> &str;

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 生成回收对象键: `<trash_prefix><时间戳>/<原始键>`
pub fn trash_key(trash_prefix: &str, key: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}{}/{}",
        trash_prefix,
        at.format("%Y%m%dT%H%M%S%.3fZ"),
        key.trim_start_matches('/')
    )
}

/// 规范化远程前缀：去掉开头的 `/`，非空时保证以 `/` 结尾
pub fn normalize_prefix(prefix: &str) -> String {
    let prefix = prefix.trim_start_matches('/');
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{}/", prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("/"), "");
        assert_eq!(normalize_prefix("/site"), "site/");
        assert_eq!(normalize_prefix("site/assets/"), "site/assets/");
    }

    #[test]
    fn test_trash_key_keeps_original_key() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
        let key = trash_key(".sync-trash/", "site/a.txt", at);
        assert_eq!(key, ".sync-trash/20240501T083000.000Z/site/a.txt");
    }
}
