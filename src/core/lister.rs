use crate::error::SyncError;
use crate::storage::{normalize_prefix, ObjectStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 默认翻页间隔
pub const DEFAULT_PAGE_DELAY_MS: u64 = 100;

/// 远程对象元数据（键已去掉前缀）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub relative_key: String,
    pub size_bytes: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// 中断的列举：保存最后一个成功的续传令牌和已收集的部分结果
#[derive(Debug)]
pub struct ListingInterrupted {
    pub bucket: String,
    pub prefix: String,
    /// 最后一页成功返回的续传令牌，`None` 表示第一页就失败了
    pub last_token: Option<String>,
    pub partial: HashMap<String, ObjectEntry>,
    pub source: anyhow::Error,
}

/// 远程对象列举器：逐页调用 `list_objects` 直到 `is_truncated == false`
pub struct ObjectLister {
    page_delay: Duration,
    cancel_flag: Option<Arc<AtomicBool>>,
}

impl ObjectLister {
    pub fn new() -> Self {
        Self {
            page_delay: Duration::from_millis(DEFAULT_PAGE_DELAY_MS),
            cancel_flag: None,
        }
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    pub fn with_cancel(mut self, cancel_flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = Some(cancel_flag);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .map(|f| f.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// 列举 `prefix` 下的全部对象，返回 `相对键 -> ObjectEntry`
    pub async fn list(
        &self,
        store: &dyn ObjectStore,
        bucket: &str,
        prefix: &str,
    ) -> Result<HashMap<String, ObjectEntry>, SyncError> {
        let prefix = normalize_prefix(prefix);
        info!("开始列举远程对象: {} {}/{}", store.name(), bucket, prefix);
        self.list_from(store, bucket, &prefix, None, HashMap::new())
            .await
    }

    /// 从中断处继续列举，结果合并到已有的部分结果中
    pub async fn resume(
        &self,
        store: &dyn ObjectStore,
        interrupted: ListingInterrupted,
    ) -> Result<HashMap<String, ObjectEntry>, SyncError> {
        let ListingInterrupted {
            bucket,
            prefix,
            last_token,
            partial,
            source,
        } = interrupted;
        info!(
            "继续列举 {}/{} (已有 {} 个对象, 上次错误: {})",
            bucket,
            prefix,
            partial.len(),
            source
        );
        self.list_from(store, &bucket, &prefix, last_token, partial)
            .await
    }

    async fn list_from(
        &self,
        store: &dyn ObjectStore,
        bucket: &str,
        prefix: &str,
        mut token: Option<String>,
        mut entries: HashMap<String, ObjectEntry>,
    ) -> Result<HashMap<String, ObjectEntry>, SyncError> {
        let trash_prefix = store.trash_prefix().to_string();
        let mut pages = 0usize;

        loop {
            if self.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let page = match store.list_objects(bucket, prefix, token.as_deref()).await {
                Ok(page) => page,
                Err(source) => {
                    warn!("列举第 {} 页失败: {:#}", pages + 1, source);
                    return Err(SyncError::RemoteList(Box::new(ListingInterrupted {
                        bucket: bucket.to_string(),
                        prefix: prefix.to_string(),
                        last_token: token,
                        partial: entries,
                        source,
                    })));
                }
            };
            pages += 1;

            for object in page.objects {
                if !trash_prefix.is_empty() && object.key.starts_with(&trash_prefix) {
                    continue;
                }
                let relative = object.key.strip_prefix(prefix).unwrap_or(&object.key);
                if relative.is_empty() {
                    continue;
                }
                entries.insert(
                    relative.to_string(),
                    ObjectEntry {
                        relative_key: relative.to_string(),
                        size_bytes: object.size,
                        last_modified: object.last_modified,
                    },
                );
            }

            match (page.is_truncated, page.next_continuation_token) {
                (true, Some(next)) => {
                    // 令牌不前进时继续请求只会得到同一页
                    if token.as_deref() == Some(next.as_str()) {
                        warn!("续传令牌未前进: {}", next);
                        return Err(SyncError::RemoteList(Box::new(ListingInterrupted {
                            bucket: bucket.to_string(),
                            prefix: prefix.to_string(),
                            source: anyhow::anyhow!("续传令牌未前进: {}", next),
                            last_token: token,
                            partial: entries,
                        })));
                    }
                    token = Some(next);
                    debug!("已列举 {} 页, {} 个对象", pages, entries.len());
                    if !self.page_delay.is_zero() {
                        tokio::time::sleep(self.page_delay).await;
                    }
                }
                (true, None) => {
                    warn!("列举结果被截断但没有续传令牌，提前结束");
                    break;
                }
                (false, _) => break,
            }
        }

        info!("远程列举完成: {} 页, {} 个对象", pages, entries.len());
        Ok(entries)
    }
}

impl Default for ObjectLister {
    fn default() -> Self {
        Self::new()
    }
}
