use crate::config::{AppConfig, SyncSettings};
use crate::core::comparator::{diff, summarize, ActionSummary, Direction, SyncAction};
use crate::core::executor::{ExecutionReport, Executor};
use crate::core::lister::{ObjectEntry, ObjectLister};
use crate::core::loader::{CachedLoader, Fetch};
use crate::core::scanner::{LocalScanner, ScanConfig};
use crate::db::{StoreInstance, SyncPlan};
use crate::error::{is_transient, SyncError};
use crate::storage::{normalize_prefix, ObjectStore, OpendalStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// 远程列举结果
pub type RemoteMap = HashMap<String, ObjectEntry>;

/// 同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    Completed,
    /// 部分动作失败
    CompletedWithErrors,
    Cancelled,
}

/// 同步报告
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub plan_id: Uuid,
    pub direction: Direction,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: ActionSummary,
    pub execution: ExecutionReport,
}

/// 远程列举缓存键
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListingKey {
    pub instance: String,
    pub bucket: String,
    pub prefix: String,
}

/// 存储实例到对象存储的映射，按实例 id 复用
struct StoreRegistry {
    instances: Vec<StoreInstance>,
    stores: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
    settings: SyncSettings,
    operator_ttl: Duration,
}

impl StoreRegistry {
    fn get(&self, instance_id: &str) -> Result<Arc<dyn ObjectStore>> {
        let mut stores = self
            .stores
            .lock()
            .map_err(|_| anyhow::anyhow!("存储注册表已损坏"))?;
        if let Some(store) = stores.get(instance_id) {
            return Ok(store.clone());
        }

        let instance = self
            .instances
            .iter()
            .find(|i| i.s3_instance_id == instance_id)
            .with_context(|| format!("未找到存储实例: {}", instance_id))?
            .clone();
        let store: Arc<dyn ObjectStore> = Arc::new(
            OpendalStore::s3(instance, self.operator_ttl)
                .with_page_size(self.settings.list_page_size)
                .with_trash_prefix(&self.settings.remote_trash_prefix),
        );
        stores.insert(instance_id.to_string(), store.clone());
        Ok(store)
    }

    fn register(&self, instance_id: &str, store: Arc<dyn ObjectStore>) {
        if let Ok(mut stores) = self.stores.lock() {
            stores.insert(instance_id.to_string(), store);
        }
    }
}

/// 远程列举获取器（加载器的数据源）
struct RemoteListing {
    stores: Arc<StoreRegistry>,
    page_delay: Duration,
    cancelled: Arc<AtomicBool>,
}

#[async_trait]
impl Fetch<ListingKey, Arc<RemoteMap>> for RemoteListing {
    async fn fetch(&self, key: &ListingKey) -> Result<Arc<RemoteMap>> {
        let store = self.stores.get(&key.instance)?;
        let lister = ObjectLister::new()
            .with_page_delay(self.page_delay)
            .with_cancel(self.cancelled.clone());

        let entries = match lister.list(store.as_ref(), &key.bucket, &key.prefix).await {
            // 瞬时错误从中断处续传一次
            Err(SyncError::RemoteList(interrupted)) if is_transient(&interrupted.source) => {
                warn!(
                    "列举中断，从续传令牌 {:?} 继续",
                    interrupted.last_token
                );
                lister.resume(store.as_ref(), *interrupted).await?
            }
            other => other?,
        };
        Ok(Arc::new(entries))
    }
}

/// 同步引擎：执行单个同步计划
pub struct SyncEngine {
    settings: SyncSettings,
    scan_config: ScanConfig,
    stores: Arc<StoreRegistry>,
    listings: CachedLoader<ListingKey, Arc<RemoteMap>>,
    cancelled: Arc<AtomicBool>,
}

impl SyncEngine {
    pub fn new(config: &AppConfig, instances: Vec<StoreInstance>) -> Self {
        let cancelled = Arc::new(AtomicBool::new(false));
        let stores = Arc::new(StoreRegistry {
            instances,
            stores: Mutex::new(HashMap::new()),
            settings: config.sync.clone(),
            operator_ttl: Duration::from_secs(config.cache.operator_ttl_secs),
        });
        let fetcher = Arc::new(RemoteListing {
            stores: stores.clone(),
            page_delay: config.sync.page_delay(),
            cancelled: cancelled.clone(),
        });

        Self {
            settings: config.sync.clone(),
            scan_config: ScanConfig {
                exclude_patterns: config.sync.exclude_patterns.clone(),
            },
            stores,
            listings: CachedLoader::new(fetcher, config.cache.max_entries),
            cancelled,
        }
    }

    /// 为实例注册一个现成的对象存储（替代按配置创建的 S3 存储）
    pub fn register_store(&self, instance_id: &str, store: Arc<dyn ObjectStore>) {
        self.stores.register(instance_id, store);
    }

    /// 取消同步
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// 共享的取消标志（例如交给 Ctrl-C 处理器）
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// 预演：计算同步动作但不执行（远程列举可来自缓存）
    pub async fn plan(&self, plan: &SyncPlan) -> Result<Vec<SyncAction>> {
        self.compute_actions(plan, false).await
    }

    /// `fresh` 为真时跳过缓存重新列举远程
    async fn compute_actions(&self, plan: &SyncPlan, fresh: bool) -> Result<Vec<SyncAction>> {
        let prefix = normalize_prefix(&plan.remote_dir);

        if plan.direction == Direction::MirrorToLocal && !plan.local_dir.exists() {
            tokio::fs::create_dir_all(&plan.local_dir)
                .await
                .with_context(|| format!("创建本地目录失败: {}", plan.local_dir.display()))?;
        }

        let scanner =
            LocalScanner::with_config(&self.scan_config)?.with_cancel(self.cancelled.clone());
        let key = ListingKey {
            instance: plan.store_instance_id.clone(),
            bucket: plan.bucket.clone(),
            prefix,
        };

        let listing = async {
            if fresh {
                self.listings.reload(key).await
            } else {
                self.listings.update(key).await
            }
        };
        let (local, remote) = tokio::try_join!(
            async { scanner.scan(&plan.local_dir).await.map_err(anyhow::Error::from) },
            listing,
        )?;

        let actions = diff(&local, &remote, plan.direction);
        let summary = summarize(&actions);
        info!(
            "差异计算完成: 上传 {}, 下载 {}, 删除本地 {}, 删除远程 {}, 跳过 {}",
            summary.upload_count,
            summary.download_count,
            summary.delete_local_count,
            summary.delete_remote_count,
            summary.skip_count
        );
        Ok(actions)
    }

    /// 运行同步计划
    pub async fn run(&self, plan: &SyncPlan) -> Result<SyncReport> {
        let started_at = Utc::now();
        // 重置取消标志
        self.cancelled.store(false, Ordering::SeqCst);

        info!(
            "开始同步计划 {}: {} <-> {}/{} ({})",
            plan.id,
            plan.local_dir.display(),
            plan.bucket,
            plan.remote_dir,
            plan.direction
        );

        // 执行前总是重新列举，删除类动作不能基于缓存的远程视图
        let actions = self.compute_actions(plan, true).await?;
        let summary = summarize(&actions);

        let store = self.stores.get(&plan.store_instance_id)?;
        let executor = Executor::new(
            store,
            plan.bucket.clone(),
            plan.remote_dir.clone(),
            plan.local_dir.clone(),
        )
        .with_config(self.settings.executor_config())
        .with_trash(self.settings.trash_bin())
        .with_cancel(self.cancelled.clone());

        let execution = executor.execute(actions).await;

        // 远程有变化时刷新列举缓存
        if execution.remote_changed() {
            if let Err(e) = self.listings.refresh().await {
                warn!("刷新远程列举缓存失败: {:#}", e);
            }
        }

        let status = if self.is_cancelled() {
            SyncStatus::Cancelled
        } else if !execution.failed.is_empty() {
            SyncStatus::CompletedWithErrors
        } else {
            SyncStatus::Completed
        };

        info!(
            "同步计划 {} 结束: {:?}, 成功 {}, 失败 {}, 跳过 {}",
            plan.id,
            status,
            execution.succeeded.len(),
            execution.failed.len(),
            execution.skipped.len()
        );

        Ok(SyncReport {
            plan_id: plan.id,
            direction: plan.direction,
            status,
            started_at,
            finished_at: Utc::now(),
            summary,
            execution,
        })
    }

    /// 当前缓存的远程列举
    pub fn cached_listing(&self, plan: &SyncPlan) -> Option<Arc<RemoteMap>> {
        let key = ListingKey {
            instance: plan.store_instance_id.clone(),
            bucket: plan.bucket.clone(),
            prefix: normalize_prefix(&plan.remote_dir),
        };
        match self.listings.lookup(&key) {
            Ok(crate::core::loader::CacheLookup::Hit(value)) => Some(value),
            _ => None,
        }
    }
}
