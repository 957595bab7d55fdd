use crate::core::comparator::SyncAction;
use crate::error::{is_transient, SyncError};
use crate::storage::local::{read_stream, resolve_key, write_stream};
use crate::storage::{ObjectStore, TrashBin};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// 取消后未开始的动作使用的失败原因
pub const CANCELLED_REASON: &str = "cancelled";

/// 执行配置
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// 并发上限
    pub concurrency_limit: usize,
    /// 瞬时错误重试前的等待时间
    pub retry_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 1,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// 单个动作的执行结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionOutcome {
    Succeeded,
    Failed(String),
    Skipped,
}

/// 执行报告
///
/// `outcomes` 与输入动作一一对应且顺序一致；`succeeded` / `failed` / `skipped` 按结果分组列出键，
/// 组内保持输入顺序。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub outcomes: Vec<(SyncAction, ActionOutcome)>,
    pub succeeded: Vec<String>,
    /// (键, 原因)
    pub failed: Vec<(String, String)>,
    pub skipped: Vec<String>,
}

impl ExecutionReport {
    fn from_outcomes(outcomes: Vec<(SyncAction, ActionOutcome)>) -> Self {
        let mut report = Self::default();
        for (action, outcome) in &outcomes {
            let key = action.key().to_string();
            match outcome {
                ActionOutcome::Succeeded => report.succeeded.push(key),
                ActionOutcome::Failed(reason) => report.failed.push((key, reason.clone())),
                ActionOutcome::Skipped => report.skipped.push(key),
            }
        }
        report.outcomes = outcomes;
        report
    }

    /// 是否有成功的动作改动了远程
    pub fn remote_changed(&self) -> bool {
        self.outcomes
            .iter()
            .any(|(a, o)| a.touches_remote() && *o == ActionOutcome::Succeeded)
    }
}

/// 动作执行的目标（本地根目录 + 远程 bucket/前缀）
struct Target {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
    local_root: PathBuf,
    trash: TrashBin,
}

impl Target {
    fn remote_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// 执行单个动作
    async fn apply(&self, action: &SyncAction) -> Result<(), SyncError> {
        let key = action.key();
        // 所有键都先解析一次，拒绝 `..` 等越界键
        let path = resolve_key(&self.local_root, key).map_err(|e| SyncError::Transfer {
            key: key.to_string(),
            reason: e.to_string(),
            transient: false,
        })?;

        let result = match action {
            SyncAction::Upload(_) => {
                debug!("上传: {} -> {}", path.display(), self.remote_key(key));
                match read_stream(&path).await {
                    Ok(body) => {
                        self.store
                            .put_object(&self.bucket, &self.remote_key(key), body)
                            .await
                    }
                    Err(e) => Err(e),
                }
            }
            SyncAction::Download(_) => {
                debug!("下载: {} -> {}", self.remote_key(key), path.display());
                match self.store.get_object(&self.bucket, &self.remote_key(key)).await {
                    Ok(body) => write_stream(&path, body).await.map(|_| ()),
                    Err(e) => Err(e),
                }
            }
            SyncAction::DeleteLocal(_) => {
                debug!("移入本地回收站: {}", path.display());
                self.trash.discard(&path, key).await
            }
            SyncAction::DeleteRemote(_) => {
                debug!("移入远程回收前缀: {}", self.remote_key(key));
                self.store
                    .trash_object(&self.bucket, &self.remote_key(key))
                    .await
                    .map(|_| ())
            }
            SyncAction::Skip(_) => Ok(()),
        };

        result.map_err(|e| SyncError::Transfer {
            key: key.to_string(),
            reason: format!("{:#}", e),
            transient: is_transient(&e),
        })
    }

    /// 执行动作，瞬时错误重试一次
    async fn apply_with_retry(&self, action: &SyncAction, retry_delay: Duration) -> ActionOutcome {
        let err = match self.apply(action).await {
            Ok(()) => return ActionOutcome::Succeeded,
            Err(e) => e,
        };

        if !err.is_transient() {
            error!("动作失败: {}: {}", action, err);
            return ActionOutcome::Failed(err.to_string());
        }

        warn!("动作失败，{}ms 后重试: {}: {}", retry_delay.as_millis(), action, err);
        tokio::time::sleep(retry_delay).await;

        match self.apply(action).await {
            Ok(()) => ActionOutcome::Succeeded,
            Err(e) => {
                error!("动作重试后仍失败: {}: {}", action, e);
                ActionOutcome::Failed(e.to_string())
            }
        }
    }
}

/// 执行控制器：有界并发执行同步动作，单个失败不影响其它动作
pub struct Executor {
    target: Arc<Target>,
    config: ExecutorConfig,
    cancel_flag: Arc<AtomicBool>,
}

impl Executor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        local_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            target: Arc::new(Target {
                store,
                bucket: bucket.into(),
                prefix: crate::storage::normalize_prefix(&prefix.into()),
                local_root: local_root.into(),
                trash: TrashBin::default(),
            }),
            config: ExecutorConfig::default(),
            cancel_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_trash(mut self, trash: TrashBin) -> Self {
        if let Some(target) = Arc::get_mut(&mut self.target) {
            target.trash = trash;
        }
        self
    }

    pub fn with_cancel(mut self, cancel_flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = cancel_flag;
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }

    /// 执行全部动作
    ///
    /// 每个动作占用一个并发槽（Skip 不占用），瞬时错误原地重试一次后再释放槽位。
    /// 取消标志在动作之间检查，已开始的动作会执行完，未开始的记为 `Failed("cancelled")`。
    pub async fn execute(&self, actions: Vec<SyncAction>) -> ExecutionReport {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency_limit.max(1)));
        let mut outcomes: Vec<Option<ActionOutcome>> = vec![None; actions.len()];
        let mut handles = Vec::new();

        info!(
            "开始执行 {} 个动作 (并发上限 {})",
            actions.len(),
            self.config.concurrency_limit.max(1)
        );

        for (idx, action) in actions.iter().enumerate() {
            if matches!(action, SyncAction::Skip(_)) {
                outcomes[idx] = Some(ActionOutcome::Skipped);
                continue;
            }
            if self.is_cancelled() {
                outcomes[idx] = Some(ActionOutcome::Failed(CANCELLED_REASON.to_string()));
                continue;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    outcomes[idx] = Some(ActionOutcome::Failed(CANCELLED_REASON.to_string()));
                    continue;
                }
            };
            // 等待槽位期间可能已被取消
            if self.is_cancelled() {
                outcomes[idx] = Some(ActionOutcome::Failed(CANCELLED_REASON.to_string()));
                continue;
            }

            let target = self.target.clone();
            let action = action.clone();
            let retry_delay = self.config.retry_delay;

            let handle = tokio::spawn(async move {
                let outcome = target.apply_with_retry(&action, retry_delay).await;
                drop(permit);
                outcome
            });
            handles.push((idx, handle));
        }

        // 等待所有任务完成
        for (idx, handle) in handles {
            outcomes[idx] = Some(match handle.await {
                Ok(outcome) => outcome,
                Err(e) => ActionOutcome::Failed(format!("任务失败: {}", e)),
            });
        }

        let outcomes = actions
            .into_iter()
            .zip(outcomes)
            .map(|(action, outcome)| {
                let outcome = outcome
                    .unwrap_or_else(|| ActionOutcome::Failed(CANCELLED_REASON.to_string()));
                (action, outcome)
            })
            .collect();

        let report = ExecutionReport::from_outcomes(outcomes);
        info!(
            "执行完成: 成功 {}, 失败 {}, 跳过 {}",
            report.succeeded.len(),
            report.failed.len(),
            report.skipped.len()
        );
        report
    }
}
