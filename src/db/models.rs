use super::{JsonDocumentStore, INSTANCES_DOCUMENT, INSTANCES_KEY, PLANS_DOCUMENT, PLANS_KEY};
use crate::core::comparator::Direction;
use crate::error::SyncError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{info, warn};
use uuid::Uuid;

/// 同步计划：本地目录与某个 bucket 前缀的对应关系
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPlan {
    pub id: Uuid,
    pub bucket: String,
    pub store_instance_id: String,
    pub local_dir: PathBuf,
    pub remote_dir: String,
    #[serde(default)]
    pub direction: Direction,
}

impl SyncPlan {
    pub fn new(
        bucket: impl Into<String>,
        store_instance_id: impl Into<String>,
        local_dir: impl Into<PathBuf>,
        remote_dir: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            bucket: bucket.into(),
            store_instance_id: store_instance_id.into(),
            local_dir: local_dir.into(),
            remote_dir: remote_dir.into(),
            direction: Direction::default(),
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// 校验字段
    pub fn validate(&self) -> Result<(), String> {
        if !bucket_name_re().is_some_and(|re| re.is_match(&self.bucket)) {
            return Err(format!("非法的 bucket 名称: {:?}", self.bucket));
        }
        if self.store_instance_id.trim().is_empty() {
            return Err("storeInstanceId 不能为空".to_string());
        }
        if self.local_dir.as_os_str().is_empty() {
            return Err("localDir 不能为空".to_string());
        }
        if self.remote_dir.split(['/', '\\']).any(|s| s == "..") {
            return Err(format!("remoteDir 不能包含 `..`: {}", self.remote_dir));
        }
        Ok(())
    }
}

/// S3 bucket 命名规则：3-63 位小写字母、数字、`.`、`-`，首尾为字母或数字
fn bucket_name_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9.-]{1,61}[a-z0-9]$").ok())
        .as_ref()
}

/// S3 兼容存储实例（凭证记录）
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreInstance {
    pub s3_instance_id: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub endpoint_url: String,
}

// 不输出密钥
impl std::fmt::Debug for StoreInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreInstance")
            .field("s3_instance_id", &self.s3_instance_id)
            .field("access_key_id", &self.access_key_id)
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .finish_non_exhaustive()
    }
}

impl StoreInstance {
    pub fn validate(&self) -> Result<(), String> {
        if self.s3_instance_id.trim().is_empty() {
            return Err("s3_instance_id 不能为空".to_string());
        }
        if !self.endpoint_url.starts_with("http://") && !self.endpoint_url.starts_with("https://")
        {
            return Err(format!("非法的 endpoint_url: {}", self.endpoint_url));
        }
        Ok(())
    }
}

/// 解码并校验同步计划集合
pub fn decode_plans(value: serde_json::Value) -> Result<Vec<SyncPlan>, SyncError> {
    let invalid = |reason: String| SyncError::Validation {
        document: PLANS_DOCUMENT.to_string(),
        reason,
    };

    let plans: Vec<SyncPlan> = serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;
    let mut seen = HashSet::new();
    for plan in &plans {
        plan.validate()
            .map_err(|reason| invalid(format!("{}: {}", plan.id, reason)))?;
        if !seen.insert(plan.id) {
            return Err(invalid(format!("重复的计划 id: {}", plan.id)));
        }
    }
    Ok(plans)
}

/// 解码并校验存储实例集合
pub fn decode_instances(value: serde_json::Value) -> Result<Vec<StoreInstance>, SyncError> {
    let invalid = |reason: String| SyncError::Validation {
        document: INSTANCES_DOCUMENT.to_string(),
        reason,
    };

    let instances: Vec<StoreInstance> =
        serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;
    let mut seen = HashSet::new();
    for instance in &instances {
        instance
            .validate()
            .map_err(|reason| invalid(format!("{}: {}", instance.s3_instance_id, reason)))?;
        if !seen.insert(instance.s3_instance_id.as_str()) {
            return Err(invalid(format!("重复的实例 id: {}", instance.s3_instance_id)));
        }
    }
    Ok(instances)
}

/// 同步计划集合的唯一写入者
///
/// 修改一律是“替换整个集合并持久化”，不在原地修改单个计划。
pub struct PlanStore {
    documents: JsonDocumentStore,
    plans: Vec<SyncPlan>,
}

impl PlanStore {
    /// 加载计划集合；文档校验失败时记录警告并回退为空集合
    pub fn load(documents: JsonDocumentStore) -> Self {
        let plans = match documents.get_raw(PLANS_DOCUMENT, PLANS_KEY) {
            Ok(None) => Vec::new(),
            Ok(Some(value)) => decode_plans(value).unwrap_or_else(|e| {
                warn!("同步计划文档无效，使用空集合: {}", e);
                Vec::new()
            }),
            Err(e) => {
                warn!("读取同步计划文档失败，使用空集合: {:#}", e);
                Vec::new()
            }
        };
        info!("已加载 {} 个同步计划", plans.len());
        Self { documents, plans }
    }

    pub fn list(&self) -> &[SyncPlan] {
        &self.plans
    }

    pub fn get(&self, id: &Uuid) -> Option<&SyncPlan> {
        self.plans.iter().find(|p| p.id == *id)
    }

    /// 添加计划，id 重复或校验失败时拒绝
    pub fn add(&mut self, plan: SyncPlan) -> Result<(), SyncError> {
        plan.validate().map_err(|reason| SyncError::Validation {
            document: PLANS_DOCUMENT.to_string(),
            reason,
        })?;
        if self.get(&plan.id).is_some() {
            return Err(SyncError::Validation {
                document: PLANS_DOCUMENT.to_string(),
                reason: format!("计划 id 已存在: {}", plan.id),
            });
        }

        let mut next = self.plans.clone();
        next.push(plan);
        self.replace(next)
    }

    /// 删除计划，返回是否存在
    pub fn delete(&mut self, id: &Uuid) -> Result<bool, SyncError> {
        if self.get(id).is_none() {
            return Ok(false);
        }
        let next = self.plans.iter().filter(|p| p.id != *id).cloned().collect();
        self.replace(next)?;
        Ok(true)
    }

    fn replace(&mut self, plans: Vec<SyncPlan>) -> Result<(), SyncError> {
        self.documents.put(PLANS_DOCUMENT, PLANS_KEY, &plans)?;
        self.plans = plans;
        Ok(())
    }
}

/// 存储实例集合
pub struct InstanceStore {
    documents: JsonDocumentStore,
    instances: Vec<StoreInstance>,
}

impl InstanceStore {
    pub fn load(documents: JsonDocumentStore) -> Self {
        let instances = match documents.get_raw(INSTANCES_DOCUMENT, INSTANCES_KEY) {
            Ok(None) => Vec::new(),
            Ok(Some(value)) => decode_instances(value).unwrap_or_else(|e| {
                warn!("存储实例文档无效，使用空集合: {}", e);
                Vec::new()
            }),
            Err(e) => {
                warn!("读取存储实例文档失败，使用空集合: {:#}", e);
                Vec::new()
            }
        };
        Self {
            documents,
            instances,
        }
    }

    pub fn list(&self) -> &[StoreInstance] {
        &self.instances
    }

    pub fn find(&self, id: &str) -> Option<&StoreInstance> {
        self.instances.iter().find(|i| i.s3_instance_id == id)
    }

    pub fn add(&mut self, instance: StoreInstance) -> Result<(), SyncError> {
        let invalid = |reason: String| SyncError::Validation {
            document: INSTANCES_DOCUMENT.to_string(),
            reason,
        };
        instance.validate().map_err(invalid)?;
        if self.find(&instance.s3_instance_id).is_some() {
            return Err(invalid(format!(
                "实例 id 已存在: {}",
                instance.s3_instance_id
            )));
        }

        let mut next = self.instances.clone();
        next.push(instance);
        self.replace(next)
    }

    pub fn remove(&mut self, id: &str) -> Result<bool, SyncError> {
        if self.find(id).is_none() {
            return Ok(false);
        }
        let next = self
            .instances
            .iter()
            .filter(|i| i.s3_instance_id != id)
            .cloned()
            .collect();
        self.replace(next)?;
        Ok(true)
    }

    fn replace(&mut self, instances: Vec<StoreInstance>) -> Result<(), SyncError> {
        self.documents
            .put(INSTANCES_DOCUMENT, INSTANCES_KEY, &instances)?;
        self.instances = instances;
        Ok(())
    }
}
