use super::{
    trash_key, ByteStream, ListObjectsPage, ObjectStore, RemoteObject, IO_TIMEOUT_SECS,
    OP_TIMEOUT_SECS, TRANSFER_CHUNK_SIZE,
};
use crate::db::StoreInstance;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use moka::future::Cache;
use opendal::{layers::TimeoutLayer, Metakey, Operator};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// 每页默认对象数（与 ListObjectsV2 的默认上限一致）
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// 后端类型
#[derive(Debug, Clone)]
enum Backend {
    S3(StoreInstance),
    /// 进程内存储，用于预演和测试
    Memory,
}

/// 基于 opendal 的 S3 兼容对象存储
///
/// opendal 的 Operator 绑定单个 bucket，这里按 bucket 缓存 Operator。
pub struct OpendalStore {
    backend: Backend,
    operators: Cache<String, Operator>,
    page_size: usize,
    trash_prefix: String,
    name: String,
}

impl OpendalStore {
    /// 根据实例配置创建 S3 存储
    pub fn s3(instance: StoreInstance, operator_ttl: Duration) -> Self {
        let name = format!("s3:{}@{}", instance.s3_instance_id, instance.endpoint_url);
        Self {
            backend: Backend::S3(instance),
            operators: Cache::builder()
                .time_to_live(operator_ttl)
                .max_capacity(50)
                .build(),
            page_size: DEFAULT_PAGE_SIZE,
            trash_prefix: ".sync-trash/".to_string(),
            name,
        }
    }

    /// 创建内存存储（Operator 永不过期，否则数据会丢失）
    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory,
            operators: Cache::builder().max_capacity(50).build(),
            page_size: DEFAULT_PAGE_SIZE,
            trash_prefix: ".sync-trash/".to_string(),
            name: "memory".to_string(),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_trash_prefix(mut self, prefix: &str) -> Self {
        self.trash_prefix = super::normalize_prefix(prefix);
        self
    }

    /// 获取（或创建）bucket 对应的 Operator
    async fn operator(&self, bucket: &str) -> Result<Operator> {
        let backend = self.backend.clone();
        let bucket_name = bucket.to_string();
        self.operators
            .try_get_with(bucket.to_string(), async move {
                build_operator(&backend, &bucket_name)
            })
            .await
            .map_err(|e: Arc<anyhow::Error>| anyhow::anyhow!("{:#}", e))
    }
}

fn build_operator(backend: &Backend, bucket: &str) -> Result<Operator> {
    match backend {
        Backend::S3(instance) => {
            use opendal::services::S3;

            let builder = S3::default()
                .bucket(bucket)
                .region(&instance.region)
                .access_key_id(&instance.access_key_id)
                .secret_access_key(&instance.secret_access_key)
                .endpoint(&instance.endpoint_url);

            info!(
                "初始化S3存储: bucket={}, region={}, endpoint={}",
                bucket, instance.region, instance.endpoint_url
            );

            // 添加超时层
            Ok(Operator::new(builder)?
                .layer(
                    TimeoutLayer::default()
                        .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                        .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
                )
                .finish())
        }
        Backend::Memory => {
            debug!("初始化内存存储: bucket={}", bucket);
            Ok(Operator::new(opendal::services::Memory::default())?.finish())
        }
    }
}

#[async_trait]
impl ObjectStore for OpendalStore {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<&str>,
    ) -> Result<ListObjectsPage> {
        let op = self.operator(bucket).await?;

        // 续传令牌即上一页最后一个对象键，服务端支持时交给 start_after，否则在客户端过滤
        let mut request = op
            .lister_with(prefix)
            .recursive(true)
            .metakey(Metakey::ContentLength | Metakey::LastModified | Metakey::Mode);
        if let Some(token) = continuation_token {
            if op.info().full_capability().list_with_start_after {
                request = request.start_after(token);
            }
        }
        let mut lister = request
            .await
            .with_context(|| format!("列举对象失败: {}/{}", bucket, prefix))?;

        let mut page = ListObjectsPage::default();
        while let Some(entry) = lister.try_next().await? {
            let meta = entry.metadata();
            if meta.is_dir() {
                continue;
            }

            let key = entry.path().trim_start_matches('/').to_string();
            if continuation_token.is_some_and(|token| key.as_str() <= token) {
                continue;
            }

            if page.objects.len() == self.page_size {
                page.is_truncated = true;
                break;
            }

            page.objects.push(RemoteObject {
                key,
                size: Some(meta.content_length()),
                last_modified: meta.last_modified(),
            });
        }

        if page.is_truncated {
            page.next_continuation_token = page.objects.last().map(|o| o.key.clone());
        }

        Ok(page)
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ByteStream> {
        let op = self.operator(bucket).await?;
        let size = op
            .stat(key)
            .await
            .with_context(|| format!("获取对象信息失败: {}", key))?
            .content_length();
        let reader = Arc::new(op.reader(key).await?);

        // 按固定分块读取，避免整个对象进内存
        let chunk = TRANSFER_CHUNK_SIZE as u64;
        let stream = futures::stream::try_unfold(0u64, move |offset| {
            let reader = reader.clone();
            async move {
                if offset >= size {
                    return Ok::<_, anyhow::Error>(None);
                }
                let end = (offset + chunk).min(size);
                let buffer = reader.read(offset..end).await?;
                Ok(Some((buffer.to_bytes(), end)))
            }
        });

        Ok(stream.boxed())
    }

    async fn put_object(&self, bucket: &str, key: &str, mut body: ByteStream) -> Result<()> {
        let op = self.operator(bucket).await?;
        let mut writer = op
            .writer_with(key)
            .chunk(TRANSFER_CHUNK_SIZE)
            .await
            .with_context(|| format!("创建写入器失败: {}", key))?;

        let result: Result<()> = async {
            while let Some(chunk) = body.try_next().await? {
                writer.write(chunk).await?;
            }
            writer.close().await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            // 放弃未完成的分片上传
            let _ = writer.abort().await;
            return Err(e.context(format!("上传对象失败: {}", key)));
        }
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        // S3 删除不存在的对象不会报错
        let op = self.operator(bucket).await?;
        op.delete(key)
            .await
            .with_context(|| format!("删除对象失败: {}", key))?;
        Ok(())
    }

    async fn trash_object(&self, bucket: &str, key: &str) -> Result<String> {
        let op = self.operator(bucket).await?;
        let target = trash_key(&self.trash_prefix, key, chrono::Utc::now());

        if op.info().full_capability().copy {
            op.copy(key, &target)
                .await
                .with_context(|| format!("复制对象到回收前缀失败: {}", key))?;
        } else {
            let body = self.get_object(bucket, key).await?;
            self.put_object(bucket, &target, body).await?;
        }

        self.delete_object(bucket, key).await?;
        debug!("已移入回收前缀: {} -> {}", key, target);
        Ok(target)
    }

    fn trash_prefix(&self) -> &str {
        &self.trash_prefix
    }

    fn name(&self) -> &str {
        &self.name
    }
}
