//! 带缓存的异步加载器
//!
//! 状态机：`Idle -> Fetching{param} -> Settled{param, value}`，通过 `watch` 通道对外可见。
//! 同一时刻最多一个请求在执行（`Semaphore(1)`，先到先得）；结果按参数的 BLAKE3 键缓存，
//! 只有存入的参数与请求参数结构相等时才视为命中。

use anyhow::{Context, Result};
use async_trait::async_trait;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Semaphore};
use tracing::debug;

/// 加载器对外可见的状态
#[derive(Debug, Clone, PartialEq)]
pub enum LoadState<P, R> {
    Idle,
    Fetching { param: P },
    Settled { param: P, value: R },
}

/// 缓存查询结果
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<R> {
    Hit(R),
    Miss,
}

/// 数据获取接口
#[async_trait]
pub trait Fetch<P, R>: Send + Sync
where
    P: Send + Sync + 'static,
    R: Send + 'static,
{
    async fn fetch(&self, param: &P) -> Result<R>;
}

/// 由参数计算缓存键：参数 JSON 编码的 BLAKE3 摘要
pub fn cache_key<P: Serialize>(param: &P) -> Result<String> {
    let encoded = serde_json::to_vec(param).context("序列化加载参数失败")?;
    Ok(blake3::hash(&encoded).to_hex().to_string())
}

pub struct CachedLoader<P, R>
where
    P: Clone + PartialEq + Serialize + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    fetcher: Arc<dyn Fetch<P, R>>,
    cache: Cache<String, (P, R)>,
    gate: Semaphore,
    state: watch::Sender<LoadState<P, R>>,
    current: Mutex<Option<P>>,
}

impl<P, R> CachedLoader<P, R>
where
    P: Clone + PartialEq + Serialize + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    pub fn new(fetcher: Arc<dyn Fetch<P, R>>, max_entries: u64) -> Self {
        let (state, _) = watch::channel(LoadState::Idle);
        Self {
            fetcher,
            cache: Cache::builder()
                .max_capacity(max_entries)
                .eviction_policy(EvictionPolicy::lru())
                .build(),
            gate: Semaphore::new(1),
            state,
            current: Mutex::new(None),
        }
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<LoadState<P, R>> {
        self.state.subscribe()
    }

    /// 当前显示的状态
    pub fn state(&self) -> LoadState<P, R> {
        self.state.borrow().clone()
    }

    /// 查询缓存，存入的参数与 `param` 不相等时视为未命中
    pub fn lookup(&self, param: &P) -> Result<CacheLookup<R>> {
        let key = cache_key(param)?;
        Ok(match self.cache.get(&key) {
            Some((stored, value)) if stored == *param => CacheLookup::Hit(value),
            _ => CacheLookup::Miss,
        })
    }

    /// 切换到 `param`：已就绪且参数相同时直接返回，缓存命中时不请求
    pub async fn update(&self, param: P) -> Result<R> {
        if let LoadState::Settled { param: shown, value } = &*self.state.borrow() {
            if *shown == param {
                return Ok(value.clone());
            }
        }

        self.set_current(param.clone());

        if let CacheLookup::Hit(value) = self.lookup(&param)? {
            debug!("加载缓存命中");
            self.settle_if_current(&param, value.clone());
            return Ok(value);
        }

        self.load(param, false).await
    }

    /// 强制为当前参数重新请求
    pub async fn refresh(&self) -> Result<R> {
        let param = self
            .current_param()
            .context("加载器尚未设置参数，无法刷新")?;
        self.load(param, true).await
    }

    /// 切换到 `param` 并强制请求，不使用缓存
    pub async fn reload(&self, param: P) -> Result<R> {
        self.set_current(param.clone());
        self.load(param, true).await
    }

    async fn load(&self, param: P, forced: bool) -> Result<R> {
        let key = cache_key(&param)?;
        let _permit = self.gate.acquire().await.context("加载器已关闭")?;

        // 排队期间可能已有相同参数的请求完成
        if !forced {
            if let CacheLookup::Hit(value) = self.lookup(&param)? {
                self.settle_if_current(&param, value.clone());
                return Ok(value);
            }
        }

        let previous = self.state();
        if self.is_current(&param) {
            self.state.send_replace(LoadState::Fetching {
                param: param.clone(),
            });
        }

        match self.fetcher.fetch(&param).await {
            Ok(value) => {
                self.cache.insert(key, (param.clone(), value.clone()));
                self.settle_if_current(&param, value.clone());
                Ok(value)
            }
            Err(e) => {
                // 失败不写缓存，恢复之前的显示状态
                self.state.send_if_modified(|state| match state {
                    LoadState::Fetching { param: p } if *p == param => {
                        *state = previous;
                        true
                    }
                    _ => false,
                });
                Err(e)
            }
        }
    }

    fn set_current(&self, param: P) {
        if let Ok(mut current) = self.current.lock() {
            *current = Some(param);
        }
    }

    fn current_param(&self) -> Option<P> {
        self.current.lock().ok().and_then(|c| c.clone())
    }

    fn is_current(&self, param: &P) -> bool {
        self.current
            .lock()
            .map(|c| c.as_ref() == Some(param))
            .unwrap_or(false)
    }

    /// 只有参数仍是当前参数时才更新显示（后写者胜）
    fn settle_if_current(&self, param: &P, value: R) {
        if self.is_current(param) {
            self.state.send_replace(LoadState::Settled {
                param: param.clone(),
                value,
            });
        }
    }
}
