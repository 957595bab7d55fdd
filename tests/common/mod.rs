#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use bucketsync::storage::{trash_key, ByteStream, ListObjectsPage, ObjectStore, RemoteObject};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::TryStreamExt;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::Mutex;

/// 测试用对象存储：内存对象表 + 可注入的失败 + 调用事件日志
#[derive(Default)]
pub struct FakeStore {
    objects: Mutex<BTreeMap<String, Bytes>>,
    page_size: usize,
    /// 键 -> 剩余的瞬时失败次数
    put_failures: Mutex<HashMap<String, usize>>,
    /// 第 N 次 list 调用（从 0 开始）失败一次
    list_failure_at: Mutex<Option<usize>>,
    list_calls: Mutex<usize>,
    events: Mutex<Vec<String>>,
}

impl FakeStore {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            ..Default::default()
        }
    }

    pub fn insert(&self, key: &str, body: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), Bytes::copy_from_slice(body));
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn body(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    /// 对 `key` 的下 `times` 次上传返回超时错误
    pub fn fail_put(&self, key: &str, times: usize) {
        self.put_failures
            .lock()
            .unwrap()
            .insert(key.to_string(), times);
    }

    pub fn fail_list_call(&self, call: usize) {
        *self.list_failure_at.lock().unwrap() = Some(call);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

fn timed_out(what: &str) -> anyhow::Error {
    anyhow::Error::new(io::Error::new(io::ErrorKind::TimedOut, what.to_string()))
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn list_objects(
        &self,
        _bucket: &str,
        prefix: &str,
        continuation_token: Option<&str>,
    ) -> Result<ListObjectsPage> {
        let call = {
            let mut calls = self.list_calls.lock().unwrap();
            let call = *calls;
            *calls += 1;
            call
        };
        self.record(format!("list:{}", continuation_token.unwrap_or("")));

        {
            let mut failure = self.list_failure_at.lock().unwrap();
            if *failure == Some(call) {
                *failure = None;
                return Err(timed_out("list"));
            }
        }

        let objects = self.objects.lock().unwrap();
        let mut matching = objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .filter(|(k, _)| continuation_token.map_or(true, |t| k.as_str() > t));

        let page: Vec<RemoteObject> = matching
            .by_ref()
            .take(self.page_size)
            .map(|(k, v)| RemoteObject {
                key: k.clone(),
                size: Some(v.len() as u64),
                last_modified: None,
            })
            .collect();
        let is_truncated = matching.next().is_some();
        let next_continuation_token = if is_truncated {
            page.last().map(|o| o.key.clone())
        } else {
            None
        };

        Ok(ListObjectsPage {
            objects: page,
            is_truncated,
            next_continuation_token,
        })
    }

    async fn get_object(&self, _bucket: &str, key: &str) -> Result<ByteStream> {
        self.record(format!("get:{}", key));
        let Some(body) = self.body(key) else {
            bail!("对象不存在: {}", key);
        };
        Ok(Box::pin(futures::stream::iter(vec![Ok(body)])))
    }

    async fn put_object(&self, _bucket: &str, key: &str, body: ByteStream) -> Result<()> {
        self.record(format!("put:{}", key));
        {
            let mut failures = self.put_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(timed_out("put"));
                }
            }
        }

        let data = body
            .try_fold(BytesMut::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok::<_, anyhow::Error>(acc)
            })
            .await?;
        self.insert(key, &data);
        Ok(())
    }

    async fn delete_object(&self, _bucket: &str, key: &str) -> Result<()> {
        self.record(format!("delete:{}", key));
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn trash_object(&self, _bucket: &str, key: &str) -> Result<String> {
        self.record(format!("trash:{}", key));
        let target = trash_key(self.trash_prefix(), key, Utc::now());
        let mut objects = self.objects.lock().unwrap();
        let Some(body) = objects.remove(key) else {
            bail!("对象不存在: {}", key);
        };
        objects.insert(target.clone(), body);
        Ok(target)
    }

    fn trash_prefix(&self) -> &str {
        ".sync-trash/"
    }

    fn name(&self) -> &str {
        "fake"
    }
}
