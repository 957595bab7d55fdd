pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod logging;
pub mod storage;

pub use config::AppConfig;
pub use crate::core::{Direction, SyncAction, SyncEngine, SyncReport};
pub use db::{InstanceStore, JsonDocumentStore, PlanStore, StoreInstance, SyncPlan};
pub use error::SyncError;

use std::path::PathBuf;

/// 应用上下文：数据目录、配置和持久化存储，由命令行入口创建后注入各处
pub struct AppContext {
    pub data_dir: PathBuf,
    pub config: AppConfig,
    pub plans: PlanStore,
    pub instances: InstanceStore,
}

impl AppContext {
    /// 用已加载的配置打开数据目录中的计划和实例记录
    ///
    /// 记录校验失败时只发出警告，调用方应先安装日志订阅器再调用。
    pub fn open(data_dir: PathBuf, config: AppConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&data_dir)?;

        let documents = JsonDocumentStore::new(&data_dir);
        Ok(Self {
            config,
            plans: PlanStore::load(documents.clone()),
            instances: InstanceStore::load(documents),
            data_dir,
        })
    }

    /// 根据当前配置和实例记录创建同步引擎
    pub fn engine(&self) -> SyncEngine {
        SyncEngine::new(&self.config, self.instances.list().to_vec())
    }
}

// 为了不引入 dirs 依赖，按平台约定手工解析
pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }
    }
}
