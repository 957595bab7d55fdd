use crate::core::lister::ObjectEntry;
use crate::storage::FileEntry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// 镜像方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    /// 本地为准：上传新增/变更，删除远程多余对象
    #[default]
    MirrorToRemote,
    /// 远程为准：下载新增/变更，删除本地多余文件
    MirrorToLocal,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::MirrorToRemote => f.write_str("mirror-to-remote"),
            Direction::MirrorToLocal => f.write_str("mirror-to-local"),
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mirror-to-remote" | "remote" => Ok(Direction::MirrorToRemote),
            "mirror-to-local" | "local" => Ok(Direction::MirrorToLocal),
            other => Err(format!("未知的同步方向: {}", other)),
        }
    }
}

/// 同步动作，携带相对键
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncAction {
    Upload(String),
    Download(String),
    DeleteLocal(String),
    DeleteRemote(String),
    /// 两边一致，无需处理
    Skip(String),
}

impl SyncAction {
    pub fn key(&self) -> &str {
        match self {
            SyncAction::Upload(k)
            | SyncAction::Download(k)
            | SyncAction::DeleteLocal(k)
            | SyncAction::DeleteRemote(k)
            | SyncAction::Skip(k) => k,
        }
    }

    /// 排序分组：Upload < Download < Skip < DeleteLocal < DeleteRemote
    fn order(&self) -> u8 {
        match self {
            SyncAction::Upload(_) => 0,
            SyncAction::Download(_) => 1,
            SyncAction::Skip(_) => 2,
            SyncAction::DeleteLocal(_) => 3,
            SyncAction::DeleteRemote(_) => 4,
        }
    }

    /// 是否会改动远程
    pub fn touches_remote(&self) -> bool {
        matches!(self, SyncAction::Upload(_) | SyncAction::DeleteRemote(_))
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            SyncAction::Upload(_) => "upload",
            SyncAction::Download(_) => "download",
            SyncAction::DeleteLocal(_) => "delete-local",
            SyncAction::DeleteRemote(_) => "delete-remote",
            SyncAction::Skip(_) => "skip",
        };
        write!(f, "{:<13} {}", verb, self.key())
    }
}

/// 计算本地与远程的差异
///
/// 两边都存在时只比较大小：大小相同即视为一致，修改时间不参与比较。
/// 这是一个近似判断，内容不同但大小相同的文件会被跳过。
/// 远程对象没有大小时视为不同。本地目录条目会被忽略。
///
/// 输出按动作类型分组，组内按键排序，相同输入总是得到相同输出。
pub fn diff(
    local: &HashMap<String, FileEntry>,
    remote: &HashMap<String, ObjectEntry>,
    direction: Direction,
) -> Vec<SyncAction> {
    let mut actions = Vec::with_capacity(local.len() + remote.len());

    for (key, file) in local {
        if file.is_directory {
            continue;
        }
        let action = match (remote.get(key), direction) {
            (None, Direction::MirrorToRemote) => SyncAction::Upload(key.clone()),
            (None, Direction::MirrorToLocal) => SyncAction::DeleteLocal(key.clone()),
            (Some(object), _) if object.size_bytes == Some(file.size_bytes) => {
                SyncAction::Skip(key.clone())
            }
            (Some(_), Direction::MirrorToRemote) => SyncAction::Upload(key.clone()),
            (Some(_), Direction::MirrorToLocal) => SyncAction::Download(key.clone()),
        };
        actions.push(action);
    }

    for key in remote.keys() {
        if local.get(key).is_some_and(|f| !f.is_directory) {
            continue;
        }
        actions.push(match direction {
            Direction::MirrorToRemote => SyncAction::DeleteRemote(key.clone()),
            Direction::MirrorToLocal => SyncAction::Download(key.clone()),
        });
    }

    actions.sort_by(|a, b| a.order().cmp(&b.order()).then_with(|| a.key().cmp(b.key())));
    actions
}

/// 动作统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSummary {
    pub upload_count: usize,
    pub download_count: usize,
    pub delete_local_count: usize,
    pub delete_remote_count: usize,
    pub skip_count: usize,
}

impl ActionSummary {
    pub fn total(&self) -> usize {
        self.upload_count
            + self.download_count
            + self.delete_local_count
            + self.delete_remote_count
            + self.skip_count
    }

    /// 需要实际执行的动作数
    pub fn pending(&self) -> usize {
        self.total() - self.skip_count
    }
}

/// 统计同步动作
pub fn summarize(actions: &[SyncAction]) -> ActionSummary {
    let mut summary = ActionSummary::default();

    for action in actions {
        match action {
            SyncAction::Upload(_) => summary.upload_count += 1,
            SyncAction::Download(_) => summary.download_count += 1,
            SyncAction::DeleteLocal(_) => summary.delete_local_count += 1,
            SyncAction::DeleteRemote(_) => summary.delete_remote_count += 1,
            SyncAction::Skip(_) => summary.skip_count += 1,
        }
    }

    summary
}
