use super::ByteStream;
use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use walkdir::WalkDir;

/// 本地读取的分块大小
const LOCAL_READ_CHUNK: usize = 256 * 1024;
/// 下载中的临时文件后缀
pub const PARTIAL_SUFFIX: &str = ".partial";

/// 本地文件元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// 相对于同步根目录的路径，分隔符统一为 `/`
    pub relative_path: String,
    pub is_directory: bool,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
}

/// 规范化路径分隔符（统一使用 /）
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// 列出目录的直接子项（不递归），`base` 用于计算相对路径
///
/// 子项按文件名排序，符号链接不跟随，作为叶子节点返回。
pub fn list_directory(base: &Path, dir: &Path) -> io::Result<Vec<FileEntry>> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(io::Error::from)?;
        let metadata = entry.metadata().map_err(io::Error::from)?;

        let relative = entry
            .path()
            .strip_prefix(base)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let modified_at = metadata
            .modified()
            .ok()
            .map(DateTime::<Utc>::from)
            .unwrap_or_default();

        let is_directory = entry.file_type().is_dir();

        entries.push(FileEntry {
            relative_path: normalize_path(&relative.to_string_lossy()),
            is_directory,
            size_bytes: if is_directory { 0 } else { metadata.len() },
            modified_at,
        });
    }

    Ok(entries)
}

/// 将同步键解析为根目录下的本地路径，拒绝越出根目录的键
pub fn resolve_key(root: &Path, key: &str) -> Result<PathBuf> {
    let mut path = root.to_path_buf();
    for segment in key.split('/').filter(|s| !s.is_empty()) {
        let mut components = Path::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) => path.push(part),
            _ => anyhow::bail!("非法的同步键: {}", key),
        }
    }
    if path == root {
        anyhow::bail!("同步键为空");
    }
    Ok(path)
}

/// 以分块流的形式读取本地文件
///
/// 符号链接不跟随，读出的是链接目标的路径文本，长度与 `symlink_metadata` 的大小一致，
/// 这样扫描得到的大小和上传后的对象大小能对上。
pub async fn read_stream(path: &Path) -> Result<ByteStream> {
    let metadata = fs::symlink_metadata(path)
        .await
        .with_context(|| format!("打开文件失败: {}", path.display()))?;
    if metadata.file_type().is_symlink() {
        let target = fs::read_link(path)
            .await
            .with_context(|| format!("读取符号链接失败: {}", path.display()))?;
        let body = Bytes::from(link_text(&target));
        return Ok(futures::stream::iter(vec![Ok::<_, anyhow::Error>(body)]).boxed());
    }

    let file = fs::File::open(path)
        .await
        .with_context(|| format!("打开文件失败: {}", path.display()))?;
    let stream = ReaderStream::with_capacity(file, LOCAL_READ_CHUNK).map_err(anyhow::Error::from);
    Ok(stream.boxed())
}

#[cfg(unix)]
fn link_text(target: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    target.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn link_text(target: &Path) -> Vec<u8> {
    target.to_string_lossy().into_owned().into_bytes()
}

/// 将字节流写入本地文件：先写 `.partial` 临时文件，完成后原子重命名
pub async fn write_stream(path: &Path, mut body: ByteStream) -> Result<u64> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("创建目录失败: {}", parent.display()))?;
    }

    let mut partial = path.as_os_str().to_owned();
    partial.push(PARTIAL_SUFFIX);
    let partial = PathBuf::from(partial);

    // 失败时清理临时文件
    let guard = scopeguard::guard(partial.clone(), |p| {
        let _ = std::fs::remove_file(p);
    });

    let mut file = fs::File::create(&partial)
        .await
        .with_context(|| format!("创建文件失败: {}", partial.display()))?;

    let mut written = 0u64;
    while let Some(chunk) = body.try_next().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    fs::rename(&partial, path)
        .await
        .with_context(|| format!("重命名失败: {}", path.display()))?;
    scopeguard::ScopeGuard::into_inner(guard);

    Ok(written)
}

/// 本地回收站：删除操作一律移入回收站，不做永久删除
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrashBin {
    /// 系统回收站
    #[default]
    System,
    /// 移动到指定目录（保留相对路径，按时间戳分组）
    Directory(PathBuf),
}

impl TrashBin {
    /// 将文件移入回收站
    pub async fn discard(&self, path: &Path, relative: &str) -> Result<()> {
        match self {
            TrashBin::System => {
                let target = path.to_path_buf();
                tokio::task::spawn_blocking(move || trash::delete(&target))
                    .await?
                    .with_context(|| format!("移入回收站失败: {}", path.display()))?;
            }
            TrashBin::Directory(dir) => {
                let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
                let target = resolve_key(&dir.join(stamp), relative)?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).await?;
                }
                if fs::rename(path, &target).await.is_err() {
                    // 跨设备时退化为复制后删除
                    fs::copy(path, &target)
                        .await
                        .with_context(|| format!("移入回收目录失败: {}", path.display()))?;
                    fs::remove_file(path).await?;
                }
                tracing::debug!("已移入回收目录: {} -> {}", path.display(), target.display());
            }
        }
        Ok(())
    }
}
