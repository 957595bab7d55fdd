//! 内容寻址命名
//!
//! 文件名由内容的 BLAKE3 摘要决定，使用小写 Crockford base32 编码：
//! 不含 `/`、`\`、`:`，也不区分大小写，可以安全地用作文件名或对象键。

use crate::storage::local::{read_stream, write_stream};
use crate::storage::TrashBin;
use anyhow::{Context, Result};
use base32::Alphabet;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 哈希读取的分块大小
const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// 编码后的名称长度（256 位 / 5 向上取整）
pub const NAME_LEN: usize = 52;

/// 默认处理的扩展名
pub const DEFAULT_EXTENSIONS: &[&str] = &["mp4", "webm", "m4v", "avi", "mkv", "mov"];

/// 计算字节流的内容名称
pub async fn name_for<R: AsyncRead + Unpin>(mut reader: R) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    let digest: [u8; 32] = hasher.finalize().into();
    Ok(base32::encode(Alphabet::Crockford, &digest).to_lowercase())
}

/// 计算文件的内容名称
pub async fn name_for_path(path: &Path) -> Result<String> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("打开文件失败: {}", path.display()))?;
    name_for(file)
        .await
        .with_context(|| format!("计算哈希失败: {}", path.display()))
}

/// 哈希复制结果
#[derive(Debug, Default)]
pub struct HashCopyReport {
    /// (源文件, 目标文件)
    pub copied: Vec<(PathBuf, PathBuf)>,
    /// 目标已存在的源文件
    pub already_present: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

/// 按内容哈希重命名复制文件
pub struct HashCopier {
    extensions: Vec<String>,
    move_after_copy: bool,
    trash: TrashBin,
}

impl HashCopier {
    pub fn new<S: AsRef<str>>(extensions: &[S]) -> Self {
        Self {
            extensions: extensions
                .iter()
                .map(|e| e.as_ref().trim().trim_start_matches('.').to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
            move_after_copy: false,
            trash: TrashBin::default(),
        }
    }

    /// 移动模式：复制成功后将源文件移入回收站
    pub fn with_move(mut self, trash: TrashBin) -> Self {
        self.move_after_copy = true;
        self.trash = trash;
        self
    }

    fn extension_of(&self, path: &Path) -> Option<String> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        self.extensions.contains(&ext).then_some(ext)
    }

    /// 递归遍历 `source`，将匹配的文件复制为 `<target>/<名称>.<扩展名>`
    ///
    /// 单个文件失败不会中断整批处理。
    pub async fn copy(&self, source: &Path, target: &Path) -> Result<HashCopyReport> {
        if !source.is_dir() {
            anyhow::bail!("源目录不存在: {}", source.display());
        }
        tokio::fs::create_dir_all(target)
            .await
            .with_context(|| format!("创建目标目录失败: {}", target.display()))?;
        if tokio::fs::canonicalize(source).await? == tokio::fs::canonicalize(target).await? {
            anyhow::bail!("源目录和目标目录不能相同");
        }

        let root = source.to_path_buf();
        let files: Vec<PathBuf> = tokio::task::spawn_blocking(move || {
            WalkDir::new(&root)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| match e {
                    Ok(entry) => Some(entry),
                    Err(err) => {
                        warn!("跳过无法访问的路径: {}", err);
                        None
                    }
                })
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .collect::<Vec<_>>()
        })
        .await?;

        info!("找到 {} 个文件，开始哈希复制", files.len());

        let mut report = HashCopyReport::default();
        for file in files {
            let Some(ext) = self.extension_of(&file) else {
                continue;
            };
            match self.copy_one(&file, target, &ext).await {
                Ok(Some(dest)) => report.copied.push((file, dest)),
                Ok(None) => report.already_present.push(file),
                Err(e) => {
                    warn!("处理失败 {}: {:#}", file.display(), e);
                    report.failed.push((file, format!("{:#}", e)));
                }
            }
        }

        info!(
            "哈希复制完成: 复制 {}, 已存在 {}, 失败 {}",
            report.copied.len(),
            report.already_present.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// 处理单个文件，目标已存在时返回 `None`
    async fn copy_one(&self, file: &Path, target: &Path, ext: &str) -> Result<Option<PathBuf>> {
        let name = name_for_path(file).await?;
        let dest = target.join(format!("{}.{}", name, ext));

        if tokio::fs::try_exists(&dest).await? {
            debug!("目标已存在: {}", dest.display());
            return Ok(None);
        }

        write_stream(&dest, read_stream(file).await?)
            .await
            .with_context(|| format!("复制文件到 {} 失败", dest.display()))?;
        debug!("复制完成: {} -> {}", file.display(), dest.display());

        if self.move_after_copy {
            let relative = file
                .file_name()
                .and_then(|n| n.to_str())
                .context("无效的文件名")?;
            self.trash.discard(file, relative).await?;
        }

        Ok(Some(dest))
    }
}
