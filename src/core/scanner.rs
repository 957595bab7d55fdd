use crate::error::SyncError;
use crate::storage::local::{list_directory, normalize_path};
use crate::storage::FileEntry;
use regex::Regex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 本地扫描配置
#[derive(Debug, Clone, Default)]
pub struct ScanConfig {
    /// 排除规则（glob patterns，支持 `*`、`**`、`?`）
    pub exclude_patterns: Vec<String>,
}

/// 本地目录树扫描器
///
/// 递归建立在非递归的 [`list_directory`] 之上：子项按文件名排序、深度优先遍历，
/// 因此遍历顺序是确定的。
pub struct LocalScanner {
    excludes: Vec<Regex>,
    cancel_flag: Option<Arc<AtomicBool>>,
}

impl LocalScanner {
    pub fn new() -> Self {
        Self {
            excludes: Vec::new(),
            cancel_flag: None,
        }
    }

    pub fn with_config(config: &ScanConfig) -> Result<Self, SyncError> {
        let excludes = config
            .exclude_patterns
            .iter()
            .map(|p| glob_to_regex(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SyncError::Store(anyhow::anyhow!("无效的排除规则: {}", e)))?;
        Ok(Self {
            excludes,
            cancel_flag: None,
        })
    }

    /// 设置取消标志（每个目录检查一次）
    pub fn with_cancel(mut self, cancel_flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = Some(cancel_flag);
        self
    }

    /// 扫描 `root` 下的全部文件，返回 `相对路径 -> FileEntry`
    ///
    /// 目录只遍历不输出；符号链接不跟随，按叶子节点输出。
    /// 两个节点规范化后键相同时，后访问的覆盖先访问的。
    pub async fn scan(&self, root: &Path) -> Result<HashMap<String, FileEntry>, SyncError> {
        let root = root.to_path_buf();
        let excludes = self.excludes.clone();
        let cancel_flag = self.cancel_flag.clone();

        info!("开始扫描本地目录: {}", root.display());

        let tree = tokio::task::spawn_blocking(move || {
            scan_blocking(&root, &excludes, cancel_flag.as_deref())
        })
        .await
        .map_err(|e| SyncError::Store(e.into()))??;

        info!("本地扫描完成: {} 个文件", tree.len());
        Ok(tree)
    }
}

impl Default for LocalScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn scan_blocking(
    root: &Path,
    excludes: &[Regex],
    cancel_flag: Option<&AtomicBool>,
) -> Result<HashMap<String, FileEntry>, SyncError> {
    match std::fs::metadata(root) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(SyncError::Store(anyhow::anyhow!(
                "不是目录: {}",
                root.display()
            )))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(SyncError::NotFound {
                path: root.to_path_buf(),
            })
        }
        Err(e) => return Err(root_error(root, e)),
    }

    let mut stack: Vec<FileEntry> = list_directory(root, root)
        .map_err(|e| root_error(root, e))?
        .into_iter()
        .rev()
        .collect();

    let mut tree = HashMap::new();
    let mut excluded = 0usize;

    while let Some(entry) = stack.pop() {
        if is_excluded(excludes, &entry) {
            debug!("排除: {}", entry.relative_path);
            excluded += 1;
            continue;
        }

        if !entry.is_directory {
            tree.insert(entry.relative_path.clone(), entry);
            continue;
        }

        if cancel_flag.is_some_and(|f| f.load(Ordering::Relaxed)) {
            return Err(SyncError::Cancelled);
        }

        let dir: PathBuf = root.join(&entry.relative_path);
        match list_directory(root, &dir) {
            Ok(children) => stack.extend(children.into_iter().rev()),
            Err(e) => warn!("跳过不可读目录 {}: {}", dir.display(), e),
        }
    }

    if excluded > 0 {
        debug!("{} 个条目被排除规则跳过", excluded);
    }
    Ok(tree)
}

fn root_error(root: &Path, e: io::Error) -> SyncError {
    if e.kind() == io::ErrorKind::PermissionDenied {
        SyncError::Permission {
            path: root.to_path_buf(),
            source: e,
        }
    } else {
        SyncError::Store(anyhow::Error::new(e).context(format!("读取目录失败: {}", root.display())))
    }
}

fn is_excluded(excludes: &[Regex], entry: &FileEntry) -> bool {
    if excludes.is_empty() {
        return false;
    }
    let path = entry.relative_path.as_str();
    let dir_form = entry.is_directory.then(|| format!("{}/", path));
    excludes.iter().any(|re| {
        re.is_match(path) || dir_form.as_deref().is_some_and(|d| re.is_match(d))
    })
}

/// 将 glob 模式转换为正则
///
/// 不含 `/` 的模式匹配任意层级的文件名（`*.tmp` 同时匹配 `a/b.tmp`）。
fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let pattern = normalize_path(pattern);
    let mut re = String::from("(?i)");
    re.push_str(if pattern.contains('/') { "^" } else { "(^|/)" });

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                re.push_str(".*");
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn test_scan_emits_files_only_with_slash_keys() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a").join("b")).unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();
        fs::write(dir.path().join("top.txt"), b"1").unwrap();
        fs::write(dir.path().join("a").join("b").join("deep.txt"), b"22").unwrap();

        let tree = LocalScanner::new().scan(dir.path()).await.unwrap();

        let mut keys: Vec<_> = tree.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["a/b/deep.txt", "top.txt"]);
        assert!(tree.values().all(|e| !e.is_directory));
        assert_eq!(tree["a/b/deep.txt"].size_bytes, 2);
    }

    #[tokio::test]
    async fn test_missing_root_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = LocalScanner::new()
            .scan(&dir.path().join("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_duplicate_key_later_visit_wins() {
        // "sub\x.txt" 在 Unix 上是合法文件名，规范化后与 "sub/x.txt" 同键
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("x.txt"), b"nested").unwrap();
        fs::write(dir.path().join("sub\\x.txt"), b"flat").unwrap();

        let tree = LocalScanner::new().scan(dir.path()).await.unwrap();

        // 深度优先：先进入 "sub" 目录，随后访问 "sub\x.txt" 并覆盖
        assert_eq!(tree.len(), 1);
        assert_eq!(tree["sub/x.txt"].size_bytes, 4);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_is_leaf() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("real")).unwrap();
        fs::write(dir.path().join("real").join("f.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("link")).unwrap();

        let tree = LocalScanner::new().scan(dir.path()).await.unwrap();

        assert!(tree.contains_key("link"));
        assert!(!tree.contains_key("link/f.txt"));
        assert!(tree.contains_key("real/f.txt"));
    }

    #[cfg(unix)]
    fn set_mode(path: &Path, mode: u32) {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_subdirectory_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let locked = dir.path().join("b_locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("hidden.txt"), b"h").unwrap();
        fs::create_dir(dir.path().join("c")).unwrap();
        fs::write(dir.path().join("c").join("after.txt"), b"c").unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();

        set_mode(&locked, 0o000);
        if fs::read_dir(&locked).is_ok() {
            // root 用户不受权限位限制
            set_mode(&locked, 0o755);
            return;
        }

        let result = LocalScanner::new().scan(dir.path()).await;
        set_mode(&locked, 0o755);

        let tree = result.unwrap();
        let mut keys: Vec<_> = tree.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["a.txt", "c/after.txt"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_root_is_permission_error() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("a.txt"), b"a").unwrap();

        set_mode(&root, 0o000);
        if fs::read_dir(&root).is_ok() {
            set_mode(&root, 0o755);
            return;
        }

        let result = LocalScanner::new().scan(&root).await;
        set_mode(&root, 0o755);

        match result {
            Err(SyncError::Permission { path, .. }) => assert_eq!(path, root),
            other => panic!("期望权限错误, 实际: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exclude_patterns() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".git").join("objects")).unwrap();
        fs::write(dir.path().join(".git").join("objects").join("x"), b"x").unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src").join("main.rs"), b"fn").unwrap();
        fs::write(dir.path().join("src").join("notes.TMP"), b"t").unwrap();

        let config = ScanConfig {
            exclude_patterns: vec![".git/**".to_string(), "*.tmp".to_string()],
        };
        let tree = LocalScanner::with_config(&config)
            .unwrap()
            .scan(dir.path())
            .await
            .unwrap();

        let keys: Vec<_> = tree.keys().cloned().collect();
        assert_eq!(keys, vec!["src/main.rs"]);
    }

    #[tokio::test]
    async fn test_cancelled_scan() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("f"), b"x").unwrap();

        let cancel = Arc::new(AtomicBool::new(true));
        let err = LocalScanner::new()
            .with_cancel(cancel)
            .scan(dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
    }

    #[test]
    fn test_glob_to_regex() {
        let re = glob_to_regex("*.tmp").unwrap();
        assert!(re.is_match("a.tmp"));
        assert!(re.is_match("dir/a.TMP"));
        assert!(!re.is_match("a.tmp.bak"));

        let re = glob_to_regex("build/*").unwrap();
        assert!(re.is_match("build/out"));
        assert!(!re.is_match("build/sub/out"));
        assert!(!re.is_match("x/build/out"));
    }
}
