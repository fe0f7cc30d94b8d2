//! Bundle 归档
//!
//! 每个已安装 Bundle 在缓存根目录下有一个归档目录：
//!
//! ```text
//! <cacheRoot>/bundle<id>/
//!   ├── bundle_state.properties   持久化的 id / location / 符号名 / 版本
//!   ├── storage/                  Bundle 私有的可写目录
//!   └── resources/                解压后的 Bundle 内容（当前修订）
//! ```
//!
//! 资源缓存只在来源比现有缓存更新时才重新解压，否则直接复用。

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use semver::Version;
use tracing::{debug, error, info, trace, warn};

use super::manifest::{BundleManifest, ManifestParser, MANIFEST_PATH};
use crate::utils::{BundleSource, FileStore, FrameworkError, Properties, Result};

/// 状态文件名
pub const STATE_FILE: &str = "bundle_state.properties";
/// 私有存储目录名
pub const STORAGE_DIR: &str = "storage";
/// 资源缓存目录名
pub const RESOURCES_DIR: &str = "resources";
/// 归档目录名前缀
pub const ARCHIVE_DIR_PREFIX: &str = "bundle";

/// 状态文件中的 Bundle ID
pub const KEY_ID: &str = "bundle.id";
/// 状态文件中的 location
pub const KEY_LOCATION: &str = "bundle.location";
/// 状态文件中的符号名
pub const KEY_SYMBOLIC_NAME: &str = "bundle.symbolic_name";
/// 状态文件中的版本
pub const KEY_VERSION: &str = "bundle.version";

/// 归档路径集合，由 `(cacheRoot, id)` 一次性计算
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePaths {
    /// 归档根目录
    pub root: PathBuf,
    /// 状态文件
    pub state_file: PathBuf,
    /// 私有存储目录
    pub store_root: PathBuf,
    /// 资源缓存目录
    pub resource_cache_root: PathBuf,
}

impl ArchivePaths {
    /// 计算指定 Bundle 的归档路径
    pub fn new(cache_root: &Path, id: i64) -> Self {
        let root = cache_root.join(Self::dir_name(id));
        Self {
            state_file: root.join(STATE_FILE),
            store_root: root.join(STORAGE_DIR),
            resource_cache_root: root.join(RESOURCES_DIR),
            root,
        }
    }

    /// 归档目录名
    pub fn dir_name(id: i64) -> String {
        format!("{}{}", ARCHIVE_DIR_PREFIX, id)
    }

    /// 从目录名解析 Bundle ID
    pub fn parse_dir_name(name: &str) -> Option<i64> {
        name.strip_prefix(ARCHIVE_DIR_PREFIX)?
            .parse::<i64>()
            .ok()
            .filter(|id| *id >= 0)
    }
}

/// 创建失败时的回滚范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rollback {
    /// 删除整个归档目录（新安装）
    Root,
    /// 只删除资源缓存（刷新已有 Bundle，保留身份与私有存储）
    Resources,
}

/// Bundle 归档
#[derive(Debug)]
pub struct BundleArchive {
    id: i64,
    location: String,
    paths: ArchivePaths,
    manifest: BundleManifest,
    extracted_at: Option<SystemTime>,
    valid: AtomicBool,
    cache_valid: AtomicBool,
    store: Arc<dyn FileStore>,
}

impl BundleArchive {
    /// 创建或复用归档
    ///
    /// 任一步骤失败都会按 `rollback` 删除已创建的内容，不会留下有效的半成品。
    pub(crate) fn create(
        store: Arc<dyn FileStore>,
        paths: ArchivePaths,
        id: i64,
        location: &str,
        source: &BundleSource,
        rollback: Rollback,
    ) -> Result<Self> {
        match Self::populate(store.as_ref(), &paths, id, location, source) {
            Ok((manifest, extracted_at)) => Ok(Self {
                id,
                location: location.to_string(),
                paths,
                manifest,
                extracted_at,
                valid: AtomicBool::new(true),
                cache_valid: AtomicBool::new(true),
                store,
            }),
            Err(e) => {
                let target = match rollback {
                    Rollback::Root => &paths.root,
                    Rollback::Resources => &paths.resource_cache_root,
                };
                warn!(
                    bundle_id = id,
                    location,
                    path = %target.display(),
                    error = %e,
                    "创建归档失败，回滚"
                );
                if let Err(cleanup) = store.remove_dir_all(target) {
                    error!(bundle_id = id, error = %cleanup, "回滚归档目录失败");
                }
                Err(e)
            }
        }
    }

    /// 框架自身的伪 Bundle（ID 0）：不解压、不删除
    pub(crate) fn system(store: Arc<dyn FileStore>, paths: ArchivePaths) -> Result<Self> {
        store.create_dir_all(&paths.store_root)?;
        let location = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| ".".to_string());
        Ok(Self {
            id: 0,
            location,
            paths,
            manifest: BundleManifest::system(),
            extracted_at: None,
            valid: AtomicBool::new(true),
            cache_valid: AtomicBool::new(true),
            store,
        })
    }

    fn populate(
        store: &dyn FileStore,
        paths: &ArchivePaths,
        id: i64,
        location: &str,
        source: &BundleSource,
    ) -> Result<(BundleManifest, Option<SystemTime>)> {
        // 1. 归档根目录与私有存储（可能已由上次运行创建）
        store.create_dir_all(&paths.root)?;
        store.create_dir_all(&paths.store_root)?;

        // 2. 必要时重新解压
        Self::refresh_resources(store, paths, id, source)?;

        // 3. 解析清单
        let manifest_path = paths.resource_cache_root.join(MANIFEST_PATH);
        let content = store.read_to_string(&manifest_path)?.ok_or_else(|| {
            FrameworkError::InvalidManifest(format!("缺少清单文件 {}", MANIFEST_PATH))
        })?;
        let manifest = ManifestParser::parse_string(&content)?;

        // 4. 持久化状态
        Self::persist_state(store, paths, id, location, &manifest)?;

        let extracted_at = store.last_modified(&paths.resource_cache_root)?;
        Ok((manifest, extracted_at))
    }

    /// 资源缓存缺失或早于来源时重新解压，返回是否执行了解压
    fn refresh_resources(
        store: &dyn FileStore,
        paths: &ArchivePaths,
        id: i64,
        source: &BundleSource,
    ) -> Result<bool> {
        let cached = store.last_modified(&paths.resource_cache_root)?;
        let stale = match (cached, source.last_modified()) {
            (None, _) => true,
            (Some(_), None) => true,
            (Some(cached), Some(modified)) => cached < modified,
        };

        if !stale {
            debug!(bundle_id = id, source = %source.describe(), "复用已有资源缓存");
            return Ok(false);
        }

        // 旧缓存可能是悬空符号链接，删除由存储层处理
        store.remove_dir_all(&paths.resource_cache_root)?;
        store.extract(source, &paths.resource_cache_root)?;
        store.touch(&paths.resource_cache_root)?;
        info!(bundle_id = id, source = %source.describe(), "资源缓存已重新解压");
        Ok(true)
    }

    /// 仅在字段变化时重写状态文件
    fn persist_state(
        store: &dyn FileStore,
        paths: &ArchivePaths,
        id: i64,
        location: &str,
        manifest: &BundleManifest,
    ) -> Result<bool> {
        let desired = Properties::new()
            .with(KEY_ID, id.to_string())
            .with(KEY_LOCATION, location)
            .with(KEY_SYMBOLIC_NAME, manifest.symbolic_name.as_str())
            .with(KEY_VERSION, manifest.version.to_string());

        let current = Self::read_state(store, paths)?;
        if current.as_ref() == Some(&desired) {
            trace!(bundle_id = id, "状态文件未变化");
            return Ok(false);
        }

        store.write_atomic(&paths.state_file, desired.to_properties_string().as_bytes())?;
        debug!(bundle_id = id, path = %paths.state_file.display(), "状态文件已写入");
        Ok(true)
    }

    /// 读取持久化状态，文件不存在时返回 `None`
    pub(crate) fn read_state(store: &dyn FileStore, paths: &ArchivePaths) -> Result<Option<Properties>> {
        Ok(store
            .read_to_string(&paths.state_file)?
            .map(|content| Properties::parse(&content)))
    }

    // ==================== 访问器 ====================

    /// Bundle ID
    pub fn id(&self) -> i64 {
        self.id
    }

    /// 安装来源
    pub fn location(&self) -> &str {
        &self.location
    }

    /// 归档路径
    pub fn paths(&self) -> &ArchivePaths {
        &self.paths
    }

    /// 清单
    pub fn manifest(&self) -> &BundleManifest {
        &self.manifest
    }

    /// 符号名
    pub fn symbolic_name(&self) -> &str {
        &self.manifest.symbolic_name
    }

    /// 版本
    pub fn version(&self) -> &Version {
        &self.manifest.version
    }

    /// 资源缓存的修改时间（即最近一次解压的时间）
    pub fn extracted_at(&self) -> Option<SystemTime> {
        self.extracted_at
    }

    /// 是否为框架自身的伪 Bundle
    pub fn is_system(&self) -> bool {
        self.id == 0
    }

    /// 归档是否有效
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// 资源缓存是否有效
    pub fn is_cache_valid(&self) -> bool {
        self.cache_valid.load(Ordering::Acquire)
    }

    /// 标记整个归档失效（可重复调用）
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
        self.cache_valid.store(false, Ordering::Release);
    }

    /// 标记资源缓存失效（可重复调用）
    pub fn invalidate_cache(&self) {
        self.cache_valid.store(false, Ordering::Release);
    }

    /// 删除失效的目录
    ///
    /// 归档失效时删除整个归档目录，否则仅资源缓存失效时只删除资源缓存。
    /// 伪 Bundle 从不删除。
    pub fn remove_invalid_dirs(&self) -> Result<()> {
        if self.is_system() {
            return Ok(());
        }
        if !self.is_valid() {
            debug!(bundle_id = self.id, path = %self.paths.root.display(), "删除失效归档");
            self.store.remove_dir_all(&self.paths.root)
        } else if !self.is_cache_valid() {
            debug!(
                bundle_id = self.id,
                path = %self.paths.resource_cache_root.display(),
                "删除失效资源缓存"
            );
            self.store.remove_dir_all(&self.paths.resource_cache_root)
        } else {
            Ok(())
        }
    }

    /// 解析资源缓存中的条目，不存在或越界时返回 `None`
    pub fn entry(&self, path: &str) -> Option<PathBuf> {
        let relative = safe_relative(path)?;
        let full = self.paths.resource_cache_root.join(relative);
        self.store.exists(&full).then_some(full)
    }

    /// 私有存储中的路径（不要求文件存在）
    ///
    /// # Errors
    ///
    /// 路径为绝对路径或包含 `..` 时返回 `IllegalArgument`
    pub fn data_file(&self, path: &str) -> Result<PathBuf> {
        let relative = safe_relative(path).ok_or_else(|| {
            FrameworkError::IllegalArgument(format!("无效的私有存储路径: '{}'", path))
        })?;
        Ok(self.paths.store_root.join(relative))
    }
}

/// 只接受不越出根目录的相对路径
fn safe_relative(path: &str) -> Option<PathBuf> {
    let candidate = Path::new(path.trim_start_matches('/'));
    let mut out = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::LocalFileStore;
    use std::fs;
    use tempfile::TempDir;

    fn source_dir(temp: &TempDir, symbolic_name: &str) -> PathBuf {
        let dir = temp.path().join(format!("src-{}", symbolic_name));
        fs::create_dir_all(dir.join("META-INF")).unwrap();
        fs::write(
            dir.join("META-INF/MANIFEST.MF"),
            format!("Bundle-SymbolicName: {}\nBundle-Version: 1.0\n", symbolic_name),
        )
        .unwrap();
        fs::write(dir.join("payload.txt"), "data").unwrap();
        dir
    }

    #[test]
    fn test_archive_paths_layout() {
        let paths = ArchivePaths::new(Path::new("/cache"), 7);
        assert_eq!(paths.root, PathBuf::from("/cache/bundle7"));
        assert_eq!(paths.state_file, PathBuf::from("/cache/bundle7/bundle_state.properties"));
        assert_eq!(paths.store_root, PathBuf::from("/cache/bundle7/storage"));
        assert_eq!(paths.resource_cache_root, PathBuf::from("/cache/bundle7/resources"));
        assert_eq!(ArchivePaths::parse_dir_name("bundle12"), Some(12));
        assert_eq!(ArchivePaths::parse_dir_name("bundlex"), None);
        assert_eq!(ArchivePaths::parse_dir_name("other3"), None);
    }

    #[test]
    fn test_create_persists_state() {
        let temp = TempDir::new().unwrap();
        let src = source_dir(&temp, "org.chips.a");
        let paths = ArchivePaths::new(&temp.path().join("cache"), 1);
        let location = src.display().to_string();

        let archive = BundleArchive::create(
            Arc::new(LocalFileStore::new()),
            paths.clone(),
            1,
            &location,
            &BundleSource::Directory(src),
            Rollback::Root,
        )
        .unwrap();

        assert!(archive.is_valid() && archive.is_cache_valid());
        assert_eq!(archive.symbolic_name(), "org.chips.a");
        assert_eq!(archive.version(), &Version::new(1, 0, 0));
        assert!(paths.store_root.is_dir());
        assert!(archive.entry("payload.txt").is_some());
        assert!(archive.entry("../bundle_state.properties").is_none());

        let state = Properties::parse(&fs::read_to_string(&paths.state_file).unwrap());
        assert_eq!(state.get(KEY_ID), Some("1"));
        assert_eq!(state.get(KEY_LOCATION), Some(location.as_str()));
        assert_eq!(state.get(KEY_VERSION), Some("1.0.0"));
    }

    #[test]
    fn test_invalid_manifest_rolls_back_root() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("broken");
        fs::create_dir_all(&src).unwrap();
        let paths = ArchivePaths::new(&temp.path().join("cache"), 2);

        let err = BundleArchive::create(
            Arc::new(LocalFileStore::new()),
            paths.clone(),
            2,
            "broken",
            &BundleSource::Directory(src),
            Rollback::Root,
        )
        .unwrap_err();
        assert!(matches!(err, FrameworkError::InvalidManifest(_)));
        assert!(!paths.root.exists());
    }

    #[test]
    fn test_remove_invalid_dirs_two_phase() {
        let temp = TempDir::new().unwrap();
        let src = source_dir(&temp, "org.chips.b");
        let paths = ArchivePaths::new(&temp.path().join("cache"), 3);
        let archive = BundleArchive::create(
            Arc::new(LocalFileStore::new()),
            paths.clone(),
            3,
            "b",
            &BundleSource::Directory(src),
            Rollback::Root,
        )
        .unwrap();

        archive.invalidate_cache();
        archive.invalidate_cache();
        archive.remove_invalid_dirs().unwrap();
        assert!(!paths.resource_cache_root.exists());
        assert!(paths.state_file.exists());
        assert!(paths.store_root.exists());

        archive.invalidate();
        archive.remove_invalid_dirs().unwrap();
        archive.remove_invalid_dirs().unwrap();
        assert!(!paths.root.exists());
    }

    #[test]
    fn test_data_file_rejects_escape() {
        let temp = TempDir::new().unwrap();
        let paths = ArchivePaths::new(temp.path(), 0);
        let archive = BundleArchive::system(Arc::new(LocalFileStore::new()), paths.clone()).unwrap();

        assert_eq!(
            archive.data_file("conf/app.yaml").unwrap(),
            paths.store_root.join("conf/app.yaml")
        );
        assert!(archive.data_file("../escape").is_err());

        archive.invalidate();
        archive.remove_invalid_dirs().unwrap();
        assert!(paths.store_root.exists());
    }
}
