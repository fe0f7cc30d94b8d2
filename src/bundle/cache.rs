//! Bundle 缓存
//!
//! 管理一个框架实例的归档目录树：创建、刷新、删除与枚举归档，
//! 并通过扫描持久化状态文件保证同一 location 在重启后获得相同的 Bundle ID。

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use semver::Version;
use tracing::{debug, info, warn};

use super::archive::{
    ArchivePaths, BundleArchive, Rollback, KEY_ID, KEY_LOCATION, KEY_SYMBOLIC_NAME, KEY_VERSION,
};
use crate::core::CacheConfig;
use crate::utils::{
    BundleSource, FileStore, FrameworkError, LocalFileStore, Result, EMBEDDED_SCHEME,
};

/// 本地文件 location 允许带的前缀
const FILE_SCHEME: &str = "file://";

/// 从状态文件恢复出的归档记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedArchive {
    /// Bundle ID
    pub id: i64,
    /// 安装来源
    pub location: String,
    /// 符号名
    pub symbolic_name: String,
    /// 版本
    pub version: Option<Version>,
}

/// Bundle 缓存
#[derive(Debug)]
pub struct BundleCache {
    root: PathBuf,
    store: Arc<dyn FileStore>,
    embedded: RwLock<HashMap<String, &'static [u8]>>,
    /// 结构性操作（创建、删除、枚举归档）互斥
    structure: Mutex<()>,
    next_id: AtomicI64,
}

impl BundleCache {
    /// 按配置打开本地文件系统上的缓存
    pub fn open(config: &CacheConfig) -> Result<Self> {
        Self::new(&config.dir, Arc::new(LocalFileStore::new()), config.clean_on_create)
    }

    /// 打开缓存
    ///
    /// `clean` 为 `true` 时先删除整个缓存目录。缺少状态文件的归档目录
    /// 是上次运行中途失败留下的，会被直接清理。
    pub fn new(root: impl Into<PathBuf>, store: Arc<dyn FileStore>, clean: bool) -> Result<Self> {
        let root = root.into();
        if clean {
            info!(root = %root.display(), "清空 Bundle 缓存");
            store.remove_dir_all(&root)?;
        }
        store.create_dir_all(&root)?;

        let cache = Self {
            root,
            store,
            embedded: RwLock::new(HashMap::new()),
            structure: Mutex::new(()),
            next_id: AtomicI64::new(1),
        };

        let max_id = cache.purge_incomplete()?;
        cache.next_id.store(max_id + 1, Ordering::SeqCst);
        debug!(root = %cache.root.display(), next_id = max_id + 1, "Bundle 缓存已打开");
        Ok(cache)
    }

    /// 删除不完整的归档目录，返回剩余归档中的最大 ID
    fn purge_incomplete(&self) -> Result<i64> {
        let mut max_id = 0;
        for (id, dir) in self.archive_dirs()? {
            if id == 0 {
                continue;
            }
            let paths = ArchivePaths::new(&self.root, id);
            if self.store.exists(&paths.state_file) {
                max_id = max_id.max(id);
            } else {
                warn!(bundle_id = id, path = %dir.display(), "删除缺少状态文件的归档目录");
                self.store.remove_dir_all(&dir)?;
            }
        }
        Ok(max_id)
    }

    fn archive_dirs(&self) -> Result<Vec<(i64, PathBuf)>> {
        let mut dirs: Vec<(i64, PathBuf)> = self
            .store
            .list_dirs(&self.root)?
            .into_iter()
            .filter_map(|dir| {
                let id = dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(ArchivePaths::parse_dir_name)?;
                Some((id, dir))
            })
            .collect();
        dirs.sort_by_key(|(id, _)| *id);
        Ok(dirs)
    }

    /// 缓存根目录
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 文件存储
    pub fn store(&self) -> &Arc<dyn FileStore> {
        &self.store
    }

    /// 注册内嵌 Bundle，之后 `embedded://<name>` 可作为 location 安装
    pub fn register_embedded(&self, name: impl Into<String>, bytes: &'static [u8]) {
        let name = name.into();
        debug!(name = %name, size = bytes.len(), "注册内嵌 Bundle");
        self.embedded.write().insert(name, bytes);
    }

    /// 将 location 解析为 Bundle 包来源
    ///
    /// # Errors
    ///
    /// - location 为空或内嵌名称未注册时返回 `IllegalArgument`
    /// - 本地路径不存在时返回 `FileIo`
    pub fn resolve_source(&self, location: &str) -> Result<BundleSource> {
        let location = location.trim();
        if location.is_empty() {
            return Err(FrameworkError::IllegalArgument("location 不能为空".into()));
        }

        if let Some(name) = location.strip_prefix(EMBEDDED_SCHEME) {
            let bytes = self.embedded.read().get(name).copied().ok_or_else(|| {
                FrameworkError::IllegalArgument(format!("未注册的内嵌 Bundle: {}", name))
            })?;
            return Ok(BundleSource::Embedded {
                name: name.to_string(),
                bytes,
            });
        }

        let path = PathBuf::from(location.strip_prefix(FILE_SCHEME).unwrap_or(location));
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => Ok(BundleSource::Directory(path)),
            Ok(_) => Ok(BundleSource::Archive(path)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(FrameworkError::file_io(
                &path,
                io::Error::new(io::ErrorKind::NotFound, "Bundle 包不存在"),
            )),
            Err(e) => Err(FrameworkError::file_io(&path, e)),
        }
    }

    /// 为 location 创建归档
    ///
    /// 若缓存中已有该 location 的持久化记录且其 ID 未被占用，则复用该 ID；
    /// 否则分配一个新的 ID。`in_use` 判断 ID 是否已被运行中的 Bundle 占用。
    pub fn create_archive(
        &self,
        location: &str,
        in_use: impl Fn(i64) -> bool,
    ) -> Result<Arc<BundleArchive>> {
        let source = self.resolve_source(location)?;
        let _guard = self.structure.lock();

        let id = match self.find_id_locked(location)? {
            Some(id) if !in_use(id) => {
                debug!(bundle_id = id, location, "复用已持久化的 Bundle ID");
                id
            }
            _ => self.allocate_id_locked(&in_use),
        };

        let archive = BundleArchive::create(
            Arc::clone(&self.store),
            ArchivePaths::new(&self.root, id),
            id,
            location,
            &source,
            Rollback::Root,
        )?;
        info!(
            bundle_id = id,
            location,
            symbolic_name = %archive.symbolic_name(),
            version = %archive.version(),
            "归档已创建"
        );
        Ok(Arc::new(archive))
    }

    /// 框架自身伪 Bundle 的归档
    pub fn create_system_archive(&self) -> Result<Arc<BundleArchive>> {
        let _guard = self.structure.lock();
        BundleArchive::system(Arc::clone(&self.store), ArchivePaths::new(&self.root, 0)).map(Arc::new)
    }

    /// 从原 location 重新生成归档的资源缓存
    ///
    /// 失败时只删除资源缓存，ID、状态文件与私有存储保持不变。
    pub fn refresh_archive(&self, archive: &BundleArchive) -> Result<Arc<BundleArchive>> {
        if archive.is_system() {
            return Err(FrameworkError::IllegalArgument("不能刷新系统 Bundle".into()));
        }
        let source = self.resolve_source(archive.location())?;
        let _guard = self.structure.lock();

        archive.invalidate_cache();
        archive.remove_invalid_dirs()?;

        let refreshed = BundleArchive::create(
            Arc::clone(&self.store),
            archive.paths().clone(),
            archive.id(),
            archive.location(),
            &source,
            Rollback::Resources,
        )?;
        info!(bundle_id = archive.id(), location = archive.location(), "归档已刷新");
        Ok(Arc::new(refreshed))
    }

    /// 查找持久化记录中 location 对应的 Bundle ID
    pub fn find_bundle_id_for_location(&self, location: &str) -> Result<Option<i64>> {
        let _guard = self.structure.lock();
        self.find_id_locked(location)
    }

    fn find_id_locked(&self, location: &str) -> Result<Option<i64>> {
        Ok(self
            .persisted_locked()?
            .into_iter()
            .find(|record| record.location == location)
            .map(|record| record.id))
    }

    /// ID 是否已被缓存中的归档目录使用
    pub fn is_bundle_id_already_used(&self, id: i64) -> bool {
        id == 0 || self.store.exists(&ArchivePaths::new(&self.root, id).root)
    }

    fn allocate_id_locked(&self, in_use: &impl Fn(i64) -> bool) -> i64 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            if !self.is_bundle_id_already_used(id) && !in_use(id) {
                return id;
            }
            debug!(bundle_id = id, "Bundle ID 已被占用，跳过");
        }
    }

    /// 枚举缓存中全部持久化归档（不含系统 Bundle）
    pub fn archives(&self) -> Result<Vec<PersistedArchive>> {
        let _guard = self.structure.lock();
        self.persisted_locked()
    }

    fn persisted_locked(&self) -> Result<Vec<PersistedArchive>> {
        let mut records = Vec::new();
        for (id, _) in self.archive_dirs()? {
            if id == 0 {
                continue;
            }
            let paths = ArchivePaths::new(&self.root, id);
            let Some(state) = BundleArchive::read_state(self.store.as_ref(), &paths)? else {
                continue;
            };
            if state.get_as_i64(KEY_ID, -1) != id {
                warn!(bundle_id = id, path = %paths.state_file.display(), "状态文件中的 ID 与目录不符");
                continue;
            }
            records.push(PersistedArchive {
                id,
                location: state.get(KEY_LOCATION).unwrap_or_default().to_string(),
                symbolic_name: state.get(KEY_SYMBOLIC_NAME).unwrap_or_default().to_string(),
                version: state.get(KEY_VERSION).and_then(|v| Version::parse(v).ok()),
            });
        }
        Ok(records)
    }

    /// 使归档失效并删除其目录
    pub fn remove_archive(&self, archive: &BundleArchive) -> Result<()> {
        if archive.is_system() {
            return Ok(());
        }
        let _guard = self.structure.lock();
        archive.invalidate();
        archive.remove_invalid_dirs()?;
        info!(bundle_id = archive.id(), location = archive.location(), "归档已删除");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_bundle(dir: &Path, symbolic_name: &str) -> String {
        fs::create_dir_all(dir.join("META-INF")).unwrap();
        fs::write(
            dir.join("META-INF/MANIFEST.MF"),
            format!("Bundle-SymbolicName: {}\n", symbolic_name),
        )
        .unwrap();
        dir.display().to_string()
    }

    fn open(root: &Path, clean: bool) -> BundleCache {
        BundleCache::new(root, Arc::new(LocalFileStore::new()), clean).unwrap()
    }

    #[test]
    fn test_ids_are_stable_across_reopen() {
        let temp = TempDir::new().unwrap();
        let a = write_bundle(&temp.path().join("a"), "a");
        let b = write_bundle(&temp.path().join("b"), "b");
        let root = temp.path().join("cache");

        let cache = open(&root, false);
        let first_a = cache.create_archive(&a, |_| false).unwrap();
        let first_b = cache.create_archive(&b, |_| false).unwrap();
        assert_eq!((first_a.id(), first_b.id()), (1, 2));
        drop(cache);

        let cache = open(&root, false);
        assert_eq!(cache.find_bundle_id_for_location(&b).unwrap(), Some(2));
        assert_eq!(cache.create_archive(&b, |_| false).unwrap().id(), 2);
        assert_eq!(cache.archives().unwrap().len(), 2);
    }

    #[test]
    fn test_allocation_skips_used_ids() {
        let temp = TempDir::new().unwrap();
        let a = write_bundle(&temp.path().join("a"), "a");
        let b = write_bundle(&temp.path().join("b"), "b");
        let cache = open(&temp.path().join("cache"), false);

        let archive = cache.create_archive(&a, |id| id == 1).unwrap();
        assert_eq!(archive.id(), 2);
        assert!(cache.is_bundle_id_already_used(2));
        assert!(cache.is_bundle_id_already_used(0));

        cache.remove_archive(&archive).unwrap();
        assert!(!cache.is_bundle_id_already_used(2));
        assert_eq!(cache.create_archive(&b, |_| false).unwrap().id(), 3);
    }

    #[test]
    fn test_incomplete_dirs_are_purged() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("cache");
        fs::create_dir_all(root.join("bundle5/resources")).unwrap();
        fs::create_dir_all(root.join("unrelated")).unwrap();

        let cache = open(&root, false);
        assert!(!root.join("bundle5").exists());
        assert!(root.join("unrelated").exists());
        assert!(cache.archives().unwrap().is_empty());
    }

    #[test]
    fn test_clean_on_create_removes_everything() {
        let temp = TempDir::new().unwrap();
        let a = write_bundle(&temp.path().join("a"), "a");
        let root = temp.path().join("cache");
        open(&root, false).create_archive(&a, |_| false).unwrap();

        let cache = open(&root, true);
        assert!(cache.archives().unwrap().is_empty());
        assert_eq!(cache.find_bundle_id_for_location(&a).unwrap(), None);
    }

    #[test]
    fn test_resolve_source_errors() {
        let temp = TempDir::new().unwrap();
        let cache = open(&temp.path().join("cache"), false);

        assert!(matches!(
            cache.resolve_source("  "),
            Err(FrameworkError::IllegalArgument(_))
        ));
        assert!(matches!(
            cache.resolve_source("embedded://missing"),
            Err(FrameworkError::IllegalArgument(_))
        ));
        assert!(matches!(
            cache.resolve_source(&temp.path().join("nope").display().to_string()),
            Err(FrameworkError::FileIo { .. })
        ));

        cache.register_embedded("demo", b"");
        assert!(matches!(
            cache.resolve_source("embedded://demo"),
            Ok(BundleSource::Embedded { .. })
        ));
    }

    #[test]
    fn test_refresh_keeps_identity_and_storage() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("a");
        let a = write_bundle(&src, "a");
        let cache = open(&temp.path().join("cache"), false);

        let archive = cache.create_archive(&a, |_| false).unwrap();
        let data = archive.data_file("keep.txt").unwrap();
        fs::write(&data, "x").unwrap();

        fs::write(src.join("added.txt"), "new").unwrap();
        let refreshed = cache.refresh_archive(&archive).unwrap();
        assert_eq!(refreshed.id(), archive.id());
        assert!(refreshed.entry("added.txt").is_some());
        assert!(data.exists());
    }
}
