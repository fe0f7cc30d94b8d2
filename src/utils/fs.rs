//! 文件存储层
//!
//! Bundle 缓存所依赖的全部文件系统操作都经过 [`FileStore`] 接口：
//! 目录创建/删除、最后修改时间、原子写入以及 Bundle 包解压。
//! 默认实现 [`LocalFileStore`] 直接操作本地文件系统。

use std::fs::{self, File};
use std::io::{self, BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use flate2::read::GzDecoder;
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::utils::{FrameworkError, Result};

/// 内嵌 Bundle 的 location 前缀
pub const EMBEDDED_SCHEME: &str = "embedded://";

/// gzip 魔数
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Bundle 包来源
#[derive(Debug, Clone)]
pub enum BundleSource {
    /// 已解包的目录
    Directory(PathBuf),
    /// tar 或 tar.gz 归档文件
    Archive(PathBuf),
    /// 编译进可执行文件的 tar/tar.gz 数据
    Embedded {
        /// 内嵌名称
        name: String,
        /// 归档字节
        bytes: &'static [u8],
    },
}

impl BundleSource {
    /// 来源的最后修改时间
    ///
    /// 目录取整棵树中最新的修改时间；内嵌 Bundle 使用当前可执行文件的
    /// 修改时间。无法获取时返回 `None`，调用方应当视为“总是需要重新解压”。
    pub fn last_modified(&self) -> Option<SystemTime> {
        match self {
            BundleSource::Directory(path) => newest_mtime(path),
            BundleSource::Archive(path) => fs::metadata(path).and_then(|m| m.modified()).ok(),
            BundleSource::Embedded { .. } => std::env::current_exe()
                .and_then(fs::metadata)
                .and_then(|m| m.modified())
                .ok(),
        }
    }

    /// 用于日志的描述
    pub fn describe(&self) -> String {
        match self {
            BundleSource::Directory(path) => format!("dir:{}", path.display()),
            BundleSource::Archive(path) => format!("archive:{}", path.display()),
            BundleSource::Embedded { name, .. } => format!("{}{}", EMBEDDED_SCHEME, name),
        }
    }
}

/// 目录树中最新的修改时间，任一条目不可读时返回 `None`
fn newest_mtime(root: &Path) -> Option<SystemTime> {
    let mut newest = None;
    for entry in WalkDir::new(root).follow_links(true) {
        let modified = entry.ok()?.metadata().ok()?.modified().ok()?;
        newest = newest.max(Some(modified));
    }
    newest
}

/// 文件存储接口
///
/// 所有写操作都不假定在 OS 层面是原子的：解压可以重复执行，
/// 状态文件通过“写临时文件再改名”的方式替换。
pub trait FileStore: Send + Sync + std::fmt::Debug {
    /// 递归创建目录（已存在时视为成功）
    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// 递归删除目录（不存在时视为成功，悬空符号链接单独处理）
    fn remove_dir_all(&self, path: &Path) -> Result<()>;

    /// 路径是否存在（悬空符号链接也视为存在）
    fn exists(&self, path: &Path) -> bool;

    /// 最后修改时间，路径不存在时返回 `None`
    fn last_modified(&self, path: &Path) -> Result<Option<SystemTime>>;

    /// 将目录的修改时间刷新为当前时间
    fn touch(&self, path: &Path) -> Result<()>;

    /// 读取文本文件，文件不存在时返回 `None`
    fn read_to_string(&self, path: &Path) -> Result<Option<String>>;

    /// 替换式写入文件
    fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()>;

    /// 将 Bundle 包解压/复制到目标目录
    fn extract(&self, source: &BundleSource, dest: &Path) -> Result<()>;

    /// 列出目录下的直接子目录
    fn list_dirs(&self, path: &Path) -> Result<Vec<PathBuf>>;
}

/// 本地文件系统实现
#[derive(Debug, Clone, Default)]
pub struct LocalFileStore;

impl LocalFileStore {
    /// 创建本地文件存储
    pub fn new() -> Self {
        Self
    }

    fn unpack_tar<R: Read>(reader: R, dest: &Path) -> io::Result<()> {
        let mut archive = tar::Archive::new(reader);
        archive.set_preserve_permissions(true);
        archive.unpack(dest)
    }

    fn unpack_reader<R: Read>(mut reader: R, dest: &Path) -> io::Result<()> {
        let mut magic = [0u8; 2];
        let mut filled = 0;
        while filled < magic.len() {
            let n = reader.read(&mut magic[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let chained = Cursor::new(magic[..filled].to_vec()).chain(reader);
        if filled == magic.len() && magic == GZIP_MAGIC {
            Self::unpack_tar(GzDecoder::new(chained), dest)
        } else {
            Self::unpack_tar(chained, dest)
        }
    }

    fn copy_dir(src: &Path, dest: &Path) -> io::Result<()> {
        for entry in WalkDir::new(src).follow_links(true) {
            let entry = entry.map_err(io::Error::other)?;
            let relative = entry
                .path()
                .strip_prefix(src)
                .map_err(io::Error::other)?;
            let target = dest.join(relative);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&target)?;
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(entry.path(), &target)?;
            }
        }
        Ok(())
    }
}

impl FileStore for LocalFileStore {
    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(|e| FrameworkError::file_io(path, e))
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(FrameworkError::file_io(path, e)),
        };

        // 递归删除不会穿过符号链接，悬空链接需要直接删除链接本身
        if meta.file_type().is_symlink() || meta.is_file() {
            trace!(path = %path.display(), "删除符号链接或文件");
            return fs::remove_file(path).map_err(|e| FrameworkError::file_io(path, e));
        }

        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FrameworkError::file_io(path, e)),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }

    fn last_modified(&self, path: &Path) -> Result<Option<SystemTime>> {
        match fs::metadata(path) {
            Ok(meta) => meta
                .modified()
                .map(Some)
                .map_err(|e| FrameworkError::file_io(path, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FrameworkError::file_io(path, e)),
        }
    }

    fn touch(&self, path: &Path) -> Result<()> {
        let file = File::open(path).map_err(|e| FrameworkError::file_io(path, e))?;
        file.set_modified(SystemTime::now())
            .map_err(|e| FrameworkError::file_io(path, e))
    }

    fn read_to_string(&self, path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FrameworkError::file_io(path, e)),
        }
    }

    fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, contents).map_err(|e| FrameworkError::file_io(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            FrameworkError::file_io(path, e)
        })
    }

    fn extract(&self, source: &BundleSource, dest: &Path) -> Result<()> {
        debug!(source = %source.describe(), dest = %dest.display(), "解压 Bundle 包");
        self.create_dir_all(dest)?;
        match source {
            BundleSource::Directory(src) => {
                Self::copy_dir(src, dest).map_err(|e| FrameworkError::file_io(src, e))
            }
            BundleSource::Archive(path) => {
                let file = File::open(path).map_err(|e| FrameworkError::file_io(path, e))?;
                Self::unpack_reader(BufReader::new(file), dest)
                    .map_err(|e| FrameworkError::file_io(path, e))
            }
            BundleSource::Embedded { name, bytes } => Self::unpack_reader(*bytes, dest)
                .map_err(|e| FrameworkError::file_io(format!("{}{}", EMBEDDED_SCHEME, name), e)),
        }
    }

    fn list_dirs(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(FrameworkError::file_io(path, e)),
        };

        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| FrameworkError::file_io(path, e))?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn build_tar(gzip: bool) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let data = b"hello";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "META-INF/MANIFEST.MF", &data[..])
            .unwrap();
        let tar_bytes = builder.into_inner().unwrap();
        if gzip {
            use flate2::write::GzEncoder;
            use std::io::Write;
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(&tar_bytes).unwrap();
            encoder.finish().unwrap()
        } else {
            tar_bytes
        }
    }

    #[test]
    fn test_extract_plain_and_gzip_tar() {
        let temp = TempDir::new().unwrap();
        let store = LocalFileStore::new();

        for (i, gzip) in [false, true].into_iter().enumerate() {
            let archive = temp.path().join(format!("bundle{}.tar", i));
            fs::write(&archive, build_tar(gzip)).unwrap();
            let dest = temp.path().join(format!("out{}", i));
            store
                .extract(&BundleSource::Archive(archive), &dest)
                .unwrap();
            let content = fs::read_to_string(dest.join("META-INF/MANIFEST.MF")).unwrap();
            assert_eq!(content, "hello");
        }
    }

    #[test]
    fn test_extract_directory_copies_tree() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("a/b")).unwrap();
        fs::write(src.join("a/b/file.txt"), "x").unwrap();

        let dest = temp.path().join("dest");
        LocalFileStore::new()
            .extract(&BundleSource::Directory(src), &dest)
            .unwrap();
        assert!(dest.join("a/b/file.txt").is_file());
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let temp = TempDir::new().unwrap();
        let store = LocalFileStore::new();
        let path = temp.path().join("state.properties");

        store.write_atomic(&path, b"a=1\n").unwrap();
        store.write_atomic(&path, b"a=2\n").unwrap();
        assert_eq!(
            store.read_to_string(&path).unwrap().as_deref(),
            Some("a=2\n")
        );
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_remove_missing_dir_is_ok() {
        let temp = TempDir::new().unwrap();
        let store = LocalFileStore::new();
        store.remove_dir_all(&temp.path().join("nope")).unwrap();
        assert_eq!(store.last_modified(&temp.path().join("nope")).unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_remove_dangling_symlink() {
        let temp = TempDir::new().unwrap();
        let store = LocalFileStore::new();
        let link = temp.path().join("resources");
        std::os::unix::fs::symlink(temp.path().join("gone"), &link).unwrap();

        assert!(store.exists(&link));
        store.remove_dir_all(&link).unwrap();
        assert!(!store.exists(&link));
    }

    #[test]
    fn test_directory_source_tracks_nested_files() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("bundle");
        fs::create_dir_all(root.join("META-INF")).unwrap();
        let manifest = root.join("META-INF/MANIFEST.MF");
        fs::write(&manifest, "Bundle-SymbolicName: a\n").unwrap();

        let source = BundleSource::Directory(root.clone());
        let before = source.last_modified().unwrap();

        let later = SystemTime::now() + std::time::Duration::from_secs(120);
        filetime::set_file_mtime(&manifest, filetime::FileTime::from_system_time(later)).unwrap();
        let root_mtime = fs::metadata(&root).unwrap().modified().unwrap();

        let after = source.last_modified().unwrap();
        assert!(after > before);
        assert!(after > root_mtime);
    }

    #[test]
    fn test_touch_updates_mtime() {
        let temp = TempDir::new().unwrap();
        let store = LocalFileStore::new();
        let dir = temp.path().join("d");
        store.create_dir_all(&dir).unwrap();
        let past = SystemTime::now() - std::time::Duration::from_secs(3600);
        filetime::set_file_mtime(&dir, filetime::FileTime::from_system_time(past)).unwrap();

        store.touch(&dir).unwrap();
        let modified = store.last_modified(&dir).unwrap().unwrap();
        assert!(modified > past);
    }
}
