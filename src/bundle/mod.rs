//! Bundle 层
//!
//! 清单解析、磁盘归档与缓存、Bundle 实体及其生命周期状态。

pub mod archive;
#[allow(clippy::module_inception)]
pub mod bundle;
pub mod cache;
pub mod manifest;
pub mod state;

pub use archive::{ArchivePaths, BundleArchive, STATE_FILE};
pub use bundle::{Bundle, BundleInfo, BundleRevision};
pub use cache::{BundleCache, PersistedArchive};
pub use manifest::{BundleManifest, ManifestParser, MANIFEST_PATH};
pub use state::BundleState;
