//! Bundle 运行时实体
//!
//! 包装归档、生命周期状态、激活器和上下文。状态只由框架修改。

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use super::archive::BundleArchive;
use super::state::BundleState;
use crate::framework::{BundleActivator, BundleContext};

/// Bundle 修订（一次解压出的资源缓存）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleRevision {
    /// 修订号，从 0 开始
    pub number: u32,
    /// 符号名
    pub symbolic_name: String,
    /// 版本
    pub version: String,
    /// 资源缓存修改时间
    #[serde(skip)]
    pub extracted_at: Option<SystemTime>,
    /// 创建时间
    pub created_at: DateTime<Utc>,
}

impl BundleRevision {
    fn from_archive(number: u32, archive: &BundleArchive) -> Self {
        Self {
            number,
            symbolic_name: archive.symbolic_name().to_string(),
            version: archive.version().to_string(),
            extracted_at: archive.extracted_at(),
            created_at: Utc::now(),
        }
    }
}

/// Bundle 快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleInfo {
    /// Bundle ID
    pub id: i64,
    /// 安装来源
    pub location: String,
    /// 符号名
    pub symbolic_name: String,
    /// 版本
    pub version: String,
    /// 状态
    pub state: BundleState,
    /// 当前修订号
    pub revision: u32,
    /// 是否被显式停止
    pub persistently_stopped: bool,
    /// 安装时间
    pub installed_at: DateTime<Utc>,
    /// 最近一次状态变化时间
    pub last_modified: DateTime<Utc>,
}

/// Bundle
pub struct Bundle {
    id: i64,
    archive: RwLock<Arc<BundleArchive>>,
    state: RwLock<BundleState>,
    revisions: Mutex<Vec<BundleRevision>>,
    activator: Mutex<Option<Arc<dyn BundleActivator>>>,
    context: Mutex<Option<BundleContext>>,
    /// 生命周期操作互斥
    lifecycle: tokio::sync::Mutex<()>,
    persistently_stopped: AtomicBool,
    installed_at: DateTime<Utc>,
    last_modified: RwLock<DateTime<Utc>>,
}

impl Bundle {
    /// 由归档创建处于 INSTALLED 状态的 Bundle
    pub(crate) fn new(archive: Arc<BundleArchive>) -> Self {
        let now = Utc::now();
        Self {
            id: archive.id(),
            revisions: Mutex::new(vec![BundleRevision::from_archive(0, &archive)]),
            archive: RwLock::new(archive),
            state: RwLock::new(BundleState::Installed),
            activator: Mutex::new(None),
            context: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            persistently_stopped: AtomicBool::new(false),
            installed_at: now,
            last_modified: RwLock::new(now),
        }
    }

    /// Bundle ID
    pub fn id(&self) -> i64 {
        self.id
    }

    /// 当前归档
    pub fn archive(&self) -> Arc<BundleArchive> {
        Arc::clone(&self.archive.read())
    }

    /// 当前状态
    pub fn state(&self) -> BundleState {
        *self.state.read()
    }

    /// 安装来源
    pub fn location(&self) -> String {
        self.archive.read().location().to_string()
    }

    /// 符号名
    pub fn symbolic_name(&self) -> String {
        self.archive.read().symbolic_name().to_string()
    }

    /// 全部修订，最后一个为当前修订
    pub fn revisions(&self) -> Vec<BundleRevision> {
        self.revisions.lock().clone()
    }

    /// 当前上下文（仅在 STARTING / ACTIVE / STOPPING 期间存在）
    pub fn context(&self) -> Option<BundleContext> {
        self.context.lock().clone()
    }

    /// 快照
    pub fn info(&self) -> BundleInfo {
        let archive = self.archive();
        BundleInfo {
            id: self.id,
            location: archive.location().to_string(),
            symbolic_name: archive.symbolic_name().to_string(),
            version: archive.version().to_string(),
            state: self.state(),
            revision: self.revisions.lock().last().map(|r| r.number).unwrap_or_default(),
            persistently_stopped: self.persistently_stopped.load(Ordering::Acquire),
            installed_at: self.installed_at,
            last_modified: *self.last_modified.read(),
        }
    }

    pub(crate) fn set_state(&self, state: BundleState) {
        *self.state.write() = state;
        *self.last_modified.write() = Utc::now();
    }

    /// 替换归档并追加一个修订
    pub(crate) fn push_revision(&self, archive: Arc<BundleArchive>) {
        let mut revisions = self.revisions.lock();
        let number = revisions.last().map(|r| r.number + 1).unwrap_or_default();
        revisions.push(BundleRevision::from_archive(number, &archive));
        *self.archive.write() = archive;
        *self.last_modified.write() = Utc::now();
    }

    pub(crate) fn lifecycle(&self) -> &tokio::sync::Mutex<()> {
        &self.lifecycle
    }

    pub(crate) fn set_activator(&self, activator: Option<Arc<dyn BundleActivator>>) {
        *self.activator.lock() = activator;
    }

    pub(crate) fn take_activator(&self) -> Option<Arc<dyn BundleActivator>> {
        self.activator.lock().take()
    }

    pub(crate) fn set_context(&self, context: Option<BundleContext>) {
        *self.context.lock() = context;
    }

    pub(crate) fn take_context(&self) -> Option<BundleContext> {
        self.context.lock().take()
    }

    pub(crate) fn set_persistently_stopped(&self, stopped: bool) {
        self.persistently_stopped.store(stopped, Ordering::Release);
    }

    /// 是否被显式停止
    pub fn is_persistently_stopped(&self) -> bool {
        self.persistently_stopped.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bundle")
            .field("id", &self.id)
            .field("symbolic_name", &self.symbolic_name())
            .field("state", &self.state())
            .finish()
    }
}
