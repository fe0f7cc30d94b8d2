//! 框架
//!
//! 框架持有服务注册表、Bundle 缓存和已安装 Bundle 表，驱动 Bundle 生命周期：
//!
//! ```text
//! INSTALLED → RESOLVED → STARTING → ACTIVE → STOPPING → RESOLVED
//!                                                      ↘ UNINSTALLED
//! ```
//!
//! 每个 Bundle 的生命周期操作由其自身的异步互斥量串行化。
//! Bundle 事件和框架事件由唯一的分发任务按 FIFO 顺序投递；
//! 同步回调中需要的生命周期操作通过 `BundleContext::schedule_*`
//! 交给独立的生命周期工作任务执行。

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::activator::{ActivatorFactory, ActivatorRegistry, BundleActivator};
use super::context::BundleContext;
use super::dispatcher::EventDispatcher;
use super::event::{BundleEvent, BundleEventType, FrameworkEvent, FrameworkEventType};
use crate::bundle::{Bundle, BundleCache, BundleInfo, BundleRevision, BundleState};
use crate::core::FrameworkConfig;
use crate::service::ServiceRegistry;
use crate::utils::{FrameworkError, Properties, Result, EMBEDDED_SCHEME};

/// 框架实例 UUID 属性
pub const FRAMEWORK_UUID: &str = "org.osgi.framework.uuid";
/// 框架版本属性
pub const FRAMEWORK_VERSION: &str = "org.osgi.framework.version";
/// 缓存目录属性
pub const FRAMEWORK_STORAGE: &str = "org.osgi.framework.storage";

/// 计划执行的生命周期操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LifecycleOp {
    Start,
    Stop,
    Uninstall,
}

impl fmt::Display for LifecycleOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleOp::Start => "start",
            LifecycleOp::Stop => "stop",
            LifecycleOp::Uninstall => "uninstall",
        };
        f.write_str(s)
    }
}

/// 生命周期工作任务的请求
#[derive(Debug)]
pub(crate) enum LifecycleRequest {
    Run { bundle_id: i64, op: LifecycleOp },
    Barrier(oneshot::Sender<()>),
}

pub(crate) struct FrameworkInner {
    pub(crate) config: FrameworkConfig,
    pub(crate) registry: ServiceRegistry,
    pub(crate) dispatcher: EventDispatcher,
    pub(crate) properties: Arc<Properties>,
    pub(crate) lifecycle_tx: mpsc::UnboundedSender<LifecycleRequest>,
    cache: BundleCache,
    activators: ActivatorRegistry,
    bundles: RwLock<BTreeMap<i64, Arc<Bundle>>>,
    /// 安装互斥，保证 location 与符号名/版本的唯一性检查
    install_lock: tokio::sync::Mutex<()>,
    system: Arc<Bundle>,
    uuid: String,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for FrameworkInner {
    fn drop(&mut self) {
        self.dispatcher.close();
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

/// 框架
///
/// 可廉价克隆，克隆体共享同一实例。
#[derive(Clone)]
pub struct Framework {
    inner: Arc<FrameworkInner>,
}

impl Framework {
    /// 创建框架实例
    ///
    /// 打开（或按配置清空）Bundle 缓存，启动事件分发任务和生命周期工作任务。
    /// 必须在 tokio 运行时内调用。
    ///
    /// # Errors
    ///
    /// 配置无效或缓存目录无法创建时返回错误
    pub async fn new(config: FrameworkConfig) -> Result<Self> {
        config.validate()?;
        info!(version = crate::VERSION, cache_dir = %config.cache.dir.display(), "初始化框架");

        let cache_config = config.cache.clone();
        let cache = tokio::task::spawn_blocking(move || BundleCache::open(&cache_config))
            .await
            .map_err(|e| FrameworkError::Internal(format!("打开缓存任务失败: {}", e)))??;
        let system_archive = cache.create_system_archive()?;

        let uuid = Uuid::new_v4().to_string();
        let mut properties: Properties = config
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        properties.set(FRAMEWORK_UUID, uuid.as_str());
        properties.set(FRAMEWORK_VERSION, crate::VERSION);
        properties.set(FRAMEWORK_STORAGE, cache.root().display().to_string());

        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(FrameworkInner {
            registry: ServiceRegistry::with_wait_policy(config.wait_policy()),
            dispatcher: EventDispatcher::start(),
            properties: Arc::new(properties),
            lifecycle_tx,
            cache,
            activators: ActivatorRegistry::new(),
            bundles: RwLock::new(BTreeMap::new()),
            install_lock: tokio::sync::Mutex::new(()),
            system: Arc::new(Bundle::new(Arc::clone(&system_archive))),
            uuid,
            worker: Mutex::new(None),
            config,
        });

        inner.system.set_state(BundleState::Resolved);
        inner
            .system
            .set_context(Some(BundleContext::new(&inner, system_archive)));
        let worker = tokio::spawn(Self::lifecycle_worker(Arc::downgrade(&inner), lifecycle_rx));
        *inner.worker.lock() = Some(worker);

        info!(uuid = %inner.uuid, "框架已创建");
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<FrameworkInner>) -> Self {
        Self { inner }
    }

    // ==================== 框架生命周期 ====================

    /// 启动框架
    ///
    /// 安装并启动 `auto_start` 中的全部 location；单个失败只记录日志并
    /// 发布 `FrameworkEvent::Error`，不会中断启动。
    #[instrument(skip(self), fields(uuid = %self.inner.uuid))]
    pub async fn start(&self) -> Result<()> {
        let system = Arc::clone(&self.inner.system);
        let _guard = self.lock_lifecycle(&system).await?;

        match system.state() {
            BundleState::Active => return Ok(()),
            BundleState::Starting | BundleState::Stopping => {
                return Err(FrameworkError::IllegalState(format!(
                    "框架当前状态 {} 不允许启动",
                    system.state()
                )))
            }
            _ => {}
        }

        if self.inner.dispatcher.is_closed() {
            return Err(FrameworkError::IllegalState("框架已关闭，不能再次启动".into()));
        }

        info!("启动框架...");
        system.set_state(BundleState::Starting);
        if !system.context().map(|c| c.is_valid()).unwrap_or(false) {
            system.set_context(Some(BundleContext::new(&self.inner, system.archive())));
        }

        for location in self.inner.config.auto_start.clone() {
            let result = async {
                let id = self.install_bundle(&location).await?;
                self.start_bundle(id).await
            }
            .await;
            if let Err(e) = result {
                warn!(location = %location, error = %e, "自动启动 Bundle 失败");
                self.publish_framework(
                    FrameworkEventType::Error,
                    0,
                    format!("自动启动 {} 失败: {}", location, e),
                );
            }
        }

        system.set_state(BundleState::Active);
        self.publish_framework(FrameworkEventType::Started, 0, "框架已启动");
        info!(bundles = self.inner.bundles.read().len(), "框架已启动");
        Ok(())
    }

    /// 停止框架
    ///
    /// 按 ID 倒序停止全部运行中的 Bundle（不记录为显式停止），
    /// 等待事件队列清空后清理系统上下文。
    #[instrument(skip(self), fields(uuid = %self.inner.uuid))]
    pub async fn stop(&self) -> Result<()> {
        let system = Arc::clone(&self.inner.system);
        let _guard = self.lock_lifecycle(&system).await?;

        if system.state() != BundleState::Active {
            debug!(state = %system.state(), "框架未运行，忽略停止请求");
            return Ok(());
        }

        info!("正在停止框架...");
        system.set_state(BundleState::Stopping);

        let active: Vec<Arc<Bundle>> = self
            .inner
            .bundles
            .read()
            .values()
            .rev()
            .filter(|b| b.state() == BundleState::Active)
            .cloned()
            .collect();
        for bundle in active {
            let result = match self.lock_lifecycle(&bundle).await {
                Ok(_lifecycle) => self.stop_locked(&bundle, false).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(bundle_id = bundle.id(), error = %e, "停止 Bundle 失败");
            }
        }

        self.publish_framework(FrameworkEventType::Stopped, 0, "框架已停止");
        self.inner.dispatcher.wait_for_empty_queue().await;
        self.cleanup_context(&system).await;
        system.set_state(BundleState::Resolved);
        info!("框架已停止");
        Ok(())
    }

    /// 停止框架并关闭后台任务
    ///
    /// 等待计划中的生命周期操作执行完毕、已发布的事件全部投递后返回。
    /// 之后框架不能再次启动。
    pub async fn shutdown(&self) -> Result<()> {
        self.stop().await?;
        self.wait_for_lifecycle_queue().await;
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            worker.abort();
        }
        self.inner.dispatcher.shutdown().await;
        info!(uuid = %self.inner.uuid, "框架已关闭");
        Ok(())
    }

    // ==================== Bundle 生命周期 ====================

    /// 安装 Bundle，返回 Bundle ID
    ///
    /// 同一 location 已安装时直接返回已有 ID。
    ///
    /// # Errors
    ///
    /// - location 为空时返回 `IllegalArgument`
    /// - 清单无效时返回 `InvalidManifest`
    /// - 符号名与版本和已安装 Bundle 冲突时返回 `DuplicateBundle`
    /// - 解压或持久化失败时返回 `FileIo`
    #[instrument(skip(self))]
    pub async fn install_bundle(&self, location: &str) -> Result<i64> {
        let location = location.trim().to_string();
        if location.is_empty() {
            return Err(FrameworkError::IllegalArgument("location 不能为空".into()));
        }

        let _guard = self.inner.install_lock.lock().await;
        if let Some(existing) = self.find_by_location(&location) {
            debug!(bundle_id = existing.id(), location = %location, "Bundle 已安装");
            return Ok(existing.id());
        }

        let in_use: HashSet<i64> = self.inner.bundles.read().keys().copied().collect();
        let inner = Arc::clone(&self.inner);
        let archive_location = location.clone();
        let archive = tokio::task::spawn_blocking(move || {
            inner
                .cache
                .create_archive(&archive_location, |id| in_use.contains(&id))
        })
        .await
        .map_err(|e| FrameworkError::Internal(format!("创建归档任务失败: {}", e)))??;

        if let Some(existing) = self.find_duplicate(archive.symbolic_name(), archive.version(), None) {
            let err = FrameworkError::DuplicateBundle {
                symbolic_name: archive.symbolic_name().to_string(),
                version: archive.version().to_string(),
                existing_id: existing,
            };
            warn!(location = %location, error = %err, "安装被拒绝");
            if let Err(e) = self.inner.cache.remove_archive(&archive) {
                warn!(bundle_id = archive.id(), error = %e, "删除冲突归档失败");
            }
            return Err(err);
        }

        let bundle = Arc::new(Bundle::new(archive));
        let id = bundle.id();
        self.inner.bundles.write().insert(id, Arc::clone(&bundle));
        self.publish_bundle(&bundle, BundleEventType::Installed);
        info!(
            bundle_id = id,
            location = %location,
            symbolic_name = %bundle.symbolic_name(),
            "Bundle 已安装"
        );
        Ok(id)
    }

    /// 解析 Bundle（INSTALLED → RESOLVED）
    ///
    /// # Errors
    ///
    /// 清单指定的激活器未注册时返回 `UnknownActivator`
    pub async fn resolve_bundle(&self, bundle_id: i64) -> Result<()> {
        let bundle = self.get(bundle_id)?;
        let _guard = self.lock_lifecycle(&bundle).await?;
        match bundle.state() {
            BundleState::Uninstalled => Err(Self::uninstalled(bundle_id)),
            BundleState::Installed => self.resolve_locked(&bundle),
            _ => Ok(()),
        }
    }

    /// 启动 Bundle
    ///
    /// 激活器失败时 Bundle 回到 RESOLVED，错误返回给调用方，
    /// 其他 Bundle 与框架不受影响。
    ///
    /// # Errors
    ///
    /// - Bundle 不存在时返回 `BundleNotFound`
    /// - Bundle 已卸载时返回 `IllegalState`
    /// - 激活器失败时返回 `ActivatorFailed`
    #[instrument(skip(self))]
    pub async fn start_bundle(&self, bundle_id: i64) -> Result<()> {
        let bundle = self.get(bundle_id)?;
        let _guard = self.lock_lifecycle(&bundle).await?;
        bundle.set_persistently_stopped(false);
        self.start_locked(&bundle).await
    }

    /// 停止 Bundle，并记录为显式停止
    ///
    /// 激活器失败时停止仍会完成（清理上下文、回到 RESOLVED），
    /// 之后返回 `ActivatorFailed`。
    #[instrument(skip(self))]
    pub async fn stop_bundle(&self, bundle_id: i64) -> Result<()> {
        let bundle = self.get(bundle_id)?;
        let _guard = self.lock_lifecycle(&bundle).await?;
        self.stop_locked(&bundle, true).await
    }

    /// 更新 Bundle
    ///
    /// 运行中的 Bundle 先停止，然后从原 location 重新生成资源缓存并追加修订，
    /// 之前运行中的会被重新启动。ID、状态文件和私有存储保持不变。
    #[instrument(skip(self))]
    pub async fn update_bundle(&self, bundle_id: i64) -> Result<()> {
        if bundle_id == 0 {
            return Err(FrameworkError::IllegalArgument("不能更新系统 Bundle".into()));
        }
        let bundle = self.get(bundle_id)?;
        let _guard = self.lock_lifecycle(&bundle).await?;

        let previous = bundle.state();
        if previous == BundleState::Uninstalled {
            return Err(Self::uninstalled(bundle_id));
        }
        let was_active = previous == BundleState::Active;
        if was_active {
            if let Err(e) = self.stop_locked(&bundle, false).await {
                warn!(bundle_id, error = %e, "更新前停止 Bundle 失败，继续更新");
            }
        }
        if bundle.state() == BundleState::Resolved {
            bundle.set_state(BundleState::Installed);
            self.publish_bundle(&bundle, BundleEventType::Unresolved);
        }

        let old = bundle.archive();
        let inner = Arc::clone(&self.inner);
        let refresh_source = Arc::clone(&old);
        let refreshed = tokio::task::spawn_blocking(move || inner.cache.refresh_archive(&refresh_source))
            .await
            .map_err(|e| FrameworkError::Internal(format!("刷新归档任务失败: {}", e)))??;

        if let Some(existing) =
            self.find_duplicate(refreshed.symbolic_name(), refreshed.version(), Some(bundle_id))
        {
            refreshed.invalidate_cache();
            if let Err(e) = refreshed.remove_invalid_dirs() {
                warn!(bundle_id, error = %e, "删除冲突的资源缓存失败");
            }
            return Err(FrameworkError::DuplicateBundle {
                symbolic_name: refreshed.symbolic_name().to_string(),
                version: refreshed.version().to_string(),
                existing_id: existing,
            });
        }

        bundle.push_revision(refreshed);
        self.publish_bundle(&bundle, BundleEventType::Updated);
        info!(
            bundle_id,
            revision = bundle.info().revision,
            version = %bundle.archive().version(),
            "Bundle 已更新"
        );

        if was_active {
            self.start_locked(&bundle).await?;
        }
        Ok(())
    }

    /// 卸载 Bundle
    ///
    /// 运行中的 Bundle 先停止；归档随即失效并删除，
    /// 之后重新安装同一 location 会获得新的 ID。
    #[instrument(skip(self))]
    pub async fn uninstall_bundle(&self, bundle_id: i64) -> Result<()> {
        if bundle_id == 0 {
            return Err(FrameworkError::IllegalArgument("不能卸载系统 Bundle".into()));
        }
        let bundle = self.get(bundle_id)?;
        let _guard = self.lock_lifecycle(&bundle).await?;

        match bundle.state() {
            BundleState::Uninstalled => return Err(Self::uninstalled(bundle_id)),
            BundleState::Active => {
                if let Err(e) = self.stop_locked(&bundle, false).await {
                    warn!(bundle_id, error = %e, "卸载前停止 Bundle 失败，继续卸载");
                }
            }
            _ => {}
        }
        if bundle.state() == BundleState::Resolved {
            self.publish_bundle(&bundle, BundleEventType::Unresolved);
        }

        bundle.set_state(BundleState::Uninstalled);
        self.inner.bundles.write().remove(&bundle_id);

        let inner = Arc::clone(&self.inner);
        let archive = bundle.archive();
        let removed = tokio::task::spawn_blocking(move || inner.cache.remove_archive(&archive)).await;
        match removed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(bundle_id, error = %e, "删除归档失败"),
            Err(e) => warn!(bundle_id, error = %e, "删除归档任务失败"),
        }

        self.publish_bundle(&bundle, BundleEventType::Uninstalled);
        info!(bundle_id, location = %bundle.location(), "Bundle 已卸载");
        Ok(())
    }

    fn resolve_locked(&self, bundle: &Bundle) -> Result<()> {
        let archive = bundle.archive();
        if let Some(activator) = archive.manifest().activator.as_deref() {
            if !self.inner.activators.contains(activator) {
                warn!(bundle_id = bundle.id(), activator, "无法解析 Bundle：激活器未注册");
                return Err(FrameworkError::UnknownActivator(activator.to_string()));
            }
        }
        bundle.set_state(BundleState::Resolved);
        self.publish_bundle(bundle, BundleEventType::Resolved);
        debug!(bundle_id = bundle.id(), "Bundle 已解析");
        Ok(())
    }

    async fn start_locked(&self, bundle: &Arc<Bundle>) -> Result<()> {
        let bundle_id = bundle.id();
        match bundle.state() {
            BundleState::Active => return Ok(()),
            BundleState::Uninstalled => return Err(Self::uninstalled(bundle_id)),
            BundleState::Starting | BundleState::Stopping => {
                return Err(FrameworkError::IllegalState(format!(
                    "Bundle {} 当前状态 {} 不允许启动",
                    bundle_id,
                    bundle.state()
                )))
            }
            BundleState::Installed => self.resolve_locked(bundle)?,
            BundleState::Resolved => {}
        }

        let archive = bundle.archive();
        bundle.set_state(BundleState::Starting);
        self.publish_bundle(bundle, BundleEventType::Starting);
        let context = BundleContext::new(&self.inner, Arc::clone(&archive));
        bundle.set_context(Some(context.clone()));

        let activator = match archive.manifest().activator.as_deref() {
            Some(name) => self
                .inner
                .activators
                .create(name)
                .map(Some)
                .map_err(|e| e.to_string()),
            None => Ok(None),
        };
        let started = match activator {
            Ok(Some(activator)) => Self::run_activator(Arc::clone(&activator), context, true)
                .await
                .map(|()| Some(activator)),
            Ok(None) => Ok(None),
            Err(reason) => Err(reason),
        };

        match started {
            Ok(activator) => {
                bundle.set_activator(activator);
                bundle.set_state(BundleState::Active);
                self.publish_bundle(bundle, BundleEventType::Started);
                info!(bundle_id, symbolic_name = %archive.symbolic_name(), "Bundle 已启动");
                Ok(())
            }
            Err(reason) => {
                error!(bundle_id, reason = %reason, "Bundle 激活器启动失败，回滚");
                bundle.set_state(BundleState::Stopping);
                self.publish_bundle(bundle, BundleEventType::Stopping);
                self.cleanup_context(bundle).await;
                bundle.set_state(BundleState::Resolved);
                self.publish_bundle(bundle, BundleEventType::Stopped);
                self.publish_framework(FrameworkEventType::Error, bundle_id, reason.clone());
                Err(FrameworkError::ActivatorFailed { bundle_id, reason })
            }
        }
    }

    async fn stop_locked(&self, bundle: &Arc<Bundle>, record: bool) -> Result<()> {
        let bundle_id = bundle.id();
        if record {
            bundle.set_persistently_stopped(true);
        }
        match bundle.state() {
            BundleState::Active => {}
            BundleState::Uninstalled => return Err(Self::uninstalled(bundle_id)),
            _ => return Ok(()),
        }

        bundle.set_state(BundleState::Stopping);
        self.publish_bundle(bundle, BundleEventType::Stopping);

        let mut failure = None;
        if let (Some(activator), Some(context)) = (bundle.take_activator(), bundle.context()) {
            if let Err(reason) = Self::run_activator(activator, context, false).await {
                error!(bundle_id, reason = %reason, "Bundle 激活器停止失败");
                failure = Some(reason);
            }
        }

        self.cleanup_context(bundle).await;
        bundle.set_state(BundleState::Resolved);
        self.publish_bundle(bundle, BundleEventType::Stopped);
        info!(bundle_id, persistent = record, "Bundle 已停止");

        match failure {
            Some(reason) => {
                self.publish_framework(FrameworkEventType::Error, bundle_id, reason.clone());
                Err(FrameworkError::ActivatorFailed { bundle_id, reason })
            }
            None => Ok(()),
        }
    }

    /// 在独立任务中执行激活器，panic 视为失败
    async fn run_activator(
        activator: Arc<dyn BundleActivator>,
        context: BundleContext,
        starting: bool,
    ) -> std::result::Result<(), String> {
        let task = tokio::spawn(async move {
            if starting {
                activator.start(&context).await
            } else {
                activator.stop(&context).await
            }
        });
        match task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(e) if e.is_panic() => Err("激活器 panic".to_string()),
            Err(e) => Err(format!("激活器任务失败: {}", e)),
        }
    }

    async fn cleanup_context(&self, bundle: &Bundle) {
        let Some(context) = bundle.take_context() else {
            return;
        };
        let bundle_id = bundle.id();
        match tokio::task::spawn_blocking(move || context.invalidate_and_cleanup()).await {
            Ok(report) if !report.is_clean() => {
                warn!(bundle_id, ?report, "Bundle 停止时存在遗留资源");
            }
            Ok(_) => {}
            Err(e) => error!(bundle_id, error = %e, "清理 Bundle 上下文失败"),
        }
    }

    async fn lock_lifecycle<'a>(&self, bundle: &'a Bundle) -> Result<MutexGuard<'a, ()>> {
        let lock = bundle.lifecycle().lock();
        match self.inner.registry.wait_policy().max_wait {
            Some(max_wait) => tokio::time::timeout(max_wait, lock).await.map_err(|_| {
                FrameworkError::IllegalState(format!(
                    "等待 Bundle {} 的生命周期操作超时",
                    bundle.id()
                ))
            }),
            None => Ok(lock.await),
        }
    }

    async fn lifecycle_worker(
        framework: Weak<FrameworkInner>,
        mut requests: mpsc::UnboundedReceiver<LifecycleRequest>,
    ) {
        debug!("生命周期工作任务已启动");
        while let Some(request) = requests.recv().await {
            let (bundle_id, op) = match request {
                LifecycleRequest::Barrier(done) => {
                    let _ = done.send(());
                    continue;
                }
                LifecycleRequest::Run { bundle_id, op } => (bundle_id, op),
            };
            let Some(inner) = framework.upgrade() else {
                break;
            };
            let framework = Framework::from_inner(inner);
            let result = match op {
                LifecycleOp::Start => framework.start_bundle(bundle_id).await,
                LifecycleOp::Stop => framework.stop_bundle(bundle_id).await,
                LifecycleOp::Uninstall => framework.uninstall_bundle(bundle_id).await,
            };
            if let Err(e) = result {
                warn!(bundle_id, operation = %op, error = %e, "计划的生命周期操作失败");
                framework.publish_framework(
                    FrameworkEventType::Error,
                    bundle_id,
                    format!("{} 失败: {}", op, e),
                );
            }
        }
        debug!("生命周期工作任务已退出");
    }

    // ==================== 注册 ====================

    /// 注册激活器工厂
    pub fn register_activator(&self, name: impl Into<String>, factory: ActivatorFactory) {
        self.inner.activators.register(name, factory);
    }

    /// 以构造函数注册激活器
    pub fn register_activator_fn<F, A>(&self, name: impl Into<String>, constructor: F)
    where
        F: Fn() -> A + Send + Sync + 'static,
        A: BundleActivator + 'static,
    {
        self.inner.activators.register(
            name,
            Arc::new(move || Arc::new(constructor()) as Arc<dyn BundleActivator>),
        );
    }

    /// 注册内嵌 Bundle，返回可用于安装的 location
    pub fn register_embedded_bundle(&self, name: &str, bytes: &'static [u8]) -> String {
        self.inner.cache.register_embedded(name, bytes);
        format!("{}{}", EMBEDDED_SCHEME, name)
    }

    // ==================== 查询 ====================

    /// 框架状态（即系统 Bundle 的状态）
    pub fn state(&self) -> BundleState {
        self.inner.system.state()
    }

    /// 框架实例 UUID
    pub fn uuid(&self) -> &str {
        &self.inner.uuid
    }

    /// 框架属性
    pub fn property(&self, key: &str) -> Option<String> {
        self.inner.properties.get(key).map(str::to_string)
    }

    /// 配置
    pub fn config(&self) -> &FrameworkConfig {
        &self.inner.config
    }

    /// 服务注册表
    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    /// Bundle 缓存
    pub fn cache(&self) -> &BundleCache {
        &self.inner.cache
    }

    /// 系统 Bundle 的上下文，供宿主程序注册服务和监听器
    ///
    /// # Errors
    ///
    /// 框架停止后到再次启动前返回 `IllegalState`
    pub fn system_context(&self) -> Result<BundleContext> {
        self.inner
            .system
            .context()
            .filter(BundleContext::is_valid)
            .ok_or_else(|| FrameworkError::IllegalState("框架已停止，系统上下文不可用".into()))
    }

    /// Bundle 快照（ID 0 为系统 Bundle）
    pub fn bundle(&self, bundle_id: i64) -> Option<BundleInfo> {
        self.lookup(bundle_id).map(|b| b.info())
    }

    /// 全部 Bundle 快照，系统 Bundle 在首位
    pub fn bundles(&self) -> Vec<BundleInfo> {
        let mut infos = vec![self.inner.system.info()];
        infos.extend(self.inner.bundles.read().values().map(|b| b.info()));
        infos
    }

    /// Bundle 状态
    pub fn bundle_state(&self, bundle_id: i64) -> Option<BundleState> {
        self.lookup(bundle_id).map(|b| b.state())
    }

    /// Bundle 上下文（仅在 STARTING / ACTIVE / STOPPING 期间存在）
    pub fn bundle_context(&self, bundle_id: i64) -> Option<BundleContext> {
        self.lookup(bundle_id).and_then(|b| b.context())
    }

    /// Bundle 的全部修订
    pub fn bundle_revisions(&self, bundle_id: i64) -> Option<Vec<BundleRevision>> {
        self.lookup(bundle_id).map(|b| b.revisions())
    }

    /// Bundle 资源缓存中的条目
    pub fn bundle_entry(&self, bundle_id: i64, path: &str) -> Option<PathBuf> {
        self.lookup(bundle_id)?.archive().entry(path)
    }

    /// 按 location 查找已安装 Bundle
    pub fn bundle_id_for_location(&self, location: &str) -> Option<i64> {
        self.find_by_location(location.trim()).map(|b| b.id())
    }

    /// 等待此前发布的 Bundle / 框架事件全部投递完毕
    pub async fn wait_for_empty_event_queue(&self) {
        self.inner.dispatcher.wait_for_empty_queue().await;
    }

    /// 等待此前提交的计划生命周期操作全部执行完毕
    pub async fn wait_for_lifecycle_queue(&self) {
        let (done, wait) = oneshot::channel();
        if self.inner.lifecycle_tx.send(LifecycleRequest::Barrier(done)).is_ok() {
            let _ = wait.await;
        }
    }

    // ==================== 内部工具 ====================

    fn lookup(&self, bundle_id: i64) -> Option<Arc<Bundle>> {
        if bundle_id == 0 {
            return Some(Arc::clone(&self.inner.system));
        }
        self.inner.bundles.read().get(&bundle_id).cloned()
    }

    fn get(&self, bundle_id: i64) -> Result<Arc<Bundle>> {
        if bundle_id == 0 {
            return Err(FrameworkError::IllegalArgument(
                "系统 Bundle 只能通过 Framework::start / stop 控制".into(),
            ));
        }
        self.inner
            .bundles
            .read()
            .get(&bundle_id)
            .cloned()
            .ok_or(FrameworkError::BundleNotFound(bundle_id))
    }

    fn find_by_location(&self, location: &str) -> Option<Arc<Bundle>> {
        self.inner
            .bundles
            .read()
            .values()
            .find(|b| b.location() == location)
            .cloned()
    }

    fn find_duplicate(
        &self,
        symbolic_name: &str,
        version: &semver::Version,
        exclude: Option<i64>,
    ) -> Option<i64> {
        self.inner
            .bundles
            .read()
            .values()
            .filter(|b| Some(b.id()) != exclude)
            .find(|b| {
                let archive = b.archive();
                archive.symbolic_name() == symbolic_name && archive.version() == version
            })
            .map(|b| b.id())
    }

    fn uninstalled(bundle_id: i64) -> FrameworkError {
        FrameworkError::IllegalState(format!("Bundle {} 已卸载", bundle_id))
    }

    fn publish_bundle(&self, bundle: &Bundle, event_type: BundleEventType) {
        let archive = bundle.archive();
        self.inner.dispatcher.publish_bundle(BundleEvent::new(
            event_type,
            bundle.id(),
            archive.symbolic_name(),
            archive.location(),
        ));
    }

    fn publish_framework(&self, event_type: FrameworkEventType, bundle_id: i64, message: impl Into<String>) {
        self.inner
            .dispatcher
            .publish_framework(FrameworkEvent::new(event_type, bundle_id, message));
    }
}

impl fmt::Debug for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Framework")
            .field("uuid", &self.inner.uuid)
            .field("state", &self.state())
            .field("bundles", &self.inner.bundles.read().len())
            .finish()
    }
}
