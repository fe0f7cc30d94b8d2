//! Bundle 上下文
//!
//! 每个启动中的 Bundle 持有一个上下文，通过它访问注册表和框架。
//! 上下文记录 Bundle 创建的注册、监听器和跟踪器，停止时由框架统一清理，
//! 不依赖 Bundle 自身代码的正确性。

use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::dispatcher::EventDispatcher;
use super::event::{BundleListener, EventListenerId, FrameworkListener};
use super::framework::{Framework, FrameworkInner, LifecycleOp, LifecycleRequest};
use crate::bundle::{BundleArchive, BundleInfo, BundleState};
use crate::service::{
    CleanupReport, ListenerId, ServiceListener, ServiceObject, ServiceReference,
    ServiceRegistration, ServiceRegistry, ServiceSource, ServiceTracker,
    ServiceTrackerCustomizer,
};
use crate::utils::{FrameworkError, Properties, Result};

/// 上下文创建的资源
#[derive(Default)]
struct ContextResources {
    registrations: Vec<ServiceRegistration>,
    service_listeners: Vec<ListenerId>,
    bundle_listeners: Vec<EventListenerId>,
    framework_listeners: Vec<EventListenerId>,
    trackers: Vec<ServiceTracker>,
}

struct ContextInner {
    bundle_id: i64,
    archive: Arc<BundleArchive>,
    registry: ServiceRegistry,
    dispatcher: EventDispatcher,
    properties: Arc<Properties>,
    lifecycle: mpsc::UnboundedSender<LifecycleRequest>,
    framework: Weak<FrameworkInner>,
    valid: AtomicBool,
    resources: Mutex<ContextResources>,
}

/// Bundle 上下文
///
/// 可克隆，克隆体共享同一份记录。Bundle 停止后上下文失效，
/// 之后的大多数操作返回 `IllegalState`。
#[derive(Clone)]
pub struct BundleContext {
    inner: Arc<ContextInner>,
}

impl BundleContext {
    pub(crate) fn new(framework: &Arc<FrameworkInner>, archive: Arc<BundleArchive>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                bundle_id: archive.id(),
                archive,
                registry: framework.registry.clone(),
                dispatcher: framework.dispatcher.clone(),
                properties: Arc::clone(&framework.properties),
                lifecycle: framework.lifecycle_tx.clone(),
                framework: Arc::downgrade(framework),
                valid: AtomicBool::new(true),
                resources: Mutex::new(ContextResources::default()),
            }),
        }
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(FrameworkError::IllegalState(format!(
                "Bundle {} 的上下文已失效",
                self.inner.bundle_id
            )))
        }
    }

    fn framework(&self) -> Result<Framework> {
        self.inner
            .framework
            .upgrade()
            .map(Framework::from_inner)
            .ok_or_else(|| FrameworkError::IllegalState("框架已释放".into()))
    }

    // ==================== 基本信息 ====================

    /// 所属 Bundle ID
    pub fn bundle_id(&self) -> i64 {
        self.inner.bundle_id
    }

    /// 上下文是否有效
    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::Acquire)
    }

    /// 框架属性
    pub fn get_property(&self, key: &str) -> Option<String> {
        self.inner.properties.get(key).map(str::to_string)
    }

    /// 所属 Bundle 的快照
    pub fn bundle(&self) -> Option<BundleInfo> {
        self.framework().ok()?.bundle(self.inner.bundle_id)
    }

    /// 全部已安装 Bundle 的快照
    pub fn bundles(&self) -> Result<Vec<BundleInfo>> {
        self.ensure_valid()?;
        Ok(self.framework()?.bundles())
    }

    /// 所属 Bundle 私有存储中的路径
    pub fn data_file(&self, path: &str) -> Result<PathBuf> {
        self.ensure_valid()?;
        self.inner.archive.data_file(path)
    }

    // ==================== 服务 ====================

    /// 注册服务
    ///
    /// # Errors
    ///
    /// 上下文失效时返回 `IllegalState`
    pub fn register_service(
        &self,
        name: &str,
        source: ServiceSource,
        properties: Properties,
    ) -> Result<ServiceRegistration> {
        self.ensure_valid()?;
        let registration =
            self.inner
                .registry
                .register_service(self.inner.bundle_id, name, source, properties)?;
        self.inner
            .resources
            .lock()
            .registrations
            .push(registration.clone());
        Ok(registration)
    }

    /// 注册普通服务对象
    pub fn register_object<T: Any + Send + Sync>(
        &self,
        name: &str,
        service: T,
        properties: Properties,
    ) -> Result<ServiceRegistration> {
        self.register_service(name, ServiceSource::object(service), properties)
    }

    /// 在阻塞线程池中注销服务
    ///
    /// 注销会等待在途的服务使用结束，异步代码（例如激活器）应使用此方法，
    /// 避免在运行时工作线程上阻塞。
    pub async fn unregister_service_async(&self, registration: ServiceRegistration) -> Result<()> {
        let service_id = registration.service_id();
        tokio::task::spawn_blocking(move || registration.unregister())
            .await
            .map_err(|e| {
                FrameworkError::Internal(format!("注销服务 {} 的任务失败: {}", service_id, e))
            })?
    }

    /// 排序最高的服务引用
    pub fn get_service_reference(&self, name: &str) -> Result<Option<ServiceReference>> {
        self.ensure_valid()?;
        Ok(self
            .inner
            .registry
            .get_service_reference(self.inner.bundle_id, name))
    }

    /// 按名称和/或过滤器查找服务引用
    pub fn get_service_references(
        &self,
        name: Option<&str>,
        filter: Option<&str>,
    ) -> Result<Vec<ServiceReference>> {
        self.ensure_valid()?;
        self.inner
            .registry
            .get_service_references(self.inner.bundle_id, name, filter)
    }

    /// 获取服务对象
    ///
    /// # Errors
    ///
    /// - 引用属于其他 Bundle 时返回 `IllegalArgument`
    /// - 服务已注销时返回 `ReferenceInvalidated`
    pub fn get_service(&self, reference: &ServiceReference) -> Result<ServiceObject> {
        self.ensure_valid()?;
        if reference.bundle_id() != self.inner.bundle_id {
            return Err(FrameworkError::IllegalArgument(format!(
                "服务引用属于 Bundle {}，不能由 Bundle {} 使用",
                reference.bundle_id(),
                self.inner.bundle_id
            )));
        }
        self.inner.registry.get_service(reference)
    }

    /// 获取服务对象并转换为具体类型
    pub fn get_service_as<T: Any + Send + Sync>(&self, reference: &ServiceReference) -> Result<Arc<T>> {
        let service = self.get_service(reference)?;
        match service.downcast::<T>() {
            Ok(typed) => Ok(typed),
            Err(_) => {
                self.inner.registry.unget_service(reference);
                Err(FrameworkError::IllegalArgument(format!(
                    "服务 {} 的类型不是 {}",
                    reference.service_id(),
                    std::any::type_name::<T>()
                )))
            }
        }
    }

    /// 释放服务对象
    pub fn unget_service(&self, reference: &ServiceReference) -> bool {
        self.inner.registry.unget_service(reference)
    }

    /// 添加服务监听器
    pub fn add_service_listener(
        &self,
        listener: ServiceListener,
        filter: Option<&str>,
    ) -> Result<ListenerId> {
        self.ensure_valid()?;
        let id = self
            .inner
            .registry
            .add_service_listener(self.inner.bundle_id, listener, filter)?;
        self.inner.resources.lock().service_listeners.push(id);
        Ok(id)
    }

    /// 移除服务监听器
    pub fn remove_service_listener(&self, id: ListenerId) -> bool {
        self.inner.resources.lock().service_listeners.retain(|l| *l != id);
        self.inner
            .registry
            .remove_service_listener(self.inner.bundle_id, id)
    }

    /// 在阻塞线程池中移除服务监听器，供异步代码使用
    pub async fn remove_service_listener_async(&self, id: ListenerId) -> bool {
        let context = self.clone();
        match tokio::task::spawn_blocking(move || context.remove_service_listener(id)).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(
                    bundle_id = self.inner.bundle_id,
                    listener_id = id,
                    error = %e,
                    "移除服务监听器的任务失败"
                );
                false
            }
        }
    }

    /// 创建并打开服务跟踪器
    pub fn track_services(
        &self,
        name: &str,
        filter: Option<&str>,
        customizer: Option<Arc<dyn ServiceTrackerCustomizer>>,
    ) -> Result<ServiceTracker> {
        self.ensure_valid()?;
        let tracker = ServiceTracker::new(
            self.inner.registry.clone(),
            self.inner.bundle_id,
            name,
            filter,
            customizer,
        )?;
        tracker.open()?;
        self.inner.resources.lock().trackers.push(tracker.clone());
        Ok(tracker)
    }

    // ==================== Bundle / 框架监听器 ====================

    /// 添加 Bundle 监听器
    pub fn add_bundle_listener(&self, listener: BundleListener) -> Result<EventListenerId> {
        self.ensure_valid()?;
        let id = self
            .inner
            .dispatcher
            .add_bundle_listener(self.inner.bundle_id, listener);
        self.inner.resources.lock().bundle_listeners.push(id);
        Ok(id)
    }

    /// 移除 Bundle 监听器
    pub fn remove_bundle_listener(&self, id: EventListenerId) -> bool {
        self.inner.resources.lock().bundle_listeners.retain(|l| *l != id);
        self.inner
            .dispatcher
            .remove_bundle_listener(self.inner.bundle_id, id)
    }

    /// 添加框架监听器
    pub fn add_framework_listener(&self, listener: FrameworkListener) -> Result<EventListenerId> {
        self.ensure_valid()?;
        let id = self
            .inner
            .dispatcher
            .add_framework_listener(self.inner.bundle_id, listener);
        self.inner.resources.lock().framework_listeners.push(id);
        Ok(id)
    }

    /// 移除框架监听器
    pub fn remove_framework_listener(&self, id: EventListenerId) -> bool {
        self.inner
            .resources
            .lock()
            .framework_listeners
            .retain(|l| *l != id);
        self.inner
            .dispatcher
            .remove_framework_listener(self.inner.bundle_id, id)
    }

    // ==================== 生命周期 ====================

    /// 安装 Bundle
    pub async fn install_bundle(&self, location: &str) -> Result<i64> {
        self.ensure_valid()?;
        self.framework()?.install_bundle(location).await
    }

    /// 启动 Bundle
    pub async fn start_bundle(&self, bundle_id: i64) -> Result<()> {
        self.ensure_valid()?;
        self.framework()?.start_bundle(bundle_id).await
    }

    /// 停止 Bundle
    pub async fn stop_bundle(&self, bundle_id: i64) -> Result<()> {
        self.ensure_valid()?;
        self.framework()?.stop_bundle(bundle_id).await
    }

    /// 卸载 Bundle
    pub async fn uninstall_bundle(&self, bundle_id: i64) -> Result<()> {
        self.ensure_valid()?;
        self.framework()?.uninstall_bundle(bundle_id).await
    }

    /// 查询 Bundle 状态
    pub fn bundle_state(&self, bundle_id: i64) -> Option<BundleState> {
        self.framework().ok()?.bundle_state(bundle_id)
    }

    /// 在生命周期工作任务中启动 Bundle
    ///
    /// 供同步回调（服务监听器、Bundle 监听器）使用，立即返回；
    /// 失败以 `FrameworkEvent::Error` 报告。
    pub fn schedule_start_bundle(&self, bundle_id: i64) -> Result<()> {
        self.schedule(bundle_id, LifecycleOp::Start)
    }

    /// 在生命周期工作任务中停止 Bundle
    pub fn schedule_stop_bundle(&self, bundle_id: i64) -> Result<()> {
        self.schedule(bundle_id, LifecycleOp::Stop)
    }

    /// 在生命周期工作任务中卸载 Bundle
    pub fn schedule_uninstall_bundle(&self, bundle_id: i64) -> Result<()> {
        self.schedule(bundle_id, LifecycleOp::Uninstall)
    }

    fn schedule(&self, bundle_id: i64, op: LifecycleOp) -> Result<()> {
        self.ensure_valid()?;
        debug!(from = self.inner.bundle_id, bundle_id, operation = %op, "提交生命周期请求");
        self.inner
            .lifecycle
            .send(LifecycleRequest::Run { bundle_id, op })
            .map_err(|_| FrameworkError::IllegalState("生命周期工作任务已退出".into()))
    }

    // ==================== 清理 ====================

    /// 使上下文失效并清理其记录的全部资源
    ///
    /// 仍然有效的注册说明 Bundle 没有自行注销，记为告警。
    /// 可能阻塞在注销等待上，调用方应在阻塞线程中执行。
    pub(crate) fn invalidate_and_cleanup(&self) -> CleanupReport {
        let bundle_id = self.inner.bundle_id;
        self.inner.valid.store(false, Ordering::Release);
        let resources = std::mem::take(&mut *self.inner.resources.lock());

        for tracker in resources.trackers {
            tracker.close();
        }
        for id in resources.service_listeners {
            self.inner.registry.remove_service_listener(bundle_id, id);
        }
        let event_listeners = self.inner.dispatcher.remove_all_listeners(bundle_id);

        let mut dangling = 0;
        for registration in resources.registrations {
            if registration.is_valid() {
                dangling += 1;
                warn!(
                    bundle_id,
                    service_id = registration.service_id(),
                    service_name = %registration.name(),
                    "Bundle 停止时未注销服务，强制注销"
                );
                if let Err(e) = registration.unregister() {
                    debug!(bundle_id, error = %e, "服务已被并发注销");
                }
            }
        }

        let mut report = self.inner.registry.cleanup_bundle(bundle_id);
        report.unregistered += dangling;
        info!(
            bundle_id,
            event_listeners,
            clean = report.is_clean(),
            "Bundle 上下文已清理"
        );
        report
    }
}

impl fmt::Debug for BundleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleContext")
            .field("bundle_id", &self.inner.bundle_id)
            .field("valid", &self.is_valid())
            .finish()
    }
}
