//! 服务注册表
//!
//! 负责服务的发布、查找、使用计数以及服务事件的扇出。
//!
//! # 锁与回调
//!
//! 注册表、各 Bundle 的引用表、监听器与钩子列表都位于同一把读写锁之下。
//! 事件投递遵循“锁内快照，锁外回调”：在写锁内选出匹配的监听器，释放锁后
//! 再逐个调用。每次回调前才为监听器使用计数加一，回调结束即减一，因此同一
//! 批次中尚未轮到的事件不占用计数，监听器回调可以安全地重入注册表（注册、
//! 注销、移除自身或同批次的其他监听器）。
//!
//! # 注销顺序
//!
//! 投递 REGISTERED 前先为注册的 `pending_register_events` 加一，再检查注册
//! 是否仍然有效；注销方先切换状态，再等待该计数归零后投递 UNREGISTERING。
//! 两侧都经过计数器的互斥锁，所以任一 REGISTERED 要么在等待结束前投递完毕，
//! 要么看到注销状态而被跳过，同一监听器不会在 UNREGISTERING 之后再收到
//! 同一服务的 REGISTERED。移除监听器使用同样的“先占用再检查”顺序。

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, error, info, trace, warn};

use super::event::{
    ListenerHook, ListenerId, ListenerInfo, ServiceEvent, ServiceEventType, ServiceListener,
    ServiceObject, ServiceSource, LISTENER_HOOK_SERVICE,
};
use super::filter::Filter;
use super::reference::{RefTarget, ReferenceInner, ServiceReference};
use super::registration::{RegistrationInner, ServiceRegistration};
use super::usage::{Counted, InUse, UseCounter, WaitPolicy};
use crate::utils::{FrameworkError, Properties, Result};

// ==================== 投递上下文 ====================

#[derive(Default)]
struct Delivering {
    listeners: Vec<ListenerId>,
    /// 正在投递的 REGISTERED 事件所属服务，其他事件为 `None`
    registered: Vec<Option<i64>>,
}

thread_local! {
    static DELIVERING: RefCell<Delivering> = RefCell::new(Delivering::default());
}

/// 当前线程正在执行的一次监听器回调
struct DeliveryScope;

impl DeliveryScope {
    fn enter(listener: ListenerId, registered: Option<i64>) -> Self {
        DELIVERING.with(|d| {
            let mut d = d.borrow_mut();
            d.listeners.push(listener);
            d.registered.push(registered);
        });
        DeliveryScope
    }

    /// 当前线程调用栈上该监听器的嵌套层数
    fn listener_depth(listener: ListenerId) -> usize {
        DELIVERING.with(|d| d.borrow().listeners.iter().filter(|&&l| l == listener).count())
    }

    /// 当前线程调用栈上该服务 REGISTERED 回调的嵌套层数
    fn registered_depth(service_id: i64) -> usize {
        DELIVERING.with(|d| {
            d.borrow()
                .registered
                .iter()
                .filter(|&&s| s == Some(service_id))
                .count()
        })
    }
}

impl Drop for DeliveryScope {
    fn drop(&mut self) {
        DELIVERING.with(|d| {
            let mut d = d.borrow_mut();
            d.listeners.pop();
            d.registered.pop();
        });
    }
}

// ==================== 内部条目 ====================

pub(crate) struct ListenerEntry {
    id: ListenerId,
    bundle_id: i64,
    filter: Option<Filter>,
    filter_text: Option<String>,
    callback: ServiceListener,
    in_use: UseCounter,
    removed: AtomicBool,
}

impl ListenerEntry {
    fn matches(&self, props: &Properties) -> bool {
        self.filter.as_ref().map(|f| f.matches(props)).unwrap_or(true)
    }

    fn info(&self, removed: bool) -> ListenerInfo {
        ListenerInfo {
            listener_id: self.id,
            bundle_id: self.bundle_id,
            filter: self.filter_text.clone(),
            removed,
        }
    }
}

pub(crate) struct HookEntry {
    service_id: i64,
    hook: Arc<dyn ListenerHook>,
    in_use: UseCounter,
}

impl Counted for HookEntry {
    fn use_counter(&self) -> &UseCounter {
        &self.in_use
    }
}

type ReferenceTable = HashMap<i64, HashMap<i64, Arc<ReferenceInner>>>;

#[derive(Default)]
struct RegistryTables {
    /// 提供方 Bundle → 注册列表
    registrations: HashMap<i64, Vec<Arc<RegistrationInner>>>,
    /// 消费方 Bundle → (服务 ID → 引用)
    references: ReferenceTable,
    listeners: Vec<Arc<ListenerEntry>>,
    hooks: Vec<Arc<HookEntry>>,
}

/// 一次待投递的服务事件，锁外执行
struct Delivery {
    listener: Arc<ListenerEntry>,
    registration: Arc<RegistrationInner>,
    event: ServiceEvent,
}

/// 强制回收的遗留使用：(消费方, 注册, 服务对象)
type Leftover = (i64, Arc<RegistrationInner>, Option<ServiceObject>);

/// Bundle 清理结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    /// 被强制注销的服务数
    pub unregistered: usize,
    /// 被移除的监听器数
    pub listeners_removed: usize,
    /// 被释放的引用数
    pub references_released: usize,
    /// 其中仍在使用中的引用数
    pub services_in_use: usize,
}

impl CleanupReport {
    /// 是否存在遗留资源
    pub fn is_clean(&self) -> bool {
        *self == CleanupReport::default()
    }
}

// ==================== 共享状态 ====================

pub(crate) struct RegistryShared {
    tables: RwLock<RegistryTables>,
    next_service_id: AtomicI64,
    next_listener_id: AtomicU64,
    wait_policy: WaitPolicy,
    self_ref: Weak<RegistryShared>,
}

impl RegistryShared {
    fn reference_for(
        &self,
        references: &mut ReferenceTable,
        bundle_id: i64,
        registration: &Arc<RegistrationInner>,
    ) -> ServiceReference {
        let inner = references
            .entry(bundle_id)
            .or_default()
            .entry(registration.service_id)
            .or_insert_with(|| Arc::new(ReferenceInner::new(bundle_id, Arc::clone(registration))));
        ServiceReference::retain(inner, self.self_ref.clone())
    }

    /// 在写锁内为匹配的监听器生成待投递事件
    fn snapshot_listeners(
        &self,
        tables: &mut RegistryTables,
        registration: &Arc<RegistrationInner>,
        decide: impl Fn(&ListenerEntry) -> Option<ServiceEventType>,
    ) -> Vec<Delivery> {
        let RegistryTables {
            listeners,
            references,
            ..
        } = tables;

        let mut deliveries = Vec::new();
        for listener in listeners.iter() {
            if let Some(event_type) = decide(listener) {
                let reference = self.reference_for(references, listener.bundle_id, registration);
                deliveries.push(Delivery {
                    listener: Arc::clone(listener),
                    registration: Arc::clone(registration),
                    event: ServiceEvent {
                        event_type,
                        reference,
                    },
                });
            }
        }
        deliveries
    }

    fn deliver(&self, deliveries: Vec<Delivery>) {
        for Delivery {
            listener,
            registration,
            event,
        } in deliveries
        {
            let _listener_use = listener.in_use.enter();
            if listener.removed.load(Ordering::Acquire) {
                continue;
            }
            let registered = event.event_type == ServiceEventType::Registered;
            let _pending = if registered {
                let share = registration.pending_register_events.enter();
                if !registration.is_valid() {
                    trace!(
                        listener_id = listener.id,
                        service_id = registration.service_id,
                        "服务已进入注销流程，跳过 REGISTERED"
                    );
                    continue;
                }
                Some(share)
            } else {
                None
            };
            trace!(
                listener_id = listener.id,
                service_id = event.service_id(),
                event = %event.event_type,
                "投递服务事件"
            );
            let _scope =
                DeliveryScope::enter(listener.id, registered.then_some(registration.service_id));
            let result = panic::catch_unwind(AssertUnwindSafe(|| (listener.callback)(&event)));
            if result.is_err() {
                error!(
                    listener_id = listener.id,
                    bundle_id = listener.bundle_id,
                    service_id = event.service_id(),
                    event = %event.event_type,
                    "服务监听器回调发生 panic，已跳过"
                );
            }
        }
    }

    fn call_hooks(hooks: Vec<InUse<HookEntry>>, infos: &[ListenerInfo], added: bool) {
        if infos.is_empty() {
            return;
        }
        for hook in hooks {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                if added {
                    hook.hook.added(infos)
                } else {
                    hook.hook.removed(infos)
                }
            }));
            if result.is_err() {
                error!(service_id = hook.service_id, "监听器钩子发生 panic，已跳过");
            }
        }
    }

    fn registration_handle(&self, inner: &Arc<RegistrationInner>) -> ServiceRegistration {
        ServiceRegistration::new(Arc::clone(inner), self.self_ref.clone())
    }

    /// 回收一次遗留的服务使用
    fn release_leftover(&self, (bundle_id, registration, service): Leftover) {
        if let (ServiceSource::Factory(factory), Some(service)) = (&registration.source, service) {
            let handle = self.registration_handle(&registration);
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                factory.unget_service(bundle_id, &handle, service)
            }));
            if result.is_err() {
                error!(
                    bundle_id,
                    service_id = registration.service_id,
                    "服务工厂回收服务时发生 panic"
                );
            }
        }
        registration.usage.decrement();
    }

    // ==================== 注册 ====================

    fn register(
        &self,
        bundle_id: i64,
        name: &str,
        source: ServiceSource,
        properties: Properties,
    ) -> Result<ServiceRegistration> {
        if name.trim().is_empty() {
            return Err(FrameworkError::IllegalArgument("服务名不能为空".to_string()));
        }
        let is_hook = matches!(source, ServiceSource::ListenerHook(_));
        if is_hook != (name == LISTENER_HOOK_SERVICE) {
            return Err(FrameworkError::IllegalArgument(format!(
                "服务名 '{}' 只能用于监听器钩子",
                LISTENER_HOOK_SERVICE
            )));
        }

        let service_id = self.next_service_id.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::new(RegistrationInner::new(
            service_id,
            name.to_string(),
            bundle_id,
            source,
            properties,
        ));

        let (deliveries, hook_call) = {
            let mut tables = self.tables.write();
            let list = tables.registrations.entry(bundle_id).or_default();
            list.try_reserve(1).map_err(|e| {
                FrameworkError::OutOfMemory(format!("注册服务 '{}' 失败: {}", name, e))
            })?;
            list.push(Arc::clone(&inner));

            let props = inner.properties.read().clone();
            let deliveries = self.snapshot_listeners(&mut tables, &inner, |l| {
                l.matches(&props).then_some(ServiceEventType::Registered)
            });

            let hook_call = match &inner.source {
                ServiceSource::ListenerHook(hook) => {
                    let entry = Arc::new(HookEntry {
                        service_id,
                        hook: Arc::clone(hook),
                        in_use: UseCounter::new(),
                    });
                    tables.hooks.push(Arc::clone(&entry));
                    let infos: Vec<ListenerInfo> =
                        tables.listeners.iter().map(|l| l.info(false)).collect();
                    Some((InUse::acquire(&entry), infos))
                }
                _ => None,
            };
            (deliveries, hook_call)
        };

        info!(
            service_id,
            service_name = name,
            bundle_id,
            listeners = deliveries.len(),
            "服务已注册"
        );
        self.deliver(deliveries);

        if let Some((hook, infos)) = hook_call {
            Self::call_hooks(vec![hook], &infos, true);
        }

        Ok(self.registration_handle(&inner))
    }

    pub(crate) fn unregister(&self, inner: &Arc<RegistrationInner>) -> Result<()> {
        let service_id = inner.service_id;

        let (deliveries, hook_entry) = {
            let mut tables = self.tables.write();
            if !inner.begin_unregister() {
                return Err(FrameworkError::IllegalState(format!(
                    "服务已注销: service.id={}",
                    service_id
                )));
            }

            if let Some(list) = tables.registrations.get_mut(&inner.bundle_id) {
                list.retain(|r| !Arc::ptr_eq(r, inner));
                if list.is_empty() {
                    tables.registrations.remove(&inner.bundle_id);
                }
            }

            let hook_entry = match tables.hooks.iter().position(|h| h.service_id == service_id) {
                Some(pos) => Some(tables.hooks.remove(pos)),
                None => None,
            };

            let props = inner.properties.read().clone();
            let deliveries = self.snapshot_listeners(&mut tables, inner, |l| {
                l.matches(&props).then_some(ServiceEventType::Unregistering)
            });
            (deliveries, hook_entry)
        };

        let policy = self.wait_policy;
        inner.pending_register_events.wait_until(
            DeliveryScope::registered_depth(service_id),
            &policy,
            "REGISTERED 事件投递",
        );

        debug!(service_id, listeners = deliveries.len(), "投递 UNREGISTERING 事件");
        self.deliver(deliveries);

        inner.usage.wait_until(0, &policy, "服务使用计数");

        let leftovers: Vec<Leftover> = {
            let mut tables = self.tables.write();
            inner.finish_unregister();
            let mut leftovers = Vec::new();
            for refs in tables.references.values_mut() {
                if let Some(reference) = refs.remove(&service_id) {
                    if let Some((registration, usage, service)) = reference.invalidate() {
                        if usage > 0 {
                            leftovers.push((reference.bundle_id, registration, service));
                        }
                    }
                }
            }
            tables.references.retain(|_, refs| !refs.is_empty());
            leftovers
        };

        for leftover in leftovers {
            warn!(
                service_id,
                consumer_bundle_id = leftover.0,
                "服务注销时消费方仍在使用，强制回收"
            );
            self.release_leftover(leftover);
        }

        if let Some(hook) = hook_entry {
            hook.in_use.wait_until(0, &policy, "监听器钩子");
        }

        info!(service_id, service_name = %inner.name, bundle_id = inner.bundle_id, "服务已注销");
        Ok(())
    }

    pub(crate) fn set_properties(
        &self,
        inner: &Arc<RegistrationInner>,
        properties: Properties,
    ) -> Result<()> {
        let deliveries = {
            let mut tables = self.tables.write();
            if !inner.is_valid() {
                return Err(FrameworkError::IllegalState(format!(
                    "服务已注销: service.id={}",
                    inner.service_id
                )));
            }
            let old = inner.replace_properties(properties);
            let new = inner.properties.read().clone();
            self.snapshot_listeners(&mut tables, inner, |l| {
                if l.matches(&new) {
                    Some(ServiceEventType::Modified)
                } else if l.matches(&old) {
                    Some(ServiceEventType::ModifiedEndMatch)
                } else {
                    None
                }
            })
        };

        debug!(service_id = inner.service_id, listeners = deliveries.len(), "服务属性已更新");
        self.deliver(deliveries);
        Ok(())
    }

    // ==================== 引用 ====================

    pub(crate) fn release_reference(&self, inner: &Arc<ReferenceInner>) {
        let leftover = {
            let mut tables = self.tables.write();
            let mut state = inner.state.lock();
            if state.reference_count != 0 {
                return;
            }
            let Some(refs) = tables.references.get_mut(&inner.bundle_id) else {
                return;
            };
            match refs.get(&inner.service_id) {
                Some(existing) if Arc::ptr_eq(existing, inner) => {
                    refs.remove(&inner.service_id);
                }
                _ => return,
            }
            if refs.is_empty() {
                tables.references.remove(&inner.bundle_id);
            }

            if state.usage_count > 0 {
                state.usage_count = 0;
                let service = state.service.take();
                match &state.target {
                    RefTarget::Active(reg) => Some((inner.bundle_id, Arc::clone(reg), service)),
                    RefTarget::Invalidated => None,
                }
            } else {
                None
            }
        };

        trace!(
            bundle_id = inner.bundle_id,
            service_id = inner.service_id,
            "服务引用已释放"
        );
        if let Some(leftover) = leftover {
            debug!(
                bundle_id = inner.bundle_id,
                service_id = inner.service_id,
                "引用释放时服务仍在使用，自动回收"
            );
            self.release_leftover(leftover);
        }
    }

    fn get_service(&self, reference: &ServiceReference) -> Result<ServiceObject> {
        let inner = &reference.inner;
        let invalidated = || FrameworkError::ReferenceInvalidated {
            service_id: inner.service_id,
        };

        let _get = inner.get_lock.lock();
        let registration = {
            let mut state = inner.state.lock();
            let registration = match &state.target {
                RefTarget::Active(reg) if reg.is_usable() => Arc::clone(reg),
                _ => return Err(invalidated()),
            };
            if state.usage_count > 0 {
                if let Some(service) = state.service.clone() {
                    state.usage_count += 1;
                    return Ok(service);
                }
            }
            registration
        };

        let service: ServiceObject = match &registration.source {
            ServiceSource::Object(object) => Arc::clone(object),
            ServiceSource::ListenerHook(hook) => Arc::new(Arc::clone(hook)),
            ServiceSource::Factory(factory) => {
                let handle = self.registration_handle(&registration);
                let created = panic::catch_unwind(AssertUnwindSafe(|| {
                    factory.get_service(inner.bundle_id, &handle)
                }));
                match created {
                    Ok(Ok(service)) => service,
                    Ok(Err(e)) => {
                        return Err(FrameworkError::Other(e.context(format!(
                            "服务工厂创建服务失败: service.id={}",
                            inner.service_id
                        ))))
                    }
                    Err(_) => {
                        return Err(FrameworkError::Internal(format!(
                            "服务工厂发生 panic: service.id={}",
                            inner.service_id
                        )))
                    }
                }
            }
        };

        let mut state = inner.state.lock();
        let still_usable = matches!(&state.target, RefTarget::Active(reg) if reg.is_usable());
        if !still_usable {
            drop(state);
            self.release_leftover((inner.bundle_id, registration, Some(service)));
            return Err(invalidated());
        }
        state.usage_count = 1;
        state.service = Some(Arc::clone(&service));
        registration.usage.increment();
        trace!(
            bundle_id = inner.bundle_id,
            service_id = inner.service_id,
            "服务首次被获取"
        );
        Ok(service)
    }

    fn unget_service(&self, reference: &ServiceReference) -> bool {
        let inner = &reference.inner;
        let leftover = {
            let mut state = inner.state.lock();
            if state.usage_count == 0 {
                return false;
            }
            state.usage_count -= 1;
            if state.usage_count > 0 {
                return true;
            }
            let service = state.service.take();
            match &state.target {
                RefTarget::Active(reg) => (inner.bundle_id, Arc::clone(reg), service),
                RefTarget::Invalidated => return true,
            }
        };
        self.release_leftover(leftover);
        true
    }

    // ==================== 监听器 ====================

    fn add_listener(
        &self,
        bundle_id: i64,
        callback: ServiceListener,
        filter: Option<&str>,
    ) -> Result<ListenerId> {
        let parsed = filter.map(Filter::parse).transpose()?;
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let entry = Arc::new(ListenerEntry {
            id,
            bundle_id,
            filter: parsed,
            filter_text: filter.map(str::to_string),
            callback,
            in_use: UseCounter::new(),
            removed: AtomicBool::new(false),
        });

        let (deliveries, hooks) = {
            let mut tables = self.tables.write();
            tables.listeners.push(Arc::clone(&entry));
            let hooks: Vec<InUse<HookEntry>> = tables.hooks.iter().map(InUse::acquire).collect();

            let RegistryTables {
                registrations,
                references,
                ..
            } = &mut *tables;
            let mut existing: Vec<&Arc<RegistrationInner>> = registrations
                .values()
                .flatten()
                .filter(|r| r.is_valid())
                .collect();
            existing.sort_by_key(|r| r.service_id);

            let mut deliveries = Vec::new();
            for registration in existing {
                if !entry.matches(&registration.properties.read()) {
                    continue;
                }
                deliveries.push(Delivery {
                    listener: Arc::clone(&entry),
                    registration: Arc::clone(registration),
                    event: ServiceEvent {
                        event_type: ServiceEventType::Registered,
                        reference: self.reference_for(references, bundle_id, registration),
                    },
                });
            }
            (deliveries, hooks)
        };

        debug!(
            listener_id = id,
            bundle_id,
            filter = filter.unwrap_or(""),
            replayed = deliveries.len(),
            "服务监听器已添加"
        );
        Self::call_hooks(hooks, &[entry.info(false)], true);
        self.deliver(deliveries);
        Ok(id)
    }

    fn remove_listener(&self, bundle_id: i64, listener_id: ListenerId) -> bool {
        let (entry, hooks) = {
            let mut tables = self.tables.write();
            let Some(pos) = tables
                .listeners
                .iter()
                .position(|l| l.id == listener_id && l.bundle_id == bundle_id)
            else {
                return false;
            };
            let entry = tables.listeners.remove(pos);
            entry.removed.store(true, Ordering::Release);
            let hooks: Vec<InUse<HookEntry>> = tables.hooks.iter().map(InUse::acquire).collect();
            (entry, hooks)
        };

        Self::call_hooks(hooks, &[entry.info(true)], false);
        entry.in_use.wait_until(
            DeliveryScope::listener_depth(listener_id),
            &self.wait_policy,
            "服务监听器",
        );
        debug!(listener_id, bundle_id, "服务监听器已移除");
        true
    }

    // ==================== Bundle 清理 ====================

    fn cleanup_bundle(&self, bundle_id: i64) -> CleanupReport {
        let mut report = CleanupReport::default();

        let registrations: Vec<Arc<RegistrationInner>> = self
            .tables
            .read()
            .registrations
            .get(&bundle_id)
            .cloned()
            .unwrap_or_default();
        for registration in registrations {
            warn!(
                bundle_id,
                service_id = registration.service_id,
                service_name = %registration.name,
                "Bundle 停止时仍有未注销的服务，强制注销"
            );
            if self.unregister(&registration).is_ok() {
                report.unregistered += 1;
            }
        }

        let listener_ids: Vec<ListenerId> = self
            .tables
            .read()
            .listeners
            .iter()
            .filter(|l| l.bundle_id == bundle_id)
            .map(|l| l.id)
            .collect();
        for listener_id in listener_ids {
            warn!(bundle_id, listener_id, "Bundle 停止时仍有未移除的服务监听器");
            if self.remove_listener(bundle_id, listener_id) {
                report.listeners_removed += 1;
            }
        }

        let leftovers: Vec<Leftover> = {
            let mut tables = self.tables.write();
            let refs = tables.references.remove(&bundle_id).unwrap_or_default();
            report.references_released = refs.len();
            refs.into_values()
                .filter_map(|reference| reference.invalidate())
                .filter(|(_, usage, _)| *usage > 0)
                .map(|(registration, _, service)| (bundle_id, registration, service))
                .collect()
        };
        report.services_in_use = leftovers.len();
        for leftover in leftovers {
            warn!(
                bundle_id,
                service_id = leftover.1.service_id,
                "Bundle 停止时仍在使用服务，强制回收"
            );
            self.release_leftover(leftover);
        }

        if !report.is_clean() {
            info!(bundle_id, ?report, "Bundle 注册表资源已清理");
        }
        report
    }
}

// ==================== 公共接口 ====================

/// 服务注册表
///
/// 可廉价克隆，克隆体共享同一份状态。
#[derive(Clone)]
pub struct ServiceRegistry {
    shared: Arc<RegistryShared>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    /// 使用默认等待策略创建注册表
    pub fn new() -> Self {
        Self::with_wait_policy(WaitPolicy::default())
    }

    /// 指定注销等待策略创建注册表
    pub fn with_wait_policy(wait_policy: WaitPolicy) -> Self {
        let shared = Arc::new_cyclic(|weak| RegistryShared {
            tables: RwLock::new(RegistryTables::default()),
            next_service_id: AtomicI64::new(1),
            next_listener_id: AtomicU64::new(1),
            wait_policy,
            self_ref: weak.clone(),
        });
        Self { shared }
    }

    /// 当前等待策略
    pub fn wait_policy(&self) -> WaitPolicy {
        self.shared.wait_policy
    }

    /// 注册服务
    ///
    /// 同步向所有匹配的监听器投递 REGISTERED 事件后返回。
    ///
    /// # Arguments
    ///
    /// * `bundle_id` - 提供方 Bundle
    /// * `name` - 服务名
    /// * `source` - 服务对象或服务工厂
    /// * `properties` - 服务属性（保留属性由注册表覆盖）
    ///
    /// # Errors
    ///
    /// 服务名为空时返回 `IllegalArgument`，内存分配失败时返回 `OutOfMemory`
    pub fn register_service(
        &self,
        bundle_id: i64,
        name: &str,
        source: ServiceSource,
        properties: Properties,
    ) -> Result<ServiceRegistration> {
        self.shared.register(bundle_id, name, source, properties)
    }

    /// 注册监听器钩子
    pub fn register_listener_hook(
        &self,
        bundle_id: i64,
        hook: Arc<dyn ListenerHook>,
        properties: Properties,
    ) -> Result<ServiceRegistration> {
        self.shared.register(
            bundle_id,
            LISTENER_HOOK_SERVICE,
            ServiceSource::ListenerHook(hook),
            properties,
        )
    }

    /// 注销服务
    ///
    /// 依次：标记无效并移出注册表 → 等待在途 REGISTERED 投递 → 投递
    /// UNREGISTERING → 等待使用计数归零 → 使全部引用失效。
    pub fn unregister_service(&self, registration: &ServiceRegistration) -> Result<()> {
        self.shared.unregister(&registration.inner)
    }

    /// 查找服务引用
    ///
    /// 结果按 `service.ranking` 降序、服务 ID 升序排列。
    ///
    /// # Errors
    ///
    /// 过滤器格式错误时返回 `IllegalArgument`
    pub fn get_service_references(
        &self,
        bundle_id: i64,
        name: Option<&str>,
        filter: Option<&str>,
    ) -> Result<Vec<ServiceReference>> {
        let parsed = filter.map(Filter::parse).transpose()?;
        let mut matches: Vec<Arc<RegistrationInner>> = {
            let tables = self.shared.tables.read();
            tables
                .registrations
                .values()
                .flatten()
                .filter(|r| r.is_valid())
                .filter(|r| name.map(|n| r.name == n).unwrap_or(true))
                .filter(|r| {
                    parsed
                        .as_ref()
                        .map(|f| f.matches(&r.properties.read()))
                        .unwrap_or(true)
                })
                .cloned()
                .collect()
        };
        matches.sort_by_key(|r| (std::cmp::Reverse(r.ranking()), r.service_id));

        let mut references = Vec::with_capacity(matches.len());
        for registration in matches {
            let mut tables = self.shared.tables.write();
            if !registration.is_valid() {
                continue;
            }
            references.push(self.shared.reference_for(
                &mut tables.references,
                bundle_id,
                &registration,
            ));
        }
        Ok(references)
    }

    /// 查找排序最高的服务引用
    pub fn get_service_reference(&self, bundle_id: i64, name: &str) -> Option<ServiceReference> {
        let best = {
            let tables = self.shared.tables.read();
            tables
                .registrations
                .values()
                .flatten()
                .filter(|r| r.is_valid() && r.name == name)
                .min_by_key(|r| (std::cmp::Reverse(r.ranking()), r.service_id))
                .cloned()
        }?;

        let mut tables = self.shared.tables.write();
        if !best.is_valid() {
            return None;
        }
        Some(
            self.shared
                .reference_for(&mut tables.references, bundle_id, &best),
        )
    }

    /// 获取服务对象
    ///
    /// 使用计数加一；对服务工厂，每个消费方首次获取时调用工厂创建对象。
    ///
    /// # Errors
    ///
    /// 服务已被注销时返回 `ReferenceInvalidated`
    pub fn get_service(&self, reference: &ServiceReference) -> Result<ServiceObject> {
        self.shared.get_service(reference)
    }

    /// 释放一次服务使用，返回该引用此前是否处于使用中
    pub fn unget_service(&self, reference: &ServiceReference) -> bool {
        self.shared.unget_service(reference)
    }

    /// 添加服务监听器
    ///
    /// 返回前会为已存在的匹配服务同步投递 REGISTERED 事件。
    ///
    /// # Errors
    ///
    /// 过滤器格式错误时返回 `IllegalArgument`，此时不会注册任何内容
    pub fn add_service_listener(
        &self,
        bundle_id: i64,
        listener: ServiceListener,
        filter: Option<&str>,
    ) -> Result<ListenerId> {
        self.shared.add_listener(bundle_id, listener, filter)
    }

    /// 移除服务监听器
    ///
    /// 等待该监听器的在途回调结束后返回；在监听器自身回调内调用也是安全的。
    pub fn remove_service_listener(&self, bundle_id: i64, listener_id: ListenerId) -> bool {
        self.shared.remove_listener(bundle_id, listener_id)
    }

    /// 清理 Bundle 在注册表中遗留的全部资源
    pub fn cleanup_bundle(&self, bundle_id: i64) -> CleanupReport {
        self.shared.cleanup_bundle(bundle_id)
    }

    // ==================== 查询 ====================

    /// Bundle 注册的有效服务
    pub fn registered_services(&self, bundle_id: i64) -> Vec<ServiceRegistration> {
        let tables = self.shared.tables.read();
        tables
            .registrations
            .get(&bundle_id)
            .map(|list| {
                list.iter()
                    .filter(|r| r.is_valid())
                    .map(|r| self.shared.registration_handle(r))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Bundle 正在使用的服务 ID
    pub fn services_in_use(&self, bundle_id: i64) -> Vec<i64> {
        let tables = self.shared.tables.read();
        let mut ids: Vec<i64> = tables
            .references
            .get(&bundle_id)
            .map(|refs| {
                refs.values()
                    .filter(|r| r.state.lock().usage_count > 0)
                    .map(|r| r.service_id)
                    .collect()
            })
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// 有效注册总数
    pub fn registration_count(&self) -> usize {
        self.shared
            .tables
            .read()
            .registrations
            .values()
            .map(|list| list.iter().filter(|r| r.is_valid()).count())
            .sum()
    }

    /// 服务监听器总数
    pub fn listener_count(&self) -> usize {
        self.shared.tables.read().listeners.len()
    }

    /// 监听器钩子总数
    pub fn hook_count(&self) -> usize {
        self.shared.tables.read().hooks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::event::{downcast_service, ServiceFactory};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn registry() -> ServiceRegistry {
        ServiceRegistry::with_wait_policy(WaitPolicy {
            warn_interval: Duration::from_millis(20),
            max_wait: Some(Duration::from_millis(200)),
        })
    }

    fn recorder() -> (ServiceListener, Arc<Mutex<Vec<(ServiceEventType, i64)>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let listener: ServiceListener = Arc::new(move |event: &ServiceEvent| {
            sink.lock().push((event.event_type, event.service_id()));
        });
        (listener, events)
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = registry();
        let reg = registry
            .register_service(1, "org.chips.Foo", ServiceSource::object(5u32), Properties::new())
            .unwrap();
        assert_eq!(reg.service_id(), 1);
        assert_eq!(registry.registration_count(), 1);

        let reference = registry.get_service_reference(2, "org.chips.Foo").unwrap();
        assert_eq!(reference.provider_bundle_id(), Some(1));
        assert_eq!(reference.property("objectClass").as_deref(), Some("org.chips.Foo"));

        let service = registry.get_service(&reference).unwrap();
        assert_eq!(downcast_service::<u32>(service).as_deref(), Some(&5));
        assert_eq!(reference.usage_count(), 1);
        assert_eq!(registry.services_in_use(2), vec![1]);
        assert!(registry.unget_service(&reference));
        assert!(!registry.unget_service(&reference));
    }

    #[test]
    fn test_empty_name_rejected() {
        let registry = registry();
        let err = registry
            .register_service(1, " ", ServiceSource::object(()), Properties::new())
            .unwrap_err();
        assert!(matches!(err, FrameworkError::IllegalArgument(_)));
    }

    #[test]
    fn test_references_are_deduplicated_per_bundle() {
        let registry = registry();
        registry
            .register_service(1, "Foo", ServiceSource::object(()), Properties::new())
            .unwrap();

        let first = registry.get_service_reference(2, "Foo").unwrap();
        let second = registry.get_service_reference(2, "Foo").unwrap();
        assert!(first.ptr_eq(&second));
        assert_eq!(first.reference_count(), 2);

        let other_bundle = registry.get_service_reference(3, "Foo").unwrap();
        assert!(!first.ptr_eq(&other_bundle));

        drop(second);
        assert_eq!(first.reference_count(), 1);
        drop(first);
        let fresh = registry.get_service_reference(2, "Foo").unwrap();
        assert_eq!(fresh.reference_count(), 1);
    }

    #[test]
    fn test_ranking_orders_results() {
        let registry = registry();
        let low = registry
            .register_service(1, "Foo", ServiceSource::object(()), Properties::new())
            .unwrap();
        let high = registry
            .register_service(
                1,
                "Foo",
                ServiceSource::object(()),
                Properties::new().with("service.ranking", "10"),
            )
            .unwrap();

        let refs = registry.get_service_references(2, Some("Foo"), None).unwrap();
        let ids: Vec<i64> = refs.iter().map(|r| r.service_id()).collect();
        assert_eq!(ids, vec![high.service_id(), low.service_id()]);
        assert_eq!(
            registry.get_service_reference(2, "Foo").unwrap().service_id(),
            high.service_id()
        );
    }

    #[test]
    fn test_invalid_filter_rejected_without_registering() {
        let registry = registry();
        let (listener, _) = recorder();
        let err = registry
            .add_service_listener(1, listener, Some("(k=v"))
            .unwrap_err();
        assert!(matches!(err, FrameworkError::IllegalArgument(_)));
        assert_eq!(registry.listener_count(), 0);
    }

    #[test]
    fn test_listener_replay_delivers_existing_registration() {
        let registry = registry();
        let reg = registry
            .register_service(1, "Foo", ServiceSource::object(()), Properties::new().with("k", "v"))
            .unwrap();
        registry
            .register_service(1, "Bar", ServiceSource::object(()), Properties::new().with("k", "w"))
            .unwrap();

        let (listener, events) = recorder();
        registry.add_service_listener(2, listener, Some("(k=v)")).unwrap();
        assert_eq!(
            *events.lock(),
            vec![(ServiceEventType::Registered, reg.service_id())]
        );
    }

    #[test]
    fn test_modified_and_endmatch_events() {
        let registry = registry();
        let reg = registry
            .register_service(1, "Foo", ServiceSource::object(()), Properties::new().with("k", "v"))
            .unwrap();
        let (listener, events) = recorder();
        registry.add_service_listener(2, listener, Some("(k=v)")).unwrap();

        reg.set_properties(Properties::new().with("k", "v").with("x", "1"))
            .unwrap();
        reg.set_properties(Properties::new().with("k", "other")).unwrap();
        reg.set_properties(Properties::new().with("k", "still-other"))
            .unwrap();

        let types: Vec<ServiceEventType> = events.lock().iter().map(|(t, _)| *t).collect();
        assert_eq!(
            types,
            vec![
                ServiceEventType::Registered,
                ServiceEventType::Modified,
                ServiceEventType::ModifiedEndMatch,
            ]
        );
        assert_eq!(reg.properties().get("service.id"), Some("1"));
    }

    #[test]
    fn test_unregister_delivers_unregistering_and_invalidates() {
        let registry = registry();
        let reg = registry
            .register_service(1, "Foo", ServiceSource::object(()), Properties::new())
            .unwrap();
        let reference = registry.get_service_reference(2, "Foo").unwrap();
        let (listener, events) = recorder();
        registry.add_service_listener(3, listener, None).unwrap();

        reg.unregister().unwrap();
        assert!(!reg.is_valid());
        assert!(!reference.is_valid());
        assert!(matches!(
            registry.get_service(&reference),
            Err(FrameworkError::ReferenceInvalidated { service_id: 1 })
        ));
        assert!(matches!(reg.unregister(), Err(FrameworkError::IllegalState(_))));
        assert_eq!(
            *events.lock(),
            vec![
                (ServiceEventType::Registered, 1),
                (ServiceEventType::Unregistering, 1)
            ]
        );
    }

    #[test]
    fn test_listener_can_use_service_during_unregistering() {
        let registry = registry();
        let reg = registry
            .register_service(1, "Foo", ServiceSource::object(7u8), Properties::new())
            .unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let r = registry.clone();
        let s = Arc::clone(&seen);
        registry
            .add_service_listener(
                2,
                Arc::new(move |event: &ServiceEvent| {
                    if event.event_type == ServiceEventType::Unregistering {
                        let service = r.get_service(&event.reference).unwrap();
                        assert_eq!(downcast_service::<u8>(service).as_deref(), Some(&7));
                        r.unget_service(&event.reference);
                        s.fetch_add(1, Ordering::SeqCst);
                    }
                }),
                None,
            )
            .unwrap();

        reg.unregister().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    struct CountingFactory {
        created: AtomicUsize,
        released: AtomicUsize,
    }

    impl ServiceFactory for CountingFactory {
        fn get_service(
            &self,
            bundle_id: i64,
            _registration: &ServiceRegistration,
        ) -> anyhow::Result<ServiceObject> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(format!("for-{}", bundle_id)))
        }

        fn unget_service(&self, _: i64, _: &ServiceRegistration, _: ServiceObject) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_factory_invoked_once_per_consumer() {
        let registry = registry();
        let factory = Arc::new(CountingFactory {
            created: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        });
        registry
            .register_service(1, "Foo", ServiceSource::Factory(factory.clone()), Properties::new())
            .unwrap();

        let r2 = registry.get_service_reference(2, "Foo").unwrap();
        let r3 = registry.get_service_reference(3, "Foo").unwrap();
        let a = registry.get_service(&r2).unwrap();
        let b = registry.get_service(&r2).unwrap();
        let c = registry.get_service(&r3).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(downcast_service::<String>(c).as_deref().map(String::as_str), Some("for-3"));
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);

        registry.unget_service(&r2);
        assert_eq!(factory.released.load(Ordering::SeqCst), 0);
        registry.unget_service(&r2);
        assert_eq!(factory.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_hook_observes_listeners() {
        struct Hook(Mutex<Vec<(bool, ListenerId)>>);
        impl ListenerHook for Hook {
            fn added(&self, listeners: &[ListenerInfo]) {
                let mut seen = self.0.lock();
                seen.extend(listeners.iter().map(|l| (true, l.listener_id)));
            }
            fn removed(&self, listeners: &[ListenerInfo]) {
                let mut seen = self.0.lock();
                seen.extend(listeners.iter().map(|l| (false, l.listener_id)));
            }
        }

        let registry = registry();
        let (l1, _) = recorder();
        let existing = registry.add_service_listener(2, l1, None).unwrap();

        let hook = Arc::new(Hook(Mutex::new(Vec::new())));
        let hook_reg = registry
            .register_listener_hook(1, hook.clone(), Properties::new())
            .unwrap();
        assert_eq!(registry.hook_count(), 1);

        let (l2, _) = recorder();
        let added = registry.add_service_listener(3, l2, Some("(a=b)")).unwrap();
        registry.remove_service_listener(3, added);

        hook_reg.unregister().unwrap();
        assert_eq!(registry.hook_count(), 0);
        let (l3, _) = recorder();
        registry.add_service_listener(4, l3, None).unwrap();

        assert_eq!(
            *hook.0.lock(),
            vec![(true, existing), (true, added), (false, added)]
        );
    }

    #[test]
    fn test_listener_removes_itself_inside_callback() {
        let registry = registry();
        let id_slot = Arc::new(Mutex::new(None::<ListenerId>));
        let calls = Arc::new(AtomicUsize::new(0));

        let r = registry.clone();
        let slot = Arc::clone(&id_slot);
        let c = Arc::clone(&calls);
        let id = registry
            .add_service_listener(
                2,
                Arc::new(move |_event: &ServiceEvent| {
                    c.fetch_add(1, Ordering::SeqCst);
                    if let Some(id) = *slot.lock() {
                        assert!(r.remove_service_listener(2, id));
                    }
                }),
                None,
            )
            .unwrap();
        *id_slot.lock() = Some(id);

        let started = std::time::Instant::now();
        registry
            .register_service(1, "Foo", ServiceSource::object(()), Properties::new())
            .unwrap();
        registry
            .register_service(1, "Bar", ServiceSource::object(()), Properties::new())
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.listener_count(), 0);
    }

    #[test]
    fn test_listener_removes_itself_during_replay() {
        let registry = registry();
        for name in ["Foo", "Bar"] {
            registry
                .register_service(1, name, ServiceSource::object(()), Properties::new())
                .unwrap();
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let r = registry.clone();
        let c = Arc::clone(&calls);
        let started = std::time::Instant::now();
        // 新注册表中第一个监听器的 ID 为 1
        let id = registry
            .add_service_listener(
                2,
                Arc::new(move |_event: &ServiceEvent| {
                    c.fetch_add(1, Ordering::SeqCst);
                    r.remove_service_listener(2, 1);
                }),
                None,
            )
            .unwrap();

        assert_eq!(id, 1);
        assert!(started.elapsed() < Duration::from_millis(150));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.listener_count(), 0);
    }

    #[test]
    fn test_listener_removes_peer_in_same_batch() {
        let registry = registry();
        let r = registry.clone();
        let first = registry
            .add_service_listener(
                2,
                Arc::new(move |_event: &ServiceEvent| {
                    r.remove_service_listener(3, 2);
                }),
                None,
            )
            .unwrap();
        let (listener, peer_events) = recorder();
        let peer = registry.add_service_listener(3, listener, None).unwrap();
        assert_eq!((first, peer), (1, 2));

        let started = std::time::Instant::now();
        registry
            .register_service(1, "Foo", ServiceSource::object(()), Properties::new())
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(150));
        assert!(peer_events.lock().is_empty());
        assert_eq!(registry.listener_count(), 1);
    }

    #[test]
    fn test_replay_callback_unregisters_later_service() {
        let registry = registry();
        let foo = registry
            .register_service(1, "Foo", ServiceSource::object(()), Properties::new())
            .unwrap();
        let bar = registry
            .register_service(1, "Bar", ServiceSource::object(()), Properties::new())
            .unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let victim = bar.clone();
        let started = std::time::Instant::now();
        registry
            .add_service_listener(
                2,
                Arc::new(move |event: &ServiceEvent| {
                    sink.lock().push((event.event_type, event.service_id()));
                    if event.event_type == ServiceEventType::Registered && victim.is_valid() {
                        victim.unregister().unwrap();
                    }
                }),
                None,
            )
            .unwrap();

        assert!(started.elapsed() < Duration::from_millis(150));
        assert!(!bar.is_valid());
        assert_eq!(
            *events.lock(),
            vec![
                (ServiceEventType::Registered, foo.service_id()),
                (ServiceEventType::Unregistering, bar.service_id()),
            ]
        );
    }

    #[test]
    fn test_panicking_listener_is_skipped() {
        let registry = registry();
        registry
            .add_service_listener(2, Arc::new(|_: &ServiceEvent| panic!("boom")), None)
            .unwrap();
        let (listener, events) = recorder();
        registry.add_service_listener(3, listener, None).unwrap();

        registry
            .register_service(1, "Foo", ServiceSource::object(()), Properties::new())
            .unwrap();
        assert_eq!(events.lock().len(), 1);
    }

    #[test]
    fn test_cleanup_bundle_reports_leaks() {
        let registry = registry();
        registry
            .register_service(1, "Foo", ServiceSource::object(()), Properties::new())
            .unwrap();
        let (listener, _) = recorder();
        registry.add_service_listener(1, listener, None).unwrap();

        registry
            .register_service(2, "Bar", ServiceSource::object(()), Properties::new())
            .unwrap();
        let bar = registry.get_service_reference(1, "Bar").unwrap();
        registry.get_service(&bar).unwrap();

        let report = registry.cleanup_bundle(1);
        assert_eq!(report.unregistered, 1);
        assert_eq!(report.listeners_removed, 1);
        assert_eq!(report.references_released, 1);
        assert_eq!(report.services_in_use, 1);
        assert!(!bar.is_valid());
        assert!(registry.cleanup_bundle(1).is_clean());
        assert_eq!(registry.registration_count(), 1);
    }
}
