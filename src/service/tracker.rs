//! 服务跟踪器
//!
//! 基于服务监听器持续跟踪某一服务名（可附加过滤器）的全部可用服务，
//! 自动获取与释放服务对象。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::event::{ListenerId, ServiceEvent, ServiceEventType, ServiceObject};
use super::filter::{escape_value, Filter};
use super::reference::ServiceReference;
use super::registration::OBJECT_CLASS;
use super::registry::ServiceRegistry;
use crate::utils::Result;

/// 跟踪器定制接口
///
/// 默认实现接受所有服务。
pub trait ServiceTrackerCustomizer: Send + Sync {
    /// 服务进入跟踪范围，返回 `false` 表示不跟踪
    fn adding_service(&self, _reference: &ServiceReference, _service: &ServiceObject) -> bool {
        true
    }

    /// 已跟踪服务的属性被修改
    fn modified_service(&self, _reference: &ServiceReference, _service: &ServiceObject) {}

    /// 服务离开跟踪范围
    fn removed_service(&self, _reference: &ServiceReference, _service: &ServiceObject) {}
}

struct Tracked {
    reference: ServiceReference,
    service: ServiceObject,
}

struct TrackerInner {
    registry: ServiceRegistry,
    bundle_id: i64,
    name: String,
    filter: String,
    customizer: Option<Arc<dyn ServiceTrackerCustomizer>>,
    listener_id: Mutex<Option<ListenerId>>,
    tracked: Mutex<BTreeMap<i64, Tracked>>,
    closed: AtomicBool,
}

impl TrackerInner {
    fn on_event(&self, event: &ServiceEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        match event.event_type {
            ServiceEventType::Registered | ServiceEventType::Modified => {
                let existing = self
                    .tracked
                    .lock()
                    .get(&event.service_id())
                    .map(|t| Arc::clone(&t.service));
                match existing {
                    Some(service) if event.event_type == ServiceEventType::Modified => {
                        if let Some(customizer) = &self.customizer {
                            customizer.modified_service(&event.reference, &service);
                        }
                    }
                    Some(_) => {}
                    None => self.add(&event.reference),
                }
            }
            ServiceEventType::ModifiedEndMatch | ServiceEventType::Unregistering => {
                self.remove(event.service_id());
            }
        }
    }

    fn add(&self, reference: &ServiceReference) {
        let service = match self.registry.get_service(reference) {
            Ok(service) => service,
            Err(e) => {
                debug!(service_id = reference.service_id(), error = %e, "跟踪器获取服务失败");
                return;
            }
        };

        if let Some(customizer) = &self.customizer {
            if !customizer.adding_service(reference, &service) {
                self.registry.unget_service(reference);
                return;
            }
        }

        let duplicate = {
            let mut tracked = self.tracked.lock();
            if tracked.contains_key(&reference.service_id()) || self.closed.load(Ordering::Acquire)
            {
                true
            } else {
                tracked.insert(
                    reference.service_id(),
                    Tracked {
                        reference: reference.clone(),
                        service,
                    },
                );
                false
            }
        };
        if duplicate {
            self.registry.unget_service(reference);
        }
    }

    fn remove(&self, service_id: i64) {
        let removed = self.tracked.lock().remove(&service_id);
        if let Some(tracked) = removed {
            self.release(tracked);
        }
    }

    fn release(&self, tracked: Tracked) {
        if let Some(customizer) = &self.customizer {
            customizer.removed_service(&tracked.reference, &tracked.service);
        }
        self.registry.unget_service(&tracked.reference);
    }
}

/// 服务跟踪器
///
/// 可克隆，克隆体共享同一跟踪状态。
#[derive(Clone)]
pub struct ServiceTracker {
    inner: Arc<TrackerInner>,
}

impl ServiceTracker {
    /// 创建跟踪器（尚未开始跟踪）
    ///
    /// # Errors
    ///
    /// 附加过滤器格式错误时返回 `IllegalArgument`
    pub fn new(
        registry: ServiceRegistry,
        bundle_id: i64,
        name: &str,
        filter: Option<&str>,
        customizer: Option<Arc<dyn ServiceTrackerCustomizer>>,
    ) -> Result<Self> {
        let class_filter = format!("({}={})", OBJECT_CLASS, escape_value(name));
        let filter = match filter {
            Some(extra) => {
                Filter::parse(extra)?;
                format!("(&{}{})", class_filter, extra.trim())
            }
            None => class_filter,
        };

        Ok(Self {
            inner: Arc::new(TrackerInner {
                registry,
                bundle_id,
                name: name.to_string(),
                filter,
                customizer,
                listener_id: Mutex::new(None),
                tracked: Mutex::new(BTreeMap::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// 开始跟踪，已存在的匹配服务会立即被加入
    pub fn open(&self) -> Result<()> {
        let mut listener_id = self.inner.listener_id.lock();
        if listener_id.is_some() {
            return Ok(());
        }
        self.inner.closed.store(false, Ordering::Release);

        let weak: Weak<TrackerInner> = Arc::downgrade(&self.inner);
        let id = self.inner.registry.add_service_listener(
            self.inner.bundle_id,
            Arc::new(move |event: &ServiceEvent| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_event(event);
                }
            }),
            Some(&self.inner.filter),
        )?;
        *listener_id = Some(id);
        debug!(
            bundle_id = self.inner.bundle_id,
            service_name = %self.inner.name,
            tracked = self.size(),
            "服务跟踪器已打开"
        );
        Ok(())
    }

    /// 停止跟踪并释放全部服务
    pub fn close(&self) {
        let listener_id = self.inner.listener_id.lock().take();
        self.inner.closed.store(true, Ordering::Release);
        if let Some(id) = listener_id {
            if !self.inner.registry.remove_service_listener(self.inner.bundle_id, id) {
                warn!(bundle_id = self.inner.bundle_id, listener_id = id, "跟踪器监听器已不存在");
            }
        }

        let drained = std::mem::take(&mut *self.inner.tracked.lock());
        for (_, tracked) in drained {
            self.inner.release(tracked);
        }
    }

    /// 是否处于打开状态
    pub fn is_open(&self) -> bool {
        self.inner.listener_id.lock().is_some()
    }

    /// 跟踪的服务名
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 跟踪器使用的完整过滤器
    pub fn filter(&self) -> &str {
        &self.inner.filter
    }

    /// 当前跟踪的服务数
    pub fn size(&self) -> usize {
        self.inner.tracked.lock().len()
    }

    /// 当前跟踪的服务引用（按排序降序）
    pub fn service_references(&self) -> Vec<ServiceReference> {
        self.sorted().into_iter().map(|(r, _)| r).collect()
    }

    /// 当前跟踪的服务对象（按排序降序）
    pub fn services(&self) -> Vec<ServiceObject> {
        self.sorted().into_iter().map(|(_, s)| s).collect()
    }

    /// 排序最高的服务
    pub fn highest(&self) -> Option<ServiceObject> {
        self.sorted().into_iter().next().map(|(_, s)| s)
    }

    /// 排序最高的服务，转换为具体类型
    pub fn highest_as<T: std::any::Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.highest().and_then(|s| s.downcast::<T>().ok())
    }

    fn sorted(&self) -> Vec<(ServiceReference, ServiceObject)> {
        let mut entries: Vec<(i64, i64, ServiceReference, ServiceObject)> = self
            .inner
            .tracked
            .lock()
            .iter()
            .map(|(id, t)| {
                (
                    t.reference.ranking(),
                    *id,
                    t.reference.clone(),
                    Arc::clone(&t.service),
                )
            })
            .collect();
        entries.sort_by_key(|(ranking, id, _, _)| (std::cmp::Reverse(*ranking), *id));
        entries.into_iter().map(|(_, _, r, s)| (r, s)).collect()
    }
}

impl fmt::Debug for ServiceTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceTracker")
            .field("bundle_id", &self.inner.bundle_id)
            .field("filter", &self.inner.filter)
            .field("tracked", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::event::ServiceSource;
    use crate::utils::Properties;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        added: AtomicUsize,
        modified: AtomicUsize,
        removed: AtomicUsize,
    }

    impl ServiceTrackerCustomizer for Counting {
        fn adding_service(&self, _: &ServiceReference, _: &ServiceObject) -> bool {
            self.added.fetch_add(1, Ordering::SeqCst);
            true
        }
        fn modified_service(&self, _: &ServiceReference, _: &ServiceObject) {
            self.modified.fetch_add(1, Ordering::SeqCst);
        }
        fn removed_service(&self, _: &ServiceReference, _: &ServiceObject) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_tracker_follows_service_lifecycle() {
        let registry = ServiceRegistry::new();
        let existing = registry
            .register_service(1, "Log", ServiceSource::object(1u8), Properties::new())
            .unwrap();

        let counting = Arc::new(Counting::default());
        let customizer: Arc<dyn ServiceTrackerCustomizer> = counting.clone();
        let tracker =
            ServiceTracker::new(registry.clone(), 9, "Log", None, Some(customizer)).unwrap();
        tracker.open().unwrap();
        assert_eq!(tracker.size(), 1);

        let better = registry
            .register_service(
                2,
                "Log",
                ServiceSource::object(2u8),
                Properties::new().with("service.ranking", "5"),
            )
            .unwrap();
        assert_eq!(tracker.size(), 2);
        assert_eq!(tracker.highest_as::<u8>().as_deref(), Some(&2));

        better.set_properties(Properties::new().with("service.ranking", "6")).unwrap();
        assert_eq!(counting.modified.load(Ordering::SeqCst), 1);

        better.unregister().unwrap();
        assert_eq!(tracker.size(), 1);
        assert_eq!(counting.removed.load(Ordering::SeqCst), 1);

        tracker.close();
        assert_eq!(tracker.size(), 0);
        assert_eq!(counting.added.load(Ordering::SeqCst), 2);
        assert_eq!(counting.removed.load(Ordering::SeqCst), 2);
        assert!(registry.services_in_use(9).is_empty());
        assert_eq!(registry.listener_count(), 0);
        existing.unregister().unwrap();
    }

    #[test]
    fn test_tracker_with_extra_filter() {
        let registry = ServiceRegistry::new();
        let tracker =
            ServiceTracker::new(registry.clone(), 9, "Log", Some("(level=debug)"), None).unwrap();
        assert_eq!(tracker.filter(), "(&(objectClass=Log)(level=debug))");
        tracker.open().unwrap();

        let reg = registry
            .register_service(1, "Log", ServiceSource::object(()), Properties::new().with("level", "info"))
            .unwrap();
        assert_eq!(tracker.size(), 0);

        reg.set_properties(Properties::new().with("level", "debug")).unwrap();
        assert_eq!(tracker.size(), 1);

        reg.set_properties(Properties::new().with("level", "warn")).unwrap();
        assert_eq!(tracker.size(), 0);
        tracker.close();
    }

    #[test]
    fn test_invalid_extra_filter() {
        let registry = ServiceRegistry::new();
        assert!(ServiceTracker::new(registry, 9, "Log", Some("(broken"), None).is_err());
    }
}
