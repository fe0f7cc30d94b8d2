//! 服务引用
//!
//! 每个 (消费方 Bundle, 注册) 组合同一时刻只存在一个引用对象，由注册表按
//! 服务 ID 去重。[`ServiceReference`] 是该对象的计数句柄：克隆即增加
//! `reference_count`，丢弃即减少，归零时从所属 Bundle 的引用表中移除。
//!
//! 注册被注销后引用进入 `Invalidated` 状态，之后的操作返回
//! `ReferenceInvalidated` 而不会读取已释放的数据。

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::event::ServiceObject;
use super::registration::RegistrationInner;
use super::registry::RegistryShared;
use crate::utils::Properties;

pub(crate) enum RefTarget {
    Active(Arc<RegistrationInner>),
    Invalidated,
}

pub(crate) struct RefState {
    pub(crate) target: RefTarget,
    pub(crate) reference_count: usize,
    pub(crate) usage_count: usize,
    pub(crate) service: Option<ServiceObject>,
}

/// 锁顺序：注册表表锁 → `state`；持有 `state` 时不得再获取表锁。
pub(crate) struct ReferenceInner {
    pub(crate) bundle_id: i64,
    pub(crate) service_id: i64,
    pub(crate) state: Mutex<RefState>,
    /// 串行化同一引用上的首次获取（服务工厂在此锁内调用）
    pub(crate) get_lock: Mutex<()>,
}

impl ReferenceInner {
    pub(crate) fn new(bundle_id: i64, registration: Arc<RegistrationInner>) -> Self {
        Self {
            bundle_id,
            service_id: registration.service_id,
            state: Mutex::new(RefState {
                target: RefTarget::Active(registration),
                reference_count: 0,
                usage_count: 0,
                service: None,
            }),
            get_lock: Mutex::new(()),
        }
    }

    pub(crate) fn registration(&self) -> Option<Arc<RegistrationInner>> {
        match &self.state.lock().target {
            RefTarget::Active(reg) => Some(Arc::clone(reg)),
            RefTarget::Invalidated => None,
        }
    }

    /// 标记失效，返回遗留的服务对象与使用计数
    pub(crate) fn invalidate(&self) -> Option<(Arc<RegistrationInner>, usize, Option<ServiceObject>)> {
        let mut state = self.state.lock();
        let target = std::mem::replace(&mut state.target, RefTarget::Invalidated);
        let usage = std::mem::take(&mut state.usage_count);
        let service = state.service.take();
        match target {
            RefTarget::Active(reg) => Some((reg, usage, service)),
            RefTarget::Invalidated => None,
        }
    }
}

/// 服务引用句柄
pub struct ServiceReference {
    pub(crate) inner: Arc<ReferenceInner>,
    registry: Weak<RegistryShared>,
}

impl ServiceReference {
    /// 由注册表在持有表锁时调用，计数加一
    pub(crate) fn retain(inner: &Arc<ReferenceInner>, registry: Weak<RegistryShared>) -> Self {
        inner.state.lock().reference_count += 1;
        Self {
            inner: Arc::clone(inner),
            registry,
        }
    }

    /// 服务 ID
    pub fn service_id(&self) -> i64 {
        self.inner.service_id
    }

    /// 持有该引用的消费方 Bundle
    pub fn bundle_id(&self) -> i64 {
        self.inner.bundle_id
    }

    /// 提供方 Bundle，引用失效后返回 `None`
    pub fn provider_bundle_id(&self) -> Option<i64> {
        self.inner.registration().map(|reg| reg.bundle_id)
    }

    /// 服务名，引用失效后返回 `None`
    pub fn service_name(&self) -> Option<String> {
        self.inner.registration().map(|reg| reg.name.clone())
    }

    /// 服务属性快照，引用失效后返回 `None`
    pub fn properties(&self) -> Option<Properties> {
        self.inner
            .registration()
            .map(|reg| reg.properties.read().clone())
    }

    /// 读取单个属性
    pub fn property(&self, key: &str) -> Option<String> {
        self.inner
            .registration()
            .and_then(|reg| reg.properties.read().get(key).map(str::to_string))
    }

    /// 服务排序值
    pub fn ranking(&self) -> i64 {
        self.inner.registration().map(|reg| reg.ranking()).unwrap_or(0)
    }

    /// 引用是否仍可用
    pub fn is_valid(&self) -> bool {
        self.inner
            .registration()
            .map(|reg| reg.is_usable())
            .unwrap_or(false)
    }

    /// 当前句柄计数
    pub fn reference_count(&self) -> usize {
        self.inner.state.lock().reference_count
    }

    /// 当前使用计数
    pub fn usage_count(&self) -> usize {
        self.inner.state.lock().usage_count
    }

    /// 两个句柄是否指向同一个引用对象
    pub fn ptr_eq(&self, other: &ServiceReference) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Clone for ServiceReference {
    fn clone(&self) -> Self {
        Self::retain(&self.inner, self.registry.clone())
    }
}

impl Drop for ServiceReference {
    fn drop(&mut self) {
        let released = {
            let mut state = self.inner.state.lock();
            state.reference_count = state.reference_count.saturating_sub(1);
            state.reference_count == 0
        };
        if released {
            if let Some(registry) = self.registry.upgrade() {
                registry.release_reference(&self.inner);
            }
        }
    }
}

impl PartialEq for ServiceReference {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for ServiceReference {}

impl fmt::Debug for ServiceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceReference")
            .field("service_id", &self.inner.service_id)
            .field("bundle_id", &self.inner.bundle_id)
            .field("valid", &self.is_valid())
            .finish()
    }
}
