//! 服务注册
//!
//! 一个 [`ServiceRegistration`] 对应一次服务发布。注册状态只能单向变化：
//! `Registered → Unregistering → Unregistered`。

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use super::event::ServiceSource;
use super::registry::RegistryShared;
use super::usage::UseCounter;
use crate::utils::{FrameworkError, Properties, Result};

/// 服务 ID 属性
pub const SERVICE_ID: &str = "service.id";
/// 服务名属性
pub const OBJECT_CLASS: &str = "objectClass";
/// 提供方 Bundle 属性
pub const SERVICE_BUNDLE_ID: &str = "service.bundleid";
/// 服务排序属性
pub const SERVICE_RANKING: &str = "service.ranking";

const STATE_REGISTERED: u8 = 0;
const STATE_UNREGISTERING: u8 = 1;
const STATE_UNREGISTERED: u8 = 2;

pub(crate) struct RegistrationInner {
    pub(crate) service_id: i64,
    pub(crate) name: String,
    pub(crate) bundle_id: i64,
    pub(crate) source: ServiceSource,
    pub(crate) properties: RwLock<Properties>,
    state: AtomicU8,
    /// 正在执行的 REGISTERED 回调数
    pub(crate) pending_register_events: UseCounter,
    /// 当前持有服务对象的消费方引用数
    pub(crate) usage: UseCounter,
}

impl RegistrationInner {
    pub(crate) fn new(
        service_id: i64,
        name: String,
        bundle_id: i64,
        source: ServiceSource,
        properties: Properties,
    ) -> Self {
        Self {
            service_id,
            properties: RwLock::new(with_reserved(properties, service_id, &name, bundle_id)),
            name,
            bundle_id,
            source,
            state: AtomicU8::new(STATE_REGISTERED),
            pending_register_events: UseCounter::new(),
            usage: UseCounter::new(),
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_REGISTERED
    }

    /// 服务对象仍可获取（包括 UNREGISTERING 投递期间）
    pub(crate) fn is_usable(&self) -> bool {
        self.state.load(Ordering::Acquire) != STATE_UNREGISTERED
    }

    /// 进入注销流程，只有第一次调用返回 `true`
    pub(crate) fn begin_unregister(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_REGISTERED,
                STATE_UNREGISTERING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn finish_unregister(&self) {
        self.state.store(STATE_UNREGISTERED, Ordering::Release);
    }

    pub(crate) fn ranking(&self) -> i64 {
        self.properties.read().get_as_i64(SERVICE_RANKING, 0)
    }

    pub(crate) fn replace_properties(&self, properties: Properties) -> Properties {
        let new_props = with_reserved(properties, self.service_id, &self.name, self.bundle_id);
        std::mem::replace(&mut *self.properties.write(), new_props)
    }
}

/// 写入框架控制的保留属性，覆盖调用方提供的同名值
fn with_reserved(mut properties: Properties, service_id: i64, name: &str, bundle_id: i64) -> Properties {
    properties.set(SERVICE_ID, service_id.to_string());
    properties.set(OBJECT_CLASS, name);
    properties.set(SERVICE_BUNDLE_ID, bundle_id.to_string());
    properties
}

/// 服务注册句柄
///
/// 由提供方持有，用于修改属性或注销服务。可自由克隆，克隆体指向同一注册。
#[derive(Clone)]
pub struct ServiceRegistration {
    pub(crate) inner: Arc<RegistrationInner>,
    pub(crate) registry: Weak<RegistryShared>,
}

impl ServiceRegistration {
    pub(crate) fn new(inner: Arc<RegistrationInner>, registry: Weak<RegistryShared>) -> Self {
        Self { inner, registry }
    }

    /// 服务 ID
    pub fn service_id(&self) -> i64 {
        self.inner.service_id
    }

    /// 服务名
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 提供方 Bundle ID
    pub fn bundle_id(&self) -> i64 {
        self.inner.bundle_id
    }

    /// 当前属性快照
    pub fn properties(&self) -> Properties {
        self.inner.properties.read().clone()
    }

    /// 是否仍然有效
    pub fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    /// 更新服务属性并投递 MODIFIED / MODIFIED_ENDMATCH 事件
    ///
    /// # Errors
    ///
    /// 注册已注销或注册表已销毁时返回 `IllegalState`
    pub fn set_properties(&self, properties: Properties) -> Result<()> {
        let registry = self.upgrade()?;
        registry.set_properties(&self.inner, properties)
    }

    /// 注销服务
    ///
    /// # Errors
    ///
    /// 重复注销时返回 `IllegalState`
    pub fn unregister(&self) -> Result<()> {
        let registry = self.upgrade()?;
        registry.unregister(&self.inner)
    }

    fn upgrade(&self) -> Result<Arc<RegistryShared>> {
        self.registry
            .upgrade()
            .ok_or_else(|| FrameworkError::IllegalState("服务注册表已销毁".to_string()))
    }
}

impl PartialEq for ServiceRegistration {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ServiceRegistration {}

impl fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("service_id", &self.inner.service_id)
            .field("name", &self.inner.name)
            .field("bundle_id", &self.inner.bundle_id)
            .field("valid", &self.inner.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inner() -> RegistrationInner {
        RegistrationInner::new(
            7,
            "org.chips.Foo".to_string(),
            3,
            ServiceSource::object(()),
            Properties::new()
                .with(SERVICE_ID, "999")
                .with(OBJECT_CLASS, "Fake")
                .with("k", "v"),
        )
    }

    #[test]
    fn test_reserved_properties_are_overwritten() {
        let reg = inner();
        let props = reg.properties.read().clone();
        assert_eq!(props.get(SERVICE_ID), Some("7"));
        assert_eq!(props.get(OBJECT_CLASS), Some("org.chips.Foo"));
        assert_eq!(props.get(SERVICE_BUNDLE_ID), Some("3"));
        assert_eq!(props.get("k"), Some("v"));
    }

    #[test]
    fn test_replace_properties_keeps_reserved_keys() {
        let reg = inner();
        let old = reg.replace_properties(Properties::new().with(SERVICE_RANKING, "5"));
        assert_eq!(old.get("k"), Some("v"));
        assert_eq!(reg.ranking(), 5);
        assert_eq!(reg.properties.read().get(SERVICE_ID), Some("7"));
        assert_eq!(reg.properties.read().get("k"), None);
    }

    #[test]
    fn test_state_transitions_are_one_way() {
        let reg = inner();
        assert!(reg.is_valid());
        assert!(reg.begin_unregister());
        assert!(!reg.begin_unregister());
        assert!(!reg.is_valid());
        assert!(reg.is_usable());
        reg.finish_unregister();
        assert!(!reg.is_usable());
        assert!(!reg.begin_unregister());
    }
}
