//! 服务事件、监听器与扩展接口
//!
//! 定义服务注册表向外分发的事件类型，以及注册表调用的几类固定角色：
//! 服务监听器、服务工厂、监听器钩子。

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use super::reference::ServiceReference;
use super::registration::ServiceRegistration;

/// 服务对象（实现方发布的不透明对象）
pub type ServiceObject = Arc<dyn Any + Send + Sync>;

/// 服务监听器回调
///
/// 回调在注册表锁之外同步调用，可以重入注册表。
pub type ServiceListener = Arc<dyn Fn(&ServiceEvent) + Send + Sync>;

/// 监听器 ID
pub type ListenerId = u64;

/// 监听器钩子使用的保留服务名
pub const LISTENER_HOOK_SERVICE: &str = "org.osgi.framework.hooks.service.ListenerHook";

/// 服务事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceEventType {
    /// 服务已注册
    Registered,
    /// 服务属性已修改且仍匹配
    Modified,
    /// 服务属性已修改且不再匹配
    ModifiedEndMatch,
    /// 服务即将注销
    Unregistering,
}

impl fmt::Display for ServiceEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceEventType::Registered => "REGISTERED",
            ServiceEventType::Modified => "MODIFIED",
            ServiceEventType::ModifiedEndMatch => "MODIFIED_ENDMATCH",
            ServiceEventType::Unregistering => "UNREGISTERING",
        };
        f.write_str(s)
    }
}

/// 服务事件
///
/// `reference` 属于接收事件的监听器所在的 Bundle。
#[derive(Clone)]
pub struct ServiceEvent {
    /// 事件类型
    pub event_type: ServiceEventType,
    /// 服务引用
    pub reference: ServiceReference,
}

impl ServiceEvent {
    /// 事件涉及的服务 ID
    pub fn service_id(&self) -> i64 {
        self.reference.service_id()
    }
}

impl fmt::Debug for ServiceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceEvent")
            .field("event_type", &self.event_type)
            .field("service_id", &self.reference.service_id())
            .finish()
    }
}

/// 服务工厂
///
/// 每个消费方 Bundle 第一次获取服务时调用 `get_service`，
/// 最后一次释放时调用 `unget_service`。
pub trait ServiceFactory: Send + Sync {
    /// 为消费方创建服务对象
    fn get_service(
        &self,
        bundle_id: i64,
        registration: &ServiceRegistration,
    ) -> anyhow::Result<ServiceObject>;

    /// 回收消费方的服务对象
    fn unget_service(
        &self,
        _bundle_id: i64,
        _registration: &ServiceRegistration,
        _service: ServiceObject,
    ) {
    }
}

/// 监听器描述（提供给监听器钩子）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerInfo {
    /// 监听器 ID
    pub listener_id: ListenerId,
    /// 监听器所属 Bundle
    pub bundle_id: i64,
    /// 过滤器表达式
    pub filter: Option<String>,
    /// 是否已被移除
    pub removed: bool,
}

/// 监听器钩子：观察服务监听器的添加与移除
pub trait ListenerHook: Send + Sync {
    /// 监听器被添加（钩子注册时会收到当前全部监听器）
    fn added(&self, listeners: &[ListenerInfo]);

    /// 监听器被移除
    fn removed(&self, listeners: &[ListenerInfo]);
}

/// 注册到注册表的服务来源
#[derive(Clone)]
pub enum ServiceSource {
    /// 单例对象
    Object(ServiceObject),
    /// 按消费方创建对象的工厂
    Factory(Arc<dyn ServiceFactory>),
    /// 监听器钩子
    ListenerHook(Arc<dyn ListenerHook>),
}

impl ServiceSource {
    /// 由任意对象构造
    pub fn object<T: Any + Send + Sync>(value: T) -> Self {
        ServiceSource::Object(Arc::new(value))
    }
}

impl fmt::Debug for ServiceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceSource::Object(_) => f.write_str("Object"),
            ServiceSource::Factory(_) => f.write_str("Factory"),
            ServiceSource::ListenerHook(_) => f.write_str("ListenerHook"),
        }
    }
}

/// 将服务对象转换为具体类型
pub fn downcast_service<T: Any + Send + Sync>(service: ServiceObject) -> Option<Arc<T>> {
    service.downcast::<T>().ok()
}
