//! 服务层
//!
//! 服务注册表及其周边：过滤器、注册、引用、使用计数、事件与跟踪器。

pub mod event;
pub mod filter;
pub mod reference;
pub mod registration;
pub mod registry;
pub mod tracker;
pub mod usage;

pub use event::{
    downcast_service, ListenerHook, ListenerId, ListenerInfo, ServiceEvent, ServiceEventType,
    ServiceFactory, ServiceListener, ServiceObject, ServiceSource, LISTENER_HOOK_SERVICE,
};
pub use filter::Filter;
pub use reference::ServiceReference;
pub use registration::{
    ServiceRegistration, OBJECT_CLASS, SERVICE_BUNDLE_ID, SERVICE_ID, SERVICE_RANKING,
};
pub use registry::{CleanupReport, ServiceRegistry};
pub use tracker::{ServiceTracker, ServiceTrackerCustomizer};
pub use usage::{UseCounter, WaitPolicy};
