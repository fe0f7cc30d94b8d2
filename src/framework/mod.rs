//! 框架层
//!
//! Bundle 生命周期编排、事件分发、激活器契约与 Bundle 上下文。

pub mod activator;
pub mod context;
pub(crate) mod dispatcher;
pub mod event;
#[allow(clippy::module_inception)]
pub mod framework;

pub use activator::{ActivatorFactory, ActivatorRegistry, BundleActivator};
pub use context::BundleContext;
pub use event::{
    BundleEvent, BundleEventType, BundleListener, EventListenerId, FrameworkEvent,
    FrameworkEventType, FrameworkListener,
};
pub use framework::{Framework, FRAMEWORK_STORAGE, FRAMEWORK_UUID, FRAMEWORK_VERSION};
