//! Bundle 激活器
//!
//! 清单中的 `Bundle-Activator` 是一个名称，框架在进程内的激活器注册表中
//! 按名称查找工厂并创建激活器实例。实例在启动前创建、停止后丢弃。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::context::BundleContext;
use crate::utils::{FrameworkError, Result};

/// Bundle 激活器
///
/// 失败以 `anyhow::Error` 报告，框架将其包装为 `ActivatorFailed`。
///
/// 回调运行在 tokio 工作线程上。`ServiceRegistration::unregister` 与
/// `remove_service_listener` 会同步等待在途使用结束（最长 `max_wait`），
/// 在回调中应改用 [`BundleContext::unregister_service_async`] 与
/// [`BundleContext::remove_service_listener_async`]。
#[async_trait]
pub trait BundleActivator: Send + Sync {
    /// Bundle 启动时调用
    async fn start(&self, context: &BundleContext) -> anyhow::Result<()>;

    /// Bundle 停止时调用
    ///
    /// 之后框架会强制清理该 Bundle 仍持有的服务、监听器和跟踪器。
    async fn stop(&self, context: &BundleContext) -> anyhow::Result<()>;
}

/// 激活器工厂
pub type ActivatorFactory = Arc<dyn Fn() -> Arc<dyn BundleActivator> + Send + Sync>;

/// 激活器注册表
#[derive(Default)]
pub struct ActivatorRegistry {
    factories: RwLock<HashMap<String, ActivatorFactory>>,
}

impl ActivatorRegistry {
    /// 创建空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册激活器工厂，同名工厂会被替换
    pub fn register(&self, name: impl Into<String>, factory: ActivatorFactory) {
        let name = name.into();
        debug!(activator = %name, "注册激活器");
        self.factories.write().insert(name, factory);
    }

    /// 是否已注册
    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    /// 已注册的激活器名称
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// 创建激活器实例
    ///
    /// # Errors
    ///
    /// 名称未注册时返回 `UnknownActivator`
    pub fn create(&self, name: &str) -> Result<Arc<dyn BundleActivator>> {
        let factory = self
            .factories
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| FrameworkError::UnknownActivator(name.to_string()))?;
        Ok(factory())
    }
}

impl fmt::Debug for ActivatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivatorRegistry")
            .field("names", &self.names())
            .finish()
    }
}
