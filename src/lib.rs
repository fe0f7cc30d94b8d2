//! # Chips Bundle - 动态模块运行时
//!
//! 进程内的 Bundle 容器：安装、解析、启动、停止、更新和卸载 Bundle，
//! 并通过服务注册表协调 Bundle 之间发布、查找和使用服务。
//!
//! - **服务注册表**: 带引用计数与使用计数的服务发布、查找和事件投递
//! - **Bundle 缓存**: 可在崩溃后恢复的磁盘归档，按修改时间复用解压结果
//! - **框架**: Bundle 生命周期状态机与 FIFO 事件分发
//! - **Bundle 上下文**: 代表单个 Bundle 访问框架，停止时统一清理其资源
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use chips_bundle::{Framework, FrameworkConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = FrameworkConfig::builder().cache_dir("./cache").build();
//!     let framework = Framework::new(config).await?;
//!     framework.start().await?;
//!
//!     let id = framework.install_bundle("./bundles/logger").await?;
//!     framework.start_bundle(id).await?;
//!
//!     framework.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## 模块结构
//!
//! - `service` - 服务注册表、引用、过滤器与跟踪器
//! - `bundle` - 清单、归档、缓存与 Bundle 实体
//! - `framework` - 框架、激活器、事件与 Bundle 上下文
//! - `core` - 框架配置
//! - `utils` - 错误类型、日志、属性表与文件存储

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod bundle;
pub mod core;
pub mod framework;
pub mod service;
pub mod utils;

// 重导出常用类型
pub use bundle::{
    ArchivePaths, BundleArchive, BundleCache, BundleInfo, BundleManifest, BundleRevision,
    BundleState, ManifestParser,
};
pub use core::config::{CacheConfig, FrameworkConfig, FrameworkConfigBuilder, LogConfig, RegistryConfig};
pub use framework::{
    BundleActivator, BundleContext, BundleEvent, BundleEventType, BundleListener, Framework,
    FrameworkEvent, FrameworkEventType, FrameworkListener,
};
pub use service::{
    downcast_service, Filter, ListenerHook, ListenerInfo, ServiceEvent, ServiceEventType,
    ServiceFactory, ServiceListener, ServiceObject, ServiceReference, ServiceRegistration,
    ServiceRegistry, ServiceSource, ServiceTracker, ServiceTrackerCustomizer, WaitPolicy,
};
pub use utils::logger::{fields, LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};
pub use utils::{error_code, BundleSource, FileStore, FrameworkError, LocalFileStore, Properties, Result};

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 系统 Bundle（ID 0）的符号名
pub const SYSTEM_BUNDLE_SYMBOLIC_NAME: &str = "system.bundle";
