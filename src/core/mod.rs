//! 核心模块
//!
//! 包含框架配置。

pub mod config;

pub use config::{
    CacheConfig, FrameworkConfig, FrameworkConfigBuilder, LogConfig, RegistryConfig,
};
