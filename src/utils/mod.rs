//! 工具模块
//!
//! 包含错误类型、日志系统、属性表与文件存储等通用工具。

pub mod error;
pub mod fs;
pub mod logger;
pub mod properties;

// 重导出常用类型
pub use error::{error_code, FrameworkError, Result};
pub use fs::{BundleSource, FileStore, LocalFileStore, EMBEDDED_SCHEME};
pub use logger::{fields, LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};
pub use properties::Properties;
