//! 框架错误类型定义
//!
//! 本模块定义了运行时中使用的所有错误类型，按照以下几类划分：
//!
//! - 参数错误（调用方输入无效，例如空的 location、格式错误的过滤器）
//! - 状态错误（当前生命周期状态下不允许的操作）
//! - 内存分配失败
//! - 文件 IO 错误（归档解压、状态持久化失败，携带 OS 错误码）
//! - Bundle 异常（清单无效、符号名冲突、激活器失败）
//! - 服务引用失效（服务已被并发注销）

use std::path::PathBuf;

use thiserror::Error;

/// 框架核心错误类型
#[derive(Error, Debug)]
pub enum FrameworkError {
    // ==================== 调用方错误 ====================

    /// 参数无效
    #[error("参数无效: {0}")]
    IllegalArgument(String),

    /// 当前状态不允许该操作
    #[error("状态无效: {0}")]
    IllegalState(String),

    /// 内存分配失败
    #[error("内存分配失败: {0}")]
    OutOfMemory(String),

    // ==================== 文件系统错误 ====================

    /// 文件 IO 错误（带路径上下文）
    #[error("文件操作失败: '{}' - {source}", path.display())]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Bundle 异常 ====================

    /// Bundle 清单无效
    #[error("Bundle 清单无效: {0}")]
    InvalidManifest(String),

    /// 符号名与版本与已安装的 Bundle 冲突
    #[error("Bundle '{symbolic_name}' 版本 {version} 已被 Bundle {existing_id} 安装")]
    DuplicateBundle {
        symbolic_name: String,
        version: String,
        existing_id: i64,
    },

    /// 激活器执行失败
    #[error("Bundle {bundle_id} 激活器执行失败: {reason}")]
    ActivatorFailed { bundle_id: i64, reason: String },

    /// 清单引用了未注册的激活器
    #[error("未知的激活器: '{0}'")]
    UnknownActivator(String),

    /// Bundle 未找到
    #[error("Bundle 未找到: {0}")]
    BundleNotFound(i64),

    // ==================== 服务注册表错误 ====================

    /// 服务引用已失效（对应的注册已被注销）
    #[error("服务引用已失效: service.id={service_id}")]
    ReferenceInvalidated { service_id: i64 },

    // ==================== 配置错误 ====================

    /// 配置加载失败
    #[error("配置加载失败: {0}")]
    ConfigLoadFailed(String),

    /// 配置值无效
    #[error("配置值无效: '{key}' - {reason}")]
    InvalidConfigValue { key: String, reason: String },

    // ==================== IO 和序列化错误 ====================

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化/反序列化错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 序列化/反序列化错误
    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// 版本解析错误
    #[error("版本解析错误: {0}")]
    VersionParse(#[from] semver::Error),

    // ==================== 通用错误 ====================

    /// 初始化失败
    #[error("初始化失败: {0}")]
    InitFailed(String),

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// 框架操作结果类型别名
pub type Result<T> = std::result::Result<T, FrameworkError>;

/// 错误码常量
pub mod error_code {
    // 调用方错误 (ARGUMENT-xxx / STATE-xxx)
    pub const ILLEGAL_ARGUMENT: &str = "ARGUMENT-001";
    pub const ILLEGAL_STATE: &str = "STATE-001";

    // 资源错误 (RESOURCE-xxx)
    pub const OUT_OF_MEMORY: &str = "RESOURCE-001";

    // 文件错误 (FILE-xxx)
    pub const FILE_IO: &str = "FILE-001";

    // Bundle 错误 (BUNDLE-xxx)
    pub const BUNDLE_INVALID_MANIFEST: &str = "BUNDLE-001";
    pub const BUNDLE_DUPLICATE: &str = "BUNDLE-002";
    pub const BUNDLE_ACTIVATOR_FAILED: &str = "BUNDLE-003";
    pub const BUNDLE_UNKNOWN_ACTIVATOR: &str = "BUNDLE-004";
    pub const BUNDLE_NOT_FOUND: &str = "BUNDLE-005";

    // 服务错误 (SERVICE-xxx)
    pub const SERVICE_REFERENCE_INVALIDATED: &str = "SERVICE-001";

    // 配置错误 (CONFIG-xxx)
    pub const CONFIG_LOAD_FAILED: &str = "CONFIG-001";
    pub const CONFIG_INVALID_VALUE: &str = "CONFIG-002";
}

impl FrameworkError {
    /// 构造带路径上下文的文件 IO 错误
    pub fn file_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FrameworkError::FileIo {
            path: path.into(),
            source,
        }
    }

    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            FrameworkError::IllegalArgument(_) => error_code::ILLEGAL_ARGUMENT,
            FrameworkError::IllegalState(_) => error_code::ILLEGAL_STATE,
            FrameworkError::OutOfMemory(_) => error_code::OUT_OF_MEMORY,
            FrameworkError::FileIo { .. } | FrameworkError::Io(_) => error_code::FILE_IO,
            FrameworkError::InvalidManifest(_) => error_code::BUNDLE_INVALID_MANIFEST,
            FrameworkError::DuplicateBundle { .. } => error_code::BUNDLE_DUPLICATE,
            FrameworkError::ActivatorFailed { .. } => error_code::BUNDLE_ACTIVATOR_FAILED,
            FrameworkError::UnknownActivator(_) => error_code::BUNDLE_UNKNOWN_ACTIVATOR,
            FrameworkError::BundleNotFound(_) => error_code::BUNDLE_NOT_FOUND,
            FrameworkError::ReferenceInvalidated { .. } => {
                error_code::SERVICE_REFERENCE_INVALIDATED
            }
            FrameworkError::ConfigLoadFailed(_) => error_code::CONFIG_LOAD_FAILED,
            FrameworkError::InvalidConfigValue { .. } => error_code::CONFIG_INVALID_VALUE,
            _ => "UNKNOWN",
        }
    }

    /// 是否属于 BundleException 类别
    pub fn is_bundle_exception(&self) -> bool {
        matches!(
            self,
            FrameworkError::InvalidManifest(_)
                | FrameworkError::DuplicateBundle { .. }
                | FrameworkError::ActivatorFailed { .. }
                | FrameworkError::UnknownActivator(_)
                | FrameworkError::BundleNotFound(_)
        )
    }

    /// 获取底层 OS 错误码（如果有）
    pub fn os_error_code(&self) -> Option<i32> {
        match self {
            FrameworkError::FileIo { source, .. } => source.raw_os_error(),
            FrameworkError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}
