//! 日志系统模块
//!
//! 基于 tracing 生态的日志初始化：
//!
//! - 多级别日志（TRACE, DEBUG, INFO, WARN, ERROR）
//! - 控制台输出（Pretty 或 JSON）
//! - 文件输出（异步非阻塞，按时间轮转）
//! - `RUST_LOG` 与自定义过滤指令
//!
//! # 示例
//!
//! ```rust,no_run
//! use chips_bundle::utils::logger::{Logger, LoggerConfig, RotationStrategy};
//!
//! let config = LoggerConfig::builder()
//!     .level("debug")
//!     .file_output("./logs")
//!     .rotation(RotationStrategy::Hourly)
//!     .build();
//! let _guard = Logger::init(config).unwrap();
//!
//! tracing::info!(bundle_id = 3, "Bundle 已启动");
//! ```

use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::core::config::LogConfig;
use crate::utils::{FrameworkError, Result};

/// 日志轮转策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStrategy {
    /// 不轮转
    Never,
    /// 每小时轮转
    Hourly,
    /// 每天轮转（默认）
    #[default]
    Daily,
}

impl RotationStrategy {
    fn to_rotation(self) -> Rotation {
        match self {
            RotationStrategy::Never => Rotation::NEVER,
            RotationStrategy::Hourly => Rotation::HOURLY,
            RotationStrategy::Daily => Rotation::DAILY,
        }
    }

    /// 从字符串解析轮转策略，无法识别时返回 `Daily`
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "never" | "none" => RotationStrategy::Never,
            "hourly" | "hour" => RotationStrategy::Hourly,
            _ => RotationStrategy::Daily,
        }
    }
}

/// 日志系统配置
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// 默认日志级别
    pub level: String,
    /// 是否使用 JSON 格式
    pub json_format: bool,
    /// 是否输出到控制台
    pub console_output: bool,
    /// 文件输出目录（None 表示不输出到文件）
    pub file_output: Option<PathBuf>,
    /// 日志文件名前缀
    pub file_prefix: String,
    /// 轮转策略
    pub rotation: RotationStrategy,
    /// 是否显示线程 ID（并发排查时有用）
    pub show_thread_ids: bool,
    /// 自定义过滤指令（EnvFilter 格式，例如 "chips_bundle::service=trace"）
    pub filter_directives: Option<String>,
    /// 控制台是否启用 ANSI 颜色
    pub ansi_colors: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            console_output: true,
            file_output: None,
            file_prefix: "chips-bundle".to_string(),
            rotation: RotationStrategy::Daily,
            show_thread_ids: true,
            filter_directives: None,
            ansi_colors: true,
        }
    }
}

impl LoggerConfig {
    /// 创建配置构建器
    pub fn builder() -> LoggerConfigBuilder {
        LoggerConfigBuilder::default()
    }

    /// 从框架配置的日志段创建
    pub fn from_log_config(log_config: &LogConfig) -> Self {
        Self {
            level: log_config.level.clone(),
            json_format: log_config.json_format,
            file_output: if log_config.file_output {
                log_config.log_dir.clone()
            } else {
                None
            },
            rotation: RotationStrategy::parse(&log_config.rotation),
            ..Default::default()
        }
    }
}

/// 日志配置构建器
#[derive(Debug, Default)]
pub struct LoggerConfigBuilder {
    config: LoggerConfig,
}

impl LoggerConfigBuilder {
    /// 设置日志级别
    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.config.level = level.into();
        self
    }

    /// 启用/禁用 JSON 格式
    pub fn json_format(mut self, enable: bool) -> Self {
        self.config.json_format = enable;
        self
    }

    /// 设置控制台输出
    pub fn console_output(mut self, enable: bool) -> Self {
        self.config.console_output = enable;
        self
    }

    /// 设置文件输出目录
    pub fn file_output(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.file_output = Some(dir.into());
        self
    }

    /// 设置文件名前缀
    pub fn file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.file_prefix = prefix.into();
        self
    }

    /// 设置轮转策略
    pub fn rotation(mut self, strategy: RotationStrategy) -> Self {
        self.config.rotation = strategy;
        self
    }

    /// 设置过滤指令
    pub fn filter_directives(mut self, directives: impl Into<String>) -> Self {
        self.config.filter_directives = Some(directives.into());
        self
    }

    /// 设置 ANSI 颜色
    pub fn ansi_colors(mut self, enable: bool) -> Self {
        self.config.ansi_colors = enable;
        self
    }

    /// 构建配置
    pub fn build(self) -> LoggerConfig {
        self.config
    }
}

/// 日志系统守卫
///
/// 持有非阻塞写入器的 WorkerGuard，被丢弃时刷新挂起的日志。
#[derive(Default)]
pub struct LogGuard {
    _guards: Vec<WorkerGuard>,
}

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// 日志系统
pub struct Logger;

impl Logger {
    /// 初始化日志系统
    ///
    /// 返回的 [`LogGuard`] 必须保持存活直到进程退出。
    ///
    /// # Errors
    ///
    /// 重复初始化或全局订阅者已被设置时返回 `InitFailed`
    pub fn init(config: LoggerConfig) -> Result<LogGuard> {
        if LOGGER_INITIALIZED.get().is_some() {
            return Err(FrameworkError::InitFailed(
                "日志系统已初始化，不能重复初始化".to_string(),
            ));
        }

        let env_filter = Self::create_env_filter(&config)?;
        let mut guard = LogGuard::default();

        let console_layer = if config.console_output {
            let (writer, console_guard) = tracing_appender::non_blocking(io::stdout());
            guard._guards.push(console_guard);
            Some((writer, config.ansi_colors))
        } else {
            None
        };

        let file_layer = config.file_output.as_ref().map(|log_dir| {
            let appender = RollingFileAppender::new(
                config.rotation.to_rotation(),
                log_dir,
                format!("{}.log", config.file_prefix),
            );
            let (writer, file_guard) = tracing_appender::non_blocking(appender);
            guard._guards.push(file_guard);
            writer
        });

        let registry = tracing_subscriber::registry().with(env_filter);
        let result = if config.json_format {
            registry
                .with(console_layer.map(|(writer, _)| {
                    fmt::layer()
                        .json()
                        .with_writer(writer)
                        .with_thread_ids(config.show_thread_ids)
                }))
                .with(file_layer.map(|writer| {
                    fmt::layer()
                        .json()
                        .with_writer(writer)
                        .with_thread_ids(config.show_thread_ids)
                }))
                .try_init()
        } else {
            registry
                .with(console_layer.map(|(writer, ansi)| {
                    fmt::layer()
                        .with_writer(writer)
                        .with_thread_ids(config.show_thread_ids)
                        .with_ansi(ansi)
                }))
                .with(file_layer.map(|writer| {
                    fmt::layer()
                        .with_writer(writer)
                        .with_thread_ids(config.show_thread_ids)
                        .with_ansi(false)
                }))
                .try_init()
        };
        result.map_err(|e| FrameworkError::InitFailed(format!("日志系统初始化失败: {}", e)))?;

        let _ = LOGGER_INITIALIZED.set(());
        Ok(guard)
    }

    /// 尝试初始化日志系统，失败时返回空守卫（适用于测试）
    pub fn try_init(config: LoggerConfig) -> LogGuard {
        Self::init(config).unwrap_or_default()
    }

    fn create_env_filter(config: &LoggerConfig) -> Result<EnvFilter> {
        let mut filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

        if let Some(ref directives) = config.filter_directives {
            for directive in directives.split(',').map(str::trim).filter(|d| !d.is_empty()) {
                let parsed = directive.parse().map_err(|e| FrameworkError::InvalidConfigValue {
                    key: "logging.filter_directives".to_string(),
                    reason: format!("'{}': {}", directive, e),
                })?;
                filter = filter.add_directive(parsed);
            }
        }

        Ok(filter)
    }
}

/// 标准日志字段名称
pub mod fields {
    /// Bundle ID
    pub const BUNDLE_ID: &str = "bundle_id";
    /// 服务 ID
    pub const SERVICE_ID: &str = "service_id";
    /// 服务名
    pub const SERVICE_NAME: &str = "service_name";
    /// Bundle 来源
    pub const LOCATION: &str = "location";
    /// 监听器 ID
    pub const LISTENER_ID: &str = "listener_id";
}
