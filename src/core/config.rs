//! 框架配置
//!
//! 定义框架实例的配置结构和加载逻辑。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::service::usage::WaitPolicy;
use crate::utils::{FrameworkError, Result};

/// Bundle 缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 缓存根目录
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    /// 创建框架时清空整个缓存
    #[serde(default)]
    pub clean_on_create: bool,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".chips-cache")
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            clean_on_create: false,
        }
    }
}

/// 服务注册表配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// 注销等待期间的告警间隔（毫秒）
    #[serde(default = "default_warn_interval_ms")]
    pub warn_interval_ms: u64,

    /// 注销等待上限（毫秒），0 表示无限等待
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

fn default_warn_interval_ms() -> u64 {
    5000
}

fn default_max_wait_ms() -> u64 {
    30000
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            warn_interval_ms: default_warn_interval_ms(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出到文件
    #[serde(default)]
    pub file_output: bool,

    /// 日志文件目录
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json_format: bool,

    /// 日志轮转策略
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: false,
            log_dir: None,
            json_format: false,
            rotation: default_rotation(),
        }
    }
}

/// 框架配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameworkConfig {
    /// 配置文件路径
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// 缓存配置
    #[serde(default)]
    pub cache: CacheConfig,

    /// 注册表配置
    #[serde(default)]
    pub registry: RegistryConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LogConfig,

    /// 框架属性（通过 BundleContext::get_property 可见）
    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    /// 框架启动时自动安装并启动的 Bundle location
    #[serde(default)]
    pub auto_start: Vec<String>,
}

impl FrameworkConfig {
    /// 创建配置构建器
    pub fn builder() -> FrameworkConfigBuilder {
        FrameworkConfigBuilder::new()
    }

    /// 从文件加载配置
    ///
    /// 扩展名为 `.json` 时按 JSON 解析，其余按 YAML 解析。
    pub async fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| FrameworkError::ConfigLoadFailed(format!("{}: {}", path.display(), e)))?;

        let mut config: FrameworkConfig =
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                serde_json::from_str(&content)?
            } else {
                serde_yaml::from_str(&content)?
            };

        config.validate()?;
        config.config_path = Some(path);
        Ok(config)
    }

    /// 校验配置值
    pub fn validate(&self) -> Result<()> {
        if self.cache.dir.as_os_str().is_empty() {
            return Err(FrameworkError::InvalidConfigValue {
                key: "cache.dir".to_string(),
                reason: "缓存目录不能为空".to_string(),
            });
        }
        if self.registry.max_wait_ms != 0
            && self.registry.warn_interval_ms > self.registry.max_wait_ms
        {
            return Err(FrameworkError::InvalidConfigValue {
                key: "registry.warn_interval_ms".to_string(),
                reason: format!(
                    "告警间隔 {}ms 大于等待上限 {}ms",
                    self.registry.warn_interval_ms, self.registry.max_wait_ms
                ),
            });
        }
        if self.auto_start.iter().any(|l| l.trim().is_empty()) {
            return Err(FrameworkError::InvalidConfigValue {
                key: "auto_start".to_string(),
                reason: "location 不能为空".to_string(),
            });
        }
        Ok(())
    }

    /// 合并另一个配置（用于覆盖）
    pub fn merge(&mut self, other: FrameworkConfig) {
        // 只覆盖非默认值的配置
        if other.cache.dir != default_cache_dir() {
            self.cache.dir = other.cache.dir;
        }
        if other.cache.clean_on_create {
            self.cache.clean_on_create = true;
        }
        if other.registry.warn_interval_ms != default_warn_interval_ms() {
            self.registry.warn_interval_ms = other.registry.warn_interval_ms;
        }
        if other.registry.max_wait_ms != default_max_wait_ms() {
            self.registry.max_wait_ms = other.registry.max_wait_ms;
        }
        if other.logging.level != default_log_level() {
            self.logging.level = other.logging.level;
        }
        if other.logging.file_output {
            self.logging.file_output = true;
            self.logging.log_dir = other.logging.log_dir;
        }
        if other.logging.json_format {
            self.logging.json_format = true;
        }
        self.properties.extend(other.properties);
        for location in other.auto_start {
            if !self.auto_start.contains(&location) {
                self.auto_start.push(location);
            }
        }
    }

    /// 注销等待策略
    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            warn_interval: Duration::from_millis(self.registry.warn_interval_ms),
            max_wait: match self.registry.max_wait_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
        }
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct FrameworkConfigBuilder {
    config: FrameworkConfig,
}

impl FrameworkConfigBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置缓存根目录
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache.dir = dir.into();
        self
    }

    /// 创建时清空缓存
    pub fn clean_on_create(mut self, clean: bool) -> Self {
        self.config.cache.clean_on_create = clean;
        self
    }

    /// 设置注销等待的告警间隔
    pub fn warn_interval(mut self, interval: Duration) -> Self {
        self.config.registry.warn_interval_ms = interval.as_millis() as u64;
        self
    }

    /// 设置注销等待上限，`None` 表示无限等待
    pub fn max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.config.registry.max_wait_ms = max_wait.map(|d| d.as_millis() as u64).unwrap_or(0);
        self
    }

    /// 设置日志级别
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// 启用文件日志
    pub fn file_logging(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.config.logging.file_output = true;
        self.config.logging.log_dir = Some(log_dir.into());
        self
    }

    /// 设置框架属性
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.properties.insert(key.into(), value.into());
        self
    }

    /// 添加自动启动的 Bundle
    pub fn auto_start(mut self, location: impl Into<String>) -> Self {
        self.config.auto_start.push(location.into());
        self
    }

    /// 构建配置
    pub fn build(self) -> FrameworkConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FrameworkConfig::default();
        assert_eq!(config.cache.dir, PathBuf::from(".chips-cache"));
        assert!(!config.cache.clean_on_create);
        assert_eq!(config.registry.warn_interval_ms, 5000);
        assert_eq!(config.registry.max_wait_ms, 30000);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = FrameworkConfig::builder()
            .cache_dir("/tmp/cache")
            .clean_on_create(true)
            .max_wait(None)
            .property("env", "test")
            .auto_start("/bundles/a.tar")
            .build();

        assert_eq!(config.cache.dir, PathBuf::from("/tmp/cache"));
        assert!(config.cache.clean_on_create);
        assert_eq!(config.registry.max_wait_ms, 0);
        assert_eq!(config.properties.get("env").map(String::as_str), Some("test"));
        assert_eq!(config.auto_start, vec!["/bundles/a.tar".to_string()]);
    }

    #[test]
    fn test_wait_policy_conversion() {
        let bounded = FrameworkConfig::builder()
            .warn_interval(Duration::from_millis(100))
            .max_wait(Some(Duration::from_secs(2)))
            .build()
            .wait_policy();
        assert_eq!(bounded.warn_interval, Duration::from_millis(100));
        assert_eq!(bounded.max_wait, Some(Duration::from_secs(2)));

        let unbounded = FrameworkConfig::builder().max_wait(None).build().wait_policy();
        assert_eq!(unbounded.max_wait, None);
    }

    #[test]
    fn test_validate_rejects_inverted_wait_bounds() {
        let config = FrameworkConfig::builder()
            .warn_interval(Duration::from_secs(10))
            .max_wait(Some(Duration::from_secs(1)))
            .build();
        assert!(matches!(
            config.validate(),
            Err(FrameworkError::InvalidConfigValue { .. })
        ));
    }

    #[test]
    fn test_config_merge() {
        let mut base = FrameworkConfig::builder()
            .property("a", "1")
            .auto_start("x")
            .build();
        let override_config = FrameworkConfig::builder()
            .log_level("debug")
            .clean_on_create(true)
            .property("b", "2")
            .auto_start("x")
            .auto_start("y")
            .build();

        base.merge(override_config);

        assert_eq!(base.logging.level, "debug");
        assert!(base.cache.clean_on_create);
        assert_eq!(base.properties.len(), 2);
        assert_eq!(base.auto_start, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn test_config_serialization() {
        let config = FrameworkConfig::builder()
            .cache_dir("/var/cache/chips")
            .log_level("warn")
            .build();

        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: FrameworkConfig = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(parsed.cache.dir, PathBuf::from("/var/cache/chips"));
        assert_eq!(parsed.logging.level, "warn");
    }
}
