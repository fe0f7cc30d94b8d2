//! Bundle 清单解析
//!
//! 清单位于资源缓存的 `META-INF/MANIFEST.MF`，格式为 `Key: Value` 行，
//! 以单个空格开头的行是上一行的续行。

use std::sync::OnceLock;

use regex::Regex;
use semver::Version;

use crate::utils::{FrameworkError, Properties, Result};

/// 清单在资源缓存中的相对路径
pub const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";

/// 符号名头
pub const BUNDLE_SYMBOLIC_NAME: &str = "Bundle-SymbolicName";
/// 版本头
pub const BUNDLE_VERSION: &str = "Bundle-Version";
/// 显示名头
pub const BUNDLE_NAME: &str = "Bundle-Name";
/// 描述头
pub const BUNDLE_DESCRIPTION: &str = "Bundle-Description";
/// 激活器头
pub const BUNDLE_ACTIVATOR: &str = "Bundle-Activator";

/// Bundle 清单
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleManifest {
    /// 符号名
    pub symbolic_name: String,
    /// 版本（已规范化为 semver）
    pub version: Version,
    /// 显示名
    pub name: Option<String>,
    /// 描述
    pub description: Option<String>,
    /// 激活器名称
    pub activator: Option<String>,
    /// 全部清单头
    pub attributes: Properties,
}

impl BundleManifest {
    /// 框架自身的伪 Bundle 清单
    pub fn system() -> Self {
        let version = Version::parse(crate::VERSION).unwrap_or_else(|_| Version::new(0, 0, 0));
        let attributes = Properties::new()
            .with(BUNDLE_SYMBOLIC_NAME, crate::SYSTEM_BUNDLE_SYMBOLIC_NAME)
            .with(BUNDLE_VERSION, version.to_string());
        Self {
            symbolic_name: crate::SYSTEM_BUNDLE_SYMBOLIC_NAME.to_string(),
            version,
            name: Some("System Bundle".to_string()),
            description: None,
            activator: None,
            attributes,
        }
    }
}

/// 清单解析器
#[derive(Debug, Clone, Default)]
pub struct ManifestParser;

impl ManifestParser {
    /// 从字符串解析清单
    ///
    /// # Errors
    ///
    /// 格式错误或校验失败时返回 `InvalidManifest`，错误信息包含全部问题
    pub fn parse_string(content: &str) -> Result<BundleManifest> {
        let mut errors: Vec<String> = Vec::new();
        let attributes = Self::parse_headers(content, &mut errors);

        // 1. 符号名（去掉 `;` 之后的指令）
        let symbolic_name = attributes
            .get(BUNDLE_SYMBOLIC_NAME)
            .map(|v| v.split(';').next().unwrap_or_default().trim().to_string())
            .unwrap_or_default();
        if symbolic_name.is_empty() {
            errors.push(format!("缺少必填头 {}", BUNDLE_SYMBOLIC_NAME));
        } else if !symbolic_name_regex()?.is_match(&symbolic_name) {
            errors.push(format!(
                "符号名 '{}' 格式无效，只允许字母、数字、点、下划线和连字符",
                symbolic_name
            ));
        }

        // 2. 版本
        let version = match attributes.get(BUNDLE_VERSION) {
            None => Version::new(0, 0, 0),
            Some(raw) => match Self::normalize_version(raw) {
                Ok(v) => v,
                Err(e) => {
                    errors.push(e);
                    Version::new(0, 0, 0)
                }
            },
        };

        // 3. 激活器名称
        let activator = attributes
            .get(BUNDLE_ACTIVATOR)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        if attributes.contains_key(BUNDLE_ACTIVATOR) && activator.is_none() {
            errors.push(format!("{} 不能为空", BUNDLE_ACTIVATOR));
        }

        if !errors.is_empty() {
            return Err(FrameworkError::InvalidManifest(errors.join("; ")));
        }

        Ok(BundleManifest {
            symbolic_name,
            version,
            name: attributes.get(BUNDLE_NAME).map(str::to_string),
            description: attributes.get(BUNDLE_DESCRIPTION).map(str::to_string),
            activator,
            attributes,
        })
    }

    fn parse_headers(content: &str, errors: &mut Vec<String>) -> Properties {
        let mut headers: Vec<(String, String)> = Vec::new();
        for (index, line) in content.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            if let Some(continuation) = line.strip_prefix(' ') {
                match headers.last_mut() {
                    Some((_, value)) => value.push_str(continuation),
                    None => errors.push(format!("第 {} 行: 续行之前没有清单头", index + 1)),
                }
                continue;
            }
            match line.split_once(':') {
                Some((key, value)) if !key.trim().is_empty() => {
                    headers.push((key.trim().to_string(), value.trim().to_string()));
                }
                _ => errors.push(format!("第 {} 行: 缺少 'Key: Value' 分隔符", index + 1)),
            }
        }
        headers.into_iter().collect()
    }

    /// 将 `major[.minor[.micro[.qualifier]]]` 规范化为 semver
    ///
    /// 限定符转为预发布标识（`_` 替换为 `-`）。
    pub fn normalize_version(raw: &str) -> std::result::Result<Version, String> {
        let raw = raw.trim();
        let invalid = || format!("无效的版本号 '{}'，应为 major[.minor[.micro[.qualifier]]]", raw);

        let parts: Vec<&str> = raw.splitn(4, '.').collect();
        let number = |i: usize| -> std::result::Result<u64, String> {
            match parts.get(i) {
                None => Ok(0),
                Some(p) => p.parse::<u64>().map_err(|_| invalid()),
            }
        };
        let (major, minor, micro) = (number(0)?, number(1)?, number(2)?);

        let mut version = Version::new(major, minor, micro);
        if let Some(qualifier) = parts.get(3) {
            if qualifier.is_empty()
                || !qualifier
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(invalid());
            }
            version.pre =
                semver::Prerelease::new(&qualifier.replace('_', "-")).map_err(|_| invalid())?;
        }
        Ok(version)
    }
}

fn symbolic_name_regex() -> Result<&'static Regex> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    if let Some(re) = PATTERN.get() {
        return Ok(re);
    }
    let re = Regex::new(r"^[A-Za-z0-9_.\-]+$")
        .map_err(|e| FrameworkError::Internal(format!("符号名正则无效: {}", e)))?;
    Ok(PATTERN.get_or_init(|| re))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_manifest() {
        let manifest = ManifestParser::parse_string(
            "Bundle-SymbolicName: org.chips.logger;singleton:=true\n\
             Bundle-Version: 1.2.3.beta_1\n\
             Bundle-Name: Chips\n  Logger\n\
             Bundle-Activator: logger\n\
             X-Custom: yes\n",
        )
        .unwrap();

        assert_eq!(manifest.symbolic_name, "org.chips.logger");
        assert_eq!(manifest.version.to_string(), "1.2.3-beta-1");
        assert_eq!(manifest.name.as_deref(), Some("Chips Logger"));
        assert_eq!(manifest.activator.as_deref(), Some("logger"));
        assert_eq!(manifest.attributes.get("X-Custom"), Some("yes"));
    }

    #[test]
    fn test_version_defaults_and_short_forms() {
        let manifest = ManifestParser::parse_string("Bundle-SymbolicName: a\n").unwrap();
        assert_eq!(manifest.version, Version::new(0, 0, 0));

        assert_eq!(ManifestParser::normalize_version("2").unwrap(), Version::new(2, 0, 0));
        assert_eq!(ManifestParser::normalize_version("2.5").unwrap(), Version::new(2, 5, 0));
        assert!(ManifestParser::normalize_version("1.x").is_err());
        assert!(ManifestParser::normalize_version("1.0.0.bad!").is_err());
    }

    #[test]
    fn test_missing_symbolic_name_and_bad_version_collected() {
        let err = ManifestParser::parse_string("Bundle-Version: abc\nBroken line\n").unwrap_err();
        let FrameworkError::InvalidManifest(message) = err else {
            panic!("expected InvalidManifest");
        };
        assert!(message.contains(BUNDLE_SYMBOLIC_NAME));
        assert!(message.contains("abc"));
        assert!(message.contains("第 2 行"));
    }

    #[test]
    fn test_invalid_symbolic_name() {
        let err = ManifestParser::parse_string("Bundle-SymbolicName: bad name!\n").unwrap_err();
        assert!(matches!(err, FrameworkError::InvalidManifest(_)));
    }

    #[test]
    fn test_system_manifest() {
        let manifest = BundleManifest::system();
        assert_eq!(manifest.symbolic_name, crate::SYSTEM_BUNDLE_SYMBOLIC_NAME);
        assert!(manifest.activator.is_none());
    }
}
