//! 有序属性表
//!
//! 字符串到字符串的有序映射，既用作服务属性，也用于读写
//! `key=value` 格式的 `.properties` 文件（Bundle 状态持久化）。

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// 有序属性表（保持插入顺序）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties {
    entries: IndexMap<String, String>,
}

impl Properties {
    /// 创建空属性表
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取属性值
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// 忽略大小写获取属性值（过滤器匹配使用）
    pub fn get_ignore_case(&self, key: &str) -> Option<&str> {
        if let Some(value) = self.get(key) {
            return Some(value);
        }
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// 获取整数属性，解析失败时返回默认值
    pub fn get_as_i64(&self, key: &str, default: i64) -> i64 {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// 获取布尔属性，解析失败时返回默认值
    pub fn get_as_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key).map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "true" => true,
            Some(v) if v == "false" => false,
            _ => default,
        }
    }

    /// 设置属性，返回旧值
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries.insert(key.into(), value.into())
    }

    /// 构建器风格设置属性
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// 移除属性（保持其余条目顺序）
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.shift_remove(key)
    }

    /// 是否包含属性
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// 属性数量
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 遍历属性
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// 解析 `.properties` 格式文本
    ///
    /// 支持 `key=value` 与 `key: value` 两种分隔符，忽略空行以及
    /// `#`、`!` 开头的注释行，支持 `\=`、`\:`、`\n`、`\\` 转义。
    pub fn parse(content: &str) -> Self {
        let mut props = Properties::new();
        for raw in content.lines() {
            let line = raw.trim_start();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }

            let mut key = String::new();
            let mut chars = line.chars();
            let mut escaped = false;
            let mut found_separator = false;
            for c in chars.by_ref() {
                if escaped {
                    key.push(unescape_char(c));
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '=' || c == ':' {
                    found_separator = true;
                    break;
                } else {
                    key.push(c);
                }
            }

            let value = if found_separator {
                unescape(chars.as_str().trim())
            } else {
                String::new()
            };
            props.set(key.trim().to_string(), value);
        }
        props
    }

    /// 序列化为 `.properties` 格式文本
    pub fn to_properties_string(&self) -> String {
        let mut out = String::new();
        for (k, v) in self.iter() {
            out.push_str(&escape(k));
            out.push('=');
            out.push_str(&escape(v));
            out.push('\n');
        }
        out
    }
}

impl fmt::Display for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        f.write_str("}")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut props = Properties::new();
        for (k, v) in iter {
            props.set(k, v);
        }
        props
    }
}

fn unescape_char(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        other => other,
    }
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut escaped = false;
    for c in value.chars() {
        if escaped {
            out.push(unescape_char(c));
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    out
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '=' => out.push_str("\\="),
            ':' => out.push_str("\\:"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}
